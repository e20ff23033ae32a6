//! Active-set bookkeeping.

/// Correlations within this distance of `C_max` count as tied.
pub(crate) const TIE_TOL: f64 = 1e-6;

/// How the active set changed relative to the previous iteration.
///
/// Drives the choice between incremental and full Gram/Cholesky updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSetChange {
    /// `index` was inserted at `position`.
    Added { position: usize, index: usize },
    /// `index` was removed from `position`.
    Removed { position: usize, index: usize },
    /// Same membership and order.
    Unchanged,
    /// Anything else; derived state must be rebuilt.
    Rebuild,
}

impl ActiveSetChange {
    /// Classify the transition from `last` to `current`.
    pub fn between(last: &[usize], current: &[usize]) -> Self {
        if current.len() == last.len() + 1 {
            let position = first_difference(last, current);
            if last[position..] == current[position + 1..] {
                return Self::Added {
                    position,
                    index: current[position],
                };
            }
        } else if current.len() + 1 == last.len() {
            let position = first_difference(current, last);
            if current[position..] == last[position + 1..] {
                return Self::Removed {
                    position,
                    index: last[position],
                };
            }
        } else if current == last {
            return Self::Unchanged;
        }
        Self::Rebuild
    }
}

/// Position of the first entry where `longer` departs from `shorter`.
fn first_difference(shorter: &[usize], longer: &[usize]) -> usize {
    shorter
        .iter()
        .zip(longer)
        .position(|(a, b)| a != b)
        .unwrap_or(shorter.len())
}

/// Predictors permanently disabled after causing a singular Gram matrix.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    flags: Vec<bool>,
    count: usize,
}

impl ExcludeSet {
    pub fn new(nprops: usize) -> Self {
        Self {
            flags: vec![false; nprops],
            count: 0,
        }
    }

    /// Mark `index` as excluded. Returns false if it already was.
    pub fn insert(&mut self, index: usize) -> bool {
        if self.flags[index] {
            return false;
        }
        self.flags[index] = true;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        self.flags[index]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Excluded indices in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(j, &excluded)| excluded.then_some(j))
    }
}

/// What the step-size calculation asked the active set to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingChange {
    /// Drop the entry at this position (LASSO sign crossing).
    Remove(usize),
    /// Append this feature (next LARS equalization point).
    Add(usize),
    /// Search correlations for the next predictor (first call, restart, recovery).
    Search,
}

/// Ordered active predictors plus the previous iteration's snapshot.
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    indices: Vec<usize>,
    last: Vec<usize>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active feature indices in activation order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Active set from the previous update.
    pub fn last(&self) -> &[usize] {
        &self.last
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Position of `index` in the ordered set.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.indices.iter().position(|&j| j == index)
    }

    /// Indices active now that were not active in the previous snapshot.
    pub fn newly_added(&self) -> Vec<usize> {
        self.indices
            .iter()
            .copied()
            .filter(|j| !self.last.contains(j))
            .collect()
    }

    /// Advance the active set by one event.
    ///
    /// `correlations` and `c_max` are only consulted for `PendingChange::Search`,
    /// which appends the first non-excluded, non-active feature whose absolute
    /// correlation ties `c_max`.
    pub(crate) fn update(
        &mut self,
        pending: PendingChange,
        correlations: &[f64],
        c_max: f64,
        exclude: &ExcludeSet,
    ) -> ActiveSetChange {
        self.last.clone_from(&self.indices);

        match pending {
            PendingChange::Remove(position) if position < self.indices.len() => {
                self.indices.remove(position);
            }
            PendingChange::Add(index) if !self.indices.contains(&index) => {
                self.indices.push(index);
            }
            _ => {
                let found = correlations.iter().enumerate().position(|(j, c)| {
                    !exclude.contains(j)
                        && (c.abs() - c_max).abs() < TIE_TOL
                        && !self.last.contains(&j)
                });
                if let Some(j) = found {
                    self.indices.push(j);
                }
            }
        }

        ActiveSetChange::between(&self.last, &self.indices)
    }

    /// Replace the set after a broadcast from the coordinator.
    pub(crate) fn replace(&mut self, indices: Vec<usize>) -> ActiveSetChange {
        self.indices = indices;
        ActiveSetChange::between(&self.last, &self.indices)
    }

    /// Undo the last update.
    pub(crate) fn roll_back(&mut self) {
        self.indices.clone_from(&self.last);
    }

    /// Install a replayed active set; the snapshot is cleared.
    pub(crate) fn reset(&mut self, indices: Vec<usize>) {
        self.indices = indices;
        self.last.clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<usize> {
        self.indices.clone()
    }
}
