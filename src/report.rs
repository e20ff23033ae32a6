use std::io::{self, Write};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

use crate::checkpoint::Checkpoint;

/// Why `LarsSolver::run` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Every admissible predictor is active.
    Exhausted,
    MaxIterations,
    /// The largest admissible correlation fell below `correlation_tol`.
    Converged,
    /// Two consecutive iterations failed to solve the active-set system.
    RepeatedFailure,
}

#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    pub iterations: usize,
    pub objective: f64,
    pub nactive: usize,
    pub max_correlation: f64,
}

/// Summary of one driver iteration.
///
/// Error figures describe the state the iteration started from.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub objective: f64,
    pub rms_error: f64,
    pub l1_norm: f64,
    pub nactive: usize,
    pub max_correlation: f64,
    pub gamma_use: f64,
    /// The step was shortened so an active coefficient reached zero.
    pub lasso_limited: bool,
    pub added: Option<usize>,
    pub removed: Option<usize>,
    /// Indices excluded because this iteration's solve failed.
    pub excluded: Vec<usize>,
}

impl IterationReport {
    fn event(&self) -> String {
        if !self.excluded.is_empty() {
            let list: Vec<String> = self.excluded.iter().map(ToString::to_string).collect();
            return format!("failed, excluded {}", list.join(","));
        }
        match (self.added, self.removed) {
            (Some(j), _) => format!("+{j}"),
            (_, Some(j)) => format!("-{j}"),
            _ => String::new(),
        }
    }
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    /// Settled solver state at the start of an iteration.
    fn on_checkpoint(&mut self, _checkpoint: &Checkpoint) {}
    fn on_finish(&mut self) {}
}

pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("objective").set_alignment(CellAlignment::Right),
            Cell::new("rms").set_alignment(CellAlignment::Right),
            Cell::new("l1").set_alignment(CellAlignment::Right),
            Cell::new("vars").set_alignment(CellAlignment::Right),
            Cell::new("C_max").set_alignment(CellAlignment::Right),
            Cell::new("gamma").set_alignment(CellAlignment::Right),
            Cell::new("lasso"),
            Cell::new("event"),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.6e}", row.objective)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.rms_error)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.l1_norm)).set_alignment(CellAlignment::Right),
                Cell::new(row.nactive).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3e}", row.max_correlation))
                    .set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3e}", row.gamma_use)).set_alignment(CellAlignment::Right),
                Cell::new(if row.lasso_limited { "yes" } else { "no" }),
                Cell::new(row.event()),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}

/// Appends one checkpoint block per iteration to `out`.
///
/// The first write error is kept and returned by [`TrajectoryWriter::into_inner`];
/// later blocks are dropped.
pub struct TrajectoryWriter<W: Write> {
    out: W,
    blocks: usize,
    error: Option<io::Error>,
}

impl<W: Write> TrajectoryWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            blocks: 0,
            error: None,
        }
    }

    /// Number of blocks written.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn into_inner(self) -> io::Result<W> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.out),
        }
    }
}

impl<W: Write> Reporter for TrajectoryWriter<W> {
    fn on_iteration(&mut self, _report: &IterationReport) {}

    fn on_checkpoint(&mut self, checkpoint: &Checkpoint) {
        if self.error.is_some() {
            return;
        }
        match checkpoint.write_to(&mut self.out) {
            Ok(()) => self.blocks += 1,
            Err(err) => {
                log::warn!("trajectory write failed: {err}");
                self.error = Some(err);
            }
        }
    }

    fn on_finish(&mut self) {
        if self.error.is_none() {
            if let Err(err) = self.out.flush() {
                self.error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_appends_blocks() {
        let cp = Checkpoint {
            iteration: 1,
            l1_norm: 0.0,
            rms_error: 1.0,
            objective: 0.5,
            nactive: 0,
            coefficients: Vec::new(),
            exclude: None,
            mu: None,
        };
        let mut writer = TrajectoryWriter::new(Vec::new());
        writer.on_checkpoint(&cp);
        writer.on_checkpoint(&Checkpoint { iteration: 2, ..cp.clone() });
        writer.on_finish();
        assert_eq!(writer.blocks(), 2);
        let out = writer.into_inner().unwrap();
        let blocks = Checkpoint::read_all(out.as_slice()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].iteration, 2);
    }

    #[test]
    fn event_column_describes_active_set_change() {
        let mut report = IterationReport {
            iteration: 3,
            objective: 0.0,
            rms_error: 0.0,
            l1_norm: 0.0,
            nactive: 2,
            max_correlation: 0.0,
            gamma_use: 0.0,
            lasso_limited: false,
            added: Some(4),
            removed: None,
            excluded: Vec::new(),
        };
        assert_eq!(report.event(), "+4");
        report.added = None;
        report.removed = Some(1);
        assert_eq!(report.event(), "-1");
        report.excluded = vec![5, 7];
        assert_eq!(report.event(), "failed, excluded 5,7");
    }
}
