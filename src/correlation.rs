use crate::active::ExcludeSet;
use crate::features::DesignMatrix;

/// Correlations `c = X^T (y - mu)` and their admissible maximum `C_max`.
#[derive(Debug, Clone)]
pub(crate) struct Correlation {
    values: Vec<f64>,
    c_max: f64,
}

impl Correlation {
    pub(crate) fn new(nprops: usize) -> Self {
        Self {
            values: vec![0.0; nprops],
            c_max: 0.0,
        }
    }

    pub(crate) fn values(&self) -> &[f64] {
        &self.values
    }

    pub(crate) fn c_max(&self) -> f64 {
        self.c_max
    }

    /// Full recomputation from the residual.
    pub(crate) fn recompute<M: DesignMatrix>(
        &mut self,
        matrix: &M,
        y: &[f64],
        mu: &[f64],
        exclude: &ExcludeSet,
    ) {
        let residual: Vec<f64> = y.iter().zip(mu).map(|(y, m)| y - m).collect();
        matrix.mul_transpose_vec(&residual, &mut self.values);
        self.refresh_max(exclude);
    }

    /// Incremental update after a step: `c -= gamma_use * a`.
    pub(crate) fn advance(&mut self, gamma_use: f64, a: &[f64], exclude: &ExcludeSet) {
        for (c, &a) in self.values.iter_mut().zip(a) {
            *c -= gamma_use * a;
        }
        self.refresh_max(exclude);
    }

    fn refresh_max(&mut self, exclude: &ExcludeSet) {
        self.c_max = self
            .values
            .iter()
            .enumerate()
            .filter(|&(j, _)| !exclude.contains(j))
            .fold(0.0, |max, (_, c)| max.max(c.abs()));
    }
}
