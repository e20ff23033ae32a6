use std::cell::Cell;

use faer_core::Parallelism;
use s_lars_rs::{
    Algorithm, Checkpoint, CheckpointErrorKind, ColumnScaling, DenseFeatures, DesignMatrix,
    IterationStatus, LarsSolver, LinearSolver, Preconditioner, Response, SolvePath,
    SolveStatus, SolverError, SolverOptions, SparseFeatures, TrajectoryWriter,
};

fn normalized(mut column: Vec<f64>) -> Vec<f64> {
    let mean = column.iter().sum::<f64>() / column.len() as f64;
    for v in &mut column {
        *v -= mean;
    }
    let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
    for v in &mut column {
        *v /= norm;
    }
    column
}

/// Centered, unit-norm columns that are well conditioned but not orthogonal.
fn synthetic_columns(nrows: usize, ncols: usize) -> Vec<Vec<f64>> {
    (0..ncols)
        .map(|j| {
            let column = (0..nrows)
                .map(|i| {
                    let (i, j) = (i as f64, j as f64);
                    ((i + 1.0) * (0.61 + 0.37 * j)).sin() + 0.1 * (i * (j + 2.0) * 0.23).cos()
                })
                .collect();
            normalized(column)
        })
        .collect()
}

fn dense(columns: &[Vec<f64>]) -> DenseFeatures {
    let nrows = columns[0].len();
    let values = columns.iter().flatten().copied().collect();
    DenseFeatures::new(nrows, columns.len(), values, Parallelism::None).unwrap()
}

fn synthetic_response(columns: &[Vec<f64>]) -> Response {
    let y = (0..columns[0].len())
        .map(|i| {
            2.0 * columns[1][i] - 1.5 * columns[4][i]
                + 0.8 * columns[0][i]
                + 0.05 * (1.7 * i as f64).cos()
        })
        .collect();
    Response::centered(y)
}

fn synthetic_solver(options: SolverOptions) -> LarsSolver<DenseFeatures> {
    let columns = synthetic_columns(30, 6);
    let y = synthetic_response(&columns);
    LarsSolver::new(dense(&columns), y, options, Parallelism::None).unwrap()
}

fn lasso_problem(algorithm: Algorithm) -> LarsSolver<DenseFeatures> {
    let columns: [[f64; 6]; 4] = [
        [-1.0, 1.0, 1.0, 2.0, 2.0, 0.0],
        [1.0, -1.0, -1.0, 2.0, 1.0, 2.0],
        [1.0, -1.0, -1.0, 2.0, -2.0, 0.0],
        [-2.0, 1.0, -2.0, 0.0, 2.0, 2.0],
    ];
    let values = columns.iter().flatten().copied().collect();
    let mut x = DenseFeatures::new(6, 4, values, Parallelism::None).unwrap();
    x.normalize();
    let y = Response::centered(vec![1.0, -2.0, -1.0, 2.0, 1.0, 0.0]);
    let options = SolverOptions {
        algorithm,
        ..SolverOptions::default()
    };
    LarsSolver::new(x, y, options, Parallelism::None).unwrap()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (j, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "entry {j}: {x} vs {y}");
    }
}

fn sorted(indices: &[usize]) -> Vec<usize> {
    let mut indices = indices.to_vec();
    indices.sort_unstable();
    indices
}

#[test]
fn single_correlated_feature_is_fit_in_one_step() {
    let x0 = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
    let x1 = [1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
    let x2 = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, -1.0, -1.0, -1.0, -1.0];
    let values = x0.iter().chain(&x1).chain(&x2).copied().collect();
    let x = DenseFeatures::new(10, 3, values, Parallelism::None).unwrap();
    let y = x0.iter().map(|v| 3.0 * v).collect();
    let mut solver =
        LarsSolver::new(x, Response::new(y), SolverOptions::default(), Parallelism::None)
            .unwrap();

    let status = solver.iteration().unwrap();
    assert_eq!(status.code(), 1);
    assert_eq!(solver.active_set().indices(), &[0]);
    assert!((solver.max_correlation() - 30.0).abs() <= 1e-12);
    assert!((solver.normalization() - 10.0_f64.sqrt()).abs() <= 1e-12);
    let expected_gamma = 30.0 / 10.0_f64.sqrt();
    assert!((solver.step_size() - expected_gamma).abs() <= 1e-12);
    assert!((solver.beta()[0] - 3.0).abs() <= 1e-12);
    assert_eq!(solver.beta()[1], 0.0);

    solver.predict();
    assert!(solver.squared_error() <= 1e-18);
}

#[test]
fn run_stops_once_correlations_vanish() {
    let x0 = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
    let x1 = [1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
    let values = x0.iter().chain(&x1).copied().collect();
    let x = DenseFeatures::new(10, 2, values, Parallelism::None).unwrap();
    let y = x0.iter().map(|v| -2.0 * v).collect();
    let mut solver = LarsSolver::new(
        x,
        Response::new(y),
        SolverOptions {
            correlation_tol: 1e-10,
            ..SolverOptions::default()
        },
        Parallelism::None,
    )
    .unwrap();
    let stats = solver.run(None).unwrap();
    assert!(matches!(
        stats.status,
        SolveStatus::Converged | SolveStatus::Exhausted
    ));
    assert!((solver.beta()[0] + 2.0).abs() <= 1e-12);
    assert!(stats.objective <= 1e-20);
}

#[test]
fn lasso_drops_coefficient_that_crosses_zero() {
    let mut solver = lasso_problem(Algorithm::Lasso);
    assert_eq!(solver.iteration().unwrap(), IterationStatus::Stepped);
    assert_eq!(solver.iteration().unwrap(), IterationStatus::Stepped);
    assert_eq!(solver.active_set().indices(), &[1, 2]);

    assert_eq!(solver.iteration().unwrap(), IterationStatus::Stepped);
    assert_eq!(solver.active_set().indices(), &[1, 2, 3]);
    assert!((solver.step_size() - 0.1995852320).abs() <= 1e-8);
    assert!((solver.gamma_lasso() - 0.0534004888).abs() <= 1e-8);
    assert_eq!(solver.gamma_use(), solver.gamma_lasso());
    assert_eq!(solver.beta()[2], 0.0);

    assert_eq!(solver.iteration().unwrap(), IterationStatus::Stepped);
    assert_eq!(solver.active_set().indices(), &[1, 3]);
    assert!((solver.beta()[1] - 2.1823883372).abs() <= 1e-8);
    assert!((solver.beta()[3] + 0.1856054149).abs() <= 1e-8);

    let stats = solver.run(None).unwrap();
    assert_eq!(stats.status, SolveStatus::Exhausted);
    assert_eq!(stats.iterations, 6);

    let mut lars = lasso_problem(Algorithm::Lars);
    for _ in 0..3 {
        lars.iteration().unwrap();
    }
    // Plain LARS lets the coefficient change sign.
    assert!(lars.beta()[2] < 0.0);
    lars.run(None).unwrap();
    let least_squares = [1.2695456768, 4.0948190722, -0.9314103931, -2.2828446685];
    assert_close(lars.beta(), &least_squares, 1e-7);
    assert_close(solver.beta(), &least_squares, 1e-7);
}

#[test]
fn path_invariants_hold_at_every_iteration() {
    let mut solver = synthetic_solver(SolverOptions {
        algorithm: Algorithm::Lasso,
        ..SolverOptions::default()
    });
    let nprops = solver.beta().len();
    loop {
        let status = solver.iteration().unwrap();
        if status == IterationStatus::Exhausted {
            break;
        }
        let active = solver.active_set();
        let excluded = solver.excluded();
        assert!(active.len() <= nprops - excluded.len());
        assert_eq!(sorted(active.indices()).windows(2).filter(|w| w[0] == w[1]).count(), 0);
        assert!(active.indices().iter().all(|&j| !excluded.contains(j)));

        let norm = solver.direction().iter().map(|u| u * u).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-4);
    }
    assert_eq!(solver.iterations(), 6);

    // The end of the path is the least-squares fit.
    let residual: Vec<f64> = {
        let columns = synthetic_columns(30, 6);
        let y = synthetic_response(&columns);
        y.values()
            .iter()
            .zip(solver.settled_prediction())
            .map(|(y, m)| y - m)
            .collect()
    };
    let mut c = vec![0.0; nprops];
    solver.matrix().mul_transpose_vec(&residual, &mut c);
    assert!(c.iter().all(|c| c.abs() <= 1e-8));
}

#[test]
fn predict_all_then_predict_leaves_prediction_unchanged() {
    let mut solver = synthetic_solver(SolverOptions::default());
    for _ in 0..3 {
        solver.iteration().unwrap();
    }
    solver.predict_all();
    let before = solver.prediction().to_vec();
    solver.predict();
    assert_eq!(solver.prediction(), before.as_slice());
}

#[test]
fn restart_reproduces_state() {
    let mut original = synthetic_solver(SolverOptions::default());
    for _ in 0..3 {
        original.iteration().unwrap();
    }
    let text = original.checkpoint().to_string();
    let checkpoint = Checkpoint::parse_last(&text).unwrap();
    assert_eq!(checkpoint.iteration, 4);

    let mut restarted = synthetic_solver(SolverOptions::default());
    assert_eq!(restarted.restart(&checkpoint).unwrap(), 3);
    assert_eq!(restarted.iterations(), 3);
    assert_close(restarted.beta(), original.beta(), 1e-15);
    assert_eq!(
        restarted.active_set().indices(),
        sorted(original.active_set().indices()).as_slice()
    );
    assert!((restarted.objective() - checkpoint.objective).abs() <= 1e-12);

    assert_eq!(original.iteration().unwrap(), IterationStatus::Stepped);
    assert_eq!(restarted.iteration().unwrap(), IterationStatus::Stepped);
    assert_close(restarted.beta(), original.beta(), 1e-8);
    assert!((restarted.objective() - original.objective()).abs() <= 1e-12);
}

#[test]
fn restart_rejects_out_of_range_indices() {
    let mut solver = synthetic_solver(SolverOptions::default());
    let mut checkpoint = solver.checkpoint();
    checkpoint.coefficients.push((17, 1.0));
    match solver.restart(&checkpoint) {
        Err(SolverError::Restart(err)) => {
            assert_eq!(
                err.kind,
                CheckpointErrorKind::IndexOutOfRange { index: 17, len: 6 }
            );
        }
        other => panic!("unexpected restart result: {:?}", other.err()),
    }
}

#[test]
fn trajectory_records_every_iteration() {
    let mut solver = synthetic_solver(SolverOptions::default());
    let mut writer = TrajectoryWriter::new(Vec::new());
    let stats = solver.run(Some(&mut writer)).unwrap();
    assert_eq!(stats.status, SolveStatus::Exhausted);
    assert_eq!(writer.blocks(), stats.iterations);

    let out = writer.into_inner().unwrap();
    let blocks = Checkpoint::read_all(out.as_slice()).unwrap();
    assert_eq!(blocks.len(), stats.iterations);
    assert_eq!(blocks[0].iteration, 1);
    assert!(blocks[0].coefficients.is_empty());
    let last = blocks.last().unwrap();
    assert_eq!(last.iteration, stats.iterations);
    assert!((last.objective - stats.objective).abs() <= 1e-12);
}

#[test]
fn stepping_with_a_reporter_writes_resumable_blocks() {
    let mut solver = synthetic_solver(SolverOptions::default());
    let mut writer = TrajectoryWriter::new(Vec::new());
    for _ in 0..2 {
        solver.iterate_with(&mut writer).unwrap();
    }
    let out = writer.into_inner().unwrap();
    let last = Checkpoint::read_last(out.as_slice()).unwrap();
    // The block for iteration 2 holds the state after the first step.
    assert_eq!(last.iteration, 2);
    assert_eq!(last.nactive, 1);
    assert_eq!(last.coefficients.len(), 1);
    assert_eq!(last.coefficients[0].0, 1);
}

#[test]
fn restart_from_trajectory_resumes_the_logged_iteration() {
    let mut logged = synthetic_solver(SolverOptions::default());
    let mut writer = TrajectoryWriter::new(Vec::new());
    for _ in 0..3 {
        logged.iterate_with(&mut writer).unwrap();
    }
    let out = writer.into_inner().unwrap();
    let last = Checkpoint::read_last(out.as_slice()).unwrap();
    assert_eq!(last.iteration, 3);

    let mut reference = synthetic_solver(SolverOptions::default());
    for _ in 0..2 {
        reference.iteration().unwrap();
    }
    let mut restarted = synthetic_solver(SolverOptions::default());
    assert_eq!(restarted.restart(&last).unwrap(), 2);
    assert_close(restarted.beta(), reference.beta(), 1e-15);

    reference.iteration().unwrap();
    restarted.iteration().unwrap();
    assert_eq!(restarted.iterations(), reference.iterations());
    assert_close(restarted.beta(), reference.beta(), 1e-8);
}

#[test]
fn conjugate_gradient_matches_cholesky() {
    let mut reference = synthetic_solver(SolverOptions::default());
    let mut expected = Vec::new();
    for _ in 0..5 {
        reference.iteration().unwrap();
        expected.push(reference.beta().to_vec());
    }

    for preconditioner in [
        None,
        Some(Preconditioner::CholeskyInverse),
        Some(Preconditioner::Ssor { omega: 1.2 }),
    ] {
        let mut solver = synthetic_solver(SolverOptions {
            linear_solver: LinearSolver::ConjugateGradient { preconditioner },
            ..SolverOptions::default()
        });
        for beta in &expected {
            assert_eq!(solver.iteration().unwrap(), IterationStatus::Stepped);
            assert_eq!(solver.solve_path(), Some(SolvePath::ConjugateGradient));
            assert_close(solver.beta(), beta, 1e-6);
        }
    }
}

#[test]
fn incremental_updates_match_full_rebuilds() {
    let mut incremental = synthetic_solver(SolverOptions::default());
    let mut full = synthetic_solver(SolverOptions {
        incremental_updates: false,
        ..SolverOptions::default()
    });
    for iteration in 1..=6 {
        incremental.iteration().unwrap();
        full.iteration().unwrap();
        assert_eq!(full.solve_path(), Some(SolvePath::CholeskyFull));
        let expected = if iteration <= 2 {
            SolvePath::CholeskyFull
        } else {
            SolvePath::CholeskyAddRow
        };
        assert_eq!(incremental.solve_path(), Some(expected));
        assert_close(incremental.beta(), full.beta(), 1e-9);
    }
}

#[test]
fn sparse_storage_matches_dense() {
    let columns = synthetic_columns(20, 5);
    let y: Vec<f64> = (0..20)
        .map(|i| 1.5 * columns[2][i] - 0.7 * columns[4][i] + 0.05 * (i as f64).sin())
        .collect();
    let mut entries = Vec::new();
    for (j, column) in columns.iter().enumerate() {
        for (i, &v) in column.iter().enumerate() {
            if v != 0.0 {
                entries.push((i, j, v));
            }
        }
    }
    let sparse = SparseFeatures::from_triplets(20, 5, &entries).unwrap();

    let mut a = LarsSolver::new(
        dense(&columns),
        Response::centered(y.clone()),
        SolverOptions::default(),
        Parallelism::None,
    )
    .unwrap();
    let mut b = LarsSolver::new(
        sparse,
        Response::centered(y),
        SolverOptions::default(),
        Parallelism::None,
    )
    .unwrap();
    for _ in 0..4 {
        assert_eq!(a.iteration().unwrap(), IterationStatus::Stepped);
        assert_eq!(b.iteration().unwrap(), IterationStatus::Stepped);
        assert_eq!(a.active_set().indices(), b.active_set().indices());
        assert_close(a.beta(), b.beta(), 1e-10);
    }
}

#[test]
fn duplicate_column_is_excluded() {
    let columns = synthetic_columns(24, 4);
    let x0 = columns[0].clone();
    let x1 = columns[3].clone();
    let y = (0..24)
        .map(|i| 1.2 * x0[i] + 0.7 * x1[i] + 0.03 * (2.1 * i as f64).sin())
        .collect();
    let x = dense(&[x0.clone(), x1, x0]);
    let mut solver =
        LarsSolver::new(x, Response::centered(y), SolverOptions::default(), Parallelism::None)
            .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..10 {
        let status = solver.iteration().unwrap();
        let done = status == IterationStatus::Exhausted;
        statuses.push(status);
        if done {
            break;
        }
    }
    assert!(statuses.contains(&IterationStatus::Failed { excluded: vec![2] }));
    assert_eq!(statuses.iter().filter(|s| s.code() == -1).count(), 1);
    assert_eq!(statuses.last(), Some(&IterationStatus::Exhausted));
    assert_eq!(solver.excluded().iter().collect::<Vec<_>>(), vec![2]);
    assert_eq!(sorted(solver.active_set().indices()), vec![0, 1]);
    assert_eq!(solver.beta()[2], 0.0);
}

#[test]
fn unscaled_coefficients_recover_raw_model() {
    let n = 12;
    let f0: Vec<f64> = (0..n).map(|i| (0.9 * i as f64).cos() + 0.3 * i as f64).collect();
    let f1: Vec<f64> = (0..n)
        .map(|i| (i % 4) as f64 - 1.5 + 0.2 * (i as f64).sin())
        .collect();
    let y: Vec<f64> = f0.iter().zip(&f1).map(|(a, b)| 2.0 + 1.5 * a - 0.5 * b).collect();
    let values = f0.iter().chain(&f1).copied().collect();
    let mut x = DenseFeatures::new(n, 2, values, Parallelism::None).unwrap();
    x.normalize();
    let mut solver = LarsSolver::new(
        x,
        Response::centered(y.clone()),
        SolverOptions::default(),
        Parallelism::None,
    )
    .unwrap();
    let stats = solver.run(None).unwrap();
    assert_eq!(stats.status, SolveStatus::Exhausted);

    let model = solver.unscaled_coefficients().unwrap();
    assert_close(&model.coefficients, &[1.5, -0.5], 1e-8);
    assert!((model.intercept - 2.0).abs() <= 1e-8);
    assert_close(&solver.unshifted_predictions(), &y, 1e-8);

    let weighted = solver.unshifted_predictions_weighted(&vec![2.0; n]).unwrap();
    let halved: Vec<f64> = y.iter().map(|v| v / 2.0).collect();
    assert_close(&weighted, &halved, 1e-8);
}

#[test]
fn zero_scale_is_reported() {
    let columns = synthetic_columns(8, 2);
    let x = dense(&columns)
        .with_scaling(vec![
            ColumnScaling::default(),
            ColumnScaling {
                scale: 0.0,
                shift: 0.0,
            },
        ])
        .unwrap();
    let solver = LarsSolver::new(
        x,
        Response::new(vec![0.0; 8]),
        SolverOptions::default(),
        Parallelism::None,
    )
    .unwrap();
    assert!(matches!(
        solver.unscaled_coefficients(),
        Err(SolverError::ZeroScale { column: 1 })
    ));
}

/// A worker that is not the coordinator; counts synchronization calls.
struct Worker {
    inner: DenseFeatures,
    index_broadcasts: Cell<usize>,
    value_broadcasts: Cell<usize>,
}

impl DesignMatrix for Worker {
    fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    fn column_scaling(&self, col: usize) -> ColumnScaling {
        self.inner.column_scaling(col)
    }

    fn column_into(&self, col: usize, out: &mut [f64]) {
        self.inner.column_into(col, out);
    }

    fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        self.inner.mul_vec(x, out);
    }

    fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64]) {
        self.inner.mul_transpose_vec(v, out);
    }

    fn is_coordinator(&self) -> bool {
        false
    }

    fn broadcast_indices(&self, _indices: &mut Vec<usize>) {
        self.index_broadcasts.set(self.index_broadcasts.get() + 1);
    }

    fn broadcast_values(&self, _values: &mut [f64]) {
        self.value_broadcasts.set(self.value_broadcasts.get() + 1);
    }
}

#[test]
fn workers_synchronize_but_do_not_report() {
    let columns = synthetic_columns(30, 6);
    let y = synthetic_response(&columns);
    let worker = Worker {
        inner: dense(&columns),
        index_broadcasts: Cell::new(0),
        value_broadcasts: Cell::new(0),
    };
    let mut solver =
        LarsSolver::new(worker, y, SolverOptions::default(), Parallelism::None).unwrap();
    let mut writer = TrajectoryWriter::new(Vec::new());
    let stats = solver.run(Some(&mut writer)).unwrap();

    assert_eq!(writer.blocks(), 0);
    assert_eq!(solver.matrix().index_broadcasts.get(), stats.iterations);
    assert_eq!(solver.matrix().value_broadcasts.get(), stats.iterations);
}

#[test]
fn rejects_empty_and_mismatched_inputs() {
    let x = DenseFeatures::new(0, 3, Vec::new(), Parallelism::None).unwrap();
    assert!(matches!(
        LarsSolver::new(x, Response::new(Vec::new()), SolverOptions::default(), Parallelism::None),
        Err(SolverError::InvalidDimensions { nrows: 0, ncols: 3 })
    ));

    let columns = synthetic_columns(8, 2);
    assert!(matches!(
        LarsSolver::new(
            dense(&columns),
            Response::new(vec![0.0; 7]),
            SolverOptions::default(),
            Parallelism::None
        ),
        Err(SolverError::DimensionMismatch {
            expected: 8,
            actual: 7
        })
    ));
}
