//! Batch-independent multitask exact Gaussian process.
//!
//! Each output task `t` is an independent GP with constant mean `m_t`, a
//! scaled RBF kernel (`outputscale_t`, lengthscale shared across inputs or one
//! per input dimension) and Gaussian noise `noise_t`:
//!
//! ```text
//! mean_t(x)     = m_t + k_t(x, X) · α_t,       α_t = (K_t + noise_t·I)^-1 (y_t - m_t)
//! ∂mean_t/∂x_d  = -Σ_i α_ti · k_t(x, x_i) · (x_d - x_id) / l_td²
//! ```
//!
//! The factorization is cached against the training-set revision, so online
//! updates pay for a refit only on the next evaluation.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::kernel::{cholesky, cholesky_solve, gram_matrix, rbf, JITTER_LADDER};
use super::{GpPredictor, PosteriorGradient, PredictorMode, TrainingSet};
use crate::checkpoint::{CheckpointError, Checkpointable};
use crate::error::{ResidualError, ResidualResult};

/// Kernel and likelihood parameters, one row per output task.
#[derive(Debug, Clone, PartialEq)]
pub struct GpHyperparameters {
    /// `(R, 1)` for a shared lengthscale or `(R, input_dimension)` for ARD.
    pub lengthscales: Array2<f64>,
    /// `(R)`
    pub outputscales: Array1<f64>,
    /// `(R)`
    pub task_noises: Array1<f64>,
    /// `(R)`
    pub means: Array1<f64>,
}

impl GpHyperparameters {
    /// Same scalar parameters for every task, shared lengthscale.
    pub fn isotropic(
        residual_dimension: usize,
        lengthscale: f64,
        outputscale: f64,
        noise: f64,
    ) -> Self {
        Self {
            lengthscales: Array2::from_elem((residual_dimension, 1), lengthscale),
            outputscales: Array1::from_elem(residual_dimension, outputscale),
            task_noises: Array1::from_elem(residual_dimension, noise),
            means: Array1::zeros(residual_dimension),
        }
    }

    pub fn with_means(mut self, means: Array1<f64>) -> Self {
        self.means = means;
        self
    }

    pub fn residual_dimension(&self) -> usize {
        self.outputscales.len()
    }

    pub fn uses_ard(&self) -> bool {
        self.lengthscales.ncols() > 1
    }

    pub fn validate(&self, input_dimension: usize, residual_dimension: usize) -> ResidualResult<()> {
        for (name, len) in [
            ("lengthscales", self.lengthscales.nrows()),
            ("outputscales", self.outputscales.len()),
            ("task_noises", self.task_noises.len()),
            ("means", self.means.len()),
        ] {
            if len != residual_dimension {
                return Err(ResidualError::shape(
                    residual_dimension,
                    len,
                    format!("hyperparameter '{name}' task count"),
                ));
            }
        }

        let cols = self.lengthscales.ncols();
        if cols != 1 && cols != input_dimension {
            return Err(ResidualError::shape(
                input_dimension,
                cols,
                "ARD lengthscale width",
            ));
        }

        check_positive("lengthscales", self.lengthscales.iter())?;
        check_positive("outputscales", self.outputscales.iter())?;
        check_positive("task_noises", self.task_noises.iter())?;
        if let Some(bad) = self.means.iter().find(|v| !v.is_finite()) {
            return Err(ResidualError::configuration(
                "means",
                bad.to_string(),
                "must be finite",
            ));
        }
        Ok(())
    }

    /// `1 / l_td` expanded to `(R, input_dimension)`.
    fn inverse_lengthscales(&self, input_dimension: usize) -> Array2<f64> {
        let ard = self.uses_ard();
        Array2::from_shape_fn((self.residual_dimension(), input_dimension), |(t, d)| {
            let l = if ard {
                self.lengthscales[[t, d]]
            } else {
                self.lengthscales[[t, 0]]
            };
            1.0 / l
        })
    }
}

fn check_positive<'a>(name: &str, values: impl Iterator<Item = &'a f64>) -> ResidualResult<()> {
    for value in values {
        if !value.is_finite() || *value <= 0.0 {
            return Err(ResidualError::configuration(
                name,
                value.to_string(),
                "must be finite and > 0",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Posterior {
    revision: u64,
    train_x: Array2<f64>,
    /// `(R, n)`
    alphas: Array2<f64>,
    /// `(R, input_dimension)`
    inv_lengthscales: Array2<f64>,
}

/// Exact GP over a [`TrainingSet`] with caller-supplied hyperparameters.
#[derive(Debug, Clone)]
pub struct ExactGp {
    input_dimension: usize,
    residual_dimension: usize,
    hyperparameters: GpHyperparameters,
    training: TrainingSet,
    mode: PredictorMode,
    posterior: Option<Posterior>,
}

impl ExactGp {
    /// Unconditioned GP. Starts in training mode; call
    /// [`GpPredictor::eval`] before handing it to a model.
    pub fn new(
        input_dimension: usize,
        residual_dimension: usize,
        hyperparameters: GpHyperparameters,
    ) -> ResidualResult<Self> {
        if input_dimension == 0 || residual_dimension == 0 {
            return Err(ResidualError::configuration(
                "gp dimensions",
                format!("{input_dimension}x{residual_dimension}"),
                "input and residual dimensions must be ≥ 1",
            ));
        }
        hyperparameters.validate(input_dimension, residual_dimension)?;

        Ok(Self {
            input_dimension,
            residual_dimension,
            hyperparameters,
            training: TrainingSet::new(input_dimension, residual_dimension),
            mode: PredictorMode::Training,
            posterior: None,
        })
    }

    /// GP conditioned on already-reduced training arrays.
    pub fn with_training_data(
        train_x: ArrayView2<'_, f64>,
        train_y: ArrayView2<'_, f64>,
        hyperparameters: GpHyperparameters,
    ) -> ResidualResult<Self> {
        let mut gp = Self::new(train_x.ncols(), train_y.ncols(), hyperparameters)?;
        gp.training = TrainingSet::from_arrays(train_x, train_y)?;
        Ok(gp)
    }

    /// Replace the hyperparameters; the cached factorization is dropped.
    pub fn initialize(&mut self, hyperparameters: GpHyperparameters) -> ResidualResult<()> {
        hyperparameters.validate(self.input_dimension, self.residual_dimension)?;
        self.hyperparameters = hyperparameters;
        self.posterior = None;
        Ok(())
    }

    pub fn hyperparameters(&self) -> &GpHyperparameters {
        &self.hyperparameters
    }

    fn ensure_posterior(&mut self) -> ResidualResult<()> {
        let revision = self.training.revision();
        let stale = self
            .posterior
            .as_ref()
            .map_or(true, |posterior| posterior.revision != revision);

        if stale {
            let posterior = self.fit_posterior()?;
            tracing::trace!(
                points = self.training.len(),
                revision,
                "refit exact GP posterior"
            );
            self.posterior = Some(posterior);
        }
        Ok(())
    }

    fn fit_posterior(&self) -> ResidualResult<Posterior> {
        let train_x = self.training.inputs();
        let train_y = self.training.targets();
        let inv_lengthscales = self.hyperparameters.inverse_lengthscales(self.input_dimension);
        let n = train_x.nrows();

        let rows: Vec<Array1<f64>> = (0..self.residual_dimension)
            .into_par_iter()
            .map(|task| {
                if n == 0 {
                    return Ok(Array1::zeros(0));
                }
                let centered = train_y.column(task).mapv(|y| y - self.hyperparameters.means[task]);
                let gram = gram_matrix(
                    train_x.view(),
                    inv_lengthscales.row(task),
                    self.hyperparameters.outputscales[task],
                    self.hyperparameters.task_noises[task],
                );
                let factor = factorize_with_jitter(gram, task)?;
                Ok(cholesky_solve(&factor, centered.view()))
            })
            .collect::<ResidualResult<_>>()?;

        let mut alphas = Array2::zeros((self.residual_dimension, n));
        for (mut dst, src) in alphas.outer_iter_mut().zip(rows.iter()) {
            dst.assign(src);
        }

        Ok(Posterior {
            revision: self.training.revision(),
            train_x,
            alphas,
            inv_lengthscales,
        })
    }
}

fn factorize_with_jitter(mut gram: Array2<f64>, task: usize) -> ResidualResult<Array2<f64>> {
    let mut applied = 0.0;
    for jitter in JITTER_LADDER {
        let step = jitter - applied;
        if step > 0.0 {
            gram.diag_mut().mapv_inplace(|v| v + step);
            applied = jitter;
        }
        if let Some(factor) = cholesky(&gram) {
            if applied > 0.0 {
                tracing::warn!(task, jitter = applied, "kernel matrix needed diagonal jitter");
            }
            return Ok(factor);
        }
    }
    Err(ResidualError::numerical(
        format!("kernel factorization for task {task}"),
        format!("matrix not positive definite after jitter {applied:e}"),
    ))
}

fn evaluate_point(
    query: ArrayView1<'_, f64>,
    posterior: &Posterior,
    hyper: &GpHyperparameters,
    mut mean_row: ArrayViewMut1<'_, f64>,
    gradient: &mut Array3<f64>,
    n_idx: usize,
) {
    for (task, mean) in mean_row.iter_mut().enumerate() {
        let inv = posterior.inv_lengthscales.row(task);
        let alpha = posterior.alphas.row(task);
        let outputscale = hyper.outputscales[task];
        let mut acc = hyper.means[task];

        for (i, train) in posterior.train_x.outer_iter().enumerate() {
            let weight = alpha[i] * rbf(query, train, inv, outputscale);
            acc += weight;
            for d in 0..query.len() {
                let inv_d = inv[d];
                gradient[[task, n_idx, d]] -= weight * (query[d] - train[d]) * inv_d * inv_d;
            }
        }
        *mean = acc;
    }
}

impl GpPredictor for ExactGp {
    fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    fn residual_dimension(&self) -> usize {
        self.residual_dimension
    }

    fn training_set(&self) -> &TrainingSet {
        &self.training
    }

    fn training_set_mut(&mut self) -> &mut TrainingSet {
        &mut self.training
    }

    fn mode(&self) -> PredictorMode {
        self.mode
    }

    fn set_mode(&mut self, mode: PredictorMode) {
        self.mode = mode;
    }

    fn posterior_with_gradient(&mut self, x: ArrayView2<'_, f64>) -> ResidualResult<PosteriorGradient> {
        if self.mode != PredictorMode::Inference {
            return Err(ResidualError::configuration(
                "predictor mode",
                "training",
                "posterior evaluation requires inference mode",
            ));
        }
        if x.ncols() != self.input_dimension {
            return Err(ResidualError::shape(
                self.input_dimension,
                x.ncols(),
                "gp query input",
            ));
        }

        let batch = x.nrows();
        let residual_dimension = self.residual_dimension;
        self.ensure_posterior()?;
        let posterior = self
            .posterior
            .as_ref()
            .ok_or_else(|| ResidualError::numerical("gp evaluation", "posterior missing after refit"))?;

        let mut mean = Array2::zeros((batch, residual_dimension));
        let mut gradient = Array3::zeros((residual_dimension, batch, self.input_dimension));
        for (n_idx, (query, mean_row)) in x
            .outer_iter()
            .zip(mean.axis_iter_mut(Axis(0)))
            .enumerate()
        {
            evaluate_point(query, posterior, &self.hyperparameters, mean_row, &mut gradient, n_idx);
        }

        Ok(PosteriorGradient { mean, gradient })
    }
}

/// Flattened [`ExactGp`] state as stored in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactGpSnapshot {
    input_dimension: usize,
    residual_dimension: usize,
    lengthscale_columns: usize,
    lengthscales: Vec<f64>,
    outputscales: Vec<f64>,
    task_noises: Vec<f64>,
    means: Vec<f64>,
    mode: PredictorMode,
    train_inputs: Vec<f64>,
    train_targets: Vec<f64>,
}

fn reshape(
    field: &'static str,
    values: Vec<f64>,
    rows: usize,
    columns: usize,
) -> Result<Array2<f64>, CheckpointError> {
    let malformed = |found| CheckpointError::Malformed {
        field,
        expected: rows * columns,
        found,
    };
    if values.len() != rows * columns {
        return Err(malformed(values.len()));
    }
    let found = values.len();
    Array2::from_shape_vec((rows, columns), values).map_err(|_| malformed(found))
}

impl Checkpointable for ExactGp {
    const KIND: &'static str = "exact_gp";
    const VERSION: u32 = 1;
    type Snapshot = ExactGpSnapshot;

    fn snapshot(&self) -> ExactGpSnapshot {
        let hyper = &self.hyperparameters;
        ExactGpSnapshot {
            input_dimension: self.input_dimension,
            residual_dimension: self.residual_dimension,
            lengthscale_columns: hyper.lengthscales.ncols(),
            lengthscales: hyper.lengthscales.iter().copied().collect(),
            outputscales: hyper.outputscales.to_vec(),
            task_noises: hyper.task_noises.to_vec(),
            means: hyper.means.to_vec(),
            mode: self.mode,
            train_inputs: self.training.inputs().iter().copied().collect(),
            train_targets: self.training.targets().iter().copied().collect(),
        }
    }

    fn restore(snapshot: ExactGpSnapshot) -> Result<Self, CheckpointError> {
        let r = snapshot.residual_dimension;
        let d = snapshot.input_dimension;
        // Row count comes from the inputs; a ragged tail fails the reshape.
        let rows = snapshot.train_inputs.len().checked_div(d).unwrap_or(0);

        let hyperparameters = GpHyperparameters {
            lengthscales: reshape("lengthscales", snapshot.lengthscales, r, snapshot.lengthscale_columns)?,
            outputscales: Array1::from(snapshot.outputscales),
            task_noises: Array1::from(snapshot.task_noises),
            means: Array1::from(snapshot.means),
        };
        let train_x = reshape("train_inputs", snapshot.train_inputs, rows, d)?;
        let train_y = reshape("train_targets", snapshot.train_targets, rows, r)?;

        let mut gp = ExactGp::new(d, r, hyperparameters)?;
        gp.training = TrainingSet::from_arrays(train_x.view(), train_y.view())?;
        gp.mode = snapshot.mode;
        Ok(gp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fitted_gp() -> ExactGp {
        let train_x = array![[0.0, 0.0], [1.0, 0.5], [-0.5, 1.0], [0.3, -0.7]];
        let train_y = array![[0.1, 1.0], [0.4, -0.2], [-0.3, 0.5], [0.2, 0.0]];
        let hyper = GpHyperparameters::isotropic(2, 0.8, 1.3, 1e-4);
        let mut gp = ExactGp::with_training_data(train_x.view(), train_y.view(), hyper).unwrap();
        gp.eval();
        gp
    }

    #[test]
    fn empty_gp_returns_prior_mean_and_zero_gradient() {
        let hyper = GpHyperparameters::isotropic(2, 1.0, 1.0, 0.1).with_means(array![0.5, -1.0]);
        let mut gp = ExactGp::new(3, 2, hyper).unwrap();
        gp.eval();

        let out = gp.posterior_with_gradient(array![[0.1, 0.2, 0.3]].view()).unwrap();
        assert_eq!(out.mean, array![[0.5, -1.0]]);
        assert!(out.gradient.iter().all(|&g| g == 0.0));
        assert_eq!(out.gradient.dim(), (2, 1, 3));
    }

    #[test]
    fn posterior_interpolates_low_noise_training_points() {
        let mut gp = fitted_gp();
        let train_x = gp.training_set().inputs();
        let train_y = gp.training_set().targets();
        let out = gp.posterior_with_gradient(train_x.view()).unwrap();
        for (got, want) in out.mean.iter().zip(train_y.iter()) {
            assert!((got - want).abs() < 1e-2, "got {got}, want {want}");
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut gp = fitted_gp();
        let x = array![[0.2, 0.1], [-0.4, 0.6]];
        let out = gp.posterior_with_gradient(x.view()).unwrap();
        let eps = 1e-6;

        for n in 0..x.nrows() {
            for d in 0..x.ncols() {
                let mut plus = x.clone();
                let mut minus = x.clone();
                plus[[n, d]] += eps;
                minus[[n, d]] -= eps;
                let f_plus = gp.posterior_with_gradient(plus.view()).unwrap().mean;
                let f_minus = gp.posterior_with_gradient(minus.view()).unwrap().mean;
                for t in 0..2 {
                    let numeric = (f_plus[[n, t]] - f_minus[[n, t]]) / (2.0 * eps);
                    let analytic = out.gradient[[t, n, d]];
                    assert!(
                        (numeric - analytic).abs() < 1e-5,
                        "task {t} point {n} dim {d}: numeric {numeric}, analytic {analytic}"
                    );
                }
            }
        }
    }

    #[test]
    fn training_mode_refuses_evaluation() {
        let mut gp = fitted_gp();
        gp.train();
        let err = gp.posterior_with_gradient(array![[0.0, 0.0]].view()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn ard_lengthscale_width_is_validated() {
        let mut hyper = GpHyperparameters::isotropic(1, 1.0, 1.0, 0.1);
        hyper.lengthscales = Array2::from_elem((1, 2), 1.0);
        assert!(ExactGp::new(3, 1, hyper).unwrap_err().is_shape());
    }

    #[test]
    fn non_positive_noise_is_rejected() {
        let hyper = GpHyperparameters::isotropic(1, 1.0, 1.0, 0.0);
        assert!(ExactGp::new(1, 1, hyper).unwrap_err().is_configuration());
    }

    #[test]
    fn posterior_refits_after_training_set_mutation() {
        let mut gp = fitted_gp();
        let query = array![[2.0, 2.0]];
        let before = gp.posterior_with_gradient(query.view()).unwrap().mean;

        gp.training_set_mut()
            .push(array![2.0, 2.0].view(), array![5.0, 5.0].view())
            .unwrap();
        let after = gp.posterior_with_gradient(query.view()).unwrap().mean;
        assert!(after[[0, 0]] > before[[0, 0]] + 1.0);
    }

    #[test]
    fn checkpoint_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gp.bin");
        let mut gp = fitted_gp();
        gp.save_checkpoint(&path).unwrap();

        let mut restored = ExactGp::load_checkpoint(&path).unwrap();
        assert_eq!(restored.mode(), PredictorMode::Inference);
        assert_eq!(restored.training_set().inputs(), gp.training_set().inputs());
        assert_eq!(restored.hyperparameters(), gp.hyperparameters());

        let query = array![[0.25, -0.1]];
        let a = gp.posterior_with_gradient(query.view()).unwrap();
        let b = restored.posterior_with_gradient(query.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ragged_snapshot_arrays_are_rejected() {
        let gp = fitted_gp();

        let mut snapshot = gp.snapshot();
        snapshot.train_inputs.pop();
        match ExactGp::restore(snapshot).err() {
            Some(CheckpointError::Malformed { field, expected, found }) => {
                assert_eq!(field, "train_inputs");
                assert_eq!((expected, found), (6, 7));
            }
            other => panic!("expected malformed inputs, got {other:?}"),
        }

        let mut snapshot = gp.snapshot();
        snapshot.lengthscales.push(1.0);
        match ExactGp::restore(snapshot).err() {
            Some(CheckpointError::Malformed { field, expected, found }) => {
                assert_eq!(field, "lengthscales");
                assert_eq!((expected, found), (2, 3));
            }
            other => panic!("expected malformed lengthscales, got {other:?}"),
        }

        let mut snapshot = gp.snapshot();
        snapshot.task_noises = vec![0.0, 0.0];
        assert!(matches!(
            ExactGp::restore(snapshot).err(),
            Some(CheckpointError::Invalid(err)) if err.is_configuration()
        ));
    }
}
