//! Regression predictor boundary.
//!
//! [`GpPredictor`] is everything the strategies and the facade need from a
//! regression model: posterior mean with input gradients, mutable access to
//! the training set, and an inference-mode toggle. [`ExactGp`] is the
//! reference implementation; any model honouring the trait can be dropped in.
//!
//! Hyperparameter optimization is not part of this crate. Predictors arrive
//! already configured (pretrained or empty) and are only conditioned on data.

pub mod exact;
pub mod kernel;
pub mod training_set;

use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::ResidualResult;

pub use exact::{ExactGp, GpHyperparameters};
pub use training_set::TrainingSet;

/// Whether the predictor is being fit or queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorMode {
    Training,
    Inference,
}

/// Posterior mean and its derivative with respect to the reduced input.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorGradient {
    /// `(N, residual_dimension)`
    pub mean: Array2<f64>,
    /// `(residual_dimension, N, input_dimension)`
    pub gradient: Array3<f64>,
}

/// Regression model collaborator used by [`ResidualModel`](crate::ResidualModel).
pub trait GpPredictor {
    /// Width of the reduced feature vectors the model consumes.
    fn input_dimension(&self) -> usize;

    /// Number of independent outputs.
    fn residual_dimension(&self) -> usize;

    fn training_set(&self) -> &TrainingSet;

    /// Mutable training data; strategies append and evict through this.
    fn training_set_mut(&mut self) -> &mut TrainingSet;

    fn mode(&self) -> PredictorMode;

    fn set_mode(&mut self, mode: PredictorMode);

    fn eval(&mut self) {
        self.set_mode(PredictorMode::Inference);
    }

    fn train(&mut self) {
        self.set_mode(PredictorMode::Training);
    }

    /// Posterior mean for a batch `(N, input_dimension)` and its Jacobian.
    fn posterior_with_gradient(&mut self, x: ArrayView2<'_, f64>) -> ResidualResult<PosteriorGradient>;
}
