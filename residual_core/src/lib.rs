//! # Residual Core
//!
//! Learned residual correction for real-time control loops. A
//! [`ResidualModel`] predicts a data-driven correction term for a raw state
//! vector together with its Jacobian, and ingests streaming
//! `(state, correction)` observations either by conditioning its predictor
//! online inside a sliding window or by logging them to disk in the
//! background for offline retraining.
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use residual_core::{
//!     ExactGp, FeatureMask, FeatureSelector, GpHyperparameters, GpPredictor,
//!     OnlineLearningStrategy, ResidualModel,
//! };
//!
//! let selector = FeatureSelector::new(Some(FeatureMask::new(vec![true, false, true])), 3)?;
//! let mut gp = ExactGp::new(2, 1, GpHyperparameters::isotropic(1, 1.0, 1.0, 0.01))?;
//! gp.eval();
//!
//! let strategy = Box::new(OnlineLearningStrategy::new(50)?);
//! let mut model = ResidualModel::new(gp, selector, strategy)?;
//!
//! model.record_datapoint(array![0.1, 7.0, -0.3].view(), array![0.05].view())?;
//! let out = model.value_and_jacobian(array![[0.1, 0.0, -0.3]].view())?;
//! assert_eq!(out.jacobian.dim(), (1, 1, 3));
//! # Ok::<(), residual_core::ResidualError>(())
//! ```
//!
//! ## Core Modules
//!
//! - [`selector`] - Feature masks and Jacobian lifting
//! - [`gp`] - Predictor boundary and the exact GP reference model
//! - [`strategy`] - Online sliding window and buffered disk logging
//! - [`model`] - The control-loop facade
//! - [`config`] - Model configuration via TOML
//! - [`logging`] - JSON line-delimited flush journal

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod gp;
pub mod logging;
pub mod model;
pub mod selector;
pub mod strategy;

pub use checkpoint::{CheckpointError, Checkpointable};
pub use config::{GpConfig, Lengthscale, ModelConfig, ResidualConfig, WarmStart};
pub use data::{load_data, read_matrix, PersistedLog, RawDatapoint};
pub use error::{ResidualError, ResidualResult};
pub use gp::{
    ExactGp, GpHyperparameters, GpPredictor, PosteriorGradient, PredictorMode, TrainingSet,
};
pub use logging::{FlushLogEntry, FlushStatus};
pub use model::{ResidualModel, ValueAndJacobian};
pub use selector::{FeatureMask, FeatureSelector};
pub use strategy::{
    DataProcessingStrategy, DiskBuffer, OnlineLearningStrategy, RecordDataStrategy, RecordStats,
    SlidingWindow, StrategyConfig, DEFAULT_BUFFER_SIZE, DEFAULT_RETAINED_BUFFERS,
};
