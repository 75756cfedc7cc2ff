//! Model configuration via TOML files.
//!
//! Raw tables are deserialized with serde and then validated into typed
//! sections, so a bad value fails at load time instead of on first use.
//!
//! ```toml
//! [model]
//! state_dimension = 3
//! residual_dimension = 2
//! feature_mask = [true, false, true]
//!
//! [gp]
//! lengthscale = 0.8
//! outputscale = 1.0
//! noise = 0.01
//!
//! [strategy]
//! kind = "online"
//! max_points_online = 20
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Axis};
use serde::Deserialize;

use crate::data::load_data;
use crate::error::{ResidualError, ResidualResult};
use crate::gp::{ExactGp, GpHyperparameters};
use crate::selector::{FeatureMask, FeatureSelector};
use crate::strategy::{StrategyConfig, DEFAULT_BUFFER_SIZE};

/// Complete model description.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    pub model: ModelConfig,
    pub gp: GpConfig,
    pub strategy: StrategyConfig,
}

impl ResidualConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ResidualResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| ResidualError::io(format!("reading {}", path.display()), &err))?;
        Self::from_str(&contents)
    }

    pub fn from_str(toml_str: &str) -> ResidualResult<Self> {
        let raw: RawResidualConfig = toml::from_str(toml_str)
            .map_err(|err| ResidualError::parse("residual configuration", err.to_string()))?;

        let model = ModelConfig::try_from(&raw.model)?;
        let selector = model.selector()?;
        let gp = GpConfig::try_from(&raw.gp, &model, selector.input_dimension())?;
        let strategy = strategy_from_raw(&raw.strategy)?;

        Ok(Self {
            model,
            gp,
            strategy,
        })
    }

    pub fn build_selector(&self) -> ResidualResult<FeatureSelector> {
        self.model.selector()
    }

    /// Predictor described by `[gp]`, seeded from logged data when a warm
    /// start is configured. Returned in training mode.
    pub fn build_gp(&self, selector: &FeatureSelector) -> ResidualResult<ExactGp> {
        let hyperparameters = self.gp.hyperparameters(self.model.residual_dimension);

        let Some(warm) = &self.gp.warm_start else {
            return ExactGp::new(
                selector.input_dimension(),
                self.model.residual_dimension,
                hyperparameters,
            );
        };

        let (train_x, train_y) = warm.load(selector, self.model.residual_dimension)?;
        tracing::info!(
            points = train_x.nrows(),
            x = %warm.train_x_path.display(),
            "seeding predictor from logged data"
        );
        ExactGp::with_training_data(train_x.view(), train_y.view(), hyperparameters)
    }
}

/// `[model]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub state_dimension: usize,
    pub residual_dimension: usize,
    pub feature_mask: Option<FeatureMask>,
}

impl ModelConfig {
    fn try_from(raw: &RawModel) -> ResidualResult<Self> {
        if raw.residual_dimension == 0 {
            return Err(ResidualError::configuration(
                "model.residual_dimension",
                "0",
                "must predict at least one output",
            ));
        }
        let config = Self {
            state_dimension: raw.state_dimension,
            residual_dimension: raw.residual_dimension,
            feature_mask: raw.feature_mask.clone().map(FeatureMask::new),
        };
        config.selector()?;
        Ok(config)
    }

    fn selector(&self) -> ResidualResult<FeatureSelector> {
        FeatureSelector::new(self.feature_mask.clone(), self.state_dimension)
    }
}

/// Shared or per-input lengthscale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Lengthscale {
    Shared(f64),
    PerInput(Vec<f64>),
}

/// `[gp]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct GpConfig {
    pub lengthscale: Lengthscale,
    pub outputscale: f64,
    pub noise: f64,
    pub mean: f64,
    pub warm_start: Option<WarmStart>,
}

impl GpConfig {
    fn try_from(raw: &RawGp, model: &ModelConfig, input_dimension: usize) -> ResidualResult<Self> {
        let config = Self {
            lengthscale: raw.lengthscale.clone(),
            outputscale: raw.outputscale,
            noise: raw.noise,
            mean: raw.mean,
            warm_start: WarmStart::try_from(raw)?,
        };
        if let Lengthscale::PerInput(values) = &config.lengthscale {
            if values.len() != input_dimension {
                return Err(ResidualError::shape(
                    input_dimension,
                    values.len(),
                    "gp.lengthscale entries",
                ));
            }
        }
        if !config.mean.is_finite() {
            return Err(ResidualError::configuration(
                "gp.mean",
                config.mean.to_string(),
                "must be finite",
            ));
        }
        config
            .hyperparameters(model.residual_dimension)
            .validate(input_dimension, model.residual_dimension)?;
        Ok(config)
    }

    /// Same parameters for every output task.
    pub fn hyperparameters(&self, residual_dimension: usize) -> GpHyperparameters {
        let lengthscales = match &self.lengthscale {
            Lengthscale::Shared(value) => Array2::from_elem((residual_dimension, 1), *value),
            Lengthscale::PerInput(values) => {
                let row = Array1::from_vec(values.clone());
                let mut lengthscales = Array2::zeros((residual_dimension, values.len()));
                for mut dst in lengthscales.axis_iter_mut(Axis(0)) {
                    dst.assign(&row);
                }
                lengthscales
            }
        };

        GpHyperparameters {
            lengthscales,
            outputscales: Array1::from_elem(residual_dimension, self.outputscale),
            task_noises: Array1::from_elem(residual_dimension, self.noise),
            means: Array1::from_elem(residual_dimension, self.mean),
        }
    }
}

/// Logged data used to condition the predictor at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmStart {
    pub train_x_path: PathBuf,
    pub train_y_path: PathBuf,
    /// Keep at most this many leading rows.
    pub max_points: Option<usize>,
}

impl WarmStart {
    fn try_from(raw: &RawGp) -> ResidualResult<Option<Self>> {
        match (&raw.train_x_path, &raw.train_y_path) {
            (None, None) => Ok(None),
            (Some(x), Some(y)) => {
                if raw.max_points == Some(0) {
                    return Err(ResidualError::configuration(
                        "gp.max_points",
                        "0",
                        "warm start must keep at least one point",
                    ));
                }
                Ok(Some(Self {
                    train_x_path: x.clone(),
                    train_y_path: y.clone(),
                    max_points: raw.max_points,
                }))
            }
            (Some(_), None) | (None, Some(_)) => Err(ResidualError::configuration(
                "gp.train_x_path/gp.train_y_path",
                "partial",
                "warm start needs both files",
            )),
        }
    }

    /// Load raw logs, reduce them through `selector`, and trim to
    /// `max_points`.
    pub fn load(
        &self,
        selector: &FeatureSelector,
        residual_dimension: usize,
    ) -> ResidualResult<(Array2<f64>, Array2<f64>)> {
        let (raw_x, y) = load_data(&self.train_x_path, &self.train_y_path)?;
        if raw_x.nrows() > 0 && y.ncols() != residual_dimension {
            return Err(ResidualError::shape(
                residual_dimension,
                y.ncols(),
                "logged residual width",
            ));
        }
        if raw_x.nrows() == 0 {
            return Ok((
                Array2::zeros((0, selector.input_dimension())),
                Array2::zeros((0, residual_dimension)),
            ));
        }

        let reduced = selector.apply(&raw_x)?;
        let keep = self.max_points.map_or(reduced.nrows(), |max| max.min(reduced.nrows()));
        Ok((
            reduced.slice_axis(Axis(0), (0..keep).into()).to_owned(),
            y.slice_axis(Axis(0), (0..keep).into()).to_owned(),
        ))
    }
}

fn strategy_from_raw(raw: &RawStrategy) -> ResidualResult<StrategyConfig> {
    let config = match raw.kind.as_str() {
        "online" => StrategyConfig::Online {
            max_points_online: raw.max_points_online.unwrap_or_else(default_max_points_online),
        },
        "record" => {
            let x_path = raw.x_path.clone().ok_or_else(|| {
                ResidualError::configuration("strategy.x_path", "missing", "record strategy needs a log path")
            })?;
            let y_path = raw.y_path.clone().ok_or_else(|| {
                ResidualError::configuration("strategy.y_path", "missing", "record strategy needs a log path")
            })?;
            StrategyConfig::Record {
                x_path,
                y_path,
                buffer_size: raw.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
                journal_path: raw.journal_path.clone(),
                max_retained_rows: raw.max_retained_rows,
            }
        }
        other => {
            return Err(ResidualError::configuration(
                "strategy.kind",
                other,
                "expected \"online\" or \"record\"",
            ))
        }
    };

    match &config {
        StrategyConfig::Online { max_points_online: 0 } => Err(ResidualError::configuration(
            "strategy.max_points_online",
            "0",
            "sliding window must hold at least one point",
        )),
        StrategyConfig::Record { buffer_size: 0, .. } => Err(ResidualError::configuration(
            "strategy.buffer_size",
            "0",
            "disk buffer must hold at least one row",
        )),
        StrategyConfig::Record {
            buffer_size,
            max_retained_rows: Some(rows),
            ..
        } if rows < buffer_size => Err(ResidualError::configuration(
            "strategy.max_retained_rows",
            rows.to_string(),
            "must hold at least one full buffer",
        )),
        StrategyConfig::Record { x_path, y_path, .. } if x_path == y_path => {
            Err(ResidualError::configuration(
                "strategy.y_path",
                y_path.display().to_string(),
                "x and y logs must be distinct files",
            ))
        }
        _ => Ok(config),
    }
}

#[derive(Debug, Deserialize)]
struct RawResidualConfig {
    model: RawModel,
    gp: RawGp,
    #[serde(default)]
    strategy: RawStrategy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
    state_dimension: usize,
    residual_dimension: usize,
    #[serde(default)]
    feature_mask: Option<Vec<bool>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGp {
    #[serde(default = "default_lengthscale")]
    lengthscale: Lengthscale,
    #[serde(default = "default_outputscale")]
    outputscale: f64,
    #[serde(default = "default_noise")]
    noise: f64,
    #[serde(default)]
    mean: f64,
    #[serde(default)]
    train_x_path: Option<PathBuf>,
    #[serde(default)]
    train_y_path: Option<PathBuf>,
    #[serde(default)]
    max_points: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStrategy {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    max_points_online: Option<usize>,
    #[serde(default)]
    x_path: Option<PathBuf>,
    #[serde(default)]
    y_path: Option<PathBuf>,
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default)]
    journal_path: Option<PathBuf>,
    #[serde(default)]
    max_retained_rows: Option<usize>,
}

impl Default for RawStrategy {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            max_points_online: None,
            x_path: None,
            y_path: None,
            buffer_size: None,
            journal_path: None,
            max_retained_rows: None,
        }
    }
}

fn default_lengthscale() -> Lengthscale {
    Lengthscale::Shared(1.0)
}

fn default_outputscale() -> f64 {
    1.0
}

fn default_noise() -> f64 {
    1e-2
}

fn default_kind() -> String {
    "online".to_string()
}

fn default_max_points_online() -> usize {
    20
}
