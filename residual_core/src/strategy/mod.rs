//! Ingestion policies for streaming observations.
//!
//! A [`DataProcessingStrategy`] decides what happens to each `(x, y)` pair the
//! control loop records. The facade only ever talks to the trait:
//!
//! - [`OnlineLearningStrategy`] conditions the predictor immediately, keeping
//!   its training set inside a fixed-size sliding window.
//! - [`RecordDataStrategy`] buffers raw pairs and appends them to disk on a
//!   background worker, leaving the predictor untouched.

pub mod online;
pub mod record;

use std::path::PathBuf;

use ndarray::ArrayView1;

use crate::error::{ResidualError, ResidualResult};
use crate::gp::GpPredictor;
use crate::selector::FeatureSelector;

pub use online::{OnlineLearningStrategy, SlidingWindow};
pub use record::{
    DiskBuffer, RecordDataStrategy, RecordStats, DEFAULT_BUFFER_SIZE, DEFAULT_RETAINED_BUFFERS,
};

/// Policy applied to every recorded observation.
pub trait DataProcessingStrategy: Send {
    /// Incorporate one raw observation.
    ///
    /// `x` has `selector.state_dimension()` entries and `y` has
    /// `gp.residual_dimension()` entries. Implementations validate both
    /// before touching any state.
    fn process(
        &mut self,
        x: ArrayView1<'_, f64>,
        y: ArrayView1<'_, f64>,
        selector: &FeatureSelector,
        gp: &mut dyn GpPredictor,
    ) -> ResidualResult<()>;

    /// Block until everything recorded so far has been handled.
    fn flush(&mut self) -> ResidualResult<()> {
        Ok(())
    }

    /// Most recent failure from work done off the caller's thread.
    fn last_error(&self) -> Option<ResidualError> {
        None
    }
}

/// Validated strategy selection, usually read from the `[strategy]` table.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyConfig {
    Online {
        max_points_online: usize,
    },
    Record {
        x_path: PathBuf,
        y_path: PathBuf,
        buffer_size: usize,
        journal_path: Option<PathBuf>,
        /// Defaults to [`DEFAULT_RETAINED_BUFFERS`] full buffers.
        max_retained_rows: Option<usize>,
    },
}

impl StrategyConfig {
    pub fn build(&self) -> ResidualResult<Box<dyn DataProcessingStrategy>> {
        match self {
            StrategyConfig::Online { max_points_online } => {
                Ok(Box::new(OnlineLearningStrategy::new(*max_points_online)?))
            }
            StrategyConfig::Record {
                x_path,
                y_path,
                buffer_size,
                journal_path,
                max_retained_rows,
            } => {
                let mut strategy = RecordDataStrategy::with_buffer_size(x_path, y_path, *buffer_size)?;
                if let Some(journal) = journal_path {
                    strategy = strategy.with_journal(journal);
                }
                if let Some(rows) = max_retained_rows {
                    strategy = strategy.with_retention_limit(*rows)?;
                }
                Ok(Box::new(strategy))
            }
        }
    }
}

/// Shared argument checks run before any strategy mutates state.
pub(crate) fn check_observation(
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    selector: &FeatureSelector,
    gp: &dyn GpPredictor,
) -> ResidualResult<()> {
    if x.len() != selector.state_dimension() {
        return Err(ResidualError::shape(
            selector.state_dimension(),
            x.len(),
            "recorded state",
        ));
    }
    if y.len() != gp.residual_dimension() {
        return Err(ResidualError::shape(
            gp.residual_dimension(),
            y.len(),
            "recorded residual",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_config_builds_and_validates_capacity() {
        assert!(StrategyConfig::Online { max_points_online: 4 }.build().is_ok());
        let err = StrategyConfig::Online { max_points_online: 0 }
            .build()
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn record_config_rejects_zero_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let config = StrategyConfig::Record {
            x_path: dir.path().join("x.txt"),
            y_path: dir.path().join("y.txt"),
            buffer_size: 0,
            journal_path: None,
            max_retained_rows: None,
        };
        assert!(config.build().err().unwrap().is_configuration());
    }

    #[test]
    fn record_config_applies_retention_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = |max_retained_rows| StrategyConfig::Record {
            x_path: dir.path().join("x.txt"),
            y_path: dir.path().join("y.txt"),
            buffer_size: 5,
            journal_path: None,
            max_retained_rows,
        };
        assert!(config(Some(25)).build().is_ok());
        assert!(config(None).build().is_ok());
        assert!(config(Some(4)).build().err().unwrap().is_configuration());
    }
}
