//! Control-loop facade.
//!
//! [`ResidualModel`] wires a [`FeatureSelector`], a [`GpPredictor`] and one
//! [`DataProcessingStrategy`] together. The control loop sees two calls:
//! [`record_datapoint`](ResidualModel::record_datapoint) to feed observations
//! and [`value_and_jacobian`](ResidualModel::value_and_jacobian) to query the
//! correction and its derivative with respect to the raw state.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2};

use crate::config::ResidualConfig;
use crate::error::{ResidualError, ResidualResult};
use crate::gp::{ExactGp, GpPredictor, PredictorMode};
use crate::selector::FeatureSelector;
use crate::strategy::DataProcessingStrategy;

/// Correction for a query batch and its Jacobian over the raw state.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueAndJacobian {
    /// `(N, residual_dimension)`
    pub value: Array2<f64>,
    /// `(residual_dimension, N, state_dimension)`; masked-out columns are zero.
    pub jacobian: Array3<f64>,
}

/// Residual correction model driven by a control loop.
pub struct ResidualModel<P: GpPredictor = ExactGp> {
    gp: P,
    selector: FeatureSelector,
    strategy: Box<dyn DataProcessingStrategy>,
}

impl<P: GpPredictor> ResidualModel<P> {
    /// Assemble a model. The predictor must already be in inference mode and
    /// consume exactly the selector's reduced width.
    pub fn new(
        gp: P,
        selector: FeatureSelector,
        strategy: Box<dyn DataProcessingStrategy>,
    ) -> ResidualResult<Self> {
        if gp.mode() != PredictorMode::Inference {
            return Err(ResidualError::configuration(
                "gp_model",
                format!("{:?}", gp.mode()),
                "predictor must be placed in inference mode before use",
            ));
        }
        if gp.input_dimension() != selector.input_dimension() {
            return Err(ResidualError::shape(
                selector.input_dimension(),
                gp.input_dimension(),
                "predictor input width vs. selected features",
            ));
        }

        tracing::debug!(
            state_dimension = selector.state_dimension(),
            input_dimension = selector.input_dimension(),
            residual_dimension = gp.residual_dimension(),
            training_points = gp.training_set().len(),
            "residual model ready"
        );
        Ok(Self {
            gp,
            selector,
            strategy,
        })
    }

    pub fn state_dimension(&self) -> usize {
        self.selector.state_dimension()
    }

    pub fn residual_dimension(&self) -> usize {
        self.gp.residual_dimension()
    }

    pub fn gp(&self) -> &P {
        &self.gp
    }

    /// Direct predictor access for offline maintenance between control steps.
    pub fn gp_mut(&mut self) -> &mut P {
        &mut self.gp
    }

    pub fn selector(&self) -> &FeatureSelector {
        &self.selector
    }

    pub fn strategy(&self) -> &dyn DataProcessingStrategy {
        self.strategy.as_ref()
    }

    /// Hand one observation to the active strategy.
    ///
    /// Never waits on disk. Shape errors are reported before any state
    /// changes.
    pub fn record_datapoint(&mut self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> ResidualResult<()> {
        if x.len() != self.state_dimension() {
            return Err(ResidualError::shape(self.state_dimension(), x.len(), "recorded state"));
        }
        if y.len() != self.residual_dimension() {
            return Err(ResidualError::shape(
                self.residual_dimension(),
                y.len(),
                "recorded residual",
            ));
        }
        self.strategy.process(x, y, &self.selector, &mut self.gp)
    }

    /// Posterior mean correction for `x_query` `(N, state_dimension)` and its
    /// Jacobian with respect to the raw state.
    ///
    /// Takes `&mut self` only so the predictor can refresh a cached
    /// factorization; no state from one call affects the next call's result
    /// beyond the current training set.
    pub fn value_and_jacobian(&mut self, x_query: ArrayView2<'_, f64>) -> ResidualResult<ValueAndJacobian> {
        if x_query.ncols() != self.state_dimension() {
            return Err(ResidualError::shape(
                self.state_dimension(),
                x_query.ncols(),
                "query batch trailing dimension",
            ));
        }
        if x_query.nrows() == 0 {
            return Err(ResidualError::shape(1, 0, "query batch rows"));
        }

        let reduced = self.selector.apply(&x_query)?;
        let posterior = self.gp.posterior_with_gradient(reduced.view())?;
        let jacobian = self.selector.lift_jacobian(posterior.gradient.view())?;
        Ok(ValueAndJacobian {
            value: posterior.mean,
            jacobian,
        })
    }

    /// Wait until every recorded observation has been handled by the strategy.
    pub fn flush(&mut self) -> ResidualResult<()> {
        self.strategy.flush()
    }

    pub fn last_error(&self) -> Option<ResidualError> {
        self.strategy.last_error()
    }
}

impl ResidualModel<ExactGp> {
    /// Build the selector, predictor and strategy described by `config`.
    pub fn from_config(config: &ResidualConfig) -> ResidualResult<Self> {
        let selector = config.build_selector()?;
        let mut gp = config.build_gp(&selector)?;
        gp.eval();
        let strategy = config.strategy.build()?;
        Self::new(gp, selector, strategy)
    }
}

impl<P: GpPredictor + std::fmt::Debug> std::fmt::Debug for ResidualModel<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualModel")
            .field("gp", &self.gp)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gp::GpHyperparameters;
    use crate::selector::FeatureMask;
    use crate::strategy::OnlineLearningStrategy;
    use ndarray::array;

    fn online_model(mask: Option<Vec<bool>>, capacity: usize) -> ResidualModel {
        let selector = FeatureSelector::new(mask.map(FeatureMask::new), 3).unwrap();
        let mut gp = ExactGp::new(
            selector.input_dimension(),
            2,
            GpHyperparameters::isotropic(2, 1.0, 1.0, 1e-3),
        )
        .unwrap();
        gp.eval();
        let strategy = Box::new(OnlineLearningStrategy::new(capacity).unwrap());
        ResidualModel::new(gp, selector, strategy).unwrap()
    }

    #[test]
    fn training_mode_predictor_is_rejected() {
        let selector = FeatureSelector::identity(2).unwrap();
        let gp = ExactGp::new(2, 1, GpHyperparameters::isotropic(1, 1.0, 1.0, 0.1)).unwrap();
        let strategy = Box::new(OnlineLearningStrategy::new(3).unwrap());
        let err = ResidualModel::new(gp, selector, strategy).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn predictor_width_must_match_selector() {
        let selector = FeatureSelector::new(Some(FeatureMask::new(vec![true, false])), 2).unwrap();
        let mut gp = ExactGp::new(2, 1, GpHyperparameters::isotropic(1, 1.0, 1.0, 0.1)).unwrap();
        gp.eval();
        let strategy = Box::new(OnlineLearningStrategy::new(3).unwrap());
        assert!(ResidualModel::new(gp, selector, strategy).unwrap_err().is_shape());
    }

    #[test]
    fn recorded_points_are_visible_to_the_next_query() {
        let mut model = online_model(None, 10);
        let x = array![0.2, -0.1, 0.4];
        let before = model.value_and_jacobian(x.view().insert_axis(ndarray::Axis(0))).unwrap();
        assert_eq!(before.value, Array2::<f64>::zeros((1, 2)));

        model.record_datapoint(x.view(), array![1.0, -1.0].view()).unwrap();
        let after = model.value_and_jacobian(x.view().insert_axis(ndarray::Axis(0))).unwrap();
        assert!(after.value[[0, 0]] > 0.9);
        assert!(after.value[[0, 1]] < -0.9);
    }

    #[test]
    fn masked_columns_of_jacobian_are_zero() {
        let mut model = online_model(Some(vec![true, false, true]), 10);
        for k in 0..4 {
            let k = k as f64;
            model
                .record_datapoint(array![k, 5.0 * k, -k].view(), array![k.sin(), k.cos()].view())
                .unwrap();
        }

        let query = array![[0.5, 1.0, -0.5], [1.5, -2.0, 0.0], [3.0, 0.0, 1.0]];
        let result = model.value_and_jacobian(query.view()).unwrap();
        assert_eq!(result.value.dim(), (3, 2));
        assert_eq!(result.jacobian.dim(), (2, 3, 3));
        for r in 0..2 {
            for n in 0..3 {
                assert_eq!(result.jacobian[[r, n, 1]], 0.0);
            }
        }
    }

    #[test]
    fn shape_errors_leave_state_untouched() {
        let mut model = online_model(None, 10);
        assert!(model
            .record_datapoint(array![1.0, 2.0].view(), array![1.0, 2.0].view())
            .unwrap_err()
            .is_shape());
        assert!(model
            .record_datapoint(array![1.0, 2.0, 3.0].view(), array![1.0].view())
            .unwrap_err()
            .is_shape());
        assert!(model.gp().training_set().is_empty());

        let bad_query = Array2::<f64>::zeros((2, 4));
        assert!(model.value_and_jacobian(bad_query.view()).unwrap_err().is_shape());
    }
}
