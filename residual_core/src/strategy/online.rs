use ndarray::ArrayView1;

use super::{check_observation, DataProcessingStrategy};
use crate::error::{ResidualError, ResidualResult};
use crate::gp::{GpPredictor, TrainingSet};
use crate::selector::FeatureSelector;

/// FIFO bound over a predictor's training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> ResidualResult<Self> {
        if capacity == 0 {
            return Err(ResidualError::configuration(
                "max_points_online",
                "0",
                "sliding window must hold at least one point",
            ));
        }
        Ok(Self { capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `(x_reduced, y)` and evict from the oldest end until the set
    /// fits. Returns how many points were evicted.
    pub fn admit(
        &self,
        set: &mut TrainingSet,
        x_reduced: ArrayView1<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> ResidualResult<usize> {
        set.push(x_reduced, y)?;
        Ok(set.truncate_oldest(self.capacity))
    }
}

/// Conditions the predictor on every observation, synchronously.
///
/// After [`process`](DataProcessingStrategy::process) returns, the
/// predictor's training set holds the `max_points_online` most recent points
/// in arrival order.
#[derive(Debug, Clone)]
pub struct OnlineLearningStrategy {
    window: SlidingWindow,
    admitted: u64,
    evicted: u64,
}

impl OnlineLearningStrategy {
    pub fn new(max_points_online: usize) -> ResidualResult<Self> {
        Ok(Self {
            window: SlidingWindow::new(max_points_online)?,
            admitted: 0,
            evicted: 0,
        })
    }

    pub fn max_points_online(&self) -> usize {
        self.window.capacity()
    }

    /// Points admitted since construction.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Points evicted since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl DataProcessingStrategy for OnlineLearningStrategy {
    fn process(
        &mut self,
        x: ArrayView1<'_, f64>,
        y: ArrayView1<'_, f64>,
        selector: &FeatureSelector,
        gp: &mut dyn GpPredictor,
    ) -> ResidualResult<()> {
        check_observation(x, y, selector, gp)?;
        let reduced = selector.apply(&x)?;
        if reduced.len() != gp.input_dimension() {
            return Err(ResidualError::shape(
                gp.input_dimension(),
                reduced.len(),
                "reduced state",
            ));
        }

        let evicted = self.window.admit(gp.training_set_mut(), reduced.view(), y)?;
        self.admitted += 1;
        if evicted > 0 {
            self.evicted += evicted as u64;
            tracing::trace!(
                evicted,
                capacity = self.window.capacity(),
                "sliding window evicted oldest points"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gp::{ExactGp, GpHyperparameters};
    use crate::selector::FeatureMask;
    use ndarray::{array, Array1};

    fn empty_gp(input: usize, residual: usize) -> ExactGp {
        let mut gp = ExactGp::new(
            input,
            residual,
            GpHyperparameters::isotropic(residual, 1.0, 1.0, 0.01),
        )
        .unwrap();
        gp.eval();
        gp
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(OnlineLearningStrategy::new(0).unwrap_err().is_configuration());
    }

    #[test]
    fn window_keeps_most_recent_points_in_order() {
        let selector =
            FeatureSelector::new(Some(FeatureMask::new(vec![true, false, true])), 3).unwrap();
        let mut gp = empty_gp(2, 2);
        let mut strategy = OnlineLearningStrategy::new(5).unwrap();

        for k in 1..=7 {
            let k = k as f64;
            let x = array![k, 100.0 + k, -k];
            let y = array![10.0 * k, -10.0 * k];
            strategy.process(x.view(), y.view(), &selector, &mut gp).unwrap();
            assert!(gp.training_set().len() <= 5);
        }

        let set = gp.training_set();
        assert_eq!(set.len(), 5);
        let expected_x: Vec<Array1<f64>> = (3..=7).map(|k| array![k as f64, -(k as f64)]).collect();
        let stored_x: Vec<Array1<f64>> = set.iter().map(|(x, _)| x.clone()).collect();
        assert_eq!(stored_x, expected_x);
        assert_eq!(set.targets().column(0).to_vec(), vec![30.0, 40.0, 50.0, 60.0, 70.0]);
        assert_eq!(strategy.admitted(), 7);
        assert_eq!(strategy.evicted(), 2);
    }

    #[test]
    fn wrong_target_width_leaves_training_set_untouched() {
        let selector = FeatureSelector::identity(2).unwrap();
        let mut gp = empty_gp(2, 1);
        let mut strategy = OnlineLearningStrategy::new(3).unwrap();

        let err = strategy
            .process(array![1.0, 2.0].view(), array![1.0, 2.0].view(), &selector, &mut gp)
            .unwrap_err();
        assert!(err.is_shape());
        assert!(gp.training_set().is_empty());
        assert_eq!(strategy.admitted(), 0);
    }
}
