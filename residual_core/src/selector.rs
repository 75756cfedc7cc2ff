//! Feature selection between the raw state vector and the regression input.
//!
//! A [`FeatureSelector`] keeps a fixed, order-preserving subset of the raw
//! state dimensions. It is a pure projection: the same input always yields the
//! same output, and batch order is never changed. The reverse direction,
//! [`FeatureSelector::lift_jacobian`], scatters derivatives computed over the
//! reduced features back onto the raw dimensions, leaving masked-out columns
//! exactly zero.

use ndarray::{s, Array, Array3, ArrayBase, ArrayView3, Axis, Data, RemoveAxis};

use crate::error::{ResidualError, ResidualResult};

/// Boolean selection over the raw state dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureMask(Vec<bool>);

impl FeatureMask {
    pub fn new(flags: Vec<bool>) -> Self {
        Self(flags)
    }

    /// Build a mask from 0/1 indicators; any non-zero entry selects.
    pub fn from_indicators(indicators: &[u8]) -> Self {
        Self(indicators.iter().map(|&v| v != 0).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of selected dimensions.
    pub fn count_selected(&self) -> usize {
        self.0.iter().filter(|&&flag| flag).count()
    }

    pub fn flags(&self) -> &[bool] {
        &self.0
    }

    fn selected_indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(idx, &flag)| flag.then_some(idx))
            .collect()
    }
}

impl From<Vec<bool>> for FeatureMask {
    fn from(flags: Vec<bool>) -> Self {
        Self::new(flags)
    }
}

/// Stateless reduction of raw state vectors to the regression input space.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSelector {
    state_dimension: usize,
    mask: Option<FeatureMask>,
    indices: Vec<usize>,
}

impl FeatureSelector {
    /// Create a selector over `state_dimension` raw dimensions.
    ///
    /// `None` selects every dimension. A mask of the wrong length is a
    /// shape error; a mask selecting nothing is a configuration error.
    pub fn new(mask: Option<FeatureMask>, state_dimension: usize) -> ResidualResult<Self> {
        if state_dimension == 0 {
            return Err(ResidualError::configuration(
                "state_dimension",
                "0",
                "must select from at least one raw dimension",
            ));
        }

        let indices = match &mask {
            None => (0..state_dimension).collect(),
            Some(mask) => {
                if mask.len() != state_dimension {
                    return Err(ResidualError::shape(
                        state_dimension,
                        mask.len(),
                        "feature mask length",
                    ));
                }
                if mask.count_selected() == 0 {
                    return Err(ResidualError::configuration(
                        "feature_mask",
                        format!("{:?}", mask.flags()),
                        "at least one dimension must be selected",
                    ));
                }
                mask.selected_indices()
            }
        };

        Ok(Self {
            state_dimension,
            mask,
            indices,
        })
    }

    /// Selector that keeps every dimension.
    pub fn identity(state_dimension: usize) -> ResidualResult<Self> {
        Self::new(None, state_dimension)
    }

    pub fn state_dimension(&self) -> usize {
        self.state_dimension
    }

    /// Number of dimensions handed to the predictor.
    pub fn input_dimension(&self) -> usize {
        self.indices.len()
    }

    pub fn mask(&self) -> Option<&FeatureMask> {
        self.mask.as_ref()
    }

    pub fn is_identity(&self) -> bool {
        self.indices.len() == self.state_dimension
    }

    /// Raw dimension indices that survive the projection, ascending.
    pub fn selected_indices(&self) -> &[usize] {
        &self.indices
    }

    /// Project a single state `(state_dimension)` or a batch
    /// `(N, state_dimension)` onto the selected dimensions.
    pub fn apply<S, D>(&self, x: &ArrayBase<S, D>) -> ResidualResult<Array<f64, D>>
    where
        S: Data<Elem = f64>,
        D: RemoveAxis,
    {
        let Some(last) = x.ndim().checked_sub(1) else {
            return Err(ResidualError::shape(1, 0, "feature selector input rank"));
        };
        let trailing = x.len_of(Axis(last));
        if trailing != self.state_dimension {
            return Err(ResidualError::shape(
                self.state_dimension,
                trailing,
                "feature selector input",
            ));
        }

        if self.is_identity() {
            return Ok(x.to_owned());
        }
        Ok(x.select(Axis(last), &self.indices))
    }

    /// Scatter a reduced Jacobian `(R, N, input_dimension)` onto the raw
    /// dimensions, producing `(R, N, state_dimension)`.
    pub fn lift_jacobian(&self, reduced: ArrayView3<'_, f64>) -> ResidualResult<Array3<f64>> {
        let (outputs, batch, inputs) = reduced.dim();
        if inputs != self.input_dimension() {
            return Err(ResidualError::shape(
                self.input_dimension(),
                inputs,
                "reduced jacobian",
            ));
        }

        if self.is_identity() {
            return Ok(reduced.to_owned());
        }

        let mut lifted = Array3::zeros((outputs, batch, self.state_dimension));
        for (reduced_idx, &raw_idx) in self.indices.iter().enumerate() {
            lifted
                .slice_mut(s![.., .., raw_idx])
                .assign(&reduced.slice(s![.., .., reduced_idx]));
        }
        Ok(lifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn mask(flags: &[bool]) -> Option<FeatureMask> {
        Some(FeatureMask::new(flags.to_vec()))
    }

    #[test]
    fn identity_keeps_every_dimension() {
        let selector = FeatureSelector::new(None, 3).unwrap();
        let x = array![1.0, 2.0, 3.0];
        assert_eq!(selector.apply(&x).unwrap(), x);
        assert_eq!(selector.input_dimension(), 3);
        assert!(selector.is_identity());
    }

    #[test]
    fn masked_vector_preserves_order() {
        let selector = FeatureSelector::new(mask(&[true, false, true, true]), 4).unwrap();
        let reduced = selector.apply(&array![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(reduced, array![0.1, 0.3, 0.4]);
    }

    #[test]
    fn masked_batch_preserves_row_order() {
        let selector = FeatureSelector::new(mask(&[false, true, true]), 3).unwrap();
        let batch = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let reduced = selector.apply(&batch).unwrap();
        assert_eq!(reduced, array![[2.0, 3.0], [5.0, 6.0]]);
    }

    #[test]
    fn apply_is_deterministic() {
        let selector = FeatureSelector::new(mask(&[true, false, true]), 3).unwrap();
        let batch = Array2::from_shape_fn((5, 3), |(r, c)| (r * 3 + c) as f64 * 0.5);
        let first = selector.apply(&batch).unwrap();
        let second = selector.apply(&batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn all_false_mask_is_configuration_error() {
        let err = FeatureSelector::new(mask(&[false, false]), 2).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn mask_length_mismatch_is_shape_error() {
        let err = FeatureSelector::new(mask(&[true, false]), 3).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn wrong_trailing_dimension_is_rejected() {
        let selector = FeatureSelector::identity(3).unwrap();
        let err = selector.apply(&array![[1.0, 2.0]]).unwrap_err();
        assert_eq!(err, ResidualError::shape(3, 2, "feature selector input"));
    }

    #[test]
    fn lift_jacobian_zeroes_masked_columns() {
        let selector = FeatureSelector::new(mask(&[true, false, true]), 3).unwrap();
        let reduced = Array3::from_shape_fn((2, 4, 2), |(r, n, d)| (r * 100 + n * 10 + d + 1) as f64);
        let lifted = selector.lift_jacobian(reduced.view()).unwrap();

        assert_eq!(lifted.dim(), (2, 4, 3));
        for r in 0..2 {
            for n in 0..4 {
                assert_eq!(lifted[[r, n, 0]], reduced[[r, n, 0]]);
                assert_eq!(lifted[[r, n, 1]], 0.0);
                assert_eq!(lifted[[r, n, 2]], reduced[[r, n, 1]]);
            }
        }
    }

    #[test]
    fn indicators_build_mask() {
        let mask = FeatureMask::from_indicators(&[1, 0, 1]);
        assert_eq!(mask.flags(), &[true, false, true]);
        assert_eq!(mask.count_selected(), 2);
    }
}
