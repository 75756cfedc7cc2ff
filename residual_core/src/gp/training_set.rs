//! Ordered training data owned by a predictor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{ResidualError, ResidualResult};

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

/// Ordered sequence of `(x_reduced, y)` pairs in arrival order.
///
/// Every construction and mutation draws a fresh process-wide
/// [`TrainingSet::revision`], which predictors use to invalidate cached
/// factorizations even when a whole set is swapped out.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    inputs: VecDeque<Array1<f64>>,
    targets: VecDeque<Array1<f64>>,
    input_dimension: usize,
    output_dimension: usize,
    revision: u64,
}

impl TrainingSet {
    pub fn new(input_dimension: usize, output_dimension: usize) -> Self {
        Self {
            inputs: VecDeque::new(),
            targets: VecDeque::new(),
            input_dimension,
            output_dimension,
            revision: next_revision(),
        }
    }

    /// Build from row-aligned arrays `(n, input_dimension)` and `(n, output_dimension)`.
    pub fn from_arrays(inputs: ArrayView2<'_, f64>, targets: ArrayView2<'_, f64>) -> ResidualResult<Self> {
        if inputs.nrows() != targets.nrows() {
            return Err(ResidualError::shape(
                inputs.nrows(),
                targets.nrows(),
                "training target rows",
            ));
        }

        let mut set = Self::new(inputs.ncols(), targets.ncols());
        set.inputs = inputs.outer_iter().map(|row| row.to_owned()).collect();
        set.targets = targets.outer_iter().map(|row| row.to_owned()).collect();
        set.bump();
        Ok(set)
    }

    pub fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    pub fn output_dimension(&self) -> usize {
        self.output_dimension
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Append one pair at the newest end. Both dimensions are checked before
    /// anything is stored.
    pub fn push(&mut self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> ResidualResult<()> {
        if x.len() != self.input_dimension {
            return Err(ResidualError::shape(
                self.input_dimension,
                x.len(),
                "training input",
            ));
        }
        if y.len() != self.output_dimension {
            return Err(ResidualError::shape(
                self.output_dimension,
                y.len(),
                "training target",
            ));
        }

        self.inputs.push_back(x.to_owned());
        self.targets.push_back(y.to_owned());
        self.bump();
        Ok(())
    }

    /// Remove the pair at `index` (0 = oldest).
    pub fn remove(&mut self, index: usize) -> Option<(Array1<f64>, Array1<f64>)> {
        let x = self.inputs.remove(index)?;
        let y = self.targets.remove(index)?;
        self.bump();
        Some((x, y))
    }

    /// Evict oldest pairs until at most `capacity` remain. Returns the
    /// number evicted.
    pub fn truncate_oldest(&mut self, capacity: usize) -> usize {
        let excess = self.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }
        self.inputs.drain(..excess);
        self.targets.drain(..excess);
        self.bump();
        excess
    }

    pub fn clear(&mut self) {
        if self.is_empty() {
            return;
        }
        self.inputs.clear();
        self.targets.clear();
        self.bump();
    }

    pub fn get(&self, index: usize) -> Option<(&Array1<f64>, &Array1<f64>)> {
        Some((self.inputs.get(index)?, self.targets.get(index)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Array1<f64>, &Array1<f64>)> + '_ {
        self.inputs.iter().zip(self.targets.iter())
    }

    /// Inputs stacked into `(len, input_dimension)`, oldest first.
    pub fn inputs(&self) -> Array2<f64> {
        stack_rows(&self.inputs, self.input_dimension)
    }

    /// Targets stacked into `(len, output_dimension)`, oldest first.
    pub fn targets(&self) -> Array2<f64> {
        stack_rows(&self.targets, self.output_dimension)
    }

    fn bump(&mut self) {
        self.revision = next_revision();
    }
}

fn stack_rows(rows: &VecDeque<Array1<f64>>, width: usize) -> Array2<f64> {
    let mut stacked = Array2::zeros((rows.len(), width));
    for (mut dst, src) in stacked.outer_iter_mut().zip(rows.iter()) {
        dst.assign(src);
    }
    stacked
}
