//! Scaled RBF kernel and the dense Cholesky routines behind [`ExactGp`](super::ExactGp).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Diagonal jitter tried in order when a kernel matrix is not numerically
/// positive definite.
pub(crate) const JITTER_LADDER: [f64; 4] = [0.0, 1e-8, 1e-6, 1e-4];

/// `outputscale * exp(-0.5 * sum_d ((a_d - b_d) * inv_ls_d)^2)`
#[inline]
pub(crate) fn rbf(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    inv_lengthscales: ArrayView1<'_, f64>,
    outputscale: f64,
) -> f64 {
    let mut sq = 0.0f64;
    for ((&ai, &bi), &inv) in a.iter().zip(b.iter()).zip(inv_lengthscales.iter()) {
        let scaled = (ai - bi) * inv;
        sq += scaled * scaled;
    }
    outputscale * (-0.5 * sq).exp()
}

/// Symmetric kernel matrix over the rows of `x`, plus `noise` on the diagonal.
pub(crate) fn gram_matrix(
    x: ArrayView2<'_, f64>,
    inv_lengthscales: ArrayView1<'_, f64>,
    outputscale: f64,
    noise: f64,
) -> Array2<f64> {
    let n = x.nrows();
    let mut gram = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..i {
            let k = rbf(x.row(i), x.row(j), inv_lengthscales, outputscale);
            gram[[i, j]] = k;
            gram[[j, i]] = k;
        }
        gram[[i, i]] = outputscale + noise;
    }
    gram
}

/// Lower-triangular factor `L` with `A = L · L^T`, or `None` if a pivot is
/// not strictly positive.
pub(crate) fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0f64;
            for p in 0..j {
                sum += l[[i, p]] * l[[j, p]];
            }
            if i == j {
                let val = a[[i, i]] - sum;
                if !val.is_finite() || val <= 0.0 {
                    return None;
                }
                l[[i, j]] = val.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    Some(l)
}

/// Solve `L · L^T · x = b` given the lower factor `L`.
pub(crate) fn cholesky_solve(l: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = l.nrows();

    // Forward substitution: L · y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * y[j];
        }
        y[i] = sum / l[[i, i]];
    }

    // Back substitution: L^T · x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }

    x
}
