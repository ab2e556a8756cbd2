// stance_core/src/estimation/covariance.rs

//! Helpers for dense covariance matrices.

use nalgebra::DMatrix;

use crate::error::{EstimationError, EstimationResult};

/// Replaces `p` with `(p + p^T) / 2`.
pub fn symmetrize(p: &mut DMatrix<f64>) {
    let transposed = p.transpose();
    *p += transposed;
    *p *= 0.5;
}

/// Writes `block` on the diagonal of `p` at `index` and zeroes every
/// cross-covariance between that block and the rest of the matrix.
pub fn set_block_covariance(
    p: &mut DMatrix<f64>,
    block: &DMatrix<f64>,
    index: usize,
) -> EstimationResult<()> {
    let size = block.nrows();
    if block.ncols() != size || index + size > p.nrows() || p.nrows() != p.ncols() {
        return Err(EstimationError::dimension(
            "covariance block",
            (size, size),
            (block.nrows(), block.ncols()),
        ));
    }

    p.rows_mut(index, size).fill(0.0);
    p.columns_mut(index, size).fill(0.0);
    p.view_mut((index, index), (size, size)).copy_from(block);
    Ok(())
}

/// Writes `block` on the diagonal of `p` at `index`, leaving every other
/// entry untouched.
pub fn set_diagonal_block(
    p: &mut DMatrix<f64>,
    block: &DMatrix<f64>,
    index: usize,
) -> EstimationResult<()> {
    let size = block.nrows();
    if block.ncols() != size || index + size > p.nrows() {
        return Err(EstimationError::dimension(
            "covariance block",
            (size, size),
            (block.nrows(), block.ncols()),
        ));
    }
    p.view_mut((index, index), (size, size)).copy_from(block);
    Ok(())
}

/// Copies the square block of `p` starting at `index`.
pub fn diagonal_block(p: &DMatrix<f64>, index: usize, size: usize) -> DMatrix<f64> {
    p.view((index, index), (size, size)).into_owned()
}

/// A diagonal matrix with `variance` repeated `size` times.
pub fn isotropic(size: usize, variance: f64) -> DMatrix<f64> {
    DMatrix::identity(size, size) * variance
}
