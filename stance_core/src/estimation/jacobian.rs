// stance_core/src/estimation/jacobian.rs

use nalgebra::{DMatrix, DVector};

use crate::error::{EstimationError, EstimationResult};
use crate::types::State;

/// Central finite-difference Jacobian of `g` on a manifold.
///
/// Column `i` is `(g(x ⊕ h_i e_i) ⊖ g(x ⊕ -h_i e_i)) / 2h_i`, where `sum`
/// applies a tangent perturbation to `x` and `difference` maps two outputs
/// of `g` back to their tangent space. `steps` holds one step per tangent
/// coordinate of `x`.
///
/// # Arguments
/// * `x`: The linearization point.
/// * `steps`: Per-coordinate perturbation steps; its length is the column count.
/// * `sum`: Applies a tangent perturbation to `x`.
/// * `g`: The function to differentiate.
/// * `difference`: Tangent-space difference between two outputs of `g`.
///
/// # Returns
/// The `rows x steps.len()` Jacobian, where `rows` is the tangent size of `g`'s output.
pub fn central_difference<S, G, D>(
    x: &State,
    steps: &DVector<f64>,
    sum: S,
    g: G,
    difference: D,
) -> EstimationResult<DMatrix<f64>>
where
    S: Fn(&State, &DVector<f64>) -> State,
    G: Fn(&State) -> EstimationResult<DVector<f64>>,
    D: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64>,
{
    let cols = steps.len();
    let mut jacobian: Option<DMatrix<f64>> = None;
    let mut dx = DVector::zeros(cols);

    for i in 0..cols {
        let h = steps[i];

        dx[i] = h;
        let plus = g(&sum(x, &dx))?;
        dx[i] = -h;
        let minus = g(&sum(x, &dx))?;
        dx[i] = 0.0;

        let column = difference(&plus, &minus) / (2.0 * h);
        let jac = jacobian.get_or_insert_with(|| DMatrix::zeros(column.len(), cols));
        if column.len() != jac.nrows() {
            return Err(EstimationError::dimension(
                "finite-difference column",
                (jac.nrows(), 1),
                (column.len(), 1),
            ));
        }
        jac.set_column(i, &column);
    }

    Ok(jacobian.unwrap_or_else(|| DMatrix::zeros(0, 0)))
}
