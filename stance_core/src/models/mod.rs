// stance_core/src/models/mod.rs

use crate::error::EstimationResult;
use crate::types::{Control, Measurement, State, TimeIndex};
use nalgebra::DVector;

/// A discrete-time nonlinear system driven by a Kalman filter.
///
/// The filter borrows the system for each call and never owns it. Besides the
/// transition and measurement functions, the system defines how a tangent
/// perturbation is applied to a state (`state_sum`) and how two states or two
/// measurements are compared in tangent space. The defaults are plain vector
/// addition and subtraction; systems with rotations override them with
/// multiplicative versions.
pub trait DynamicalSystem {
    /// Computes the next state: `x_{k+1} = f(x_k, u_k, k)`.
    ///
    /// # Arguments
    /// * `x`: State at time `k`.
    /// * `u`: Input at time `k` (empty when the system has no input).
    /// * `k`: Time index of `x`.
    ///
    /// # Returns
    /// The state at time `k + 1`.
    fn state_dynamics(&self, x: &State, u: &Control, k: TimeIndex) -> EstimationResult<State>;

    /// Computes the measurement predicted for a state: `y_k = h(x_k, u_k, k)`.
    ///
    /// # Arguments
    /// * `x`: State at time `k`.
    /// * `u`: Input at time `k`.
    /// * `k`: Time index of `x`.
    fn measure_dynamics(&self, x: &State, u: &Control, k: TimeIndex)
        -> EstimationResult<Measurement>;

    /// Applies a tangent-space perturbation `dx` to a state: `x ⊕ dx`.
    fn state_sum(&self, x: &State, dx: &DVector<f64>) -> State {
        x + dx
    }

    /// The tangent vector `x1 ⊖ x2` such that `x2 ⊕ (x1 ⊖ x2) = x1`.
    fn state_difference(&self, x1: &State, x2: &State) -> DVector<f64> {
        x1 - x2
    }

    /// The tangent vector `y1 ⊖ y2` between two measurements.
    fn measurement_difference(&self, y1: &Measurement, y2: &Measurement) -> DVector<f64> {
        y1 - y2
    }
}

pub mod kinetics;
