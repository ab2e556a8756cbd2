// stance_core/src/estimation/filters/ekf.rs

use std::collections::BTreeMap;

use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::warn;

use crate::error::{EstimationError, EstimationResult};
use crate::estimation::covariance::symmetrize;
use crate::estimation::jacobian::central_difference;
use crate::models::DynamicalSystem;
use crate::types::{Control, Measurement, State, TimeIndex};

/// Dimensions of an estimation problem.
///
/// The tangent sizes are the dimensions of the error spaces; they differ from
/// the vector sizes when the state or measurement holds rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSizes {
    pub state: usize,
    pub state_tangent: usize,
    pub measurement: usize,
    pub measurement_tangent: usize,
    pub input: usize,
}

impl FilterSizes {
    /// Sizes of a problem without rotations.
    pub fn euclidean(state: usize, measurement: usize, input: usize) -> Self {
        Self {
            state,
            state_tangent: state,
            measurement,
            measurement_tangent: measurement,
            input,
        }
    }
}

/// An Extended Kalman Filter whose error lives in the tangent space of the state.
///
/// The filter owns the time-indexed state, the pending measurements and inputs,
/// and the matrices A, C, Q, R and P. The nonlinear model is borrowed on each
/// call through [`DynamicalSystem`]. Matrices that are not set are `None`; an
/// estimation step requested while any of them is missing fails immediately.
#[derive(Debug, Clone)]
pub struct ExtendedKalmanFilter {
    sizes: FilterSizes,

    time: TimeIndex,
    state: Option<State>,
    measurements: BTreeMap<TimeIndex, Measurement>,
    inputs: BTreeMap<TimeIndex, Control>,

    a: Option<DMatrix<f64>>,
    c: Option<DMatrix<f64>>,
    q: Option<DMatrix<f64>>,
    r: Option<DMatrix<f64>>,
    p: Option<DMatrix<f64>>,

    // Intermediate values of the last successful step.
    prediction: Option<State>,
    predicted_measurement: Option<Measurement>,
    innovation: Option<DVector<f64>>,
    correction: Option<DVector<f64>>,
    gain: Option<DMatrix<f64>>,
}

impl ExtendedKalmanFilter {
    /// Creates a filter with the given sizes and no state or matrices.
    pub fn new(sizes: FilterSizes) -> Self {
        Self {
            sizes,
            time: 0,
            state: None,
            measurements: BTreeMap::new(),
            inputs: BTreeMap::new(),
            a: None,
            c: None,
            q: None,
            r: None,
            p: None,
            prediction: None,
            predicted_measurement: None,
            innovation: None,
            correction: None,
            gain: None,
        }
    }

    pub fn sizes(&self) -> FilterSizes {
        self.sizes
    }

    // --- Sizes ---

    /// Changes the state sizes. Every matrix and vector depending on them is cleared.
    pub fn set_state_size(&mut self, state: usize, state_tangent: usize) {
        if state != self.sizes.state || state_tangent != self.sizes.state_tangent {
            self.sizes.state = state;
            self.sizes.state_tangent = state_tangent;
            self.state = None;
            self.a = None;
            self.c = None;
            self.q = None;
            self.p = None;
            self.clear_intermediates();
        }
    }

    /// Changes the measurement sizes. Clears C, R and stored measurements when they change.
    pub fn set_measurement_size(&mut self, measurement: usize, measurement_tangent: usize) {
        if measurement != self.sizes.measurement
            || measurement_tangent != self.sizes.measurement_tangent
        {
            self.sizes.measurement = measurement;
            self.sizes.measurement_tangent = measurement_tangent;
            self.c = None;
            self.r = None;
            self.measurements.clear();
        }
    }

    /// Clears A, C, Q, R and P. Sizes, state and time are preserved.
    pub fn reset(&mut self) {
        self.a = None;
        self.c = None;
        self.q = None;
        self.r = None;
        self.p = None;
        self.clear_intermediates();
    }

    fn clear_intermediates(&mut self) {
        self.prediction = None;
        self.predicted_measurement = None;
        self.innovation = None;
        self.correction = None;
        self.gain = None;
    }

    // --- State, Measurements & Inputs ---

    /// Sets the state estimate at time `k`. Later measurements are kept.
    pub fn set_state(&mut self, x: State, k: TimeIndex) -> EstimationResult<()> {
        check_vector("state", &x, self.sizes.state)?;
        self.state = Some(x);
        self.time = k;
        self.measurements.retain(|&t, _| t > k);
        Ok(())
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn current_time(&self) -> TimeIndex {
        self.time
    }

    pub fn set_measurement(&mut self, y: Measurement, k: TimeIndex) -> EstimationResult<()> {
        check_vector("measurement", &y, self.sizes.measurement)?;
        self.measurements.insert(k, y);
        Ok(())
    }

    pub fn measurement(&self, k: TimeIndex) -> Option<&Measurement> {
        self.measurements.get(&k)
    }

    /// Sets the input applied from time `k`. The input holds until a newer one is set.
    pub fn set_input(&mut self, u: Control, k: TimeIndex) -> EstimationResult<()> {
        check_vector("input", &u, self.sizes.input)?;
        self.inputs.insert(k, u);
        Ok(())
    }

    /// The input in effect at time `k`, zero when none was ever set.
    pub fn input(&self, k: TimeIndex) -> Control {
        self.inputs
            .range(..=k)
            .next_back()
            .map(|(_, u)| u.clone())
            .unwrap_or_else(|| Control::zeros(self.sizes.input))
    }

    // --- Matrices ---

    pub fn set_a(&mut self, a: DMatrix<f64>) -> EstimationResult<()> {
        let nt = self.sizes.state_tangent;
        check_matrix("A", &a, (nt, nt))?;
        self.a = Some(a);
        Ok(())
    }

    pub fn set_c(&mut self, c: DMatrix<f64>) -> EstimationResult<()> {
        check_matrix("C", &c, (self.sizes.measurement_tangent, self.sizes.state_tangent))?;
        self.c = Some(c);
        Ok(())
    }

    pub fn set_q(&mut self, q: DMatrix<f64>) -> EstimationResult<()> {
        let nt = self.sizes.state_tangent;
        check_matrix("Q", &q, (nt, nt))?;
        self.q = Some(q);
        Ok(())
    }

    pub fn set_r(&mut self, r: DMatrix<f64>) -> EstimationResult<()> {
        let mt = self.sizes.measurement_tangent;
        check_matrix("R", &r, (mt, mt))?;
        self.r = Some(r);
        Ok(())
    }

    pub fn set_state_covariance(&mut self, p: DMatrix<f64>) -> EstimationResult<()> {
        let nt = self.sizes.state_tangent;
        check_matrix("P", &p, (nt, nt))?;
        self.p = Some(p);
        Ok(())
    }

    pub fn a(&self) -> Option<&DMatrix<f64>> {
        self.a.as_ref()
    }

    pub fn c(&self) -> Option<&DMatrix<f64>> {
        self.c.as_ref()
    }

    pub fn q(&self) -> Option<&DMatrix<f64>> {
        self.q.as_ref()
    }

    pub fn r(&self) -> Option<&DMatrix<f64>> {
        self.r.as_ref()
    }

    pub fn state_covariance(&self) -> Option<&DMatrix<f64>> {
        self.p.as_ref()
    }

    // --- Last step ---

    /// The prediction `f(x_k)` of the last successful step.
    pub fn last_prediction(&self) -> Option<&State> {
        self.prediction.as_ref()
    }

    /// The measurement predicted from the last prediction.
    pub fn last_predicted_measurement(&self) -> Option<&Measurement> {
        self.predicted_measurement.as_ref()
    }

    /// The innovation `y ⊖ h(x̄)` of the last step.
    pub fn last_innovation(&self) -> Option<&DVector<f64>> {
        self.innovation.as_ref()
    }

    /// The state correction `K z` applied by the last step.
    pub fn last_correction(&self) -> Option<&DVector<f64>> {
        self.correction.as_ref()
    }

    pub fn last_gain(&self) -> Option<&DMatrix<f64>> {
        self.gain.as_ref()
    }

    // --- Jacobians ---

    /// Central finite-difference state Jacobian at the current state.
    ///
    /// `dx` holds one perturbation step per tangent coordinate.
    pub fn a_matrix_fd<F: DynamicalSystem + ?Sized>(
        &self,
        functor: &F,
        dx: &DVector<f64>,
    ) -> EstimationResult<DMatrix<f64>> {
        let x = self.state.as_ref().ok_or(EstimationError::MissingState)?;
        check_vector("finite-difference step", dx, self.sizes.state_tangent)?;
        let k = self.time;
        let u = self.input(k);

        central_difference(
            x,
            dx,
            |x, d| functor.state_sum(x, d),
            |x| functor.state_dynamics(x, &u, k),
            |a, b| functor.state_difference(a, b),
        )
    }

    /// Central finite-difference measurement Jacobian at the prediction `f(x_k)`.
    pub fn c_matrix_fd<F: DynamicalSystem + ?Sized>(
        &self,
        functor: &F,
        dx: &DVector<f64>,
    ) -> EstimationResult<DMatrix<f64>> {
        let x = self.state.as_ref().ok_or(EstimationError::MissingState)?;
        check_vector("finite-difference step", dx, self.sizes.state_tangent)?;
        let k = self.time;
        let u = self.input(k);
        let x_bar = functor.state_dynamics(x, &u, k)?;
        let u_next = self.input(k + 1);

        if self.sizes.measurement == 0 {
            return Ok(DMatrix::zeros(0, self.sizes.state_tangent));
        }

        central_difference(
            &x_bar,
            dx,
            |x, d| functor.state_sum(x, d),
            |x| functor.measure_dynamics(x, &u_next, k + 1),
            |a, b| functor.measurement_difference(a, b),
        )
    }

    // --- Estimation ---

    /// Runs one prediction and correction, moving the estimate from `k` to `k + 1`.
    ///
    /// Nothing is committed unless the whole step succeeds: on error the state,
    /// covariance and time are left as they were. An empty measurement runs
    /// the prediction only.
    pub fn one_step_estimation<F: DynamicalSystem + ?Sized>(
        &mut self,
        functor: &F,
    ) -> EstimationResult<&State> {
        let k = self.time;
        let next = k + 1;
        let sizes = self.sizes;
        let x = self.state.as_ref().ok_or(EstimationError::MissingState)?;

        let empty = Measurement::zeros(0);
        let y = if sizes.measurement == 0 {
            self.measurements.get(&next).unwrap_or(&empty)
        } else {
            self.measurements
                .get(&next)
                .ok_or(EstimationError::MissingMeasurement(next))?
        };

        let a = self.a.as_ref().ok_or(EstimationError::Uninitialized("A"))?;
        let c = self.c.as_ref().ok_or(EstimationError::Uninitialized("C"))?;
        let q = self.q.as_ref().ok_or(EstimationError::Uninitialized("Q"))?;
        let r = self.r.as_ref().ok_or(EstimationError::Uninitialized("R"))?;
        let p = self.p.as_ref().ok_or(EstimationError::Uninitialized("P"))?;

        let u = self.input(k);
        let u_next = self.input(next);

        // 1. Predict the state and the measurement it implies.
        let x_bar = functor.state_dynamics(x, &u, k)?;
        check_vector("predicted state", &x_bar, sizes.state)?;
        let y_bar = functor.measure_dynamics(&x_bar, &u_next, next)?;
        check_vector("predicted measurement", &y_bar, sizes.measurement)?;

        // 2. Propagate the covariance: P̄ = A P A^T + Q
        let p_bar = a * p * a.transpose() + q;

        let (x_next, mut p_next, z, dx, gain) = if sizes.measurement_tangent == 0 {
            let nt = sizes.state_tangent;
            (
                x_bar.clone(),
                p_bar,
                DVector::zeros(0),
                DVector::zeros(nt),
                DMatrix::zeros(nt, 0),
            )
        } else {
            // 3. Innovation and its covariance: S = R + C P̄ C^T
            let z = functor.measurement_difference(y, &y_bar);
            let s = r + c * &p_bar * c.transpose();

            // 4. Invert S through its Cholesky factor.
            let s_inv = match Cholesky::new(s) {
                Some(chol) => chol.inverse(),
                None => {
                    warn!(time = next, "innovation covariance is not positive definite");
                    return Err(EstimationError::NotPositiveDefinite);
                }
            };

            // 5. Gain: K = P̄ C^T S^-1
            let gain = &p_bar * c.transpose() * s_inv;

            // 6. Correct the prediction on the manifold.
            let dx = &gain * &z;
            let x_next = functor.state_sum(&x_bar, &dx);

            // 7. Update the covariance: P = (I - K C) P̄
            let identity = DMatrix::<f64>::identity(sizes.state_tangent, sizes.state_tangent);
            let p_next = (identity - &gain * c) * &p_bar;
            (x_next, p_next, z, dx, gain)
        };
        symmetrize(&mut p_next);

        if x_next.iter().chain(p_next.iter()).any(|v| !v.is_finite()) {
            warn!(time = next, "estimation step produced non-finite values");
            return Err(EstimationError::NonFinite);
        }

        // Commit.
        self.state = Some(x_next);
        self.p = Some(p_next);
        self.time = next;
        self.prediction = Some(x_bar);
        self.predicted_measurement = Some(y_bar);
        self.innovation = Some(z);
        self.correction = Some(dx);
        self.gain = Some(gain);
        self.measurements.retain(|&t, _| t > next);
        let latest_input = self.inputs.range(..=next).next_back().map(|(&t, _)| t);
        if let Some(latest) = latest_input {
            self.inputs.retain(|&t, _| t >= latest);
        }

        self.state.as_ref().ok_or(EstimationError::MissingState)
    }

    /// Repeats one-step estimation until the estimate reaches time `k`.
    pub fn estimate_to<F: DynamicalSystem + ?Sized>(
        &mut self,
        k: TimeIndex,
        functor: &F,
    ) -> EstimationResult<&State> {
        while self.time < k {
            self.one_step_estimation(functor)?;
        }
        self.state.as_ref().ok_or(EstimationError::MissingState)
    }
}

fn check_vector(name: &'static str, v: &DVector<f64>, expected: usize) -> EstimationResult<()> {
    if v.len() != expected {
        return Err(EstimationError::dimension(name, (expected, 1), (v.len(), 1)));
    }
    Ok(())
}

fn check_matrix(
    name: &'static str,
    m: &DMatrix<f64>,
    expected: (usize, usize),
) -> EstimationResult<()> {
    if m.shape() != expected {
        return Err(EstimationError::dimension(name, expected, m.shape()));
    }
    Ok(())
}
