// stance_core/src/models/kinetics/inertia.rs

use nalgebra::{Matrix3, Vector3, Vector6};

use crate::error::{ObserverError, Result};
use crate::types::TimeIndex;

/// Inertial parameters of the body, supplied by an external robot model.
///
/// Everything is expressed in the body frame. The inertia tensor is taken
/// about the center of mass. When only a zeroth-order quantity is pushed, its
/// derivatives are synthesized by finite differences against the previous
/// push, using the number of elapsed cycles times the sampling time.
#[derive(Debug, Clone, PartialEq)]
pub struct InertialInputs {
    pub mass: f64,

    inertia: Matrix3<f64>,
    inertia_inverse: Matrix3<f64>,
    pub inertia_derivative: Matrix3<f64>,
    inertia_time: Option<TimeIndex>,

    pub center_of_mass: Vector3<f64>,
    pub center_of_mass_velocity: Vector3<f64>,
    pub center_of_mass_acceleration: Vector3<f64>,
    com_time: Option<TimeIndex>,

    pub angular_momentum: Vector3<f64>,
    pub angular_momentum_derivative: Vector3<f64>,
    momentum_time: Option<TimeIndex>,
}

impl InertialInputs {
    pub fn new(mass: f64) -> Self {
        Self {
            mass,
            inertia: Matrix3::identity(),
            inertia_inverse: Matrix3::identity(),
            inertia_derivative: Matrix3::zeros(),
            inertia_time: None,
            center_of_mass: Vector3::zeros(),
            center_of_mass_velocity: Vector3::zeros(),
            center_of_mass_acceleration: Vector3::zeros(),
            com_time: None,
            angular_momentum: Vector3::zeros(),
            angular_momentum_derivative: Vector3::zeros(),
            momentum_time: None,
        }
    }

    /// Forgets every pushed value, keeping the mass.
    pub fn reset(&mut self) {
        *self = Self::new(self.mass);
    }

    // --- Inertia ---

    pub fn inertia(&self) -> &Matrix3<f64> {
        &self.inertia
    }

    pub fn inertia_inverse(&self) -> &Matrix3<f64> {
        &self.inertia_inverse
    }

    pub fn set_inertia(&mut self, inertia: Matrix3<f64>, k: TimeIndex, dt: f64) -> Result<()> {
        let inverse = inertia.try_inverse().ok_or(ObserverError::SingularInertia)?;
        if let Some(elapsed) = elapsed(self.inertia_time, k, dt) {
            self.inertia_derivative = (inertia - self.inertia) / elapsed;
        }
        self.inertia = inertia;
        self.inertia_inverse = inverse;
        self.inertia_time = Some(k);
        Ok(())
    }

    pub fn set_inertia_with_derivative(
        &mut self,
        inertia: Matrix3<f64>,
        derivative: Matrix3<f64>,
        k: TimeIndex,
    ) -> Result<()> {
        let inverse = inertia.try_inverse().ok_or(ObserverError::SingularInertia)?;
        self.inertia = inertia;
        self.inertia_inverse = inverse;
        self.inertia_derivative = derivative;
        self.inertia_time = Some(k);
        Ok(())
    }

    // --- Center of mass ---

    pub fn set_center_of_mass(&mut self, com: Vector3<f64>, k: TimeIndex, dt: f64) {
        match elapsed(self.com_time, k, dt) {
            Some(elapsed) => {
                let velocity = (com - self.center_of_mass) / elapsed;
                self.center_of_mass_acceleration = (velocity - self.center_of_mass_velocity) / elapsed;
                self.center_of_mass_velocity = velocity;
            }
            None if self.com_time.is_none() => {
                self.center_of_mass_velocity = Vector3::zeros();
                self.center_of_mass_acceleration = Vector3::zeros();
            }
            None => {}
        }
        self.center_of_mass = com;
        self.com_time = Some(k);
    }

    pub fn set_center_of_mass_with_velocity(
        &mut self,
        com: Vector3<f64>,
        velocity: Vector3<f64>,
        k: TimeIndex,
        dt: f64,
    ) {
        if let Some(elapsed) = elapsed(self.com_time, k, dt) {
            self.center_of_mass_acceleration = (velocity - self.center_of_mass_velocity) / elapsed;
        }
        self.center_of_mass = com;
        self.center_of_mass_velocity = velocity;
        self.com_time = Some(k);
    }

    pub fn set_center_of_mass_with_derivatives(
        &mut self,
        com: Vector3<f64>,
        velocity: Vector3<f64>,
        acceleration: Vector3<f64>,
        k: TimeIndex,
    ) {
        self.center_of_mass = com;
        self.center_of_mass_velocity = velocity;
        self.center_of_mass_acceleration = acceleration;
        self.com_time = Some(k);
    }

    // --- Angular momentum ---

    pub fn set_angular_momentum(&mut self, sigma: Vector3<f64>, k: TimeIndex, dt: f64) {
        if let Some(elapsed) = elapsed(self.momentum_time, k, dt) {
            self.angular_momentum_derivative = (sigma - self.angular_momentum) / elapsed;
        }
        self.angular_momentum = sigma;
        self.momentum_time = Some(k);
    }

    pub fn set_angular_momentum_with_derivative(
        &mut self,
        sigma: Vector3<f64>,
        derivative: Vector3<f64>,
        k: TimeIndex,
    ) {
        self.angular_momentum = sigma;
        self.angular_momentum_derivative = derivative;
        self.momentum_time = Some(k);
    }
}

/// Builds a symmetric inertia matrix from `[Ixx, Iyy, Izz, Ixy, Ixz, Iyz]`.
pub fn inertia_from_vector(v: &Vector6<f64>) -> Matrix3<f64> {
    Matrix3::new(v[0], v[3], v[4], v[3], v[1], v[5], v[4], v[5], v[2])
}

// Time elapsed since a previous push, if there is one strictly older than `k`.
fn elapsed(previous: Option<TimeIndex>, k: TimeIndex, dt: f64) -> Option<f64> {
    match previous {
        Some(t) if t < k => Some((k - t) as f64 * dt),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_inertia_derivative_by_finite_difference() {
        let mut inputs = InertialInputs::new(10.0);
        let dt = 0.01;
        inputs.set_inertia(Matrix3::identity(), 1, dt).unwrap();
        assert_eq!(inputs.inertia_derivative, Matrix3::zeros());

        inputs.set_inertia(Matrix3::identity() * 1.02, 2, dt).unwrap();
        assert_abs_diff_eq!(inputs.inertia_derivative, Matrix3::identity() * 2.0, epsilon = 1e-9);

        // Two cycles later the slope uses both of them.
        inputs.set_inertia(Matrix3::identity() * 1.04, 4, dt).unwrap();
        assert_abs_diff_eq!(inputs.inertia_derivative, Matrix3::identity() * 1.0, epsilon = 1e-9);

        // Pushing again within the same cycle keeps the derivative.
        inputs.set_inertia(Matrix3::identity() * 5.0, 4, dt).unwrap();
        assert_abs_diff_eq!(inputs.inertia_derivative, Matrix3::identity() * 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(*inputs.inertia_inverse(), Matrix3::identity() * 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_inertia_is_rejected() {
        let mut inputs = InertialInputs::new(10.0);
        assert!(matches!(
            inputs.set_inertia(Matrix3::zeros(), 1, 0.01),
            Err(ObserverError::SingularInertia)
        ));
        assert_eq!(*inputs.inertia(), Matrix3::identity());
    }

    #[test]
    fn test_center_of_mass_derivatives() {
        let mut inputs = InertialInputs::new(10.0);
        let dt = 0.1;
        inputs.set_center_of_mass(Vector3::new(0.0, 0.0, 1.0), 1, dt);
        inputs.set_center_of_mass(Vector3::new(0.1, 0.0, 1.0), 2, dt);
        assert_abs_diff_eq!(inputs.center_of_mass_velocity, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_abs_diff_eq!(inputs.center_of_mass_acceleration, Vector3::new(10.0, 0.0, 0.0), epsilon = 1e-9);

        inputs.set_center_of_mass_with_velocity(Vector3::new(0.2, 0.0, 1.0), Vector3::new(1.5, 0.0, 0.0), 3, dt);
        assert_abs_diff_eq!(inputs.center_of_mass_acceleration, Vector3::new(5.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_angular_momentum_derivative() {
        let mut inputs = InertialInputs::new(10.0);
        inputs.set_angular_momentum(Vector3::new(1.0, 0.0, 0.0), 3, 0.5);
        inputs.set_angular_momentum(Vector3::new(2.0, 0.0, 0.0), 4, 0.5);
        assert_abs_diff_eq!(inputs.angular_momentum_derivative, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_inertia_from_vector() {
        let m = inertia_from_vector(&Vector6::new(1.0, 2.0, 3.0, 0.1, 0.2, 0.3));
        assert_eq!(m, m.transpose());
        assert_eq!(m[(0, 1)], 0.1);
        assert_eq!(m[(0, 2)], 0.2);
        assert_eq!(m[(1, 2)], 0.3);
        assert_eq!(m[(2, 2)], 3.0);
    }
}
