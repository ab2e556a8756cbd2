// stance_core/src/types.rs

use nalgebra::{DVector, SMatrix};

// --- Core Type Aliases ---
pub type State = DVector<f64>;
pub type Control = DVector<f64>;
pub type Measurement = DVector<f64>;

/// Discrete time index of the filter. Sensor readings are stamped with the
/// data index they were pushed at, estimates with the index they describe.
pub type TimeIndex = u64;

// --- Identifiers ---
pub type ContactId = usize;
pub type ImuId = usize;

// --- Fixed-size covariance block of a contact ---
pub type Matrix12 = SMatrix<f64, 12, 12>;

// --- Physical Constants ---
/// Standard gravity used by the dynamics and the accelerometer model (m/s^2).
pub const GRAVITY_CONSTANT: f64 = 9.8;
