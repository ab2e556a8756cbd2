// stance_core/src/estimation/mod.rs

//! State estimation: a tangent-space Extended Kalman Filter and the kinetics
//! observer built on top of it.

pub mod covariance;
pub mod filters;
pub mod jacobian;
pub mod kinetics_observer;

pub use filters::ekf::{ExtendedKalmanFilter, FilterSizes};
pub use kinetics_observer::{ContactParams, KineticsObserver, ObserverSnapshot};
