// stance_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::models::DynamicalSystem;
pub use crate::types::{ContactId, Control, ImuId, Measurement, State, TimeIndex};

// --- Kinematics (The "nouns" of the library) ---
pub use crate::kinematics::{Flags, Kinematics, Orientation};

// --- Estimation Algorithms ---
pub use crate::estimation::{ExtendedKalmanFilter, FilterSizes};

// --- Kinetics Observer ---
pub use crate::config::ObserverConfig;
pub use crate::error::{EstimationError, KinematicsError, ObserverError};
pub use crate::estimation::kinetics_observer::{BlockCovariances, StateBlock};
pub use crate::estimation::{ContactParams, KineticsObserver, ObserverSnapshot};
pub use crate::models::kinetics::contact::ContactModel;
