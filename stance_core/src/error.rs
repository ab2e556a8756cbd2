// stance_core/src/error.rs

//! Error types for every layer of the crate.
//!
//! Kinematics errors are precondition failures of the manifold algebra,
//! estimation errors come from the generic filter engine, and observer errors
//! wrap both together with the configuration problems of the kinetics
//! observer itself.

use thiserror::Error;

use crate::types::{ContactId, TimeIndex};

/// A field a kinematics operation needed but could not find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicsField {
    Position,
    Orientation,
    LinearVelocity,
    AngularVelocity,
    LinearAcceleration,
    AngularAcceleration,
}

impl std::fmt::Display for KinematicsField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Position => "position",
            Self::Orientation => "orientation",
            Self::LinearVelocity => "linear velocity",
            Self::AngularVelocity => "angular velocity",
            Self::LinearAcceleration => "linear acceleration",
            Self::AngularAcceleration => "angular acceleration",
        };
        write!(f, "{name}")
    }
}

/// Errors raised by the kinematics algebra.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KinematicsError {
    /// An operand of `operation` lacks a field it requires.
    #[error("{operation} requires the {field} to be set")]
    MissingField {
        operation: &'static str,
        field: KinematicsField,
    },

    /// The right operand of a composition has neither position nor orientation.
    #[error("composition requires the right operand to carry a position or an orientation")]
    EmptyOperand,

    /// A flat vector has the wrong number of entries for the requested fields.
    #[error("kinematics vector has {found} entries, expected {expected}")]
    VectorSize { expected: usize, found: usize },
}

impl KinematicsError {
    #[must_use]
    pub fn missing(operation: &'static str, field: KinematicsField) -> Self {
        Self::MissingField { operation, field }
    }
}

/// Errors raised by the generic Kalman filter engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimationError {
    /// A supplied matrix or vector does not match the configured sizes.
    #[error("{name} has dimensions {found:?}, expected {expected:?}")]
    DimensionMismatch {
        name: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// A matrix required by the estimation step was never set (or was reset).
    #[error("{0} matrix is not initialized")]
    Uninitialized(&'static str),

    /// No measurement is stored for the time the filter must reach.
    #[error("no measurement available for time {0}")]
    MissingMeasurement(TimeIndex),

    /// The state has never been initialized.
    #[error("the filter state is not initialized")]
    MissingState,

    /// The innovation covariance could not be factorized.
    #[error("innovation covariance is not positive definite")]
    NotPositiveDefinite,

    /// The corrected state or covariance holds NaN or infinite values.
    #[error("estimation produced non-finite values")]
    NonFinite,

    /// The model functor could not evaluate its kinematics.
    #[error("model evaluation failed: {0}")]
    Model(#[from] KinematicsError),
}

impl EstimationError {
    #[must_use]
    pub fn dimension(name: &'static str, expected: (usize, usize), found: (usize, usize)) -> Self {
        Self::DimensionMismatch {
            name,
            expected,
            found,
        }
    }

    /// Numerical failures, as opposed to configuration mistakes.
    #[must_use]
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::NotPositiveDefinite | Self::NonFinite)
    }
}

/// Errors raised by the kinetics observer.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("contact {0} does not exist")]
    UnknownContact(ContactId),

    #[error("contact {0} already exists")]
    ContactExists(ContactId),

    #[error("contact id {id} does not fit under the maximum of {max} contacts")]
    ContactOutOfRange { id: ContactId, max: usize },

    #[error("all {0} contact slots are in use")]
    TooManyContacts(usize),

    /// The supplied inertia matrix cannot be inverted.
    #[error("inertia matrix is singular")]
    SingularInertia,

    /// The absolute pose sensor needs both position and orientation.
    #[error("absolute pose sensor requires position and orientation")]
    IncompleteAbsolutePose,

    /// An accessor that depends on a correction was called before any.
    #[error("no correction step has been performed yet")]
    NoCorrectionYet,

    /// A configuration value is outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("snapshot does not match the observer: {0}")]
    SnapshotMismatch(String),

    #[error(transparent)]
    Kinematics(#[from] KinematicsError),

    #[error(transparent)]
    Estimation(#[from] EstimationError),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ObserverError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

pub type KinematicsResult<T> = std::result::Result<T, KinematicsError>;
pub type EstimationResult<T> = std::result::Result<T, EstimationError>;
pub type Result<T> = std::result::Result<T, ObserverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinematics_error_display() {
        let err = KinematicsError::missing("inversion", KinematicsField::Orientation);
        assert_eq!(err.to_string(), "inversion requires the orientation to be set");
    }

    #[test]
    fn test_dimension_mismatch_display() {
        let err = EstimationError::dimension("P", (6, 6), (5, 6));
        let msg = err.to_string();
        assert!(msg.contains('P'));
        assert!(msg.contains("(6, 6)"));
        assert!(msg.contains("(5, 6)"));
    }

    #[test]
    fn test_numerical_classification() {
        assert!(EstimationError::NotPositiveDefinite.is_numerical());
        assert!(EstimationError::NonFinite.is_numerical());
        assert!(!EstimationError::Uninitialized("A").is_numerical());
    }

    #[test]
    fn test_observer_error_from_estimation() {
        let err: ObserverError = EstimationError::NonFinite.into();
        assert!(matches!(err, ObserverError::Estimation(EstimationError::NonFinite)));
        assert_eq!(err.to_string(), "estimation produced non-finite values");
    }

    #[test]
    fn test_contact_errors_display() {
        let err = ObserverError::ContactOutOfRange { id: 7, max: 4 };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('4'));
        assert_eq!(ObserverError::UnknownContact(2).to_string(), "contact 2 does not exist");
    }
}
