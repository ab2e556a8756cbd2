// stance_core/src/config.rs

use std::path::Path;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # ObserverConfig
/// Every tunable of the kinetics observer. Missing fields fall back to
/// `Default`, so an empty TOML document yields the default observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverConfig {
    /// Number of contact slots reserved in the state vector.
    pub max_contacts: usize,
    /// Duration of one estimation cycle in seconds.
    pub sampling_time: f64,
    /// Total mass of the robot in kg.
    pub mass: f64,
    pub with_gyro_bias: bool,
    pub with_unmodeled_wrench: bool,
    /// Write the accelerations of the dynamics into the kinematics returned by `update`.
    pub with_acceleration_estimation: bool,
    /// Perturbation step of the finite-difference Jacobians.
    pub finite_difference_step: f64,

    pub state_init_variance: StateVariances,
    pub process_variance: StateVariances,
    pub sensor_variance: SensorVariances,
    pub contact_model: ContactModelConfig,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_contacts: 4,
            sampling_time: 1e-3,
            mass: 50.0,
            with_gyro_bias: true,
            with_unmodeled_wrench: false,
            with_acceleration_estimation: false,
            finite_difference_step: 1e-6,
            state_init_variance: StateVariances::initial(),
            process_variance: StateVariances::process(),
            sensor_variance: SensorVariances::default(),
            contact_model: ContactModelConfig::default(),
        }
    }
}

impl ObserverConfig {
    /// Loads a configuration from a TOML file, filling gaps with the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML string, filling gaps with the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

/// Per-block variances of the state, used for both the initial state
/// covariance and the process noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateVariances {
    pub position: f64,
    pub orientation: f64,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub gyro_bias: f64,
    pub unmodeled_force: f64,
    pub unmodeled_torque: f64,
    pub contact_position: f64,
    pub contact_orientation: f64,
    pub contact_force: f64,
    pub contact_torque: f64,
}

impl StateVariances {
    pub fn initial() -> Self {
        Self {
            position: 1e-4,
            orientation: 1e-4,
            linear_velocity: 1e-6,
            angular_velocity: 1e-6,
            gyro_bias: 1e-10,
            unmodeled_force: 1e4,
            unmodeled_torque: 1e2,
            contact_position: 1e-6,
            contact_orientation: 1e-6,
            contact_force: 1e4,
            contact_torque: 1e2,
        }
    }

    pub fn process() -> Self {
        Self {
            position: 1e-8,
            orientation: 1e-8,
            linear_velocity: 1e-8,
            angular_velocity: 1e-8,
            gyro_bias: 1e-12,
            unmodeled_force: 1e-8,
            unmodeled_torque: 1e-8,
            contact_position: 1e-8,
            contact_orientation: 1e-8,
            contact_force: 1e-8,
            contact_torque: 1e-8,
        }
    }
}

impl Default for StateVariances {
    fn default() -> Self {
        Self::initial()
    }
}

/// Default measurement variances, applied to sensors pushed without covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorVariances {
    pub accelerometer: f64,
    pub gyrometer: f64,
    pub force: f64,
    pub torque: f64,
    pub position: f64,
    pub orientation: f64,
}

impl Default for SensorVariances {
    fn default() -> Self {
        Self {
            accelerometer: 1e-4,
            gyrometer: 1e-8,
            force: 1e-8,
            torque: 1e-10,
            position: 1e-4,
            orientation: 1e-3,
        }
    }
}

/// Isotropic gains of the default visco-elastic contact model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContactModelConfig {
    pub linear_stiffness: f64,
    pub angular_stiffness: f64,
    pub linear_damping: f64,
    pub angular_damping: f64,
}

impl Default for ContactModelConfig {
    fn default() -> Self {
        Self {
            linear_stiffness: 40000.0,
            angular_stiffness: 400.0,
            linear_damping: 120.0,
            angular_damping: 12.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = ObserverConfig::from_toml_str("").unwrap();
        assert_eq!(config, ObserverConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = ObserverConfig::from_toml_str(
            r#"
            max_contacts = 2
            mass = 32.5

            [sensor_variance]
            accelerometer = 0.01

            [contact_model]
            linear_stiffness = 1000.0
            "#,
        )
        .unwrap();

        assert_eq!(config.max_contacts, 2);
        assert_eq!(config.mass, 32.5);
        assert_eq!(config.sensor_variance.accelerometer, 0.01);
        assert_eq!(config.sensor_variance.gyrometer, 1e-8);
        assert_eq!(config.contact_model.linear_stiffness, 1000.0);
        assert_eq!(config.contact_model.angular_damping, 12.0);
        assert_eq!(config.process_variance, StateVariances::process());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(ObserverConfig::from_toml_str("max_contact = 3").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        // figment treats an absent file as an empty source.
        let config = ObserverConfig::from_file("does/not/exist.toml").unwrap();
        assert_eq!(config.mass, 50.0);
    }
}
