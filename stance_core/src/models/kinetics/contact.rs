// stance_core/src/models/kinetics/contact.rs

use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};

use crate::config::ContactModelConfig;
use crate::error::{KinematicsError, KinematicsField, KinematicsResult};
use crate::kinematics::Kinematics;
use crate::types::{ContactId, Matrix12, TimeIndex};

/// Visco-elastic law relating a contact's displacement from its rest pose to
/// the wrench it exerts on the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactModel {
    pub linear_stiffness: Matrix3<f64>,
    pub linear_damping: Matrix3<f64>,
    pub angular_stiffness: Matrix3<f64>,
    pub angular_damping: Matrix3<f64>,
}

impl ContactModel {
    pub fn isotropic(config: &ContactModelConfig) -> Self {
        Self {
            linear_stiffness: Matrix3::identity() * config.linear_stiffness,
            linear_damping: Matrix3::identity() * config.linear_damping,
            angular_stiffness: Matrix3::identity() * config.angular_stiffness,
            angular_damping: Matrix3::identity() * config.angular_damping,
        }
    }

    /// Wrench in the contact frame for a contact at `global` (world frame,
    /// pose and velocities required) attached at `rest` (world pose).
    ///
    /// `f = R^T (Kl (p_rest - p) - Dl v)`
    /// `t = R^T (-Ka vec(q q_rest^-1) / 2 - Da w)`
    pub fn wrench(&self, global: &Kinematics, rest: &Kinematics) -> KinematicsResult<Vector6<f64>> {
        let missing = |field| KinematicsError::missing("contact model", field);
        let p = global.position.ok_or_else(|| missing(KinematicsField::Position))?;
        let r = global.orientation.ok_or_else(|| missing(KinematicsField::Orientation))?;
        let v = global.linear_velocity.ok_or_else(|| missing(KinematicsField::LinearVelocity))?;
        let w = global.angular_velocity.ok_or_else(|| missing(KinematicsField::AngularVelocity))?;
        let p_rest = rest.position.ok_or_else(|| missing(KinematicsField::Position))?;
        let r_rest = rest.orientation.ok_or_else(|| missing(KinematicsField::Orientation))?;

        let force = r.rotate_inverse(&(self.linear_stiffness * (p_rest - p) - self.linear_damping * v));
        let error = (r.quaternion() * r_rest.quaternion().inverse()).into_inner().imag();
        let torque = r.rotate_inverse(&(-0.5 * self.angular_stiffness * error - self.angular_damping * w));

        let mut wrench = Vector6::zeros();
        wrench.fixed_rows_mut::<3>(0).copy_from(&force);
        wrench.fixed_rows_mut::<3>(3).copy_from(&torque);
        Ok(wrench)
    }
}

/// Options of `add_contact`. Unset fields take the observer defaults.
#[derive(Debug, Clone, Default)]
pub struct ContactParams {
    /// Requested slot; the lowest free one when `None`.
    pub id: Option<ContactId>,
    pub initial_covariance: Option<Matrix12>,
    pub process_covariance: Option<Matrix12>,
    pub model: Option<ContactModel>,
}

/// A modeled point of force exchange between the body and the environment.
#[derive(Debug, Clone)]
pub struct Contact {
    /// World pose where the contact was established.
    pub rest_pose: Kinematics,
    /// Kinematics of the contact frame in the body frame, as last pushed.
    pub local_kinematics: Kinematics,
    pub model: ContactModel,
    /// Whether a force/torque sensor reading is part of the current measurement.
    pub with_real_sensor: bool,
    pub wrench_measurement: Vector6<f64>,
    /// Sensor covariance; the observer default is used when `None`.
    pub sensor_covariance: Option<Matrix6<f64>>,
    /// Data index of the last push for this contact.
    pub time: TimeIndex,
}

impl Contact {
    pub fn new(rest_pose: Kinematics, model: ContactModel, time: TimeIndex) -> Self {
        Self {
            rest_pose,
            local_kinematics: Kinematics::default(),
            model,
            with_real_sensor: false,
            wrench_measurement: Vector6::zeros(),
            sensor_covariance: None,
            time,
        }
    }

    /// Relative linear and angular velocity of the contact in the body frame.
    pub fn local_velocities(&self) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.local_kinematics.linear_velocity.unwrap_or_else(Vector3::zeros),
            self.local_kinematics.angular_velocity.unwrap_or_else(Vector3::zeros),
        )
    }
}
