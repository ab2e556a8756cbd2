// stance_core/src/models/kinetics/sensors.rs

use nalgebra::{Matrix3, Matrix6, Vector3};

use super::layout::{SIZE_IMU_SIGNAL, SIZE_POSE, SIZE_POSE_TANGENT, SIZE_WRENCH};
use crate::config::SensorVariances;
use crate::kinematics::Kinematics;
use crate::types::{ContactId, ImuId, TimeIndex};

/// An accelerometer and gyrometer pair rigidly attached to the body.
#[derive(Debug, Clone)]
pub struct Imu {
    pub accelerometer: Vector3<f64>,
    pub gyrometer: Vector3<f64>,
    pub accelerometer_covariance: Matrix3<f64>,
    pub gyrometer_covariance: Matrix3<f64>,
    /// Kinematics of the IMU frame in the body frame, derivatives included.
    pub kinematics: Kinematics,
    pub time: TimeIndex,
}

/// A reading of the full pose of the body in the world frame.
#[derive(Debug, Clone)]
pub struct AbsolutePoseSensor {
    pub pose: Kinematics,
    /// Tangent-space covariance (position then orientation); default when `None`.
    pub covariance: Option<Matrix6<f64>>,
    pub time: TimeIndex,
}

/// Covariances applied to sensors pushed without their own.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCovariances {
    pub accelerometer: Matrix3<f64>,
    pub gyrometer: Matrix3<f64>,
    /// Force then torque.
    pub contact_wrench: Matrix6<f64>,
    /// Position then orientation, in tangent space.
    pub absolute_pose: Matrix6<f64>,
}

impl SensorCovariances {
    pub fn from_variances(v: &SensorVariances) -> Self {
        Self {
            accelerometer: Matrix3::identity() * v.accelerometer,
            gyrometer: Matrix3::identity() * v.gyrometer,
            contact_wrench: block_diagonal(v.force, v.torque),
            absolute_pose: block_diagonal(v.position, v.orientation),
        }
    }
}

fn block_diagonal(first: f64, second: f64) -> Matrix6<f64> {
    let mut m = Matrix6::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).fill_diagonal(first);
    m.fixed_view_mut::<3, 3>(3, 3).fill_diagonal(second);
    m
}

/// One block of the assembled measurement vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementSegment {
    /// Accelerometer (3) then gyrometer (3).
    Imu(ImuId),
    /// Force (3) then torque (3) in the contact frame.
    ContactWrench(ContactId),
    /// Position (3) then quaternion (4); 6 in tangent space.
    AbsolutePose,
}

impl MeasurementSegment {
    pub fn size(&self) -> usize {
        match self {
            Self::Imu(_) => SIZE_IMU_SIGNAL,
            Self::ContactWrench(_) => SIZE_WRENCH,
            Self::AbsolutePose => SIZE_POSE,
        }
    }

    pub fn tangent_size(&self) -> usize {
        match self {
            Self::Imu(_) => SIZE_IMU_SIGNAL,
            Self::ContactWrench(_) => SIZE_WRENCH,
            Self::AbsolutePose => SIZE_POSE_TANGENT,
        }
    }
}

/// Total vector and tangent sizes of a measurement layout.
pub fn measurement_sizes(segments: &[MeasurementSegment]) -> (usize, usize) {
    segments
        .iter()
        .fold((0, 0), |(m, mt), s| (m + s.size(), mt + s.tangent_size()))
}
