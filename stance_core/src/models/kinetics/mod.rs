// stance_core/src/models/kinetics/mod.rs

//! The nonlinear model of the kinetics observer: floating-base dynamics with
//! contact and unmodeled wrenches, and the prediction of every sensor.

pub mod contact;
pub mod dynamics;
pub mod inertia;
pub mod layout;
pub mod measurement;
pub mod sensors;

use std::collections::BTreeMap;

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};

use crate::error::EstimationResult;
use crate::kinematics::{Kinematics, Orientation};
use crate::models::DynamicalSystem;
use crate::types::{ContactId, Control, ImuId, Measurement, State, TimeIndex};

use contact::Contact;
use inertia::InertialInputs;
use layout::StateLayout;
use sensors::{AbsolutePoseSensor, Imu, MeasurementSegment};

/// Everything the transition and measurement functions of the observer read.
///
/// The observer owns one `KineticsModel`, fills it with sensor readings and
/// inertial inputs, and lends it to the filter as the [`DynamicalSystem`].
#[derive(Debug, Clone)]
pub struct KineticsModel {
    pub layout: StateLayout,
    /// Sampling time in seconds.
    pub dt: f64,
    pub inertial: InertialInputs,
    /// Constant wrench added to the dynamics, in the body frame.
    pub additional_force: Vector3<f64>,
    pub additional_torque: Vector3<f64>,
    pub with_unmodeled_wrench: bool,
    pub with_gyro_bias: bool,

    pub contacts: BTreeMap<ContactId, Contact>,
    pub imus: BTreeMap<ImuId, Imu>,
    pub absolute_pose: Option<AbsolutePoseSensor>,
    /// Layout of the measurement being corrected.
    pub segments: Vec<MeasurementSegment>,
}

impl KineticsModel {
    pub fn new(layout: StateLayout, dt: f64, mass: f64) -> Self {
        Self {
            layout,
            dt,
            inertial: InertialInputs::new(mass),
            additional_force: Vector3::zeros(),
            additional_torque: Vector3::zeros(),
            with_unmodeled_wrench: false,
            with_gyro_bias: true,
            contacts: BTreeMap::new(),
            imus: BTreeMap::new(),
            absolute_pose: None,
            segments: Vec::new(),
        }
    }

    // --- State accessors ---

    pub fn vector3(x: &State, index: usize) -> Vector3<f64> {
        x.fixed_rows::<3>(index).into_owned()
    }

    /// Reads a quaternion stored as `[x, y, z, w]`, normalizing it.
    pub fn quaternion(x: &State, index: usize) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(Quaternion::new(
            x[index + 3],
            x[index],
            x[index + 1],
            x[index + 2],
        ))
    }

    pub fn write_quaternion(x: &mut State, index: usize, q: &UnitQuaternion<f64>) {
        x.fixed_rows_mut::<4>(index).copy_from(&q.coords);
    }

    pub fn orientation(&self, x: &State) -> Orientation {
        Orientation::from_quaternion(Self::quaternion(x, self.layout.orientation()))
    }

    /// Pose and velocities of the body stored in `x`.
    pub fn state_kinematics(&self, x: &State) -> Kinematics {
        let l = &self.layout;
        Kinematics {
            position: Some(Self::vector3(x, l.position())),
            orientation: Some(self.orientation(x)),
            linear_velocity: Some(Self::vector3(x, l.linear_velocity())),
            angular_velocity: Some(Self::vector3(x, l.angular_velocity())),
            ..Kinematics::default()
        }
    }

    /// Pose of a contact frame in the body frame, as stored in `x`.
    pub fn contact_relative_pose(&self, x: &State, id: ContactId) -> Kinematics {
        let l = &self.layout;
        Kinematics::from_pose(
            Self::vector3(x, l.contact_position(id)),
            Orientation::from_rotation_vector(&Self::vector3(x, l.contact_orientation(id))),
        )
    }

    /// Writes a contact relative pose into its state slot.
    pub fn write_contact_relative_pose(
        &self,
        x: &mut State,
        id: ContactId,
        position: &Vector3<f64>,
        orientation: &Orientation,
    ) {
        let l = &self.layout;
        x.fixed_rows_mut::<3>(l.contact_position(id)).copy_from(position);
        x.fixed_rows_mut::<3>(l.contact_orientation(id))
            .copy_from(&orientation.to_rotation_vector());
    }

    pub fn gyro_bias(&self, x: &State) -> Vector3<f64> {
        Self::vector3(x, self.layout.gyro_bias())
    }
}

impl DynamicalSystem for KineticsModel {
    fn state_dynamics(&self, x: &State, _u: &Control, _k: TimeIndex) -> EstimationResult<State> {
        self.transition(x)
    }

    fn measure_dynamics(
        &self,
        x: &State,
        _u: &Control,
        _k: TimeIndex,
    ) -> EstimationResult<Measurement> {
        self.predict_measurement(x)
    }

    fn state_sum(&self, x: &State, dx: &DVector<f64>) -> State {
        self.tangent_sum(x, dx)
    }

    fn state_difference(&self, x1: &State, x2: &State) -> DVector<f64> {
        self.tangent_difference(x1, x2)
    }

    fn measurement_difference(&self, y1: &Measurement, y2: &Measurement) -> DVector<f64> {
        self.measurement_tangent_difference(y1, y2)
    }
}
