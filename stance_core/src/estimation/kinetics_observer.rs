// stance_core/src/estimation/kinetics_observer.rs

//! The kinetics observer.
//!
//! Each control cycle the caller pushes sensor readings and inertial inputs,
//! then calls [`KineticsObserver::update`]. The observer assembles the
//! measurement of the cycle, linearizes the [`KineticsModel`] by finite
//! differences and runs one step of its [`ExtendedKalmanFilter`].

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, SMatrix, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{ObserverConfig, SensorVariances, StateVariances};
use crate::error::{EstimationError, EstimationResult, KinematicsError, KinematicsField, ObserverError, Result};
use crate::estimation::covariance::{set_block_covariance, set_diagonal_block};
use crate::estimation::filters::ekf::{ExtendedKalmanFilter, FilterSizes};
use crate::kinematics::{Flags, Kinematics};
use crate::models::kinetics::contact::{Contact, ContactModel};
use crate::models::kinetics::inertia::inertia_from_vector;
use crate::models::kinetics::layout::{
    StateLayout, SIZE_CONTACT, SIZE_GYRO_BIAS, SIZE_KINE, SIZE_KINE_TANGENT, SIZE_WRENCH,
};
use crate::models::kinetics::sensors::{measurement_sizes, AbsolutePoseSensor, Imu, SensorCovariances};
use crate::models::kinetics::KineticsModel;
use crate::types::{ContactId, ImuId, Matrix12, Measurement, State, TimeIndex};

pub use crate::models::kinetics::contact::ContactParams;

// =========================================================================
// == Covariance Blocks ==
// =========================================================================

/// A block of the state whose covariance can be set or reset on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBlock {
    /// Position, orientation, linear and angular velocity.
    Kinematics,
    GyroBias,
    UnmodeledWrench,
    Contact(ContactId),
}

/// Default covariance of every kind of state block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCovariances {
    pub kinematics: Matrix12,
    pub gyro_bias: Matrix3<f64>,
    pub unmodeled_wrench: Matrix6<f64>,
    pub contact: Matrix12,
}

impl BlockCovariances {
    pub fn from_variances(v: &StateVariances) -> Self {
        Self {
            kinematics: diagonal_of(&[v.position, v.orientation, v.linear_velocity, v.angular_velocity]),
            gyro_bias: diagonal_of(&[v.gyro_bias]),
            unmodeled_wrench: diagonal_of(&[v.unmodeled_force, v.unmodeled_torque]),
            contact: diagonal_of(&[
                v.contact_position,
                v.contact_orientation,
                v.contact_force,
                v.contact_torque,
            ]),
        }
    }

    fn block(&self, block: StateBlock) -> DMatrix<f64> {
        match block {
            StateBlock::Kinematics => to_dynamic(&self.kinematics),
            StateBlock::GyroBias => to_dynamic(&self.gyro_bias),
            StateBlock::UnmodeledWrench => to_dynamic(&self.unmodeled_wrench),
            StateBlock::Contact(_) => to_dynamic(&self.contact),
        }
    }
}

// Each variance fills three consecutive diagonal entries.
fn diagonal_of<const N: usize>(variances: &[f64]) -> SMatrix<f64, N, N> {
    let mut m = SMatrix::<f64, N, N>::zeros();
    for (i, v) in variances.iter().enumerate() {
        for j in 0..3 {
            m[(3 * i + j, 3 * i + j)] = *v;
        }
    }
    m
}

fn to_dynamic<const N: usize>(m: &SMatrix<f64, N, N>) -> DMatrix<f64> {
    DMatrix::from_column_slice(N, N, m.as_slice())
}

#[derive(Debug, Clone, Copy)]
enum Covariance {
    State,
    Process,
}

// =========================================================================
// == Snapshot ==
// =========================================================================

/// Estimate and covariance at one time, with the state offset of every
/// active contact so that the raw vectors can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverSnapshot {
    pub time: TimeIndex,
    pub state: State,
    pub covariance: DMatrix<f64>,
    pub contacts: BTreeMap<ContactId, usize>,
}

// =========================================================================
// == Kinetics Observer ==
// =========================================================================

/// Estimates the kinematics, gyrometer bias, unmodeled wrench and contact
/// wrenches of a floating-base robot.
///
/// Two time indices drive the observer: `k_est`, the time of the last
/// estimate, and `k_data`, the time readings are stamped with. The first
/// setter of a cycle moves `k_data` to `k_est + 1`; `update` then brings the
/// estimate to `k_data`.
#[derive(Debug, Clone)]
pub struct KineticsObserver {
    model: KineticsModel,
    ekf: ExtendedKalmanFilter,

    k_est: TimeIndex,
    k_data: TimeIndex,

    finite_difference_step: f64,
    with_acceleration_estimation: bool,

    sensor_variances: SensorVariances,
    sensor_defaults: SensorCovariances,
    state_defaults: BlockCovariances,
    process_defaults: BlockCovariances,
    contact_model: ContactModel,
}

impl KineticsObserver {
    /// An observer with the default configuration and `max_contacts` slots.
    pub fn new(max_contacts: usize) -> Result<Self> {
        Self::with_config(&ObserverConfig {
            max_contacts,
            ..ObserverConfig::default()
        })
    }

    pub fn with_config(config: &ObserverConfig) -> Result<Self> {
        if config.sampling_time <= 0.0 {
            return Err(ObserverError::InvalidConfig("sampling time must be positive"));
        }
        if config.mass <= 0.0 {
            return Err(ObserverError::InvalidConfig("mass must be positive"));
        }
        if config.finite_difference_step <= 0.0 {
            return Err(ObserverError::InvalidConfig("finite-difference step must be positive"));
        }

        let layout = StateLayout::new(config.max_contacts);
        let mut model = KineticsModel::new(layout, config.sampling_time, config.mass);
        model.with_gyro_bias = config.with_gyro_bias;
        model.with_unmodeled_wrench = config.with_unmodeled_wrench;

        let sizes = FilterSizes {
            state: layout.size(),
            state_tangent: layout.tangent_size(),
            measurement: 0,
            measurement_tangent: 0,
            input: 0,
        };

        let mut observer = Self {
            model,
            ekf: ExtendedKalmanFilter::new(sizes),
            k_est: 0,
            k_data: 0,
            finite_difference_step: config.finite_difference_step,
            with_acceleration_estimation: config.with_acceleration_estimation,
            sensor_variances: config.sensor_variance.clone(),
            sensor_defaults: SensorCovariances::from_variances(&config.sensor_variance),
            state_defaults: BlockCovariances::from_variances(&config.state_init_variance),
            process_defaults: BlockCovariances::from_variances(&config.process_variance),
            contact_model: ContactModel::isotropic(&config.contact_model),
        };

        let mut x = State::zeros(layout.size());
        KineticsModel::write_quaternion(&mut x, layout.orientation(), &UnitQuaternion::identity());
        observer.ekf.set_state(x, 0)?;
        observer.reset_state_covariance()?;
        observer.reset_process_covariance()?;
        Ok(observer)
    }

    // Starts a new cycle if the last one was already estimated.
    fn open_cycle(&mut self) {
        if self.k_data == self.k_est {
            self.k_data = self.k_est + 1;
        }
    }

    // --- Sensors ---

    /// Pushes an IMU reading for the current cycle.
    ///
    /// # Arguments
    /// * `accelerometer`, `gyrometer`: Raw readings in the IMU frame.
    /// * `local`: Kinematics of the IMU frame in the body frame. Missing
    ///   derivatives are synthesized by finite differences.
    /// * `id`: The IMU to update; a new one after the highest id when `None`.
    ///
    /// # Returns
    /// The id of the IMU.
    pub fn set_imu(
        &mut self,
        accelerometer: &Vector3<f64>,
        gyrometer: &Vector3<f64>,
        local: &Kinematics,
        id: Option<ImuId>,
    ) -> ImuId {
        self.push_imu(accelerometer, gyrometer, None, local, id)
    }

    /// Like [`Self::set_imu`], replacing the covariances of this IMU.
    pub fn set_imu_with_covariance(
        &mut self,
        accelerometer: &Vector3<f64>,
        gyrometer: &Vector3<f64>,
        accelerometer_covariance: &Matrix3<f64>,
        gyrometer_covariance: &Matrix3<f64>,
        local: &Kinematics,
        id: Option<ImuId>,
    ) -> ImuId {
        let covariances = Some((*accelerometer_covariance, *gyrometer_covariance));
        self.push_imu(accelerometer, gyrometer, covariances, local, id)
    }

    fn push_imu(
        &mut self,
        accelerometer: &Vector3<f64>,
        gyrometer: &Vector3<f64>,
        covariances: Option<(Matrix3<f64>, Matrix3<f64>)>,
        local: &Kinematics,
        id: Option<ImuId>,
    ) -> ImuId {
        self.open_cycle();
        let k = self.k_data;
        let dt = self.model.dt;
        let id = id.unwrap_or_else(|| self.model.imus.keys().next_back().map_or(0, |last| last + 1));
        let defaults = (self.sensor_defaults.accelerometer, self.sensor_defaults.gyrometer);

        let imu = self.model.imus.entry(id).or_insert_with(|| Imu {
            accelerometer: Vector3::zeros(),
            gyrometer: Vector3::zeros(),
            accelerometer_covariance: defaults.0,
            gyrometer_covariance: defaults.1,
            kinematics: Kinematics::default(),
            time: k,
        });
        let elapsed = k.saturating_sub(imu.time).max(1) as f64 * dt;
        imu.kinematics.update_from(local, elapsed, Flags::ALL);
        imu.accelerometer = *accelerometer;
        imu.gyrometer = *gyrometer;
        imu.time = k;
        if let Some((acc, gyro)) = covariances {
            imu.accelerometer_covariance = acc;
            imu.gyrometer_covariance = gyro;
        }
        id
    }

    /// Pushes a force/torque reading (force then torque, in the contact
    /// frame) for an existing contact, making its wrench part of the
    /// measurement of this cycle.
    pub fn set_contact_wrench_sensor(
        &mut self,
        wrench: &Vector6<f64>,
        local: &Kinematics,
        id: ContactId,
    ) -> Result<()> {
        self.push_contact(Some(*wrench), None, local, id)
    }

    pub fn set_contact_wrench_sensor_with_covariance(
        &mut self,
        wrench: &Vector6<f64>,
        covariance: &Matrix6<f64>,
        local: &Kinematics,
        id: ContactId,
    ) -> Result<()> {
        self.push_contact(Some(*wrench), Some(*covariance), local, id)
    }

    /// Refreshes the kinematics of a contact that has no force sensor.
    ///
    /// The velocities of `local` drive the contact model. Its pose is kept
    /// with the contact; the relative pose in the state stays the filter's.
    pub fn set_contact_with_no_sensor(&mut self, local: &Kinematics, id: ContactId) -> Result<()> {
        self.push_contact(None, None, local, id)
    }

    fn push_contact(
        &mut self,
        wrench: Option<Vector6<f64>>,
        covariance: Option<Matrix6<f64>>,
        local: &Kinematics,
        id: ContactId,
    ) -> Result<()> {
        if !self.model.contacts.contains_key(&id) {
            return Err(ObserverError::UnknownContact(id));
        }
        self.open_cycle();
        let k = self.k_data;
        let dt = self.model.dt;

        let contact = self
            .model
            .contacts
            .get_mut(&id)
            .ok_or(ObserverError::UnknownContact(id))?;
        let elapsed = k.saturating_sub(contact.time).max(1) as f64 * dt;
        contact.local_kinematics.update_from(local, elapsed, Flags::POSE_AND_VELOCITIES);
        contact.with_real_sensor = wrench.is_some();
        if let Some(wrench) = wrench {
            contact.wrench_measurement = wrench;
            contact.sensor_covariance = covariance;
        }
        contact.time = k;
        Ok(())
    }

    /// Pushes a measurement of the body pose in the world frame.
    pub fn set_absolute_pose_sensor(&mut self, pose: &Kinematics) -> Result<()> {
        self.push_pose(pose, None)
    }

    pub fn set_absolute_pose_sensor_with_covariance(
        &mut self,
        pose: &Kinematics,
        covariance: &Matrix6<f64>,
    ) -> Result<()> {
        self.push_pose(pose, Some(*covariance))
    }

    fn push_pose(&mut self, pose: &Kinematics, covariance: Option<Matrix6<f64>>) -> Result<()> {
        let (Some(position), Some(orientation)) = (pose.position, pose.orientation) else {
            return Err(ObserverError::IncompleteAbsolutePose);
        };
        self.open_cycle();
        self.model.absolute_pose = Some(AbsolutePoseSensor {
            pose: Kinematics::from_pose(position, orientation),
            covariance,
            time: self.k_data,
        });
        Ok(())
    }

    // --- Sensor default covariances ---

    /// Covariances given to IMUs created from now on without their own.
    pub fn set_imu_default_covariance(&mut self, accelerometer: &Matrix3<f64>, gyrometer: &Matrix3<f64>) {
        self.sensor_defaults.accelerometer = *accelerometer;
        self.sensor_defaults.gyrometer = *gyrometer;
    }

    pub fn set_contact_wrench_sensor_default_covariance(&mut self, covariance: &Matrix6<f64>) {
        self.sensor_defaults.contact_wrench = *covariance;
    }

    pub fn set_absolute_pose_sensor_default_covariance(&mut self, covariance: &Matrix6<f64>) {
        self.sensor_defaults.absolute_pose = *covariance;
    }

    /// Restores the sensor defaults of the configuration.
    pub fn reset_sensors_default_covariance(&mut self) {
        self.sensor_defaults = SensorCovariances::from_variances(&self.sensor_variances);
    }

    pub fn sensor_default_covariances(&self) -> &SensorCovariances {
        &self.sensor_defaults
    }

    // --- Inertial inputs ---

    pub fn set_mass(&mut self, mass: f64) -> Result<()> {
        if mass <= 0.0 {
            return Err(ObserverError::InvalidConfig("mass must be positive"));
        }
        self.model.inertial.mass = mass;
        Ok(())
    }

    /// Sets the inertia about the center of mass in the body frame. Its
    /// derivative is synthesized from the previous push.
    pub fn set_inertia_matrix(&mut self, inertia: &Matrix3<f64>) -> Result<()> {
        self.open_cycle();
        self.model.inertial.set_inertia(*inertia, self.k_data, self.model.dt)
    }

    pub fn set_inertia_matrix_with_derivative(
        &mut self,
        inertia: &Matrix3<f64>,
        derivative: &Matrix3<f64>,
    ) -> Result<()> {
        self.open_cycle();
        self.model
            .inertial
            .set_inertia_with_derivative(*inertia, *derivative, self.k_data)
    }

    /// Sets the inertia from `[Ixx, Iyy, Izz, Ixy, Ixz, Iyz]`.
    pub fn set_inertia_vector(&mut self, inertia: &Vector6<f64>) -> Result<()> {
        self.set_inertia_matrix(&inertia_from_vector(inertia))
    }

    pub fn set_inertia_vector_with_derivative(
        &mut self,
        inertia: &Vector6<f64>,
        derivative: &Vector6<f64>,
    ) -> Result<()> {
        self.set_inertia_matrix_with_derivative(&inertia_from_vector(inertia), &inertia_from_vector(derivative))
    }

    pub fn set_center_of_mass(&mut self, com: &Vector3<f64>) {
        self.open_cycle();
        self.model
            .inertial
            .set_center_of_mass(*com, self.k_data, self.model.dt);
    }

    pub fn set_center_of_mass_with_velocity(&mut self, com: &Vector3<f64>, velocity: &Vector3<f64>) {
        self.open_cycle();
        self.model
            .inertial
            .set_center_of_mass_with_velocity(*com, *velocity, self.k_data, self.model.dt);
    }

    pub fn set_center_of_mass_with_derivatives(
        &mut self,
        com: &Vector3<f64>,
        velocity: &Vector3<f64>,
        acceleration: &Vector3<f64>,
    ) {
        self.open_cycle();
        self.model
            .inertial
            .set_center_of_mass_with_derivatives(*com, *velocity, *acceleration, self.k_data);
    }

    /// Sets the angular momentum about the center of mass in the body frame.
    pub fn set_angular_momentum(&mut self, sigma: &Vector3<f64>) {
        self.open_cycle();
        self.model
            .inertial
            .set_angular_momentum(*sigma, self.k_data, self.model.dt);
    }

    pub fn set_angular_momentum_with_derivative(&mut self, sigma: &Vector3<f64>, derivative: &Vector3<f64>) {
        self.open_cycle();
        self.model
            .inertial
            .set_angular_momentum_with_derivative(*sigma, *derivative, self.k_data);
    }

    /// A known constant wrench on the body, in the body frame.
    pub fn set_additional_wrench(&mut self, force: &Vector3<f64>, torque: &Vector3<f64>) {
        self.model.additional_force = *force;
        self.model.additional_torque = *torque;
    }

    /// Discards the readings pushed for the pending cycle by stamping every
    /// sensor with the time of the last estimate. Stale IMUs are dropped and
    /// sensed contacts demoted by the next `update`.
    pub fn reset_inputs(&mut self) {
        let k = self.k_est;
        for imu in self.model.imus.values_mut() {
            imu.time = k;
        }
        for contact in self.model.contacts.values_mut() {
            contact.time = k;
        }
        if let Some(pose) = self.model.absolute_pose.as_mut() {
            pose.time = k;
        }
    }

    /// Forgets every inertial input and the additional wrench.
    pub fn reset_inertial_inputs(&mut self) {
        self.model.inertial.reset();
        self.model.additional_force = Vector3::zeros();
        self.model.additional_torque = Vector3::zeros();
    }

    // --- Contacts ---

    /// Declares a new contact established at `pose` in the world frame.
    ///
    /// The relative pose of the contact is initialized from the current
    /// estimate and its wrench from the contact model. Its state and process
    /// covariance blocks are reset, with no cross-covariance.
    ///
    /// # Returns
    /// The id of the contact, which is also its state slot.
    pub fn add_contact(&mut self, pose: &Kinematics, params: ContactParams) -> Result<ContactId> {
        let max = self.model.layout.max_contacts();
        let id = match params.id {
            Some(id) => id,
            None => (0..max)
                .find(|id| !self.model.contacts.contains_key(id))
                .ok_or(ObserverError::TooManyContacts(max))?,
        };
        if id >= max {
            return Err(ObserverError::ContactOutOfRange { id, max });
        }
        if self.model.contacts.contains_key(&id) {
            return Err(ObserverError::ContactExists(id));
        }

        let missing = |field| ObserverError::from(KinematicsError::missing("contact rest pose", field));
        let position = pose.position.ok_or_else(|| missing(KinematicsField::Position))?;
        let orientation = pose.orientation.ok_or_else(|| missing(KinematicsField::Orientation))?;
        let rest_pose = Kinematics::from_pose(position, orientation);

        // 1. Express the rest pose in the body frame of the current estimate.
        let mut x = self.state_vector()?.clone();
        let relative = self.model.state_kinematics(&x).inverse()?.compose(&rest_pose)?;
        let relative_position = relative.position.ok_or_else(|| missing(KinematicsField::Position))?;
        let relative_orientation = relative
            .orientation
            .ok_or_else(|| missing(KinematicsField::Orientation))?;
        self.model
            .write_contact_relative_pose(&mut x, id, &relative_position, &relative_orientation);

        // 2. Register the contact and seed its wrench with the model.
        let model = params.model.unwrap_or_else(|| self.contact_model.clone());
        let mut contact = Contact::new(rest_pose, model, self.k_data);
        contact.local_kinematics = Kinematics::from_pose(relative_position, relative_orientation);
        self.model.contacts.insert(id, contact);

        match self.model.contact_model_wrench(&x, id) {
            Ok(Some(wrench)) => x
                .fixed_rows_mut::<6>(self.model.layout.contact_force(id))
                .copy_from(&wrench),
            Ok(None) => {}
            Err(err) => {
                self.model.contacts.remove(&id);
                return Err(err.into());
            }
        }
        self.ekf.set_state(x, self.k_est)?;

        // 3. Fresh, uncorrelated covariance blocks.
        let initial = params.initial_covariance.unwrap_or(self.state_defaults.contact);
        let process = params.process_covariance.unwrap_or(self.process_defaults.contact);
        let index = self.model.layout.contact_tangent(id);
        self.write_block(Covariance::State, index, &to_dynamic(&initial))?;
        self.write_block(Covariance::Process, index, &to_dynamic(&process))?;

        debug!(contact = id, "contact added");
        Ok(id)
    }

    /// Removes a contact, zeroing its state slot and covariance blocks.
    pub fn remove_contact(&mut self, id: ContactId) -> Result<()> {
        if self.model.contacts.remove(&id).is_none() {
            return Err(ObserverError::UnknownContact(id));
        }
        let l = self.model.layout;
        let mut x = self.state_vector()?.clone();
        x.rows_mut(l.contact(id), SIZE_CONTACT).fill(0.0);
        self.ekf.set_state(x, self.k_est)?;

        let zeros = DMatrix::zeros(SIZE_CONTACT, SIZE_CONTACT);
        self.write_block(Covariance::State, l.contact_tangent(id), &zeros)?;
        self.write_block(Covariance::Process, l.contact_tangent(id), &zeros)?;

        debug!(contact = id, "contact removed");
        Ok(())
    }

    pub fn clear_contacts(&mut self) -> Result<()> {
        for id in self.contact_ids() {
            self.remove_contact(id)?;
        }
        Ok(())
    }

    /// Ids of the active contacts, ascending.
    pub fn contact_ids(&self) -> Vec<ContactId> {
        self.model.contacts.keys().copied().collect()
    }

    pub fn number_of_contacts(&self) -> usize {
        self.model.contacts.len()
    }

    fn check_contact(&self, id: ContactId) -> Result<()> {
        if self.model.contacts.contains_key(&id) {
            Ok(())
        } else {
            Err(ObserverError::UnknownContact(id))
        }
    }

    // --- Estimation ---

    /// Runs the estimation of the current cycle and returns the new state.
    ///
    /// Does nothing when no reading was pushed since the last call. When the
    /// step fails numerically the last valid estimate is carried over to the
    /// current time, so the next cycle starts from it, and the error is
    /// returned. Any other failure leaves the observer as it was, so the
    /// cycle can be retried.
    pub fn update(&mut self) -> Result<&State> {
        if self.k_data == self.k_est {
            return self.state_vector();
        }
        let k = self.k_data;

        // The cycle runs on copies, committed once the step is consumed.
        let mut model = self.model.clone();
        let mut ekf = self.ekf.clone();
        let step = self.estimate_cycle(&mut model, &mut ekf, k);

        match step {
            Ok(()) => {
                self.model = model;
                self.ekf = ekf;
                self.k_est = k;
                self.state_vector()
            }
            Err(err) if err.is_numerical() => {
                self.model = model;
                self.ekf = ekf;
                self.roll_back(&err)?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn estimate_cycle(
        &self,
        model: &mut KineticsModel,
        ekf: &mut ExtendedKalmanFilter,
        k: TimeIndex,
    ) -> EstimationResult<()> {
        // 1. Drop stale IMUs and demote contacts whose sensor was not refreshed.
        model.imus.retain(|&id, imu| {
            let fresh = imu.time == k;
            if !fresh {
                debug!(imu = id, "dropping stale IMU");
            }
            fresh
        });
        for (&id, contact) in model.contacts.iter_mut() {
            if contact.with_real_sensor && contact.time != k {
                warn!(contact = id, time = k, "contact sensor not refreshed, contact is now sensorless");
                contact.with_real_sensor = false;
            }
        }

        // 2. Assemble the measurement of the cycle.
        let (size, tangent_size) = model.build_segments(k);
        trace!(time = k, size, tangent_size, "measurement layout");
        let y = model.measurement_vector(&model.segments)?;
        let r = model.measurement_covariance(&model.segments, &self.sensor_defaults)?;
        ekf.set_measurement_size(size, tangent_size);
        ekf.set_measurement(y, k)?;
        ekf.set_r(r)?;

        // 3. Linearize around the current estimate.
        let steps = DVector::from_element(model.layout.tangent_size(), self.finite_difference_step);
        let a = ekf.a_matrix_fd(&*model, &steps)?;
        let c = ekf.c_matrix_fd(&*model, &steps)?;
        ekf.set_a(a)?;
        ekf.set_c(c)?;

        // 4. Predict and correct.
        ekf.one_step_estimation(&*model).map(|_| ())
    }

    fn roll_back(&mut self, err: &EstimationError) -> Result<()> {
        let x = self.state_vector()?.clone();
        self.ekf.set_state(x, self.k_data)?;
        self.k_est = self.k_data;
        warn!(time = self.k_data, error = %err, "estimation step failed, keeping the last valid estimate");
        Ok(())
    }

    // --- Accessors ---

    pub fn state_vector(&self) -> Result<&State> {
        self.ekf
            .state()
            .ok_or(ObserverError::Estimation(EstimationError::MissingState))
    }

    /// Pose and velocities of the body in the world frame, with the
    /// accelerations of the dynamics when acceleration estimation is on.
    pub fn kinematics(&self) -> Result<Kinematics> {
        let x = self.state_vector()?;
        let mut kine = self.model.state_kinematics(x);
        if self.with_acceleration_estimation {
            let (linear, angular) = self.model.state_accelerations(x);
            kine.linear_acceleration = Some(linear);
            kine.angular_acceleration = Some(angular);
        }
        Ok(kine)
    }

    /// World kinematics of a frame given in the body frame.
    pub fn kinematics_of(&self, local: &Kinematics) -> Result<Kinematics> {
        Ok(self.kinematics()?.compose(local)?)
    }

    /// Linear and angular accelerations of the body implied by the estimate.
    pub fn estimate_accelerations(&self) -> Result<(Vector3<f64>, Vector3<f64>)> {
        Ok(self.model.state_accelerations(self.state_vector()?))
    }

    /// Estimated wrench of a contact, force then torque in the contact frame.
    pub fn contact_wrench(&self, id: ContactId) -> Result<Vector6<f64>> {
        self.check_contact(id)?;
        let x = self.state_vector()?;
        Ok(x.fixed_rows::<6>(self.model.layout.contact_force(id)).into_owned())
    }

    /// Estimated pose of a contact frame in the body frame.
    pub fn contact_relative_pose(&self, id: ContactId) -> Result<Kinematics> {
        self.check_contact(id)?;
        Ok(self.model.contact_relative_pose(self.state_vector()?, id))
    }

    /// Wrench the visco-elastic model predicts for a contact at the current estimate.
    pub fn contact_model_wrench(&self, id: ContactId) -> Result<Vector6<f64>> {
        self.model
            .contact_model_wrench(self.state_vector()?, id)?
            .ok_or(ObserverError::UnknownContact(id))
    }

    /// Estimated unmodeled wrench in the body frame.
    pub fn unmodeled_wrench(&self) -> Result<Vector6<f64>> {
        let x = self.state_vector()?;
        Ok(x.fixed_rows::<6>(self.model.layout.unmodeled_wrench()).into_owned())
    }

    pub fn gyro_bias(&self) -> Result<Vector3<f64>> {
        Ok(self.model.gyro_bias(self.state_vector()?))
    }

    pub fn state_covariance(&self) -> Result<&DMatrix<f64>> {
        self.ekf
            .state_covariance()
            .ok_or(ObserverError::Estimation(EstimationError::Uninitialized("P")))
    }

    pub fn process_covariance(&self) -> Result<&DMatrix<f64>> {
        self.ekf
            .q()
            .ok_or(ObserverError::Estimation(EstimationError::Uninitialized("Q")))
    }

    /// Size of the measurement the next `update` will correct with.
    pub fn measurement_size(&self) -> usize {
        if self.k_data == self.k_est {
            return 0;
        }
        measurement_sizes(&self.model.segments_at(self.k_data)).0
    }

    /// The measurement the next `update` will correct with.
    pub fn measurement_vector(&self) -> Result<Measurement> {
        if self.k_data == self.k_est {
            return Ok(Measurement::zeros(0));
        }
        let segments = self.model.segments_at(self.k_data);
        Ok(self.model.measurement_vector(&segments)?)
    }

    /// Innovation of the last correction, in measurement tangent space.
    pub fn innovation(&self) -> Result<&DVector<f64>> {
        self.ekf.last_innovation().ok_or(ObserverError::NoCorrectionYet)
    }

    pub fn predicted_measurement(&self) -> Result<&Measurement> {
        self.ekf
            .last_predicted_measurement()
            .ok_or(ObserverError::NoCorrectionYet)
    }

    /// State correction of the last step, in state tangent space.
    pub fn correction(&self) -> Result<&DVector<f64>> {
        self.ekf.last_correction().ok_or(ObserverError::NoCorrectionYet)
    }

    /// Kalman gain of the last correction.
    pub fn kalman_gain(&self) -> Result<&DMatrix<f64>> {
        self.ekf.last_gain().ok_or(ObserverError::NoCorrectionYet)
    }

    pub fn ekf(&self) -> &ExtendedKalmanFilter {
        &self.ekf
    }

    pub fn ekf_mut(&mut self) -> &mut ExtendedKalmanFilter {
        &mut self.ekf
    }

    pub fn model(&self) -> &KineticsModel {
        &self.model
    }

    /// `(k_est, k_data)`.
    pub fn time_indices(&self) -> (TimeIndex, TimeIndex) {
        (self.k_est, self.k_data)
    }

    pub fn layout(&self) -> StateLayout {
        self.model.layout
    }

    pub fn sampling_time(&self) -> f64 {
        self.model.dt
    }

    // --- State setters ---

    /// Replaces the whole state estimate at the current time.
    pub fn set_state_vector(&mut self, x: State) -> Result<()> {
        self.ekf.set_state(x, self.k_est)?;
        Ok(())
    }

    /// Overwrites the estimated pose and velocities with the fields present
    /// in `kine`.
    ///
    /// # Arguments
    /// * `reset_forces`: Also zero the unmodeled wrench and reseed every
    ///   contact wrench from its model.
    /// * `reset_covariance`: Also reset the kinematics covariance block.
    pub fn set_state_kinematics(
        &mut self,
        kine: &Kinematics,
        reset_forces: bool,
        reset_covariance: bool,
    ) -> Result<()> {
        let l = self.model.layout;
        let mut x = self.state_vector()?.clone();
        let current = self.model.state_kinematics(&x);
        let merged = Kinematics {
            position: kine.position.or(current.position),
            orientation: kine.orientation.or(current.orientation),
            linear_velocity: kine.linear_velocity.or(current.linear_velocity),
            angular_velocity: kine.angular_velocity.or(current.angular_velocity),
            ..Kinematics::default()
        };
        x.rows_mut(l.kine(), SIZE_KINE)
            .copy_from(&merged.to_vector(Flags::POSE_AND_VELOCITIES)?);

        if reset_forces {
            x.rows_mut(l.unmodeled_wrench(), SIZE_WRENCH).fill(0.0);
            for &id in self.model.contacts.keys() {
                let wrench = self
                    .model
                    .contact_model_wrench(&x, id)?
                    .unwrap_or_else(Vector6::zeros);
                x.fixed_rows_mut::<6>(l.contact_force(id)).copy_from(&wrench);
            }
        }
        self.ekf.set_state(x, self.k_est)?;

        if reset_covariance {
            self.reset_state_block_covariance(StateBlock::Kinematics)?;
        }
        Ok(())
    }

    pub fn set_gyro_bias(&mut self, bias: &Vector3<f64>) -> Result<()> {
        let mut x = self.state_vector()?.clone();
        x.fixed_rows_mut::<3>(self.model.layout.gyro_bias()).copy_from(bias);
        self.set_state_vector(x)
    }

    /// Sets the estimated unmodeled wrench, force then torque in the body frame.
    pub fn set_state_unmodeled_wrench(&mut self, wrench: &Vector6<f64>) -> Result<()> {
        let mut x = self.state_vector()?.clone();
        x.fixed_rows_mut::<6>(self.model.layout.unmodeled_wrench()).copy_from(wrench);
        self.set_state_vector(x)
    }

    pub fn set_with_unmodeled_wrench(&mut self, enabled: bool) {
        self.model.with_unmodeled_wrench = enabled;
    }

    pub fn set_with_gyro_bias(&mut self, enabled: bool) {
        self.model.with_gyro_bias = enabled;
    }

    pub fn set_with_acceleration_estimation(&mut self, enabled: bool) {
        self.with_acceleration_estimation = enabled;
    }

    pub fn set_sampling_time(&mut self, dt: f64) -> Result<()> {
        if dt <= 0.0 {
            return Err(ObserverError::InvalidConfig("sampling time must be positive"));
        }
        self.model.dt = dt;
        Ok(())
    }

    pub fn set_finite_difference_step(&mut self, step: f64) -> Result<()> {
        if step <= 0.0 {
            return Err(ObserverError::InvalidConfig("finite-difference step must be positive"));
        }
        self.finite_difference_step = step;
        Ok(())
    }

    // --- Covariance configuration ---

    // Tangent index and size of a block.
    fn block_range(&self, block: StateBlock) -> Result<(usize, usize)> {
        let l = &self.model.layout;
        Ok(match block {
            StateBlock::Kinematics => (l.position_tangent(), SIZE_KINE_TANGENT),
            StateBlock::GyroBias => (l.gyro_bias_tangent(), SIZE_GYRO_BIAS),
            StateBlock::UnmodeledWrench => (l.unmodeled_wrench_tangent(), SIZE_WRENCH),
            StateBlock::Contact(id) => {
                self.check_contact(id)?;
                (l.contact_tangent(id), SIZE_CONTACT)
            }
        })
    }

    fn active_blocks(&self) -> Vec<StateBlock> {
        [StateBlock::Kinematics, StateBlock::GyroBias, StateBlock::UnmodeledWrench]
            .into_iter()
            .chain(self.model.contacts.keys().map(|&id| StateBlock::Contact(id)))
            .collect()
    }

    fn write_block(&mut self, target: Covariance, index: usize, block: &DMatrix<f64>) -> Result<()> {
        let nt = self.model.layout.tangent_size();
        let current = match target {
            Covariance::State => self.ekf.state_covariance(),
            Covariance::Process => self.ekf.q(),
        };
        let mut m = current.cloned().unwrap_or_else(|| DMatrix::zeros(nt, nt));
        set_block_covariance(&mut m, block, index)?;
        match target {
            Covariance::State => self.ekf.set_state_covariance(m)?,
            Covariance::Process => self.ekf.set_q(m)?,
        }
        Ok(())
    }

    fn set_block(&mut self, target: Covariance, block: StateBlock, covariance: &DMatrix<f64>) -> Result<()> {
        let (index, size) = self.block_range(block)?;
        if covariance.shape() != (size, size) {
            return Err(EstimationError::dimension("covariance block", (size, size), covariance.shape()).into());
        }
        self.write_block(target, index, covariance)
    }

    /// Sets a block of the state covariance, zeroing its cross-covariances.
    pub fn set_state_block_covariance(&mut self, block: StateBlock, covariance: &DMatrix<f64>) -> Result<()> {
        self.set_block(Covariance::State, block, covariance)
    }

    /// Sets a block of the process covariance, zeroing its cross-covariances.
    pub fn set_process_block_covariance(&mut self, block: StateBlock, covariance: &DMatrix<f64>) -> Result<()> {
        self.set_block(Covariance::Process, block, covariance)
    }

    pub fn reset_state_block_covariance(&mut self, block: StateBlock) -> Result<()> {
        let default = self.state_defaults.block(block);
        self.set_block(Covariance::State, block, &default)
    }

    pub fn reset_process_block_covariance(&mut self, block: StateBlock) -> Result<()> {
        let default = self.process_defaults.block(block);
        self.set_block(Covariance::Process, block, &default)
    }

    fn default_covariance(&self, defaults: &BlockCovariances) -> Result<DMatrix<f64>> {
        let nt = self.model.layout.tangent_size();
        let mut m = DMatrix::zeros(nt, nt);
        for block in self.active_blocks() {
            let (index, _) = self.block_range(block)?;
            set_diagonal_block(&mut m, &defaults.block(block), index)?;
        }
        Ok(m)
    }

    /// Resets the whole state covariance to the block defaults.
    pub fn reset_state_covariance(&mut self) -> Result<()> {
        let p = self.default_covariance(&self.state_defaults)?;
        self.ekf.set_state_covariance(p)?;
        Ok(())
    }

    /// Resets the whole process covariance to the block defaults.
    pub fn reset_process_covariance(&mut self) -> Result<()> {
        let q = self.default_covariance(&self.process_defaults)?;
        self.ekf.set_q(q)?;
        Ok(())
    }

    /// Defaults used by the state covariance resets and new contacts.
    pub fn set_state_covariance_defaults(&mut self, defaults: BlockCovariances) {
        self.state_defaults = defaults;
    }

    pub fn set_process_covariance_defaults(&mut self, defaults: BlockCovariances) {
        self.process_defaults = defaults;
    }

    pub fn state_covariance_defaults(&self) -> &BlockCovariances {
        &self.state_defaults
    }

    pub fn process_covariance_defaults(&self) -> &BlockCovariances {
        &self.process_defaults
    }

    // --- Persistence ---

    fn contact_offsets(&self) -> BTreeMap<ContactId, usize> {
        self.model
            .contacts
            .keys()
            .map(|&id| (id, self.model.layout.contact(id)))
            .collect()
    }

    pub fn snapshot(&self) -> Result<ObserverSnapshot> {
        Ok(ObserverSnapshot {
            time: self.k_est,
            state: self.state_vector()?.clone(),
            covariance: self.state_covariance()?.clone(),
            contacts: self.contact_offsets(),
        })
    }

    /// Replaces the estimate with a snapshot taken with the same active
    /// contacts. Both time indices move to the snapshot time.
    pub fn restore(&mut self, snapshot: &ObserverSnapshot) -> Result<()> {
        let contacts = self.contact_offsets();
        if contacts != snapshot.contacts {
            return Err(ObserverError::SnapshotMismatch(format!(
                "active contacts {:?}, snapshot contacts {:?}",
                contacts, snapshot.contacts
            )));
        }
        let l = self.model.layout;
        if snapshot.state.len() != l.size() {
            return Err(ObserverError::SnapshotMismatch(format!(
                "state has {} entries, expected {}",
                snapshot.state.len(),
                l.size()
            )));
        }
        if snapshot.covariance.shape() != (l.tangent_size(), l.tangent_size()) {
            return Err(ObserverError::SnapshotMismatch(format!(
                "covariance is {:?}, expected {:?}",
                snapshot.covariance.shape(),
                (l.tangent_size(), l.tangent_size())
            )));
        }

        self.ekf.set_state(snapshot.state.clone(), snapshot.time)?;
        self.ekf.set_state_covariance(snapshot.covariance.clone())?;
        self.k_est = snapshot.time;
        self.k_data = snapshot.time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::Orientation;
    use approx::assert_abs_diff_eq;

    fn ground_pose() -> Kinematics {
        Kinematics::from_pose(Vector3::zeros(), Orientation::identity())
    }

    #[test]
    fn test_sizes_follow_max_contacts() {
        let observer = KineticsObserver::new(3).unwrap();
        let x = observer.state_vector().unwrap();
        assert_eq!(x.len(), 22 + 36);
        assert_eq!(observer.state_covariance().unwrap().shape(), (57, 57));
        // Identity orientation, everything else zero.
        assert_eq!(x[6], 1.0);
        assert_eq!(x.iter().filter(|v| **v != 0.0).count(), 1);
        assert_eq!(observer.time_indices(), (0, 0));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ObserverConfig {
            sampling_time: 0.0,
            ..ObserverConfig::default()
        };
        assert!(matches!(
            KineticsObserver::with_config(&config),
            Err(ObserverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_blocks_on_the_diagonal() {
        let observer = KineticsObserver::new(1).unwrap();
        let p = observer.state_covariance().unwrap();
        assert_eq!(p[(0, 0)], 1e-4);
        assert_eq!(p[(6, 6)], 1e-6);
        assert_eq!(p[(12, 12)], 1e-10);
        assert_eq!(p[(15, 15)], 1e4);
        assert_eq!(p[(18, 18)], 1e2);
        // The unused contact slot is empty.
        assert_eq!(p.view((21, 21), (12, 12)).iter().filter(|v| **v != 0.0).count(), 0);

        let q = observer.process_covariance().unwrap();
        assert_eq!(q[(12, 12)], 1e-12);
    }

    #[test]
    fn test_automatic_contact_ids_fill_the_lowest_slot() {
        let mut observer = KineticsObserver::new(3).unwrap();
        assert_eq!(observer.add_contact(&ground_pose(), ContactParams::default()).unwrap(), 0);
        let params = ContactParams {
            id: Some(2),
            ..ContactParams::default()
        };
        assert_eq!(observer.add_contact(&ground_pose(), params).unwrap(), 2);
        assert_eq!(observer.add_contact(&ground_pose(), ContactParams::default()).unwrap(), 1);
        assert!(matches!(
            observer.add_contact(&ground_pose(), ContactParams::default()),
            Err(ObserverError::TooManyContacts(3))
        ));
        assert_eq!(observer.contact_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_contact_relative_pose_from_current_estimate() {
        let mut observer = KineticsObserver::new(1).unwrap();
        let body = Kinematics {
            position: Some(Vector3::new(0.0, 0.0, 1.0)),
            linear_velocity: Some(Vector3::zeros()),
            angular_velocity: Some(Vector3::zeros()),
            ..Kinematics::default()
        };
        observer.set_state_kinematics(&body, false, false).unwrap();

        let foot = Kinematics::from_pose(Vector3::new(0.1, 0.0, 0.0), Orientation::identity());
        let id = observer.add_contact(&foot, ContactParams::default()).unwrap();
        let relative = observer.contact_relative_pose(id).unwrap();
        assert_abs_diff_eq!(relative.position.unwrap(), Vector3::new(0.1, 0.0, -1.0), epsilon = 1e-12);

        // At rest on its rest pose, the model exerts no wrench.
        assert_abs_diff_eq!(observer.contact_wrench(id).unwrap(), Vector6::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_block_setter_checks_dimensions() {
        let mut observer = KineticsObserver::new(1).unwrap();
        let wrong = DMatrix::identity(4, 4);
        assert!(matches!(
            observer.set_state_block_covariance(StateBlock::GyroBias, &wrong),
            Err(ObserverError::Estimation(EstimationError::DimensionMismatch { .. }))
        ));
        assert!(matches!(
            observer.set_state_block_covariance(StateBlock::Contact(0), &DMatrix::identity(12, 12)),
            Err(ObserverError::UnknownContact(0))
        ));
    }

    #[test]
    fn test_accessors_before_any_correction() {
        let observer = KineticsObserver::new(1).unwrap();
        assert!(matches!(observer.innovation(), Err(ObserverError::NoCorrectionYet)));
        assert!(matches!(
            observer.predicted_measurement(),
            Err(ObserverError::NoCorrectionYet)
        ));
        assert!(matches!(observer.correction(), Err(ObserverError::NoCorrectionYet)));
        assert!(matches!(observer.kalman_gain(), Err(ObserverError::NoCorrectionYet)));
        assert!(matches!(observer.contact_wrench(0), Err(ObserverError::UnknownContact(0))));
    }

    #[test]
    fn test_reset_inertial_inputs() {
        let mut observer = KineticsObserver::new(0).unwrap();
        observer.set_center_of_mass(&Vector3::new(0.0, 0.0, 0.1));
        observer.set_additional_wrench(&Vector3::new(1.0, 0.0, 0.0), &Vector3::zeros());
        observer.reset_inertial_inputs();

        assert_eq!(observer.model().inertial.center_of_mass, Vector3::zeros());
        assert_eq!(observer.model().additional_force, Vector3::zeros());
        // Readings are not inertial inputs, the cycle stays open.
        assert_eq!(observer.time_indices(), (0, 1));
    }

    #[test]
    fn test_absolute_pose_needs_position_and_orientation() {
        let mut observer = KineticsObserver::new(0).unwrap();
        let partial = Kinematics {
            position: Some(Vector3::zeros()),
            ..Kinematics::default()
        };
        assert!(matches!(
            observer.set_absolute_pose_sensor(&partial),
            Err(ObserverError::IncompleteAbsolutePose)
        ));
        // A rejected push does not open a cycle.
        assert_eq!(observer.time_indices(), (0, 0));
    }

    #[test]
    fn test_imu_ids_and_default_covariance() {
        let mut observer = KineticsObserver::new(0).unwrap();
        let local = Kinematics::identity();
        let g = Vector3::new(0.0, 0.0, 9.8);
        assert_eq!(observer.set_imu(&g, &Vector3::zeros(), &local, None), 0);
        assert_eq!(observer.set_imu(&g, &Vector3::zeros(), &local, None), 1);
        assert_eq!(observer.set_imu(&g, &Vector3::zeros(), &local, Some(5)), 5);
        assert_eq!(observer.time_indices(), (0, 1));
        assert_eq!(observer.measurement_size(), 18);

        let imu = &observer.model().imus[&5];
        assert_eq!(imu.accelerometer_covariance, Matrix3::identity() * 1e-4);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut observer = KineticsObserver::new(2).unwrap();
        observer.add_contact(&ground_pose(), ContactParams::default()).unwrap();
        let snapshot = observer.snapshot().unwrap();
        assert_eq!(snapshot.contacts, BTreeMap::from([(0, 22)]));

        observer.set_gyro_bias(&Vector3::new(0.1, 0.2, 0.3)).unwrap();
        observer.restore(&snapshot).unwrap();
        assert_eq!(observer.gyro_bias().unwrap(), Vector3::zeros());

        observer.remove_contact(0).unwrap();
        assert!(matches!(
            observer.restore(&snapshot),
            Err(ObserverError::SnapshotMismatch(_))
        ));
    }
}
