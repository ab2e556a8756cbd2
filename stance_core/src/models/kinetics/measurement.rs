// stance_core/src/models/kinetics/measurement.rs

use nalgebra::{DMatrix, DVector, Vector3};

use super::layout::{SIZE_IMU_SIGNAL, SIZE_WRENCH};
use super::sensors::{measurement_sizes, MeasurementSegment, SensorCovariances};
use super::KineticsModel;
use crate::error::{EstimationResult, KinematicsError, KinematicsField};
use crate::estimation::covariance::set_diagonal_block;
use crate::kinematics::{Flags, Orientation};
use crate::types::{Measurement, State, TimeIndex, GRAVITY_CONSTANT};

impl KineticsModel {
    /// Layout of the measurement made of the sensors stamped `k`: IMUs,
    /// then contacts with a real sensor, then the absolute pose.
    pub fn segments_at(&self, k: TimeIndex) -> Vec<MeasurementSegment> {
        let imus = self
            .imus
            .iter()
            .filter(|(_, imu)| imu.time == k)
            .map(|(&id, _)| MeasurementSegment::Imu(id));
        let contacts = self
            .contacts
            .iter()
            .filter(|(_, c)| c.with_real_sensor && c.time == k)
            .map(|(&id, _)| MeasurementSegment::ContactWrench(id));
        let pose = self
            .absolute_pose
            .as_ref()
            .filter(|pose| pose.time == k)
            .map(|_| MeasurementSegment::AbsolutePose);

        imus.chain(contacts).chain(pose).collect()
    }

    /// Makes the layout of `k` the one used by the measurement function.
    ///
    /// # Returns
    /// The measurement size and its tangent size.
    pub fn build_segments(&mut self, k: TimeIndex) -> (usize, usize) {
        self.segments = self.segments_at(k);
        measurement_sizes(&self.segments)
    }

    /// The measured values, laid out as `segments`.
    pub fn measurement_vector(&self, segments: &[MeasurementSegment]) -> EstimationResult<Measurement> {
        let (size, _) = measurement_sizes(segments);
        let mut y = DVector::zeros(size);
        let mut i = 0;

        for segment in segments {
            match segment {
                MeasurementSegment::Imu(id) => {
                    if let Some(imu) = self.imus.get(id) {
                        y.fixed_rows_mut::<3>(i).copy_from(&imu.accelerometer);
                        y.fixed_rows_mut::<3>(i + 3).copy_from(&imu.gyrometer);
                    }
                }
                MeasurementSegment::ContactWrench(id) => {
                    if let Some(contact) = self.contacts.get(id) {
                        y.fixed_rows_mut::<6>(i).copy_from(&contact.wrench_measurement);
                    }
                }
                MeasurementSegment::AbsolutePose => {
                    if let Some(sensor) = &self.absolute_pose {
                        let pose = sensor.pose.to_vector(Flags::POSE)?;
                        y.rows_mut(i, segment.size()).copy_from(&pose);
                    }
                }
            }
            i += segment.size();
        }
        Ok(y)
    }

    /// Block-diagonal measurement covariance of `segments`. Sensors pushed
    /// without a covariance take the one in `defaults`.
    pub fn measurement_covariance(
        &self,
        segments: &[MeasurementSegment],
        defaults: &SensorCovariances,
    ) -> EstimationResult<DMatrix<f64>> {
        let (_, tangent_size) = measurement_sizes(segments);
        let mut r = DMatrix::zeros(tangent_size, tangent_size);
        let mut i = 0;

        for segment in segments {
            match segment {
                MeasurementSegment::Imu(id) => {
                    let (acc, gyro) = self
                        .imus
                        .get(id)
                        .map(|imu| (imu.accelerometer_covariance, imu.gyrometer_covariance))
                        .unwrap_or((defaults.accelerometer, defaults.gyrometer));
                    set_diagonal_block(&mut r, &DMatrix::from_column_slice(3, 3, acc.as_slice()), i)?;
                    set_diagonal_block(&mut r, &DMatrix::from_column_slice(3, 3, gyro.as_slice()), i + 3)?;
                }
                MeasurementSegment::ContactWrench(id) => {
                    let cov = self
                        .contacts
                        .get(id)
                        .and_then(|c| c.sensor_covariance)
                        .unwrap_or(defaults.contact_wrench);
                    set_diagonal_block(&mut r, &DMatrix::from_column_slice(6, 6, cov.as_slice()), i)?;
                }
                MeasurementSegment::AbsolutePose => {
                    let cov = self
                        .absolute_pose
                        .as_ref()
                        .and_then(|p| p.covariance)
                        .unwrap_or(defaults.absolute_pose);
                    set_diagonal_block(&mut r, &DMatrix::from_column_slice(6, 6, cov.as_slice()), i)?;
                }
            }
            i += segment.tangent_size();
        }
        Ok(r)
    }

    /// `y = h(x)` for the current segments.
    ///
    /// An IMU reads the specific force `R_G^T (a_G + g e_z)` and the angular
    /// velocity `R_G^T ω_G` (plus the gyro bias) of its frame `G`, the
    /// composition of the body state with the IMU's local kinematics.
    pub fn predict_measurement(&self, x: &State) -> EstimationResult<Measurement> {
        let (size, _) = measurement_sizes(&self.segments);
        let mut y = DVector::zeros(size);
        let mut i = 0;

        let with_imu = self
            .segments
            .iter()
            .any(|s| matches!(s, MeasurementSegment::Imu(_)));
        let mut body = self.state_kinematics(x);
        if with_imu {
            let (linear, angular) = self.state_accelerations(x);
            body.linear_acceleration = Some(linear);
            body.angular_acceleration = Some(angular);
        }
        let bias = if self.with_gyro_bias {
            self.gyro_bias(x)
        } else {
            Vector3::zeros()
        };

        for segment in &self.segments {
            match segment {
                MeasurementSegment::Imu(id) => {
                    if let Some(imu) = self.imus.get(id) {
                        let global = body.compose(&imu.kinematics)?;
                        let missing = |field| KinematicsError::missing("IMU measurement", field);
                        let r = global.orientation.ok_or_else(|| missing(KinematicsField::Orientation))?;
                        let a = global
                            .linear_acceleration
                            .ok_or_else(|| missing(KinematicsField::LinearAcceleration))?;
                        let w = global
                            .angular_velocity
                            .ok_or_else(|| missing(KinematicsField::AngularVelocity))?;

                        let specific_force = r.rotate_inverse(&(a + Vector3::z() * GRAVITY_CONSTANT));
                        y.fixed_rows_mut::<3>(i).copy_from(&specific_force);
                        y.fixed_rows_mut::<3>(i + 3).copy_from(&(r.rotate_inverse(&w) + bias));
                    }
                }
                MeasurementSegment::ContactWrench(id) => {
                    y.fixed_rows_mut::<6>(i)
                        .copy_from(&x.fixed_rows::<6>(self.layout.contact_force(*id)));
                }
                MeasurementSegment::AbsolutePose => {
                    let l = &self.layout;
                    y.fixed_rows_mut::<3>(i).copy_from(&Self::vector3(x, l.position()));
                    y.fixed_rows_mut::<4>(i + 3)
                        .copy_from(&x.fixed_rows::<4>(l.orientation()));
                }
            }
            i += segment.size();
        }
        Ok(y)
    }

    /// `y1 ⊖ y2`: the pose orientation is compared multiplicatively, every
    /// other entry by subtraction.
    pub fn measurement_tangent_difference(&self, y1: &Measurement, y2: &Measurement) -> DVector<f64> {
        let (_, tangent_size) = measurement_sizes(&self.segments);
        let mut d = DVector::zeros(tangent_size);
        let (mut i, mut t) = (0, 0);

        for segment in &self.segments {
            match segment {
                MeasurementSegment::Imu(_) | MeasurementSegment::ContactWrench(_) => {
                    let n = if matches!(segment, MeasurementSegment::Imu(_)) {
                        SIZE_IMU_SIGNAL
                    } else {
                        SIZE_WRENCH
                    };
                    d.rows_mut(t, n).copy_from(&(y1.rows(i, n) - y2.rows(i, n)));
                }
                MeasurementSegment::AbsolutePose => {
                    d.rows_mut(t, 3).copy_from(&(y1.rows(i, 3) - y2.rows(i, 3)));
                    let q1 = Orientation::from_quaternion(Self::quaternion(y1, i + 3));
                    let q2 = Orientation::from_quaternion(Self::quaternion(y2, i + 3));
                    d.fixed_rows_mut::<3>(t + 3).copy_from(&q2.differentiate(&q1));
                }
            }
            i += segment.size();
            t += segment.tangent_size();
        }
        d
    }
}
