// stance_core/tests/imu_attitude.rs

//! Attitude estimation from a single IMU through the generic filter.
//!
//! The simulated body follows commanded accelerations (vertical linear,
//! sinusoidal angular) disturbed by process noise. The filter starts from
//! the identity while the truth starts from a random orientation, and must
//! recover the direction of gravity in the body frame.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use stance_core::error::EstimationResult;
use stance_core::prelude::*;
use stance_core::types::GRAVITY_CONSTANT;

const DT: f64 = 1e-3;
const STEPS: u64 = 3000;

/// State `[q (x, y, z, w), ω]`, orientation and angular velocity in the world
/// frame. Input `[a, ω̇]`, the commanded world accelerations.
struct RotatingBody;

fn orientation(x: &DVector<f64>) -> Orientation {
    Orientation::from_quaternion(UnitQuaternion::from_quaternion(Quaternion::new(
        x[3], x[0], x[1], x[2],
    )))
}

fn pack(r: &Orientation, w: &Vector3<f64>) -> DVector<f64> {
    let q = r.quaternion();
    DVector::from_vec(vec![q.i, q.j, q.k, q.w, w.x, w.y, w.z])
}

impl DynamicalSystem for RotatingBody {
    fn state_dynamics(&self, x: &State, u: &Control, _k: TimeIndex) -> EstimationResult<State> {
        let w = x.fixed_rows::<3>(4).into_owned();
        let dw = u.fixed_rows::<3>(3).into_owned();
        let r = orientation(x).integrate(&(w * DT));
        Ok(pack(&r, &(w + dw * DT)))
    }

    fn measure_dynamics(&self, x: &State, u: &Control, _k: TimeIndex) -> EstimationResult<Measurement> {
        let r = orientation(x);
        let a = u.fixed_rows::<3>(0).into_owned();
        let w = x.fixed_rows::<3>(4).into_owned();
        let accelerometer = r.rotate_inverse(&(a + Vector3::z() * GRAVITY_CONSTANT));
        let gyrometer = r.rotate_inverse(&w);
        Ok(DVector::from_iterator(6, accelerometer.iter().chain(gyrometer.iter()).copied()))
    }

    fn state_sum(&self, x: &State, dx: &DVector<f64>) -> State {
        let r = orientation(x).perturb(&dx.fixed_rows::<3>(0).into_owned());
        let w = x.fixed_rows::<3>(4) + dx.fixed_rows::<3>(3);
        pack(&r, &w)
    }

    fn state_difference(&self, x1: &State, x2: &State) -> DVector<f64> {
        let dr = orientation(x2).differentiate(&orientation(x1));
        let dw = x1.fixed_rows::<3>(4) - x2.fixed_rows::<3>(4);
        DVector::from_iterator(6, dr.iter().chain(dw.iter()).copied())
    }
}

fn command(k: u64) -> DVector<f64> {
    let t = k as f64 * DT;
    DVector::from_vec(vec![
        0.0,
        0.0,
        2.0 * (2.0 * PI * 0.5 * t).sin(),
        (2.0 * PI * 0.3 * t).sin(),
        0.8 * (2.0 * PI * 0.2 * t).cos(),
        0.5 * (2.0 * PI * 0.1 * t).sin(),
    ])
}

fn local_gravity(r: &Orientation) -> Vector3<f64> {
    r.rotate_inverse(&Vector3::z())
}

#[test]
fn test_gravity_direction_converges_from_identity() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let process_noise = Normal::new(0.0, 0.1).unwrap();
    let sensor_noise = Normal::new(0.0, 0.1).unwrap();

    // --- Truth ---
    // A random heading composed with a tilt of 0.5 to 1 rad about a random horizontal axis.
    let heading = Orientation::from_rotation_vector(&Vector3::new(0.0, 0.0, rng.gen_range(-PI..PI)));
    let axis: f64 = rng.gen_range(-PI..PI);
    let angle: f64 = rng.gen_range(0.5..1.0);
    let tilt = Vector3::new(axis.cos(), axis.sin(), 0.0) * angle;
    let mut truth_r = heading.compose(&Orientation::from_rotation_vector(&tilt));
    let mut truth_w = Vector3::zeros();

    // --- Filter ---
    let sizes = FilterSizes {
        state: 7,
        state_tangent: 6,
        measurement: 6,
        measurement_tangent: 6,
        input: 6,
    };
    let system = RotatingBody;
    let mut ekf = ExtendedKalmanFilter::new(sizes);
    ekf.set_state(pack(&Orientation::identity(), &Vector3::zeros()), 0).unwrap();

    let mut p0 = DMatrix::identity(6, 6);
    p0.view_mut((3, 3), (3, 3)).fill_diagonal(1e-2);
    ekf.set_state_covariance(p0).unwrap();

    let mut q = DMatrix::identity(6, 6) * 1e-10;
    q.view_mut((3, 3), (3, 3)).fill_diagonal((0.1 * DT) * (0.1 * DT));
    ekf.set_q(q).unwrap();
    ekf.set_r(DMatrix::identity(6, 6) * 0.01).unwrap();

    let steps = DVector::from_element(6, 1e-6);
    let initial_error = local_gravity(&truth_r).angle(&local_gravity(&Orientation::identity()));

    for k in 0..STEPS {
        let u = command(k);
        let u_next = command(k + 1);

        // 1. Move the truth with noisy angular accelerations.
        let dw = u.fixed_rows::<3>(3).into_owned()
            + Vector3::from_fn(|_, _| process_noise.sample(&mut rng));
        truth_r = truth_r.integrate(&(truth_w * DT));
        truth_w += dw * DT;

        // 2. Measure it.
        let a = u_next.fixed_rows::<3>(0).into_owned();
        let accelerometer = truth_r.rotate_inverse(&(a + Vector3::z() * GRAVITY_CONSTANT));
        let gyrometer = truth_r.rotate_inverse(&truth_w);
        let y = DVector::from_iterator(
            6,
            accelerometer
                .iter()
                .chain(gyrometer.iter())
                .map(|v| v + sensor_noise.sample(&mut rng)),
        );

        // 3. Estimate.
        ekf.set_input(u, k).unwrap();
        ekf.set_input(u_next, k + 1).unwrap();
        ekf.set_measurement(y, k + 1).unwrap();
        let a_matrix = ekf.a_matrix_fd(&system, &steps).unwrap();
        let c_matrix = ekf.c_matrix_fd(&system, &steps).unwrap();
        ekf.set_a(a_matrix).unwrap();
        ekf.set_c(c_matrix).unwrap();
        ekf.one_step_estimation(&system).unwrap();
    }

    assert_eq!(ekf.current_time(), STEPS);
    let estimate = orientation(ekf.state().unwrap());
    let error = local_gravity(&truth_r).angle(&local_gravity(&estimate));
    assert!(initial_error > 0.49, "initial error {initial_error}");
    assert!(error < 1.0_f64.to_radians(), "gravity direction error {} deg", error.to_degrees());

    let p = ekf.state_covariance().unwrap();
    assert!((p - p.transpose()).abs().max() < 1e-12);
}
