// stance_core/src/kinematics/rotation.rs

//! Rotation primitives: skew operators, the exponential and logarithm maps
//! between rotation vectors and the rotation group, and their Jacobians.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

// Below this angle the trigonometric ratios are replaced by their Taylor series.
const SMALL_ANGLE: f64 = 1e-6;

/// Norm above which a rotation vector is rewrapped by `regulate_rotation_vector`.
pub const REGULATE_THRESHOLD: f64 = 1.5 * PI;

/// The skew-symmetric matrix `[v]x` such that `[v]x * w = v x w`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// The square of the skew-symmetric matrix, `[v]x^2 = v v^T - |v|^2 I`.
pub fn skew_symmetric2(v: &Vector3<f64>) -> Matrix3<f64> {
    v * v.transpose() - Matrix3::identity() * v.norm_squared()
}

/// Recovers `v` from a skew-symmetric matrix, keeping only its antisymmetric part.
pub fn vee(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(m[(2, 1)] - m[(1, 2)], m[(0, 2)] - m[(2, 0)], m[(1, 0)] - m[(0, 1)]) * 0.5
}

/// Exponential map: rotation vector (axis times angle) to unit quaternion.
pub fn rotation_vector_to_quaternion(v: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = v.norm();
    let half = 0.5 * angle;
    // sin(angle / 2) / angle
    let k = if angle > SMALL_ANGLE {
        half.sin() / angle
    } else {
        0.5 - angle * angle / 48.0
    };
    UnitQuaternion::from_quaternion(Quaternion::new(half.cos(), k * v.x, k * v.y, k * v.z))
}

pub fn rotation_vector_to_matrix(v: &Vector3<f64>) -> Rotation3<f64> {
    rotation_vector_to_quaternion(v).to_rotation_matrix()
}

/// Logarithm map: unit quaternion to rotation vector with angle in `[0, pi]`.
///
/// The angle is computed with `atan2`, which stays accurate for tiny rotations
/// where an `acos` of the scalar part loses most of its digits.
pub fn quaternion_to_rotation_vector(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let q = q.quaternion();
    // q and -q are the same rotation, pick the hemisphere with w >= 0.
    let (w, imag) = if q.w < 0.0 {
        (-q.w, -q.imag())
    } else {
        (q.w, q.imag())
    };
    let n = imag.norm();
    let k = if n > SMALL_ANGLE {
        2.0 * n.atan2(w) / n
    } else {
        // 2 atan(n / w) / n
        2.0 / w * (1.0 - n * n / (3.0 * w * w))
    };
    imag * k
}

pub fn matrix_to_rotation_vector(m: &Rotation3<f64>) -> Vector3<f64> {
    quaternion_to_rotation_vector(&UnitQuaternion::from_rotation_matrix(m))
}

/// Rewraps a drifting rotation vector once its norm exceeds `1.5 pi`.
///
/// The norm `n` is reduced by `2 pi k` with `k = ceil((n - pi) / (2 pi))`,
/// which brings it back into `(-pi, pi]` along the same axis. Vectors at or
/// below the threshold are returned untouched.
pub fn regulate_rotation_vector(v: &Vector3<f64>) -> Vector3<f64> {
    let n = v.norm();
    if n > REGULATE_THRESHOLD {
        let k = ((n - PI) / (2.0 * PI)).ceil();
        v / n * (n - 2.0 * PI * k)
    } else {
        *v
    }
}

// Coefficients (1 - cos t) / t^2 and (t - sin t) / t^3 of the Rodrigues derivatives.
fn rodrigues_coefficients(angle: f64) -> (f64, f64) {
    if angle > 1e-3 {
        let a2 = angle * angle;
        ((1.0 - angle.cos()) / a2, (angle - angle.sin()) / (a2 * angle))
    } else {
        let a2 = angle * angle;
        (0.5 - a2 / 24.0, 1.0 / 6.0 - a2 / 120.0)
    }
}

/// Right Jacobian of the exponential map: `exp(v + d) ~ exp(v) * exp(Jr(v) d)`.
pub fn right_jacobian(v: &Vector3<f64>) -> Matrix3<f64> {
    let (a, b) = rodrigues_coefficients(v.norm());
    Matrix3::identity() - skew_symmetric(v) * a + skew_symmetric2(v) * b
}

/// Left Jacobian of the exponential map: `exp(v + d) ~ exp(Jl(v) d) * exp(v)`.
pub fn left_jacobian(v: &Vector3<f64>) -> Matrix3<f64> {
    let (a, b) = rodrigues_coefficients(v.norm());
    Matrix3::identity() + skew_symmetric(v) * a + skew_symmetric2(v) * b
}
