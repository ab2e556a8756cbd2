// stance_core/src/kinematics/orientation.rs

use std::ops::Mul;

use approx::AbsDiffEq;
use nalgebra::{Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::rotation::{quaternion_to_rotation_vector, rotation_vector_to_quaternion};

/// A 3-D rotation held as a quaternion, a rotation matrix, or both.
///
/// At least one representation always exists. Nothing is converted behind the
/// caller's back: `with_quaternion`/`with_matrix` return a new value that also
/// carries the requested representation, while `quaternion()`/`matrix()`
/// derive it on the fly when it is absent. Operations produce a single
/// representation, so a stale twin can never outlive an update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Orientation {
    Quaternion(UnitQuaternion<f64>),
    Matrix(Rotation3<f64>),
    Both {
        quaternion: UnitQuaternion<f64>,
        matrix: Rotation3<f64>,
    },
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Orientation {
    // --- Construction ---

    pub fn identity() -> Self {
        Self::Quaternion(UnitQuaternion::identity())
    }

    pub fn from_quaternion(q: UnitQuaternion<f64>) -> Self {
        Self::Quaternion(q)
    }

    pub fn from_matrix(m: Rotation3<f64>) -> Self {
        Self::Matrix(m)
    }

    /// Builds the rotation `exp(v)` from a rotation vector.
    pub fn from_rotation_vector(v: &Vector3<f64>) -> Self {
        Self::Quaternion(rotation_vector_to_quaternion(v))
    }

    // --- Representations ---

    pub fn has_quaternion(&self) -> bool {
        !matches!(self, Self::Matrix(_))
    }

    pub fn has_matrix(&self) -> bool {
        !matches!(self, Self::Quaternion(_))
    }

    /// The quaternion representation, derived from the matrix if needed.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        match self {
            Self::Quaternion(q) | Self::Both { quaternion: q, .. } => *q,
            Self::Matrix(m) => UnitQuaternion::from_rotation_matrix(m),
        }
    }

    /// The matrix representation, derived from the quaternion if needed.
    pub fn matrix(&self) -> Rotation3<f64> {
        match self {
            Self::Matrix(m) | Self::Both { matrix: m, .. } => *m,
            Self::Quaternion(q) => q.to_rotation_matrix(),
        }
    }

    /// Returns this orientation guaranteed to carry a quaternion.
    #[must_use]
    pub fn with_quaternion(self) -> Self {
        match self {
            Self::Matrix(m) => Self::Both {
                quaternion: UnitQuaternion::from_rotation_matrix(&m),
                matrix: m,
            },
            other => other,
        }
    }

    /// Returns this orientation guaranteed to carry a matrix.
    #[must_use]
    pub fn with_matrix(self) -> Self {
        match self {
            Self::Quaternion(q) => Self::Both {
                quaternion: q,
                matrix: q.to_rotation_matrix(),
            },
            other => other,
        }
    }

    /// Returns this orientation carrying both representations.
    #[must_use]
    pub fn synchronized(self) -> Self {
        self.with_quaternion().with_matrix()
    }

    // --- Group operations ---

    /// `self * other`: `other` expressed in the frame of `self`.
    ///
    /// Matrices are multiplied when both operands hold one, quaternions otherwise.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        if self.has_matrix() && other.has_matrix() {
            Self::Matrix(self.matrix() * other.matrix())
        } else {
            Self::Quaternion(self.quaternion() * other.quaternion())
        }
    }

    #[must_use]
    pub fn inverse(&self) -> Self {
        match self {
            Self::Quaternion(q) => Self::Quaternion(q.inverse()),
            Self::Matrix(m) => Self::Matrix(m.inverse()),
            Self::Both { quaternion, matrix } => Self::Both {
                quaternion: quaternion.inverse(),
                matrix: matrix.inverse(),
            },
        }
    }

    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        match self {
            Self::Matrix(m) | Self::Both { matrix: m, .. } => m * v,
            Self::Quaternion(q) => q * v,
        }
    }

    /// Applies the inverse rotation (`R^T v`).
    pub fn rotate_inverse(&self, v: &Vector3<f64>) -> Vector3<f64> {
        match self {
            Self::Matrix(m) | Self::Both { matrix: m, .. } => m.inverse_transform_vector(v),
            Self::Quaternion(q) => q.inverse_transform_vector(v),
        }
    }

    // --- Tangent space ---

    /// Applies a world-frame increment: `exp(v) * R`.
    #[must_use]
    pub fn integrate(&self, v: &Vector3<f64>) -> Self {
        Self::from_rotation_vector(v).compose(self)
    }

    /// Applies a body-frame increment: `R * exp(d)`. Inverse of `differentiate`.
    #[must_use]
    pub fn perturb(&self, d: &Vector3<f64>) -> Self {
        self.compose(&Self::from_rotation_vector(d))
    }

    /// The body-frame rotation vector `log(R1^-1 * R2)` carrying `self` to `other`.
    pub fn differentiate(&self, other: &Self) -> Vector3<f64> {
        quaternion_to_rotation_vector(&(self.quaternion().inverse() * other.quaternion()))
    }

    /// The world-frame rotation vector `log(R2 * R1^-1)`, so that
    /// `self.integrate(&self.world_increment_to(other))` equals `other`.
    pub fn world_increment_to(&self, other: &Self) -> Vector3<f64> {
        quaternion_to_rotation_vector(&(other.quaternion() * self.quaternion().inverse()))
    }

    pub fn to_rotation_vector(&self) -> Vector3<f64> {
        quaternion_to_rotation_vector(&self.quaternion())
    }

    /// Angle of the relative rotation between two orientations, in `[0, pi]`.
    pub fn angle_to(&self, other: &Self) -> f64 {
        self.differentiate(other).norm()
    }
}

/// Exact equality of the rotations, compared as quaternions up to sign. The
/// same rotation reached through different operations can differ by rounding;
/// compare those with [`AbsDiffEq`].
impl PartialEq for Orientation {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.quaternion(), other.quaternion());
        a.coords == b.coords || a.coords == -b.coords
    }
}

/// Equality up to the angle of the relative rotation.
impl AbsDiffEq for Orientation {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        self.angle_to(other) <= epsilon
    }
}

impl Mul for Orientation {
    type Output = Orientation;

    fn mul(self, rhs: Orientation) -> Orientation {
        self.compose(&rhs)
    }
}

impl From<UnitQuaternion<f64>> for Orientation {
    fn from(q: UnitQuaternion<f64>) -> Self {
        Self::Quaternion(q)
    }
}

impl From<Rotation3<f64>> for Orientation {
    fn from(m: Rotation3<f64>) -> Self {
        Self::Matrix(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const F64_EPSILON: f64 = 1e-10;

    fn assert_same_rotation(a: &Orientation, b: &Orientation) {
        assert_abs_diff_eq!(*a, *b, epsilon = F64_EPSILON);
    }

    #[test]
    fn test_explicit_conversions() {
        let q = UnitQuaternion::from_euler_angles(0.1, -0.4, 1.2);
        let from_q = Orientation::from_quaternion(q);
        assert!(from_q.has_quaternion());
        assert!(!from_q.has_matrix());

        let synced = from_q.with_matrix();
        assert!(synced.has_quaternion() && synced.has_matrix());
        assert_same_rotation(&synced, &Orientation::from_matrix(q.to_rotation_matrix()));

        let from_m = Orientation::from_matrix(q.to_rotation_matrix()).with_quaternion();
        assert!(from_m.has_quaternion());
        assert_abs_diff_eq!(from_m.quaternion().angle_to(&q), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_compose_keeps_single_representation() {
        let a = Orientation::from_quaternion(UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0)).synchronized();
        let b = Orientation::from_matrix(Rotation3::from_euler_angles(0.0, 0.2, 0.0));
        let c = a.compose(&b);
        assert!(matches!(c, Orientation::Matrix(_)));

        let d = Orientation::identity().compose(&b);
        assert!(matches!(d, Orientation::Quaternion(_)));
        assert_same_rotation(&c, &(a * b));
    }

    #[test]
    fn test_inverse_and_rotate() {
        let r = Orientation::from_rotation_vector(&Vector3::new(0.2, -0.5, 0.7));
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert_abs_diff_eq!(r.rotate_inverse(&r.rotate(&v)), v, epsilon = F64_EPSILON);
        assert_abs_diff_eq!(r.inverse().rotate(&v), r.rotate_inverse(&v), epsilon = F64_EPSILON);
        assert_same_rotation(&r.compose(&r.inverse()), &Orientation::identity());
    }

    #[test]
    fn test_integrate_differentiate_round_trip() {
        let v = Vector3::new(0.9, -1.1, 0.4);
        let rotated = Orientation::identity().integrate(&v);
        assert_abs_diff_eq!(Orientation::identity().differentiate(&rotated), v, epsilon = F64_EPSILON);

        let start = Orientation::from_rotation_vector(&Vector3::new(-0.3, 0.2, 0.1));
        let goal = Orientation::from_rotation_vector(&Vector3::new(1.0, 0.5, -0.8));
        assert_same_rotation(&start.perturb(&start.differentiate(&goal)), &goal);
        assert_same_rotation(&start.integrate(&start.world_increment_to(&goal)), &goal);
    }

    #[test]
    fn test_integrate_is_left_multiplication() {
        let r = Orientation::from_rotation_vector(&Vector3::new(0.4, 0.0, 0.3));
        let w = Vector3::new(0.0, 0.6, 0.0);
        let expected = Orientation::from_rotation_vector(&w).compose(&r);
        assert_same_rotation(&r.integrate(&w), &expected);
    }

    #[test]
    fn test_equality_across_representations() {
        let q = UnitQuaternion::from_euler_angles(0.5, 0.1, -0.2);
        assert_eq!(Orientation::from_quaternion(q), Orientation::from_quaternion(q).with_matrix());
        // q and -q are the same rotation.
        assert_eq!(
            Orientation::from_quaternion(q),
            Orientation::from_quaternion(UnitQuaternion::new_unchecked(-q.into_inner()))
        );
    }

    #[test]
    fn test_same_rotation_built_two_ways() {
        let v = Vector3::new(0.3, -1.2, 2.1);
        let from_vector = Orientation::from_rotation_vector(&v);
        let from_matrix = Orientation::from_matrix(Rotation3::new(v));
        assert_abs_diff_eq!(from_vector, from_matrix, epsilon = 1e-12);

        let other = from_vector.integrate(&Vector3::new(0.0, 0.0, 1e-6));
        assert!(!from_vector.abs_diff_eq(&other, 1e-9));
        assert!(from_vector.abs_diff_eq(&other, 1e-5));
    }
}
