// stance_core/src/kinematics/kine.rs

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::orientation::Orientation;
use super::rotation::regulate_rotation_vector;
use crate::error::{KinematicsError, KinematicsField, KinematicsResult};

/// Selects a subset of the fields of a [`Kinematics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub position: bool,
    pub orientation: bool,
    pub linear_velocity: bool,
    pub angular_velocity: bool,
    pub linear_acceleration: bool,
    pub angular_acceleration: bool,
}

impl Flags {
    pub const NONE: Flags = Flags {
        position: false,
        orientation: false,
        linear_velocity: false,
        angular_velocity: false,
        linear_acceleration: false,
        angular_acceleration: false,
    };
    pub const POSE: Flags = Flags {
        position: true,
        orientation: true,
        ..Flags::NONE
    };
    pub const VELOCITIES: Flags = Flags {
        linear_velocity: true,
        angular_velocity: true,
        ..Flags::NONE
    };
    pub const ACCELERATIONS: Flags = Flags {
        linear_acceleration: true,
        angular_acceleration: true,
        ..Flags::NONE
    };
    pub const POSE_AND_VELOCITIES: Flags = Flags {
        position: true,
        orientation: true,
        linear_velocity: true,
        angular_velocity: true,
        ..Flags::NONE
    };
    pub const ALL: Flags = Flags {
        position: true,
        orientation: true,
        linear_velocity: true,
        angular_velocity: true,
        linear_acceleration: true,
        angular_acceleration: true,
    };

    /// Number of entries of the quaternion vector form (orientation takes 4).
    pub fn size(&self) -> usize {
        self.vector_count() * 3 + if self.orientation { 4 } else { 0 }
    }

    /// Number of entries of the tangent vector form (orientation takes 3).
    pub fn tangent_size(&self) -> usize {
        self.vector_count() * 3 + if self.orientation { 3 } else { 0 }
    }

    fn vector_count(&self) -> usize {
        [
            self.position,
            self.linear_velocity,
            self.angular_velocity,
            self.linear_acceleration,
            self.angular_acceleration,
        ]
        .iter()
        .filter(|&&f| f)
        .count()
    }
}

/// Pose, velocity and acceleration of a frame with respect to its parent.
///
/// Every field is optional. Operators branch on presence: a derived field is
/// produced only when all of its inputs exist, otherwise it stays `None`.
/// Velocities and accelerations are expressed in the parent frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Kinematics {
    pub position: Option<Vector3<f64>>,
    pub orientation: Option<Orientation>,
    pub linear_velocity: Option<Vector3<f64>>,
    pub angular_velocity: Option<Vector3<f64>>,
    pub linear_acceleration: Option<Vector3<f64>>,
    pub angular_acceleration: Option<Vector3<f64>>,
}

impl Kinematics {
    /// Zero position, identity orientation and zero derivatives.
    pub fn identity() -> Self {
        Self::zero(Flags::ALL)
    }

    /// Sets the selected fields to zero (identity for the orientation).
    pub fn zero(flags: Flags) -> Self {
        let zero = Some(Vector3::zeros());
        Self {
            position: flags.position.then_some(Vector3::zeros()),
            orientation: flags.orientation.then(Orientation::identity),
            linear_velocity: if flags.linear_velocity { zero } else { None },
            angular_velocity: if flags.angular_velocity { zero } else { None },
            linear_acceleration: if flags.linear_acceleration { zero } else { None },
            angular_acceleration: if flags.angular_acceleration { zero } else { None },
        }
    }

    pub fn from_pose(position: Vector3<f64>, orientation: Orientation) -> Self {
        Self {
            position: Some(position),
            orientation: Some(orientation),
            ..Self::default()
        }
    }

    /// The fields currently present.
    pub fn flags(&self) -> Flags {
        Flags {
            position: self.position.is_some(),
            orientation: self.orientation.is_some(),
            linear_velocity: self.linear_velocity.is_some(),
            angular_velocity: self.angular_velocity.is_some(),
            linear_acceleration: self.linear_acceleration.is_some(),
            angular_acceleration: self.angular_acceleration.is_some(),
        }
    }

    // --- Composition & Inversion ---

    /// `self * other`: the kinematics of a frame given relative to `self`,
    /// expressed in the parent frame of `self`.
    pub fn compose(&self, other: &Kinematics) -> KinematicsResult<Kinematics> {
        let r1 = self
            .orientation
            .ok_or_else(|| KinematicsError::missing("composition", KinematicsField::Orientation))?;
        if other.position.is_none() && other.orientation.is_none() {
            return Err(KinematicsError::EmptyOperand);
        }

        let r1p2 = other.position.map(|p2| r1.rotate(&p2));
        let r1v2 = other.linear_velocity.map(|v2| r1.rotate(&v2));
        let r1w2 = other.angular_velocity.map(|w2| r1.rotate(&w2));

        let position = match (self.position, r1p2) {
            (Some(p1), Some(r1p2)) => Some(p1 + r1p2),
            _ => None,
        };

        let orientation = other.orientation.map(|r2| r1.compose(&r2));

        let linear_velocity = match (self.linear_velocity, self.angular_velocity, r1p2, r1v2) {
            (Some(v1), Some(w1), Some(r1p2), Some(r1v2)) => Some(v1 + w1.cross(&r1p2) + r1v2),
            _ => None,
        };

        let angular_velocity = match (self.angular_velocity, r1w2) {
            (Some(w1), Some(r1w2)) => Some(w1 + r1w2),
            _ => None,
        };

        let linear_acceleration = match (
            self.linear_acceleration,
            self.angular_acceleration,
            self.angular_velocity,
            r1p2,
            r1v2,
            other.linear_acceleration,
        ) {
            (Some(a1), Some(dw1), Some(w1), Some(r1p2), Some(r1v2), Some(a2)) => Some(
                a1 + dw1.cross(&r1p2)
                    + w1.cross(&w1.cross(&r1p2))
                    + 2.0 * w1.cross(&r1v2)
                    + r1.rotate(&a2),
            ),
            _ => None,
        };

        let angular_acceleration = match (
            self.angular_acceleration,
            self.angular_velocity,
            r1w2,
            other.angular_acceleration,
        ) {
            (Some(dw1), Some(w1), Some(r1w2), Some(dw2)) => {
                Some(dw1 + w1.cross(&r1w2) + r1.rotate(&dw2))
            }
            _ => None,
        };

        Ok(Kinematics {
            position,
            orientation,
            linear_velocity,
            angular_velocity,
            linear_acceleration,
            angular_acceleration,
        })
    }

    /// The kinematics of the parent frame expressed in this frame.
    pub fn inverse(&self) -> KinematicsResult<Kinematics> {
        let r = self
            .orientation
            .ok_or_else(|| KinematicsError::missing("inversion", KinematicsField::Orientation))?;

        let position = self.position.map(|p| -r.rotate_inverse(&p));

        let linear_velocity = match (self.position, self.linear_velocity, self.angular_velocity) {
            (Some(p), Some(v), Some(w)) => Some(r.rotate_inverse(&(w.cross(&p) - v))),
            _ => None,
        };

        let linear_acceleration = match (
            self.position,
            self.linear_velocity,
            self.angular_velocity,
            self.linear_acceleration,
            self.angular_acceleration,
        ) {
            (Some(p), Some(v), Some(w), Some(a), Some(dw)) => Some(
                r.rotate_inverse(&(w.cross(&(2.0 * v - w.cross(&p))) - a + dw.cross(&p))),
            ),
            _ => None,
        };

        Ok(Kinematics {
            position,
            orientation: Some(r.inverse()),
            linear_velocity,
            angular_velocity: self.angular_velocity.map(|w| -r.rotate_inverse(&w)),
            linear_acceleration,
            angular_acceleration: self.angular_acceleration.map(|dw| -r.rotate_inverse(&dw)),
        })
    }

    // --- Time Integration ---

    /// Advances the kinematics by `dt` assuming constant accelerations.
    ///
    /// Position and orientation move only when their velocity is present;
    /// velocities move only when their acceleration is present.
    pub fn integrate(&mut self, dt: f64) {
        if let Some(v) = self.linear_velocity.as_mut() {
            let a = self.linear_acceleration.unwrap_or_else(Vector3::zeros);
            if let Some(p) = self.position.as_mut() {
                *p += *v * dt + a * (0.5 * dt * dt);
            }
            *v += a * dt;
        }

        if let Some(w) = self.angular_velocity.as_mut() {
            let increment = match self.angular_acceleration {
                Some(dw) => {
                    let increment = *w * dt + dw * (0.5 * dt * dt);
                    *w += dw * dt;
                    increment
                }
                None => *w * dt,
            };
            if let Some(r) = self.orientation.as_mut() {
                *r = r.integrate(&increment);
            }
        }
    }

    /// Takes the selected fields from `new`, synthesizing any derivative that
    /// `new` lacks by finite differences against the current value over `dt`.
    /// A derivative that cannot be synthesized is set to zero.
    pub fn update_from(&mut self, new: &Kinematics, dt: f64, flags: Flags) {
        let previous = *self;

        let position = new.position.or(previous.position);
        let orientation = new.orientation.or(previous.orientation);

        let linear_velocity = new.linear_velocity.or_else(|| match (previous.position, new.position) {
            (Some(p0), Some(p1)) => Some((p1 - p0) / dt),
            _ => None,
        });
        let angular_velocity = new.angular_velocity.or_else(|| {
            match (previous.orientation, new.orientation) {
                (Some(r0), Some(r1)) => Some(r0.world_increment_to(&r1) / dt),
                _ => None,
            }
        });
        let linear_acceleration = new.linear_acceleration.or_else(|| {
            match (previous.linear_velocity, linear_velocity) {
                (Some(v0), Some(v1)) => Some((v1 - v0) / dt),
                _ => None,
            }
        });
        let angular_acceleration = new.angular_acceleration.or_else(|| {
            match (previous.angular_velocity, angular_velocity) {
                (Some(w0), Some(w1)) => Some((w1 - w0) / dt),
                _ => None,
            }
        });

        *self = Kinematics {
            position: flags.position.then(|| position.unwrap_or_else(Vector3::zeros)),
            orientation: flags
                .orientation
                .then(|| orientation.unwrap_or_else(Orientation::identity)),
            linear_velocity: flags
                .linear_velocity
                .then(|| linear_velocity.unwrap_or_else(Vector3::zeros)),
            angular_velocity: flags
                .angular_velocity
                .then(|| angular_velocity.unwrap_or_else(Vector3::zeros)),
            linear_acceleration: flags
                .linear_acceleration
                .then(|| linear_acceleration.unwrap_or_else(Vector3::zeros)),
            angular_acceleration: flags
                .angular_acceleration
                .then(|| angular_acceleration.unwrap_or_else(Vector3::zeros)),
        };
    }

    // --- Vector Forms ---

    /// Flattens the selected fields, orientation as quaternion `[x, y, z, w]`.
    pub fn to_vector(&self, flags: Flags) -> KinematicsResult<DVector<f64>> {
        self.flatten(flags, false)
    }

    /// Flattens the selected fields, orientation as a rotation vector.
    pub fn to_tangent_vector(&self, flags: Flags) -> KinematicsResult<DVector<f64>> {
        self.flatten(flags, true)
    }

    pub fn from_vector(v: &DVector<f64>, flags: Flags) -> KinematicsResult<Kinematics> {
        let mut kine = Kinematics::default();
        kine.assign_from_vector(v, flags)?;
        Ok(kine)
    }

    pub fn from_tangent_vector(v: &DVector<f64>, flags: Flags) -> KinematicsResult<Kinematics> {
        let mut kine = Kinematics::default();
        kine.assign(v, flags, true)?;
        Ok(kine)
    }

    /// Overwrites only the selected fields with the entries of `v`.
    pub fn assign_from_vector(&mut self, v: &DVector<f64>, flags: Flags) -> KinematicsResult<()> {
        self.assign(v, flags, false)
    }

    fn flatten(&self, flags: Flags, tangent: bool) -> KinematicsResult<DVector<f64>> {
        let size = if tangent { flags.tangent_size() } else { flags.size() };
        let mut out = DVector::zeros(size);
        let mut i = 0;

        let push3 = |out: &mut DVector<f64>,
                         i: &mut usize,
                         value: Option<Vector3<f64>>,
                         field: KinematicsField|
         -> KinematicsResult<()> {
            let value = value.ok_or_else(|| KinematicsError::missing("vector conversion", field))?;
            out.fixed_rows_mut::<3>(*i).copy_from(&value);
            *i += 3;
            Ok(())
        };

        if flags.position {
            push3(&mut out, &mut i, self.position, KinematicsField::Position)?;
        }
        if flags.orientation {
            let r = self
                .orientation
                .ok_or_else(|| KinematicsError::missing("vector conversion", KinematicsField::Orientation))?;
            if tangent {
                out.fixed_rows_mut::<3>(i).copy_from(&r.to_rotation_vector());
                i += 3;
            } else {
                out.fixed_rows_mut::<4>(i).copy_from(&r.quaternion().coords);
                i += 4;
            }
        }
        if flags.linear_velocity {
            push3(&mut out, &mut i, self.linear_velocity, KinematicsField::LinearVelocity)?;
        }
        if flags.angular_velocity {
            push3(&mut out, &mut i, self.angular_velocity, KinematicsField::AngularVelocity)?;
        }
        if flags.linear_acceleration {
            push3(&mut out, &mut i, self.linear_acceleration, KinematicsField::LinearAcceleration)?;
        }
        if flags.angular_acceleration {
            push3(&mut out, &mut i, self.angular_acceleration, KinematicsField::AngularAcceleration)?;
        }
        Ok(out)
    }

    fn assign(&mut self, v: &DVector<f64>, flags: Flags, tangent: bool) -> KinematicsResult<()> {
        let expected = if tangent { flags.tangent_size() } else { flags.size() };
        if v.len() != expected {
            return Err(KinematicsError::VectorSize {
                expected,
                found: v.len(),
            });
        }

        let mut i = 0;
        let take3 = |i: &mut usize| {
            let value: Vector3<f64> = v.fixed_rows::<3>(*i).into_owned();
            *i += 3;
            value
        };

        if flags.position {
            self.position = Some(take3(&mut i));
        }
        if flags.orientation {
            if tangent {
                let rotation_vector = regulate_rotation_vector(&take3(&mut i));
                self.orientation = Some(Orientation::from_rotation_vector(&rotation_vector));
            } else {
                let q = Quaternion::new(v[i + 3], v[i], v[i + 1], v[i + 2]);
                self.orientation = Some(Orientation::from_quaternion(UnitQuaternion::from_quaternion(q)));
                i += 4;
            }
        }
        if flags.linear_velocity {
            self.linear_velocity = Some(take3(&mut i));
        }
        if flags.angular_velocity {
            self.angular_velocity = Some(take3(&mut i));
        }
        if flags.linear_acceleration {
            self.linear_acceleration = Some(take3(&mut i));
        }
        if flags.angular_acceleration {
            self.angular_acceleration = Some(take3(&mut i));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const F64_EPSILON: f64 = 1e-9;

    fn sample(seed: f64) -> Kinematics {
        Kinematics {
            position: Some(Vector3::new(0.3, -1.0, 0.5) * seed),
            orientation: Some(Orientation::from_rotation_vector(&Vector3::new(0.2, 0.4, -0.6 * seed))),
            linear_velocity: Some(Vector3::new(-0.5, 0.25, 1.0) * seed),
            angular_velocity: Some(Vector3::new(0.1, -0.3, 0.2 * seed)),
            linear_acceleration: Some(Vector3::new(1.0, 0.0, -2.0) * seed),
            angular_acceleration: Some(Vector3::new(-0.4, 0.7, 0.1) * seed),
        }
    }

    fn assert_kine_eq(a: &Kinematics, b: &Kinematics) {
        assert_eq!(a.flags(), b.flags());
        let pairs = [
            (a.position, b.position),
            (a.linear_velocity, b.linear_velocity),
            (a.angular_velocity, b.angular_velocity),
            (a.linear_acceleration, b.linear_acceleration),
            (a.angular_acceleration, b.angular_acceleration),
        ];
        for (x, y) in pairs {
            if let (Some(x), Some(y)) = (x, y) {
                assert_abs_diff_eq!(x, y, epsilon = F64_EPSILON);
            }
        }
        if let (Some(x), Some(y)) = (a.orientation, b.orientation) {
            assert_abs_diff_eq!(x.angle_to(&y), 0.0, epsilon = F64_EPSILON);
        }
    }

    #[test]
    fn test_double_inverse_is_identity() {
        let k = sample(1.0);
        let back = k.inverse().unwrap().inverse().unwrap();
        assert_kine_eq(&k, &back);
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let k = sample(0.7);
        let id = k.compose(&k.inverse().unwrap()).unwrap();
        assert_kine_eq(&id, &Kinematics::identity());
        let id = k.inverse().unwrap().compose(&k).unwrap();
        assert_kine_eq(&id, &Kinematics::identity());
    }

    #[test]
    fn test_compose_with_identity_is_noop() {
        let k = sample(1.3);
        assert_kine_eq(&k.compose(&Kinematics::identity()).unwrap(), &k);
        assert_kine_eq(&Kinematics::identity().compose(&k).unwrap(), &k);
    }

    #[test]
    fn test_compose_is_associative() {
        let a = sample(1.0);
        let b = sample(-0.5);
        let c = sample(2.0);
        let left = a.compose(&b).unwrap().compose(&c).unwrap();
        let right = a.compose(&b.compose(&c).unwrap()).unwrap();
        assert_kine_eq(&left, &right);
    }

    #[test]
    fn test_compose_propagates_absence() {
        let parent = sample(1.0);
        let child = Kinematics::from_pose(Vector3::new(0.0, 0.1, 0.0), Orientation::identity());
        let composed = parent.compose(&child).unwrap();
        assert!(composed.position.is_some());
        assert!(composed.orientation.is_some());
        assert!(composed.linear_velocity.is_none());
        assert!(composed.angular_acceleration.is_none());

        // A child carrying only an orientation still rotates.
        let child = Kinematics {
            orientation: Some(Orientation::identity()),
            ..Kinematics::default()
        };
        let composed = parent.compose(&child).unwrap();
        assert!(composed.position.is_none());
        assert!(composed.orientation.is_some());
    }

    #[test]
    fn test_compose_preconditions() {
        let no_orientation = Kinematics {
            position: Some(Vector3::zeros()),
            ..Kinematics::default()
        };
        assert_eq!(
            no_orientation.compose(&Kinematics::identity()),
            Err(KinematicsError::missing("composition", KinematicsField::Orientation))
        );

        let empty = Kinematics {
            linear_velocity: Some(Vector3::zeros()),
            ..Kinematics::default()
        };
        assert_eq!(Kinematics::identity().compose(&empty), Err(KinematicsError::EmptyOperand));
        assert!(no_orientation.inverse().is_err());
    }

    #[test]
    fn test_compose_velocity_transport() {
        // A point one meter along x on a body spinning about z moves along y.
        let body = Kinematics {
            angular_velocity: Some(Vector3::new(0.0, 0.0, 2.0)),
            angular_acceleration: Some(Vector3::zeros()),
            ..Kinematics::identity()
        };
        let point = Kinematics {
            position: Some(Vector3::new(1.0, 0.0, 0.0)),
            ..Kinematics::zero(Flags::ALL)
        };
        let global = body.compose(&point).unwrap();
        assert_abs_diff_eq!(global.linear_velocity.unwrap(), Vector3::new(0.0, 2.0, 0.0), epsilon = F64_EPSILON);
        // Centripetal acceleration points back to the axis.
        assert_abs_diff_eq!(
            global.linear_acceleration.unwrap(),
            Vector3::new(-4.0, 0.0, 0.0),
            epsilon = F64_EPSILON
        );
    }

    #[test]
    fn test_integrate_constant_acceleration() {
        let mut k = Kinematics {
            angular_velocity: Some(Vector3::new(0.0, 0.0, 1.0)),
            linear_velocity: Some(Vector3::new(1.0, 0.0, 0.0)),
            linear_acceleration: Some(Vector3::new(0.0, 0.0, -9.8)),
            ..Kinematics::identity()
        };
        k.integrate(0.1);
        assert_abs_diff_eq!(k.position.unwrap(), Vector3::new(0.1, 0.0, -0.049), epsilon = F64_EPSILON);
        assert_abs_diff_eq!(k.linear_velocity.unwrap(), Vector3::new(1.0, 0.0, -0.98), epsilon = F64_EPSILON);
        let expected = Orientation::from_rotation_vector(&Vector3::new(0.0, 0.0, 0.1));
        assert_abs_diff_eq!(k.orientation.unwrap().angle_to(&expected), 0.0, epsilon = F64_EPSILON);
    }

    #[test]
    fn test_update_from_synthesizes_derivatives() {
        let dt = 0.01;
        let mut k = Kinematics::default();
        let first = Kinematics::from_pose(Vector3::new(1.0, 0.0, 0.0), Orientation::identity());
        k.update_from(&first, dt, Flags::ALL);
        // Nothing to differentiate against yet.
        assert_eq!(k.linear_velocity, Some(Vector3::zeros()));
        assert_eq!(k.angular_velocity, Some(Vector3::zeros()));

        let rotation = Vector3::new(0.0, 0.02, 0.0);
        let second = Kinematics::from_pose(Vector3::new(1.01, 0.0, 0.0), Orientation::from_rotation_vector(&rotation));
        k.update_from(&second, dt, Flags::ALL);
        assert_abs_diff_eq!(k.linear_velocity.unwrap(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_abs_diff_eq!(k.angular_velocity.unwrap(), Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-9);
        assert_abs_diff_eq!(k.linear_acceleration.unwrap(), Vector3::new(100.0, 0.0, 0.0), epsilon = 1e-6);

        // Only the selected fields are kept.
        k.update_from(&second, dt, Flags::POSE);
        assert!(k.linear_velocity.is_none());
    }

    #[test]
    fn test_vector_forms() {
        let k = sample(1.0);
        let v = k.to_vector(Flags::POSE_AND_VELOCITIES).unwrap();
        assert_eq!(v.len(), 13);
        let back = Kinematics::from_vector(&v, Flags::POSE_AND_VELOCITIES).unwrap();
        assert!(back.linear_acceleration.is_none());
        assert_abs_diff_eq!(back.position.unwrap(), k.position.unwrap(), epsilon = F64_EPSILON);
        assert_abs_diff_eq!(
            back.orientation.unwrap().angle_to(&k.orientation.unwrap()),
            0.0,
            epsilon = F64_EPSILON
        );

        let t = k.to_tangent_vector(Flags::POSE).unwrap();
        assert_eq!(t.len(), 6);
        assert_abs_diff_eq!(
            t.fixed_rows::<3>(3).into_owned(),
            k.orientation.unwrap().to_rotation_vector(),
            epsilon = F64_EPSILON
        );

        assert!(Kinematics::from_vector(&v, Flags::POSE).is_err());
        assert!(Kinematics::default().to_vector(Flags::POSE).is_err());

        let mut partial = sample(1.0);
        let acc = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        partial.assign_from_vector(&acc, Flags::ACCELERATIONS).unwrap();
        assert_eq!(partial.linear_acceleration, Some(Vector3::new(1.0, 2.0, 3.0)));
        assert_eq!(partial.position, k.position);
    }
}
