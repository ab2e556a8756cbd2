// stance_core/src/models/kinetics/layout.rs

use crate::types::ContactId;

// --- Block sizes (vector form) ---
pub const SIZE_POSITION: usize = 3;
pub const SIZE_QUATERNION: usize = 4;
pub const SIZE_ROTATION_VECTOR: usize = 3;
pub const SIZE_VECTOR3: usize = 3;
pub const SIZE_WRENCH: usize = 6;
/// Base kinematics: position, quaternion, linear and angular velocity.
pub const SIZE_KINE: usize = 13;
pub const SIZE_KINE_TANGENT: usize = 12;
pub const SIZE_GYRO_BIAS: usize = 3;
/// Relative pose (position + rotation vector) followed by the contact wrench.
pub const SIZE_CONTACT: usize = 12;
pub const SIZE_BASE: usize = SIZE_KINE + SIZE_GYRO_BIAS + SIZE_WRENCH;
pub const SIZE_BASE_TANGENT: usize = SIZE_KINE_TANGENT + SIZE_GYRO_BIAS + SIZE_WRENCH;

// --- Measurement block sizes ---
pub const SIZE_IMU_SIGNAL: usize = 6;
pub const SIZE_POSE: usize = 7;
pub const SIZE_POSE_TANGENT: usize = 6;

/// Index map of the kinetics observer state.
///
/// The state is composed of:
/// - Position (3) of the body in the world frame
/// - Orientation (4, quaternion `[x, y, z, w]`) of the body in the world frame
/// - Linear velocity (3) and angular velocity (3) in the world frame
/// - Gyrometer bias (3) in the IMU frame
/// - Unmodeled wrench (force 3 + torque 3) in the body frame
/// - One slot of 12 per possible contact: relative pose in the body frame
///   (position 3 + rotation vector 3) and wrench in the contact frame
///   (force 3 + torque 3)
///
/// Contact `i` always owns slot `i`, so adding or removing a contact never
/// moves another one. The tangent layout is the same with the quaternion
/// replaced by a 3-vector, which shifts every later index by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    max_contacts: usize,
}

impl StateLayout {
    pub fn new(max_contacts: usize) -> Self {
        Self { max_contacts }
    }

    pub fn max_contacts(&self) -> usize {
        self.max_contacts
    }

    pub fn size(&self) -> usize {
        SIZE_BASE + SIZE_CONTACT * self.max_contacts
    }

    pub fn tangent_size(&self) -> usize {
        SIZE_BASE_TANGENT + SIZE_CONTACT * self.max_contacts
    }

    // --- Base kinematics --- indices 0-12 (tangent 0-11)
    pub fn kine(&self) -> usize {
        0
    }
    pub fn position(&self) -> usize {
        0
    }
    pub fn orientation(&self) -> usize {
        SIZE_POSITION
    }
    pub fn linear_velocity(&self) -> usize {
        SIZE_POSITION + SIZE_QUATERNION
    }
    pub fn angular_velocity(&self) -> usize {
        self.linear_velocity() + SIZE_VECTOR3
    }

    pub fn position_tangent(&self) -> usize {
        0
    }
    pub fn orientation_tangent(&self) -> usize {
        SIZE_POSITION
    }
    pub fn linear_velocity_tangent(&self) -> usize {
        SIZE_POSITION + SIZE_ROTATION_VECTOR
    }
    pub fn angular_velocity_tangent(&self) -> usize {
        self.linear_velocity_tangent() + SIZE_VECTOR3
    }

    // --- Gyrometer bias --- indices 13-15 (tangent 12-14)
    pub fn gyro_bias(&self) -> usize {
        SIZE_KINE
    }
    pub fn gyro_bias_tangent(&self) -> usize {
        SIZE_KINE_TANGENT
    }

    // --- Unmodeled wrench --- indices 16-21 (tangent 15-20)
    pub fn unmodeled_wrench(&self) -> usize {
        SIZE_KINE + SIZE_GYRO_BIAS
    }
    pub fn unmodeled_torque(&self) -> usize {
        self.unmodeled_wrench() + 3
    }
    pub fn unmodeled_wrench_tangent(&self) -> usize {
        SIZE_KINE_TANGENT + SIZE_GYRO_BIAS
    }

    // --- Contacts --- from index 22 (tangent 21)
    pub fn contact(&self, id: ContactId) -> usize {
        SIZE_BASE + SIZE_CONTACT * id
    }
    pub fn contact_position(&self, id: ContactId) -> usize {
        self.contact(id)
    }
    pub fn contact_orientation(&self, id: ContactId) -> usize {
        self.contact(id) + 3
    }
    pub fn contact_force(&self, id: ContactId) -> usize {
        self.contact(id) + 6
    }
    pub fn contact_torque(&self, id: ContactId) -> usize {
        self.contact(id) + 9
    }
    pub fn contact_tangent(&self, id: ContactId) -> usize {
        SIZE_BASE_TANGENT + SIZE_CONTACT * id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let layout = StateLayout::new(4);
        assert_eq!(SIZE_BASE, 22);
        assert_eq!(SIZE_BASE_TANGENT, 21);
        assert_eq!(layout.size(), 70);
        assert_eq!(layout.tangent_size(), 69);
        assert_eq!(layout.angular_velocity(), 10);
        assert_eq!(layout.angular_velocity_tangent(), 9);
    }

    #[test]
    fn test_blocks_are_contiguous() {
        let layout = StateLayout::new(2);
        assert_eq!(layout.orientation() + SIZE_QUATERNION, layout.linear_velocity());
        assert_eq!(layout.angular_velocity() + 3, layout.gyro_bias());
        assert_eq!(layout.unmodeled_wrench() + SIZE_WRENCH, layout.contact(0));
        assert_eq!(layout.contact(1) + SIZE_CONTACT, layout.size());
        assert_eq!(layout.contact_torque(1) + 3, layout.size());

        assert_eq!(layout.angular_velocity_tangent() + 3, layout.gyro_bias_tangent());
        assert_eq!(layout.unmodeled_wrench_tangent() + SIZE_WRENCH, layout.contact_tangent(0));
        assert_eq!(layout.contact_tangent(1) + SIZE_CONTACT, layout.tangent_size());
    }
}
