// stance_core/src/kinematics/mod.rs

//! Rigid-body kinematics on the rotation manifold.

pub mod kine;
pub mod orientation;
pub mod rotation;

pub use kine::{Flags, Kinematics};
pub use orientation::Orientation;
pub use rotation::{
    left_jacobian, quaternion_to_rotation_vector, regulate_rotation_vector, right_jacobian,
    rotation_vector_to_quaternion, skew_symmetric, skew_symmetric2,
};
