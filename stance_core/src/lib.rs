// stance_core/src/lib.rs

// Public modules of the kinetics observer library.
pub mod config;
pub mod error;
pub mod estimation;
pub mod kinematics;
pub mod models;
pub mod prelude;
pub mod types;
