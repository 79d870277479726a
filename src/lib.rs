//! Indirect (error-state) extended Kalman filter for a 9-axis sensor
//! coprocessor: fuses accelerometer, magnetometer and gyroscope samples into
//! an orientation quaternion and gyro bias estimate.
//!
//! `no_std`, allocation-free, built for deployment on the same kind of
//! resource-constrained coprocessor as the timing/scheduling/driver layers
//! it is meant to sit next to (those layers are out of scope for this
//! crate: see the module docs for [`Fusion`]).

#![cfg_attr(not(test), no_std)]

mod bootstrap;
mod error;
mod fusion;
mod linalg;
mod mode;

pub use error::{RejectReason, SampleOutcome};
pub use fusion::Fusion;
pub use linalg::{Mat33, Quaternion, Vec3};
pub use mode::{FusionMode, Parameters};
