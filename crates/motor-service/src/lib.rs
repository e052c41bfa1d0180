//! Host-link front end for the servo subsystem.
//!
//! [`MotorService::install`] adds the motor command groups to a
//! [`Router`](frame_protocol::Router); [`spawn_liveness`] pushes online/offline and fault
//! transitions to the host as NOTIFY frames.

pub mod error;
pub mod handlers;
pub mod liveness;
pub mod payload;

pub use error::{motor_error_code, Result, ServiceError};
pub use handlers::MotorService;
pub use liveness::spawn_liveness;

#[cfg(test)]
mod tests;
