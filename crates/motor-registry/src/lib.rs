//! Servo motor subsystem on a CAN bus.
//!
//! Motors speak a DM-style protocol: control frames on `mode base + id`, register traffic on
//! `0x7FF`, and an 8-byte feedback frame in reply to everything. The [`MotorRegistry`] holds
//! the latest state of each motor, a [`CanDriver`] thread owns the bus, and the [`Confirmer`]
//! turns a transmission into a call that succeeds only once the addressed motor answers.

pub mod confirm;
pub mod controller;
pub mod driver;
pub mod error;
pub mod liveness;
pub mod loader;
pub mod metrics;
pub mod protocol;
pub mod quant;
pub mod registers;
pub mod registry;
pub mod sim;
pub mod types;

pub use confirm::{ConfirmPolicy, Confirmer};
pub use controller::MotorController;
pub use driver::{CanDriver, CanHandle, DriverOptions};
pub use error::{MotorError, Result};
pub use liveness::{LivenessMonitor, LivenessPolicy, StateChange};
pub use loader::{load_motors_file, parse_motors_config, validate};
pub use metrics::{MetricsHub, MotorMetrics};
pub use protocol::{ControlMode, Limits, MitCommand, MotorOp};
pub use registers::{RegisterDescriptor, RegisterValue, ValueType};
pub use registry::{BusyGuard, Ingested, Motor, MotorRegistry};
pub use sim::ServoSim;
pub use types::{MotorConfig, MotorsConfig};
