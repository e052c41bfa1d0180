//! Classic CAN frames and the buses that carry them.
//!
//! [`CanBus`] is a blocking interface meant to be owned by one I/O thread. [`MockBus`]
//! (feature `mock`, on by default) loops transmissions back through a scripted responder so
//! servo code runs without hardware; [`SlcanBus`] (feature `slcan`) talks to a USB-serial
//! adapter using the Lawicel text protocol.

mod error;
mod traits;
mod types;

pub use error::{Result, TransportError};
pub use traits::CanBus;
pub use types::{BusInfo, CanFilter, CanFrame, CanId, Timestamp, MAX_STANDARD_ID};

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::{MockBus, MockHandle};

#[cfg(feature = "slcan")]
mod slcan;
#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus};
