use can_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = MotorError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MotorError {
    #[error("motor {0} is not registered")]
    UnknownMotor(u8),
    #[error("motor {0} is already registered")]
    AlreadyRegistered(u8),
    #[error("motor {can_id} reports feedback as id {} like motor {existing}", .can_id & 0x0F)]
    FeedbackIdClash { can_id: u8, existing: u8 },
    #[error("motor {0} did not answer within the confirmation timeout")]
    Timeout(u8),
    #[error("CAN transmit failed: {0}")]
    Transport(#[from] TransportError),
    #[error("motor {0} is not enabled")]
    NotEnabled(u8),
    #[error("motor {can_id} reports fault status 0x{status:X}")]
    Faulted { can_id: u8, status: u8 },
    #[error("motor {0} is busy with another operation")]
    Busy(u8),
    #[error("motor {can_id} is in {mode} mode, which cannot execute this command")]
    ModeMismatch { can_id: u8, mode: &'static str },
    #[error("register {0} is not in the register table")]
    UnknownRegister(u8),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("CAN driver has stopped")]
    DriverGone,
}
