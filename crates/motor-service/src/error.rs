use frame_protocol::ErrorCode;
use motor_registry::MotorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
    #[error(transparent)]
    Motor(#[from] MotorError),
}

impl ServiceError {
    /// NACK code reported to the host for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::BadPayload(_) => ErrorCode::InvalidParam,
            ServiceError::Motor(e) => motor_error_code(e),
        }
    }
}

pub fn motor_error_code(e: &MotorError) -> ErrorCode {
    match e {
        MotorError::Timeout(_) => ErrorCode::Timeout,
        MotorError::Busy(_) => ErrorCode::DeviceBusy,
        MotorError::NotEnabled(_) => ErrorCode::NotReady,
        MotorError::UnknownMotor(_)
        | MotorError::AlreadyRegistered(_)
        | MotorError::FeedbackIdClash { .. }
        | MotorError::UnknownRegister(_)
        | MotorError::InvalidValue(_)
        | MotorError::ModeMismatch { .. } => ErrorCode::InvalidParam,
        MotorError::Transport(_) | MotorError::Faulted { .. } | MotorError::DriverGone => {
            ErrorCode::ExecFailed
        }
    }
}

pub type Result<T, E = ServiceError> = core::result::Result<T, E>;
