use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no CAN interface at {0}")]
    NotFound(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("bus I/O: {0}")]
    Io(String),
    #[error("receive timed out")]
    Timeout,
    #[error("malformed frame: {0}")]
    InvalidFrame(&'static str),
    /// The adapter rejected the last command (SLCAN answers with BEL).
    #[error("adapter reported an error")]
    AdapterError,
    #[error("bus state lock poisoned")]
    Poisoned,
}

impl TransportError {
    /// Timeouts are the idle case of a polling receive, not a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
