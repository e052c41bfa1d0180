use crate::frame::ErrorCode;
use thiserror::Error;

pub type Result<T, E = LinkError> = core::result::Result<T, E>;

/// Misuse of the protocol API (construction and registration).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge(usize),
    #[error("command 0x{0:04X} already has a handler")]
    DuplicateCommand(u16),
    #[error("status provider '{0}' already registered")]
    DuplicateProvider(String),
}

/// Why a candidate frame was thrown away by the codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no sync pair")]
    NoSync,
    #[error("crc mismatch: frame carries 0x{carried:04X}, computed 0x{computed:04X}")]
    CrcMismatch { carried: u16, computed: u16 },
    #[error("unknown frame type 0x{0:02X}")]
    InvalidType(u8),
    #[error("declared payload of {0} bytes exceeds the receive limit")]
    LengthExceeded(usize),
    #[error("incomplete frame followed by a complete one")]
    Interrupted,
}

/// Failures on a live host link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed")]
    Closed,
    #[error("no reply within timeout")]
    Timeout,
    #[error("all 256 sequence numbers are outstanding")]
    SeqExhausted,
    #[error("outbound queue full")]
    QueueFull,
    #[error("request rejected: {0}")]
    Nack(ErrorCode),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
