use crate::crc::Crc16;
use crate::error::ProtocolError;
use core::fmt;

pub const SYNC1: u8 = 0xAA;
pub const SYNC2: u8 = 0x55;
/// Protocol V1.0
pub const PROTOCOL_VERSION: u8 = 0x10;

/// SYNC(2) VER TYPE SEQ CMD(2) LEN(2)
pub const HEADER_SIZE: usize = 9;
pub const CRC_SIZE: usize = 2;
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CRC_SIZE;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

pub(crate) const OFFSET_VER: usize = 2;
pub(crate) const OFFSET_TYPE: usize = 3;
pub(crate) const OFFSET_SEQ: usize = 4;
pub(crate) const OFFSET_CMD: usize = 5;
pub(crate) const OFFSET_LEN: usize = 7;
pub(crate) const OFFSET_DATA: usize = 9;

const PASSTHROUGH_MIN: u8 = 0x80;
const PASSTHROUGH_MAX: u8 = 0xEF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Response,
    Notify,
    Ack,
    Nack,
    /// RS485 transparent channel, raw type byte in 0x80..=0xEF.
    Passthrough(u8),
}

impl FrameType {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Request => 0x00,
            FrameType::Response => 0x01,
            FrameType::Notify => 0x02,
            FrameType::Ack => 0x03,
            FrameType::Nack => 0x04,
            FrameType::Passthrough(t) => t,
        }
    }

    /// Whether this frame answers an earlier request.
    pub fn is_reply(self) -> bool {
        matches!(self, FrameType::Response | FrameType::Ack | FrameType::Nack)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        match b {
            0x00 => Ok(FrameType::Request),
            0x01 => Ok(FrameType::Response),
            0x02 => Ok(FrameType::Notify),
            0x03 => Ok(FrameType::Ack),
            0x04 => Ok(FrameType::Nack),
            PASSTHROUGH_MIN..=PASSTHROUGH_MAX => Ok(FrameType::Passthrough(b)),
            other => Err(other),
        }
    }
}

/// NACK error codes carried as the single payload byte of a NACK frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownCommand = 0x01,
    InvalidParam = 0x02,
    DeviceBusy = 0x03,
    NotReady = 0x04,
    ExecFailed = 0x05,
    Timeout = 0x06,
    CrcError = 0x07,
    VersionUnsupported = 0x08,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0x01 => ErrorCode::UnknownCommand,
            0x02 => ErrorCode::InvalidParam,
            0x03 => ErrorCode::DeviceBusy,
            0x04 => ErrorCode::NotReady,
            0x05 => ErrorCode::ExecFailed,
            0x06 => ErrorCode::Timeout,
            0x07 => ErrorCode::CrcError,
            0x08 => ErrorCode::VersionUnsupported,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::UnknownCommand => "unknown command",
            ErrorCode::InvalidParam => "invalid parameter",
            ErrorCode::DeviceBusy => "device busy",
            ErrorCode::NotReady => "not ready",
            ErrorCode::ExecFailed => "execution failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CrcError => "crc error",
            ErrorCode::VersionUnsupported => "version unsupported",
        };
        write!(f, "{name} (0x{:02X})", self.as_u8())
    }
}

/// One logical protocol message.
///
/// `crc` always holds the CRC-16/MODBUS of `version..payload` as it would appear on the
/// wire, so a decoded frame compares equal to the frame it was encoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub seq: u8,
    pub command: u16,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl Frame {
    pub fn new(
        frame_type: FrameType,
        seq: u8,
        command: u16,
        payload: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        Self::with_version(PROTOCOL_VERSION, frame_type, seq, command, payload)
    }

    pub fn with_version(
        version: u8,
        frame_type: FrameType,
        seq: u8,
        command: u16,
        payload: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self::assemble(version, frame_type, seq, command, payload))
    }

    pub fn request(seq: u8, command: u16, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::new(FrameType::Request, seq, command, payload)
    }

    pub fn response(seq: u8, command: u16, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::new(FrameType::Response, seq, command, payload)
    }

    /// Unsolicited push; always sequence 0.
    pub fn notify(command: u16, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::new(FrameType::Notify, 0, command, payload)
    }

    pub fn ack(seq: u8, command: u16) -> Self {
        Self::assemble(PROTOCOL_VERSION, FrameType::Ack, seq, command, Vec::new())
    }

    pub fn nack(seq: u8, command: u16, code: ErrorCode) -> Self {
        Self::assemble(
            PROTOCOL_VERSION,
            FrameType::Nack,
            seq,
            command,
            vec![code.as_u8()],
        )
    }

    fn assemble(version: u8, frame_type: FrameType, seq: u8, command: u16, payload: Vec<u8>) -> Self {
        let crc = checksum(version, frame_type.to_byte(), seq, command, &payload);
        Self {
            version,
            frame_type,
            seq,
            command,
            payload,
            crc,
        }
    }

    /// Error code of a NACK frame, if it carries a known one.
    pub fn nack_code(&self) -> Option<ErrorCode> {
        match (self.frame_type, self.payload.first()) {
            (FrameType::Nack, Some(&b)) => ErrorCode::try_from(b).ok(),
            _ => None,
        }
    }

    /// High byte of the command code.
    pub fn group(&self) -> u8 {
        (self.command >> 8) as u8
    }

    pub fn wire_len(&self) -> usize {
        MIN_FRAME_SIZE + self.payload.len()
    }
}

pub(crate) fn header_bytes(version: u8, frame_type: u8, seq: u8, command: u16, len: u16) -> [u8; 7] {
    let [cmd_hi, cmd_lo] = command.to_be_bytes();
    let [len_hi, len_lo] = len.to_be_bytes();
    [version, frame_type, seq, cmd_hi, cmd_lo, len_hi, len_lo]
}

pub(crate) fn checksum(version: u8, frame_type: u8, seq: u8, command: u16, payload: &[u8]) -> u16 {
    let header = header_bytes(version, frame_type, seq, command, payload.len() as u16);
    Crc16::new().update(&header).update(payload).finish()
}

/// Big-endian field helpers for command payloads.
pub mod be {
    pub fn f32_at(buf: &[u8], offset: usize) -> Option<f32> {
        let bytes = buf.get(offset..offset + 4)?;
        Some(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
        let bytes = buf.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
        let bytes = buf.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn put_f32(out: &mut Vec<u8>, value: f32) {
        out.extend_from_slice(&value.to_be_bytes());
    }
}
