//! Wire encoding and resynchronising decode of host link frames.

use crate::error::{DecodeError, ProtocolError};
use crate::frame::{
    checksum, header_bytes, Frame, FrameType, CRC_SIZE, HEADER_SIZE, MAX_PAYLOAD, MIN_FRAME_SIZE,
    OFFSET_CMD, OFFSET_DATA, OFFSET_LEN, OFFSET_SEQ, OFFSET_TYPE, OFFSET_VER, SYNC1, SYNC2,
};
use tracing::{debug, warn};

/// Result of one decode attempt at the head of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, checksummed frame occupying `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds a frame prefix; keep it and read more.
    NeedMoreData,
    /// `skipped` bytes of noise precede the next possible sync pair.
    Resync { skipped: usize },
    /// A candidate frame was structurally invalid; drop `consumed` bytes.
    Rejected { error: DecodeError, consumed: usize },
}

/// Serialise a frame.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    encode_parts(
        frame.version,
        frame.frame_type,
        frame.seq,
        frame.command,
        &frame.payload,
    )
}

/// Serialise header fields and a payload; the CRC covers `VER..payload`.
pub fn encode_parts(
    version: u8,
    frame_type: FrameType,
    seq: u8,
    command: u16,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let len = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());
    out.extend_from_slice(&[SYNC1, SYNC2]);
    out.extend_from_slice(&header_bytes(version, frame_type.to_byte(), seq, command, len));
    out.extend_from_slice(payload);
    let crc = checksum(version, frame_type.to_byte(), seq, command, payload);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Decode the frame at the head of `buf`, enforcing the CRC.
pub fn decode(buf: &[u8]) -> Decoded {
    decode_with(buf, MAX_PAYLOAD, true)
}

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w[0] == SYNC1 && w[1] == SYNC2)
}

fn declared_len(buf: &[u8]) -> usize {
    usize::from(u16::from_be_bytes([buf[OFFSET_LEN], buf[OFFSET_LEN + 1]]))
}

/// Whether `buf` starts with a whole frame whose CRC checks out.
fn is_complete_frame(buf: &[u8], max_payload: usize) -> bool {
    if buf.len() < MIN_FRAME_SIZE || FrameType::try_from(buf[OFFSET_TYPE]).is_err() {
        return false;
    }
    let len = declared_len(buf);
    if len > max_payload || buf.len() < HEADER_SIZE + len + CRC_SIZE {
        return false;
    }
    let command = u16::from_be_bytes([buf[OFFSET_CMD], buf[OFFSET_CMD + 1]]);
    let carried = u16::from_be_bytes([buf[OFFSET_DATA + len], buf[OFFSET_DATA + len + 1]]);
    carried
        == checksum(
            buf[OFFSET_VER],
            buf[OFFSET_TYPE],
            buf[OFFSET_SEQ],
            command,
            &buf[OFFSET_DATA..OFFSET_DATA + len],
        )
}

/// Offset of the first complete frame after the sync pair at the head of `buf`.
fn later_frame(buf: &[u8], max_payload: usize) -> Option<usize> {
    (2..buf.len().saturating_sub(1))
        .filter(|&i| buf[i] == SYNC1 && buf[i + 1] == SYNC2)
        .find(|&i| is_complete_frame(&buf[i..], max_payload))
}

pub(crate) fn decode_with(buf: &[u8], max_payload: usize, verify_crc: bool) -> Decoded {
    match find_sync(buf) {
        Some(0) => {}
        Some(offset) => return Decoded::Resync { skipped: offset },
        None => {
            // A trailing SYNC1 may be the first half of the next frame.
            let keep = usize::from(buf.last() == Some(&SYNC1));
            let skipped = buf.len() - keep;
            return if skipped == 0 {
                Decoded::NeedMoreData
            } else {
                Decoded::Resync { skipped }
            };
        }
    }

    if buf.len() < HEADER_SIZE {
        return Decoded::NeedMoreData;
    }
    let type_byte = buf[OFFSET_TYPE];
    let frame_type = match FrameType::try_from(type_byte) {
        Ok(t) => t,
        Err(raw) => {
            return Decoded::Rejected {
                error: DecodeError::InvalidType(raw),
                consumed: 2,
            }
        }
    };
    let len = declared_len(buf);
    if len > max_payload {
        return Decoded::Rejected {
            error: DecodeError::LengthExceeded(len),
            consumed: 2,
        };
    }
    let total = HEADER_SIZE + len + CRC_SIZE;
    if buf.len() < total {
        // A header read out of noise must not hold back a real frame behind it.
        return match later_frame(buf, max_payload) {
            Some(at) => Decoded::Rejected {
                error: DecodeError::Interrupted,
                consumed: at,
            },
            None => Decoded::NeedMoreData,
        };
    }

    let version = buf[OFFSET_VER];
    let seq = buf[OFFSET_SEQ];
    let command = u16::from_be_bytes([buf[OFFSET_CMD], buf[OFFSET_CMD + 1]]);
    let payload = &buf[OFFSET_DATA..OFFSET_DATA + len];
    let carried = u16::from_be_bytes([buf[OFFSET_DATA + len], buf[OFFSET_DATA + len + 1]]);
    let computed = checksum(version, type_byte, seq, command, payload);

    if carried != computed {
        if verify_crc {
            // Only the sync pair is dropped: a false sync inside noise must not swallow
            // a real frame that starts within the bogus length.
            return Decoded::Rejected {
                error: DecodeError::CrcMismatch { carried, computed },
                consumed: 2,
            };
        }
        warn!(
            command = format_args!("0x{command:04X}"),
            carried, computed, "accepting frame despite crc mismatch"
        );
    }

    Decoded::Frame {
        frame: Frame {
            version,
            frame_type,
            seq,
            command,
            payload: payload.to_vec(),
            crc: carried,
        },
        consumed: total,
    }
}

/// Something the streaming decoder produced.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeEvent {
    Frame(Frame),
    Discarded { bytes: usize, reason: DecodeError },
}

/// Accumulating decoder for a byte stream that may lose or corrupt bytes.
///
/// Each call to [`FrameDecoder::next_event`] either yields nothing (more bytes needed)
/// or consumes at least one byte, so a corrupted stream can never wedge it.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
    verify_crc: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_payload: MAX_PAYLOAD,
            verify_crc: true,
        }
    }

    /// Reject headers that declare more than `max_payload` bytes without waiting for them.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(MAX_PAYLOAD);
        self
    }

    /// Accept frames whose CRC does not match (logged at warn level).
    pub fn lenient_crc(mut self, lenient: bool) -> Self {
        self.verify_crc = !lenient;
        self
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drop everything buffered, keeping the limits.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        let (event, consumed) = match decode_with(&self.buf, self.max_payload, self.verify_crc) {
            Decoded::NeedMoreData => return None,
            Decoded::Frame { frame, consumed } => (DecodeEvent::Frame(frame), consumed),
            Decoded::Resync { skipped } => (
                DecodeEvent::Discarded {
                    bytes: skipped,
                    reason: DecodeError::NoSync,
                },
                skipped,
            ),
            Decoded::Rejected { error, consumed } => (
                DecodeEvent::Discarded {
                    bytes: consumed,
                    reason: error,
                },
                consumed,
            ),
        };
        self.buf.drain(..consumed);
        if let DecodeEvent::Discarded { bytes, reason } = &event {
            debug!(bytes, %reason, "discarded link bytes");
        }
        Some(event)
    }
}
