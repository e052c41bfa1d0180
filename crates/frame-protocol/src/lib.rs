//! Framed command protocol between a host computer and the controller.
//!
//! Frames are `AA 55 | VER TYPE SEQ CMD LEN | DATA | CRC16` with a CRC-16/MODBUS over
//! everything between the sync pair and the checksum. The [`Router`] dispatches requests to
//! registered [`CommandHandler`]s; [`Link`] runs it over any async byte stream and
//! [`LinkClient`] is the matching requester.

pub mod client;
pub mod codec;
pub mod commands;
pub mod crc;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod link;
pub mod seq;

pub use client::{ClientTasks, LinkClient, DEFAULT_REPLY_MAX_PAYLOAD};
pub use codec::{decode, encode, encode_parts, DecodeEvent, Decoded, FrameDecoder};
pub use commands::CommandGroup;
pub use crc::{crc16_modbus, Crc16};
pub use dispatch::{
    CommandHandler, DeferredReply, HandlerResult, PassthroughSink, Request, Router, StatusProvider,
};
pub use error::{DecodeError, LinkError, ProtocolError, Result};
pub use frame::{be, ErrorCode, Frame, FrameType, MAX_PAYLOAD, MIN_FRAME_SIZE, PROTOCOL_VERSION};
pub use link::{Link, LinkStats, ReplySink, DEFAULT_MAX_PAYLOAD};
pub use seq::SequenceCorrelator;
