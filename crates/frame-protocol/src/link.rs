//! Async host link: reads frames off a byte stream, routes requests and writes replies.

use crate::codec::{encode, DecodeEvent, FrameDecoder};
use crate::dispatch::Router;
use crate::error::{LinkError, Result};
use crate::frame::{ErrorCode, Frame, FrameType};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound path for replies produced outside the dispatch loop.
///
/// Deferred handlers and notifying collaborators hold clones of this.
#[derive(Clone, Debug)]
pub struct ReplySink {
    tx: mpsc::Sender<Frame>,
}

impl ReplySink {
    /// A sink and the receiving end a writer drains.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    pub async fn send_response(&self, seq: u8, command: u16, payload: Vec<u8>) -> Result<()> {
        self.send(Frame::response(seq, command, payload)?).await
    }

    pub async fn send_nack(&self, seq: u8, command: u16, code: ErrorCode) -> Result<()> {
        self.send(Frame::nack(seq, command, code)).await
    }

    pub async fn send_ack(&self, seq: u8, command: u16) -> Result<()> {
        self.send(Frame::ack(seq, command)).await
    }

    /// Push an unsolicited NOTIFY (sequence 0).
    pub async fn notify(&self, command: u16, payload: Vec<u8>) -> Result<()> {
        self.send(Frame::notify(command, payload)?).await
    }

    /// Non-blocking notify for callers outside an async context.
    pub fn try_notify(&self, command: u16, payload: Vec<u8>) -> Result<()> {
        self.tx
            .try_send(Frame::notify(command, payload)?)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LinkError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
            })
    }
}

/// Largest request payload a [`Link`] accepts unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

/// Counters for one `serve` run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub requests: u64,
    pub nacks_out: u64,
    pub bytes_discarded: u64,
}

pub struct Link {
    router: Arc<Router>,
    sink: ReplySink,
    outbound: mpsc::Receiver<Frame>,
    decoder: FrameDecoder,
    stats: LinkStats,
}

impl Link {
    pub fn new(router: Router, queue_depth: usize) -> Self {
        let (sink, outbound) = ReplySink::channel(queue_depth);
        Self {
            router: Arc::new(router),
            sink,
            outbound,
            decoder: FrameDecoder::new().with_max_payload(DEFAULT_MAX_PAYLOAD),
            stats: LinkStats::default(),
        }
    }

    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Reject incoming frames that declare more than `max_payload` bytes.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.decoder = std::mem::take(&mut self.decoder).with_max_payload(max_payload);
        self
    }

    /// Forget the previous peer: partial input and frames still queued for it are dropped.
    ///
    /// Returns how many queued frames were discarded.
    pub fn reset(&mut self) -> usize {
        self.decoder.clear();
        let mut stale = 0;
        while self.outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped frames queued for the previous peer");
        }
        stale
    }

    /// Sink for deferred replies and notifications on this link.
    pub fn replies(&self) -> ReplySink {
        self.sink.clone()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Run until the reader reaches end of stream.
    ///
    /// Requests are handled one at a time in arrival order. Frames queued through the
    /// [`ReplySink`] are interleaved with immediate replies as they become ready.
    pub async fn serve<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<LinkStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 1024];
        self.stats = LinkStats::default();
        info!("host link up");
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    self.decoder.extend(&buf[..n]);
                    while let Some(event) = self.decoder.next_event() {
                        match event {
                            DecodeEvent::Frame(frame) => {
                                self.stats.frames_in += 1;
                                if frame.frame_type == FrameType::Request {
                                    self.stats.requests += 1;
                                }
                                debug!(seq = frame.seq, command = frame.command, kind = ?frame.frame_type, "frame in");
                                if let Some(reply) = self.router.route(&frame, &self.sink) {
                                    self.write_frame(&mut writer, &reply).await?;
                                }
                            }
                            DecodeEvent::Discarded { bytes, reason } => {
                                self.stats.bytes_discarded += bytes as u64;
                                if !matches!(reason, crate::error::DecodeError::NoSync) {
                                    warn!(bytes, %reason, "dropped malformed frame");
                                }
                            }
                        }
                    }
                }
                Some(frame) = self.outbound.recv() => {
                    self.write_frame(&mut writer, &frame).await?;
                }
            }
        }
        // Flush anything deferred work queued before the peer went away.
        while let Ok(frame) = self.outbound.try_recv() {
            if let Err(e) = self.write_frame(&mut writer, &frame).await {
                debug!(error = %e, "could not flush queued frame");
                break;
            }
        }
        info!(stats = ?self.stats, "host link closed");
        Ok(self.stats)
    }

    async fn write_frame<W>(&mut self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        self.stats.frames_out += 1;
        if frame.frame_type == FrameType::Nack {
            self.stats.nacks_out += 1;
        }
        debug!(seq = frame.seq, command = frame.command, kind = ?frame.frame_type, "frame out");
        Ok(())
    }
}
