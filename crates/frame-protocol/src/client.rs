//! Requester side of a host link.

use crate::codec::{encode, DecodeEvent, FrameDecoder};
use crate::error::{LinkError, Result};
use crate::frame::{Frame, FrameType};
use crate::seq::SequenceCorrelator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest reply payload a [`LinkClient`] accepts by default; metrics text is the biggest.
pub const DEFAULT_REPLY_MAX_PAYLOAD: usize = 16 * 1024;

const NOTIFY_DEPTH: usize = 64;

/// Issues requests over a link and matches replies by sequence number.
///
/// Any number of requests may be in flight; replies are accepted in whatever order the
/// peer produces them.
#[derive(Clone)]
pub struct LinkClient {
    correlator: Arc<Mutex<SequenceCorrelator>>,
    out: mpsc::Sender<Vec<u8>>,
    notes_dropped: Arc<AtomicU64>,
}

/// Background tasks owned by a [`LinkClient`].
pub struct ClientTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl ClientTasks {
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl LinkClient {
    /// Start reader and writer tasks on the given stream halves.
    ///
    /// NOTIFY frames from the peer are delivered on the returned receiver. When it is not
    /// drained, further notifications are dropped rather than delaying replies.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Frame>, ClientTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_max_payload(reader, writer, DEFAULT_REPLY_MAX_PAYLOAD)
    }

    /// [`LinkClient::spawn`] with a custom limit on incoming payload size.
    pub fn spawn_with_max_payload<R, W>(
        reader: R,
        writer: W,
        max_payload: usize,
    ) -> (Self, mpsc::Receiver<Frame>, ClientTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let correlator = Arc::new(Mutex::new(SequenceCorrelator::new()));
        let notes_dropped = Arc::new(AtomicU64::new(0));
        let (out_tx, out_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_DEPTH);
        let inbound = Inbound {
            decoder: FrameDecoder::new().with_max_payload(max_payload),
            correlator: Arc::clone(&correlator),
            notify: notify_tx,
            notes_dropped: Arc::clone(&notes_dropped),
        };
        let tasks = ClientTasks {
            reader: tokio::spawn(read_loop(reader, inbound)),
            writer: tokio::spawn(write_loop(writer, out_rx)),
        };
        (
            Self {
                correlator,
                out: out_tx,
                notes_dropped,
            },
            notify_rx,
            tasks,
        )
    }

    /// Send a REQUEST and wait for its RESPONSE, ACK or NACK.
    pub async fn request(&self, command: u16, payload: Vec<u8>, timeout: Duration) -> Result<Frame> {
        let (seq, reply) = self.correlator.lock().register()?;
        let bytes = match Frame::request(seq, command, payload).and_then(|f| encode(&f)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.correlator.lock().cancel(seq);
                return Err(e.into());
            }
        };
        if self.out.send(bytes).await.is_err() {
            self.correlator.lock().cancel(seq);
            return Err(LinkError::Closed);
        }
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.correlator.lock().cancel(seq);
                debug!(seq, command, "request timed out");
                Err(LinkError::Timeout)
            }
        }
    }

    /// Like [`LinkClient::request`] but turns a NACK into [`LinkError::Nack`].
    pub async fn call(&self, command: u16, payload: Vec<u8>, timeout: Duration) -> Result<Frame> {
        let reply = self.request(command, payload, timeout).await?;
        match reply.frame_type {
            FrameType::Nack => match reply.nack_code() {
                Some(code) => Err(LinkError::Nack(code)),
                None => Err(LinkError::Closed),
            },
            _ => Ok(reply),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.correlator.lock().outstanding()
    }

    /// Notifications discarded because the receiver was full.
    pub fn notifications_dropped(&self) -> u64 {
        self.notes_dropped.load(Ordering::Relaxed)
    }
}

struct Inbound {
    decoder: FrameDecoder,
    correlator: Arc<Mutex<SequenceCorrelator>>,
    notify: mpsc::Sender<Frame>,
    notes_dropped: Arc<AtomicU64>,
}

impl Inbound {
    fn deliver(&self, frame: Frame) {
        if frame.frame_type.is_reply() {
            let stray = self.correlator.lock().resolve(frame);
            if let Some(stray) = stray {
                debug!(seq = stray.seq, "late reply dropped");
            }
            return;
        }
        if frame.frame_type != FrameType::Notify {
            return;
        }
        match self.notify.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let dropped = self.notes_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(command = frame.command, dropped, "notification queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("notification receiver gone"),
        }
    }
}

async fn read_loop<R>(mut reader: R, mut inbound: Inbound)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "client read failed");
                break;
            }
        };
        inbound.decoder.extend(&buf[..n]);
        while let Some(event) = inbound.decoder.next_event() {
            if let DecodeEvent::Frame(frame) = event {
                inbound.deliver(frame);
            }
        }
    }
    // Wake every waiter with a closed channel.
    *inbound.correlator.lock() = SequenceCorrelator::new();
}

async fn write_loop<W>(mut writer: W, mut out: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = out.recv().await {
        if let Err(e) = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await
        {
            warn!(error = %e, "client write failed");
            break;
        }
    }
}
