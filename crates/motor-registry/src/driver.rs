//! Dedicated thread that owns the CAN bus.
//!
//! The thread alternates between draining queued transmissions and a short blocking
//! receive, feeding every received frame into the [`MotorRegistry`].

use crate::error::{MotorError, Result};
use crate::metrics::MotorMetrics;
use crate::registry::{Ingested, MotorRegistry};
use can_transport::{CanBus, CanFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

struct TxRequest {
    frame: CanFrame,
    done: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for transmitting through the driver thread.
#[derive(Clone)]
pub struct CanHandle {
    tx: mpsc::UnboundedSender<TxRequest>,
}

impl CanHandle {
    /// Queue a frame and wait until the bus accepted or refused it.
    pub async fn send(&self, frame: CanFrame) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(TxRequest { frame, done })
            .map_err(|_| MotorError::DriverGone)?;
        result.await.map_err(|_| MotorError::DriverGone)?
    }
}

pub struct DriverOptions {
    /// Upper bound on how long a queued frame waits behind a receive.
    pub recv_poll: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            recv_poll: Duration::from_millis(2),
        }
    }
}

/// Owns the I/O thread; dropping it stops the thread.
pub struct CanDriver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CanDriver {
    pub fn spawn<B>(
        bus: B,
        registry: Arc<MotorRegistry>,
        metrics: Option<MotorMetrics>,
        options: DriverOptions,
    ) -> std::io::Result<(Self, CanHandle)>
    where
        B: CanBus + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("can-io".into())
            .spawn(move || run(bus, rx, registry, metrics, options, flag))?;
        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            CanHandle { tx },
        ))
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("can-io thread panicked");
            }
        }
    }
}

impl Drop for CanDriver {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn run<B: CanBus>(
    mut bus: B,
    mut rx: mpsc::UnboundedReceiver<TxRequest>,
    registry: Arc<MotorRegistry>,
    metrics: Option<MotorMetrics>,
    options: DriverOptions,
    stop: Arc<AtomicBool>,
) {
    let poll_ms = options.recv_poll.as_millis().max(1) as u64;
    info!(poll_ms, "can-io thread started");
    while !stop.load(Ordering::Relaxed) {
        loop {
            match rx.try_recv() {
                Ok(req) => {
                    let result = bus.send(&req.frame).map_err(MotorError::from);
                    match &result {
                        Ok(()) => {
                            trace!(frame = %req.frame, "can tx");
                            if let Some(m) = &metrics {
                                m.tx_frames.inc();
                            }
                        }
                        Err(e) => {
                            warn!(frame = %req.frame, error = %e, "can transmit failed");
                            if let Some(m) = &metrics {
                                m.tx_errors.inc();
                            }
                        }
                    }
                    let _ = req.done.send(result);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("all CAN handles dropped");
                    return;
                }
            }
        }

        match bus.recv(Some(poll_ms)) {
            Ok(frame) => {
                if let Some(m) = &metrics {
                    m.rx_frames.inc();
                }
                match registry.ingest(&frame) {
                    Ingested::Unknown => debug!(frame = %frame, "frame for unregistered motor"),
                    Ingested::Ignored => trace!(frame = %frame, "frame ignored"),
                    _ => {}
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                warn!(error = %e, "can receive failed");
                std::thread::sleep(options.recv_poll);
            }
        }
    }
    info!("can-io thread stopped");
}
