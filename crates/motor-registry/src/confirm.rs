//! Turns fire-and-forget CAN transmissions into timeout-bounded calls.

use crate::driver::CanHandle;
use crate::error::{MotorError, Result};
use crate::metrics::MotorMetrics;
use crate::registry::{Motor, MotorRegistry};
use crate::types::MotorsConfig;
use can_transport::CanFrame;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            poll: Duration::from_millis(10),
        }
    }
}

impl From<&MotorsConfig> for ConfirmPolicy {
    fn from(cfg: &MotorsConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.confirm_timeout_ms),
            poll: Duration::from_millis(cfg.poll_interval_ms),
        }
    }
}

/// Sends on behalf of a motor and waits for that motor to answer.
///
/// "Answered" means the motor's response counter moved past the value it had before the
/// send. Frames from other motors never satisfy the wait.
#[derive(Clone)]
pub struct Confirmer {
    registry: Arc<MotorRegistry>,
    can: CanHandle,
    policy: ConfirmPolicy,
    metrics: Option<MotorMetrics>,
}

impl Confirmer {
    pub fn new(registry: Arc<MotorRegistry>, can: CanHandle, policy: ConfirmPolicy) -> Self {
        Self {
            registry,
            can,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MotorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> ConfirmPolicy {
        self.policy
    }

    pub fn can(&self) -> &CanHandle {
        &self.can
    }

    /// Snapshot the counter, run `send`, then poll until the counter rises.
    ///
    /// A failing `send` returns at once without waiting.
    pub async fn confirm<F, Fut>(&self, can_id: u8, send: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let before = self.registry.response_counter(can_id)?;
        send().await?;
        self.wait_until(can_id, |m| m.response_counter > before).await
    }

    pub async fn send_and_wait(&self, can_id: u8, frame: CanFrame) -> Result<()> {
        let can = self.can.clone();
        self.confirm(can_id, || async move { can.send(frame).await }).await
    }

    /// Poll the motor until `done` holds or the policy timeout passes.
    pub async fn wait_until(&self, can_id: u8, done: impl Fn(&Motor) -> bool) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        loop {
            if self.registry.with_motor(can_id, |m| done(m))? {
                trace!(can_id, elapsed_ms = started.elapsed().as_millis() as u64, "confirmed");
                if let Some(m) = &self.metrics {
                    m.confirm_ok.inc();
                }
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let missed = self.registry.with_motor(can_id, |m| {
                    m.missed += 1;
                    m.missed
                })?;
                if let Some(m) = &self.metrics {
                    m.confirm_timeouts.inc();
                }
                warn!(can_id, missed, timeout_ms = self.policy.timeout.as_millis() as u64, "no reply from motor");
                return Err(MotorError::Timeout(can_id));
            }
            tokio::time::sleep(self.policy.poll.min(deadline - now)).await;
        }
    }
}
