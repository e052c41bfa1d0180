//! Periodic liveness sweep that pushes `MOTOR_STATE_CHANGED` notifications.

use frame_protocol::commands::MOTOR_STATE_CHANGED;
use frame_protocol::{LinkError, ReplySink};
use motor_registry::protocol::refresh_frame;
use motor_registry::{CanHandle, LivenessMonitor};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Every `interval`, probe quiet motors with a refresh and report state transitions.
///
/// The task ends when the link's outbound queue closes.
pub fn spawn_liveness(
    mut monitor: LivenessMonitor,
    can: CanHandle,
    replies: ReplySink,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for can_id in monitor.probe_targets(now) {
                if let Err(e) = can.send(refresh_frame(can_id)).await {
                    debug!(can_id, error = %e, "liveness probe not sent");
                }
            }
            for change in monitor.sweep(now) {
                trace!(?change, "motor state changed");
                match replies.notify(MOTOR_STATE_CHANGED, change.to_bytes().to_vec()).await {
                    Ok(()) => {}
                    Err(LinkError::Closed) => {
                        info!("link closed, liveness sweep stopping");
                        return;
                    }
                    Err(e) => debug!(error = %e, "state notification dropped"),
                }
            }
        }
    })
}
