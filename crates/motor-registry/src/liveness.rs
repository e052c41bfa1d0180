//! Explicit online/offline tracking on top of the response counter.

use crate::metrics::MotorMetrics;
use crate::registry::MotorRegistry;
use crate::types::MotorsConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Consecutive confirmation timeouts before a motor is declared offline.
    pub offline_after_misses: u32,
    /// Silence longer than this marks a motor offline.
    pub stale_after: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            offline_after_misses: 3,
            stale_after: Duration::from_millis(1000),
        }
    }
}

impl From<&MotorsConfig> for LivenessPolicy {
    fn from(cfg: &MotorsConfig) -> Self {
        Self {
            offline_after_misses: cfg.offline_after_misses,
            stale_after: Duration::from_millis(cfg.stale_after_ms),
        }
    }
}

/// A motor whose reported online flag or status changed since the previous sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub can_id: u8,
    pub online: bool,
    pub error_code: u8,
}

impl StateChange {
    /// `[id][online][error]`
    pub fn to_bytes(self) -> [u8; 3] {
        [self.can_id, u8::from(self.online), self.error_code]
    }
}

pub struct LivenessMonitor {
    registry: Arc<MotorRegistry>,
    policy: LivenessPolicy,
    reported: HashMap<u8, (bool, u8)>,
    metrics: Option<MotorMetrics>,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<MotorRegistry>, policy: LivenessPolicy) -> Self {
        Self {
            registry,
            policy,
            reported: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MotorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> LivenessPolicy {
        self.policy
    }

    /// Motors quiet for more than half the stale window; a refresh keeps them alive.
    pub fn probe_targets(&self, now: Instant) -> Vec<u8> {
        let half = self.policy.stale_after / 2;
        self.registry
            .snapshot_all()
            .into_iter()
            .filter(|m| m.last_seen.map_or(true, |t| now.duration_since(t) >= half))
            .map(|m| m.can_id)
            .collect()
    }

    /// Re-evaluate every motor and return what changed since the last sweep.
    pub fn sweep(&mut self, now: Instant) -> Vec<StateChange> {
        let policy = self.policy;
        let mut changes = Vec::new();
        let mut online_count = 0i64;
        for can_id in self.registry.ids() {
            let state = self.registry.with_motor(can_id, |m| {
                let fresh = m
                    .last_seen
                    .is_some_and(|t| now.duration_since(t) < policy.stale_after);
                let online = fresh && m.missed < policy.offline_after_misses;
                if m.online && !online {
                    warn!(can_id, missed = m.missed, "motor offline");
                } else if !m.online && online {
                    info!(can_id, "motor online");
                }
                m.online = online;
                (online, m.error_code)
            });
            // Unregistered between `ids()` and here.
            let Ok((online, error_code)) = state else {
                self.reported.remove(&can_id);
                continue;
            };
            if online {
                online_count += 1;
            }
            let previous = self.reported.insert(can_id, (online, error_code));
            if previous.unwrap_or((false, 0)) != (online, error_code) {
                changes.push(StateChange {
                    can_id,
                    online,
                    error_code,
                });
            }
        }
        if let Some(m) = &self.metrics {
            m.motors_online.set(online_count);
            m.motors_registered.set(self.registry.len() as i64);
        }
        changes
    }
}
