use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct MotorMetrics {
    pub tx_frames: IntCounter,
    pub tx_errors: IntCounter,
    pub rx_frames: IntCounter,
    pub confirm_ok: IntCounter,
    pub confirm_timeouts: IntCounter,
    pub motors_registered: IntGauge,
    pub motors_online: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub motors: MotorMetrics,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::new(name, help)
}

impl MetricsHub {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let motors = MotorMetrics {
            tx_frames: counter("mc_can_tx_frames", "Total CAN frames sent")?,
            tx_errors: counter("mc_can_tx_errors", "CAN transmissions refused by the bus")?,
            rx_frames: counter("mc_can_rx_frames", "Total CAN frames received")?,
            confirm_ok: counter("mc_motor_confirm_ok", "Motor commands confirmed by a reply")?,
            confirm_timeouts: counter(
                "mc_motor_confirm_timeouts",
                "Motor commands with no reply before the timeout",
            )?,
            motors_registered: IntGauge::new("mc_motors_registered", "Motors in the registry")?,
            motors_online: IntGauge::new("mc_motors_online", "Motors currently considered online")?,
        };
        registry.register(Box::new(motors.tx_frames.clone()))?;
        registry.register(Box::new(motors.tx_errors.clone()))?;
        registry.register(Box::new(motors.rx_frames.clone()))?;
        registry.register(Box::new(motors.confirm_ok.clone()))?;
        registry.register(Box::new(motors.confirm_timeouts.clone()))?;
        registry.register(Box::new(motors.motors_registered.clone()))?;
        registry.register(Box::new(motors.motors_online.clone()))?;
        Ok(Self { registry, motors })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_exposition_lists_counters() -> prometheus::Result<()> {
        let hub = MetricsHub::new()?;
        hub.motors.tx_frames.inc_by(3);
        hub.motors.motors_online.set(2);
        let text = hub.encode_text();
        assert!(text.contains("mc_can_tx_frames 3"));
        assert!(text.contains("mc_motors_online 2"));
        assert!(text.contains("# HELP mc_motor_confirm_timeouts"));
        Ok(())
    }
}
