use crate::types::{MotorConfig, MotorsConfig};
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

pub fn parse_motors_config(raw: &str) -> anyhow::Result<MotorsConfig> {
    let cfg: MotorsConfig = serde_yaml::from_str(raw).context("decoding motors section")?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn load_motors_file(path: impl AsRef<Path>) -> anyhow::Result<MotorsConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading motor config: {}", path.display()))?;
    parse_motors_config(&raw).with_context(|| format!("loading {}", path.display()))
}

pub fn validate(cfg: &MotorsConfig) -> anyhow::Result<()> {
    anyhow::ensure!(cfg.poll_interval_ms > 0, "poll_interval_ms must be positive");
    anyhow::ensure!(
        cfg.confirm_timeout_ms >= cfg.poll_interval_ms,
        "confirm_timeout_ms ({}) is shorter than poll_interval_ms ({})",
        cfg.confirm_timeout_ms,
        cfg.poll_interval_ms
    );
    let mut seen = HashSet::new();
    let mut nibbles = HashMap::new();
    for dev in &cfg.devices {
        anyhow::ensure!(seen.insert(dev.can_id), "motor {} listed twice", dev.can_id);
        if let Some(other) = nibbles.insert(dev.can_id & 0x0F, dev.can_id) {
            anyhow::bail!(
                "motors {other} and {} share feedback id {}; feedback carries only 4 id bits",
                dev.can_id,
                dev.can_id & 0x0F
            );
        }
        check_device(dev)?;
    }
    Ok(())
}

fn check_device(dev: &MotorConfig) -> anyhow::Result<()> {
    for (name, value) in [("pmax", dev.pmax), ("vmax", dev.vmax), ("tmax", dev.tmax)] {
        anyhow::ensure!(
            value.is_finite() && value > 0.0,
            "motor {}: {name} must be a positive number",
            dev.can_id
        );
    }
    Ok(())
}
