use anyhow::{Context, Result};
use motor_registry::MotorsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub motors: MotorsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostTransport {
    Serial,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_transport")]
    pub transport: HostTransport,
    #[serde(default)]
    pub serial_path: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_tcp_listen")]
    pub tcp_listen: String,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Requests declaring a longer payload are discarded at the header.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_transport() -> HostTransport {
    HostTransport::Tcp
}
fn default_baud() -> u32 {
    115_200
}
fn default_tcp_listen() -> String {
    "127.0.0.1:7000".to_string()
}
fn default_queue_depth() -> usize {
    64
}
fn default_max_payload() -> usize {
    frame_protocol::DEFAULT_MAX_PAYLOAD
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            serial_path: None,
            baud: default_baud(),
            tcp_listen: default_tcp_listen(),
            queue_depth: default_queue_depth(),
            max_payload: default_max_payload(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanBackend {
    Mock,
    Slcan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default = "default_backend")]
    pub backend: CanBackend,
    /// Serial device of the SLCAN adapter.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_recv_poll_ms")]
    pub recv_poll_ms: u64,
}

fn default_backend() -> CanBackend {
    CanBackend::Mock
}
fn default_bitrate() -> String {
    "1M".to_string()
}
fn default_recv_poll_ms() -> u64 {
    2
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            interface: None,
            bitrate: default_bitrate(),
            recv_poll_ms: default_recv_poll_ms(),
        }
    }
}

pub fn parse(raw: &str) -> Result<DaemonConfig> {
    let cfg: DaemonConfig = serde_yaml::from_str(raw).context("parsing daemon configuration")?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn load(path: &Path) -> Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    parse(&raw).with_context(|| format!("in {}", path.display()))
}

pub fn validate(cfg: &DaemonConfig) -> Result<()> {
    motor_registry::validate(&cfg.motors)?;
    if cfg.link.queue_depth == 0 {
        anyhow::bail!("link.queue_depth must be at least 1");
    }
    if cfg.link.max_payload == 0 || cfg.link.max_payload > frame_protocol::MAX_PAYLOAD {
        anyhow::bail!(
            "link.max_payload must be between 1 and {}",
            frame_protocol::MAX_PAYLOAD
        );
    }
    if cfg.link.transport == HostTransport::Serial && cfg.link.serial_path.is_none() {
        anyhow::bail!("link.serial_path is required for the serial transport");
    }
    if cfg.can.backend == CanBackend::Slcan && cfg.can.interface.is_none() {
        anyhow::bail!("can.interface is required for the slcan backend");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use motor_registry::ControlMode;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = parse("{}").unwrap();
        assert_eq!(cfg, DaemonConfig::default());
        assert_eq!(cfg.link.tcp_listen, "127.0.0.1:7000");
        assert_eq!(cfg.link.baud, 115_200);
        assert_eq!(cfg.link.max_payload, 1024);
        assert_eq!(cfg.can.bitrate, "1M");
        assert_eq!(cfg.motors.confirm_timeout_ms, 100);
    }

    #[test]
    fn full_document() {
        let cfg = parse(
            r#"
link:
  transport: serial
  serial_path: /dev/ttyUSB0
  baud: 921600
can:
  backend: slcan
  interface: /dev/ttyACM0
  bitrate: 500k
motors:
  confirm_timeout_ms: 150
  devices:
    - can_id: 1
      master_id: 17
      mode: mit
    - can_id: 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.link.transport, HostTransport::Serial);
        assert_eq!(cfg.link.baud, 921_600);
        assert_eq!(cfg.can.backend, CanBackend::Slcan);
        assert_eq!(cfg.motors.confirm_timeout_ms, 150);
        assert_eq!(cfg.motors.devices.len(), 2);
        assert_eq!(cfg.motors.devices[0].mode, ControlMode::Mit);
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg = parse(include_str!("../link-daemon.example.yaml")).unwrap();
        assert_eq!(cfg.motors.devices.len(), 2);
        assert_eq!(cfg.can.backend, CanBackend::Mock);
    }

    #[test]
    fn zero_max_payload_is_rejected() {
        let err = parse("link:\n  max_payload: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_payload"));
    }

    #[test]
    fn serial_transport_needs_a_path() {
        let err = parse("link:\n  transport: serial\n").unwrap_err();
        assert!(err.to_string().contains("serial_path"));
    }

    #[test]
    fn duplicate_motor_ids_are_rejected() {
        let doc = "motors:\n  devices:\n    - can_id: 3\n    - can_id: 3\n";
        assert!(parse(doc).is_err());
    }
}
