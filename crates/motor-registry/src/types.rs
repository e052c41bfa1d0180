use crate::protocol::{ControlMode, Limits};
use serde::{Deserialize, Serialize};

/// Static description of one servo on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub can_id: u8,
    /// CAN id the motor answers on. Zero means "same as `can_id`".
    #[serde(default)]
    pub master_id: u32,
    #[serde(default = "default_pmax")]
    pub pmax: f32,
    #[serde(default = "default_vmax")]
    pub vmax: f32,
    #[serde(default = "default_tmax")]
    pub tmax: f32,
    #[serde(default = "default_mode")]
    pub mode: ControlMode,
    /// Stiffness used when a position command is executed in MIT mode.
    #[serde(default = "default_kp")]
    pub kp: f32,
    #[serde(default = "default_kd")]
    pub kd: f32,
}

fn default_pmax() -> f32 {
    12.5
}
fn default_vmax() -> f32 {
    30.0
}
fn default_tmax() -> f32 {
    10.0
}
fn default_mode() -> ControlMode {
    ControlMode::PosVel
}
fn default_kp() -> f32 {
    20.0
}
fn default_kd() -> f32 {
    1.0
}

impl MotorConfig {
    pub fn new(can_id: u8) -> Self {
        Self {
            can_id,
            master_id: 0,
            pmax: default_pmax(),
            vmax: default_vmax(),
            tmax: default_tmax(),
            mode: default_mode(),
            kp: default_kp(),
            kd: default_kd(),
        }
    }

    pub fn with_mode(mut self, mode: ControlMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_master_id(mut self, master_id: u32) -> Self {
        self.master_id = master_id;
        self
    }

    pub fn limits(&self) -> Limits {
        Limits {
            pmax: self.pmax,
            vmax: self.vmax,
            tmax: self.tmax,
        }
    }

    /// CAN id replies are expected on.
    pub fn feedback_id(&self) -> u32 {
        if self.master_id == 0 {
            u32::from(self.can_id)
        } else {
            self.master_id
        }
    }
}

/// Motor subsystem section of the daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorsConfig {
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_offline_after_misses")]
    pub offline_after_misses: u32,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub devices: Vec<MotorConfig>,
}

fn default_confirm_timeout_ms() -> u64 {
    100
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_offline_after_misses() -> u32 {
    3
}
fn default_stale_after_ms() -> u64 {
    1000
}
fn default_sweep_interval_ms() -> u64 {
    250
}

impl Default for MotorsConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            offline_after_misses: default_offline_after_misses(),
            stale_after_ms: default_stale_after_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            devices: Vec::new(),
        }
    }
}
