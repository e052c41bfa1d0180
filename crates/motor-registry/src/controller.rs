//! High-level motor operations built on the confirmation engine.
//!
//! All quantities are in CAN units: rad, rad/s, N·m.

use crate::confirm::Confirmer;
use crate::error::{MotorError, Result};
use crate::protocol::{self, ControlMode, MitCommand, MotorOp};
use crate::registers::{self, RegisterValue};
use crate::registry::{Motor, MotorRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registers read at start-up so feedback is scaled with the motor's own limits.
pub const SYNC_REGISTERS: [u8; 5] = [
    registers::PMAX,
    registers::VMAX,
    registers::TMAX,
    registers::MST_ID,
    registers::CTRL_MODE,
];

#[derive(Clone)]
pub struct MotorController {
    registry: Arc<MotorRegistry>,
    confirm: Confirmer,
}

impl MotorController {
    pub fn new(registry: Arc<MotorRegistry>, confirm: Confirmer) -> Self {
        Self { registry, confirm }
    }

    pub fn registry(&self) -> &Arc<MotorRegistry> {
        &self.registry
    }

    fn idle_snapshot(&self, can_id: u8) -> Result<Motor> {
        self.registry.ensure_idle(can_id)?;
        self.registry.snapshot(can_id)
    }

    async fn op(&self, can_id: u8, op: MotorOp) -> Result<Motor> {
        let mode = self.registry.with_motor(can_id, |m| m.mode)?;
        self.confirm
            .send_and_wait(can_id, protocol::op_frame(can_id, mode, op))
            .await?;
        self.registry.snapshot(can_id)
    }

    async fn enable_unchecked(&self, can_id: u8) -> Result<()> {
        let motor = self.op(can_id, MotorOp::Enable).await?;
        if motor.enabled {
            info!(can_id, "motor enabled");
            Ok(())
        } else if motor.is_faulted() {
            Err(MotorError::Faulted {
                can_id,
                status: motor.error_code,
            })
        } else {
            Err(MotorError::NotEnabled(can_id))
        }
    }

    pub async fn enable(&self, can_id: u8) -> Result<()> {
        self.registry.ensure_idle(can_id)?;
        self.enable_unchecked(can_id).await
    }

    pub async fn disable(&self, can_id: u8) -> Result<()> {
        self.registry.ensure_idle(can_id)?;
        self.op(can_id, MotorOp::Disable).await?;
        info!(can_id, "motor disabled");
        Ok(())
    }

    /// Emergency stop: disable regardless of any operation in progress.
    pub async fn stop(&self, can_id: u8) -> Result<()> {
        self.op(can_id, MotorOp::Disable).await?;
        warn!(can_id, "motor stopped");
        Ok(())
    }

    /// Stop every registered motor; returns the per-motor outcome.
    pub async fn stop_all(&self) -> Vec<(u8, Result<()>)> {
        let mut outcomes = Vec::new();
        for can_id in self.registry.ids() {
            outcomes.push((can_id, self.stop(can_id).await));
        }
        outcomes
    }

    pub async fn clear_error(&self, can_id: u8) -> Result<()> {
        self.registry.ensure_idle(can_id)?;
        self.op(can_id, MotorOp::ClearError).await?;
        Ok(())
    }

    /// Make the current shaft position the new zero: disable, set zero, re-enable.
    ///
    /// The motor is marked busy for the whole sequence.
    pub async fn set_origin(&self, can_id: u8) -> Result<()> {
        let _busy = self.registry.claim(can_id)?;
        let settle = self.confirm.policy().poll;
        self.op(can_id, MotorOp::Disable).await?;
        tokio::time::sleep(settle).await;
        self.op(can_id, MotorOp::SetZero).await?;
        tokio::time::sleep(settle).await;
        self.enable_unchecked(can_id).await?;
        info!(can_id, "origin set");
        Ok(())
    }

    /// Move to an absolute position with a velocity limit.
    pub async fn rotate_to(&self, can_id: u8, position: f32, velocity: f32) -> Result<()> {
        let motor = self.idle_snapshot(can_id)?;
        if !motor.enabled {
            return Err(MotorError::NotEnabled(can_id));
        }
        if !position.is_finite() || !velocity.is_finite() {
            return Err(MotorError::InvalidValue("position and velocity must be finite"));
        }
        let frame = match motor.mode {
            ControlMode::PosVel => protocol::pos_vel_frame(can_id, position, velocity.abs()),
            ControlMode::Mit => protocol::mit_frame(
                can_id,
                &motor.limits(),
                &MitCommand {
                    position,
                    velocity: 0.0,
                    kp: motor.kp,
                    kd: motor.kd,
                    torque: 0.0,
                },
            ),
            ControlMode::Vel => {
                return Err(MotorError::ModeMismatch {
                    can_id,
                    mode: motor.mode.as_str(),
                })
            }
        };
        debug!(can_id, position, velocity, "rotate");
        self.confirm.send_and_wait(can_id, frame).await
    }

    /// Move relative to the freshly refreshed position.
    pub async fn rotate_by(&self, can_id: u8, delta: f32, velocity: f32) -> Result<()> {
        self.registry.ensure_idle(can_id)?;
        let current = self.position(can_id).await?;
        self.rotate_to(can_id, current + delta, velocity).await
    }

    pub async fn set_velocity(&self, can_id: u8, velocity: f32) -> Result<()> {
        let motor = self.idle_snapshot(can_id)?;
        if !motor.enabled {
            return Err(MotorError::NotEnabled(can_id));
        }
        if !velocity.is_finite() {
            return Err(MotorError::InvalidValue("velocity must be finite"));
        }
        let frame = match motor.mode {
            ControlMode::Vel => protocol::vel_frame(can_id, velocity),
            ControlMode::Mit => protocol::mit_frame(
                can_id,
                &motor.limits(),
                &MitCommand {
                    position: 0.0,
                    velocity,
                    kp: 0.0,
                    kd: motor.kd,
                    torque: 0.0,
                },
            ),
            ControlMode::PosVel => {
                return Err(MotorError::ModeMismatch {
                    can_id,
                    mode: motor.mode.as_str(),
                })
            }
        };
        self.confirm.send_and_wait(can_id, frame).await
    }

    pub async fn mit(&self, can_id: u8, cmd: MitCommand) -> Result<()> {
        let motor = self.idle_snapshot(can_id)?;
        if motor.mode != ControlMode::Mit {
            return Err(MotorError::ModeMismatch {
                can_id,
                mode: motor.mode.as_str(),
            });
        }
        if !motor.enabled {
            return Err(MotorError::NotEnabled(can_id));
        }
        let frame = protocol::mit_frame(can_id, &motor.limits(), &cmd);
        self.confirm.send_and_wait(can_id, frame).await
    }

    /// Pull a feedback frame without commanding motion.
    pub async fn refresh(&self, can_id: u8) -> Result<Motor> {
        self.confirm
            .send_and_wait(can_id, protocol::refresh_frame(can_id))
            .await?;
        self.registry.snapshot(can_id)
    }

    pub async fn position(&self, can_id: u8) -> Result<f32> {
        Ok(self.refresh(can_id).await?.position)
    }

    pub async fn read_register(&self, can_id: u8, register: u8) -> Result<RegisterValue> {
        registers::lookup(register).ok_or(MotorError::UnknownRegister(register))?;
        self.registry.ensure_idle(can_id)?;
        self.registry.with_motor(can_id, |m| m.registers.remove(&register))?;
        let can = self.confirm.can().clone();
        can.send(protocol::read_register_frame(can_id, register)).await?;
        self.confirm
            .wait_until(can_id, |m| m.registers.contains_key(&register))
            .await?;
        self.registry
            .with_motor(can_id, |m| m.registers.get(&register).copied())?
            .ok_or(MotorError::Timeout(can_id))
    }

    pub async fn write_register(&self, can_id: u8, register: u8, value: RegisterValue) -> Result<()> {
        let desc = registers::lookup(register).ok_or(MotorError::UnknownRegister(register))?;
        if !desc.writable {
            warn!(can_id, register = desc.name, "writing a read-only register");
        }
        self.registry.ensure_idle(can_id)?;
        self.confirm
            .send_and_wait(can_id, protocol::write_register_frame(can_id, register, value))
            .await?;
        debug!(can_id, register = desc.name, %value, "register written");
        Ok(())
    }

    /// Persist parameters to the motor's flash.
    pub async fn save_params(&self, can_id: u8) -> Result<()> {
        let motor = self.idle_snapshot(can_id)?;
        if motor.enabled {
            warn!(can_id, "saving parameters on an enabled motor; most firmware ignores this");
        }
        self.confirm
            .send_and_wait(can_id, protocol::save_frame(can_id))
            .await?;
        info!(can_id, "parameters saved");
        Ok(())
    }

    pub async fn set_mode(&self, can_id: u8, mode: ControlMode) -> Result<()> {
        self.write_register(can_id, registers::CTRL_MODE, RegisterValue::UInt(mode.register_value()))
            .await?;
        self.registry.with_motor(can_id, |m| m.mode = mode)?;
        info!(can_id, mode = mode.as_str(), "control mode changed");
        Ok(())
    }

    /// Read back the scaling, feedback id and mode registers.
    pub async fn sync_parameters(&self, can_id: u8) -> Result<()> {
        for register in SYNC_REGISTERS {
            self.read_register(can_id, register).await?;
        }
        let m = self.registry.snapshot(can_id)?;
        debug!(can_id, pmax = m.pmax, vmax = m.vmax, tmax = m.tmax, mode = m.mode.as_str(), "parameters synced");
        Ok(())
    }

    /// Best-effort start-up probe of every motor.
    pub async fn probe_all(&self, pause: Duration) {
        for can_id in self.registry.ids() {
            match self.sync_parameters(can_id).await {
                Ok(()) => info!(can_id, "motor answered probe"),
                Err(e) => warn!(can_id, error = %e, "motor did not answer probe"),
            }
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmPolicy;
    use crate::driver::{CanDriver, DriverOptions};
    use crate::sim::ServoSim;
    use crate::types::MotorConfig;
    use can_transport::{MockBus, MockHandle};

    struct Rig {
        ctl: MotorController,
        sim: ServoSim,
        bus: MockHandle,
        _driver: CanDriver,
    }

    fn rig(configs: &[MotorConfig]) -> anyhow::Result<Rig> {
        let registry = Arc::new(MotorRegistry::from_configs(configs)?);
        let sim = ServoSim::new(configs);
        let bus = MockBus::with_responder("mock0", sim.responder());
        let handle = bus.handle();
        let (driver, can) = CanDriver::spawn(bus, Arc::clone(&registry), None, DriverOptions::default())?;
        let policy = ConfirmPolicy {
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        };
        let confirm = Confirmer::new(Arc::clone(&registry), can, policy);
        Ok(Rig {
            ctl: MotorController::new(registry, confirm),
            sim,
            bus: handle,
            _driver: driver,
        })
    }

    fn two_motors() -> Vec<MotorConfig> {
        vec![
            MotorConfig::new(1).with_master_id(0x11),
            MotorConfig::new(2).with_master_id(0x12),
        ]
    }

    #[tokio::test]
    async fn enable_rotate_and_read_back() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.ctl.enable(1).await?;
        assert_eq!(rig.sim.is_enabled(1), Some(true));

        rig.ctl.rotate_to(1, 1.0, 2.0).await?;
        assert_eq!(rig.sim.position(1), Some(1.0));
        let pos = rig.ctl.position(1).await?;
        assert!((pos - 1.0).abs() < 0.001);

        // Motor 2 saw nothing.
        let other = rig.ctl.registry().snapshot(2)?;
        assert_eq!(other.response_counter, 0);
        assert!(!other.enabled);
        Ok(())
    }

    #[tokio::test]
    async fn rotate_requires_enable() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        assert!(matches!(
            rig.ctl.rotate_to(1, 1.0, 1.0).await,
            Err(MotorError::NotEnabled(1))
        ));
        assert!(rig.bus.sent().is_empty());
        assert!(matches!(
            rig.ctl.rotate_to(7, 1.0, 1.0).await,
            Err(MotorError::UnknownMotor(7))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rotate_by_adds_to_current_position() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.sim.set_position(2, 0.5);
        rig.ctl.enable(2).await?;
        rig.ctl.rotate_by(2, 0.25, 1.0).await?;
        let now = rig.sim.position(2).unwrap_or_default();
        assert!((now - 0.75).abs() < 0.001, "position {now}");
        Ok(())
    }

    #[tokio::test]
    async fn silent_motor_times_out() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.sim.set_silent(1, true);
        assert!(matches!(rig.ctl.enable(1).await, Err(MotorError::Timeout(1))));
        assert_eq!(rig.ctl.registry().snapshot(1)?.missed, 1);
        rig.ctl.enable(2).await?;
        Ok(())
    }

    #[tokio::test]
    async fn fault_surfaces_on_enable_and_clears() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.sim.inject_fault(1, 0xC);
        assert!(matches!(
            rig.ctl.enable(1).await,
            Err(MotorError::Faulted { can_id: 1, status: 0xC })
        ));
        rig.ctl.clear_error(1).await?;
        rig.ctl.enable(1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn set_origin_rezeroes_and_reenables() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.ctl.enable(1).await?;
        rig.ctl.rotate_to(1, 2.0, 1.0).await?;
        rig.ctl.set_origin(1).await?;
        assert_eq!(rig.sim.position(1), Some(0.0));
        assert_eq!(rig.sim.is_enabled(1), Some(true));
        assert!(!rig.ctl.registry().snapshot(1)?.busy);
        Ok(())
    }

    #[tokio::test]
    async fn busy_motor_refuses_other_commands() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        let _guard = rig.ctl.registry().claim(1)?;
        assert!(matches!(rig.ctl.enable(1).await, Err(MotorError::Busy(1))));
        assert!(matches!(rig.ctl.set_origin(1).await, Err(MotorError::Busy(1))));
        // Emergency stop ignores the busy flag.
        rig.ctl.stop(1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn register_read_is_refused_while_busy() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.ctl.read_register(1, registers::PMAX).await?;
        let guard = rig.ctl.registry().claim(1)?;
        assert!(matches!(
            rig.ctl.read_register(1, registers::PMAX).await,
            Err(MotorError::Busy(1))
        ));
        assert!(rig.ctl.registry().snapshot(1)?.registers.contains_key(&registers::PMAX));
        drop(guard);
        rig.ctl.read_register(1, registers::PMAX).await?;
        Ok(())
    }

    #[tokio::test]
    async fn registers_read_write_and_mode_switch() -> anyhow::Result<()> {
        let rig = rig(&[MotorConfig::new(3).with_master_id(0x13)])?;
        let pmax = rig.ctl.read_register(3, registers::PMAX).await?;
        assert_eq!(pmax, RegisterValue::Float(12.5));

        rig.ctl.write_register(3, registers::PMAX, RegisterValue::Float(6.25)).await?;
        assert_eq!(rig.ctl.registry().snapshot(3)?.pmax, 6.25);

        rig.ctl.set_mode(3, ControlMode::Vel).await?;
        assert_eq!(rig.sim.mode(3), Some(ControlMode::Vel));
        assert_eq!(rig.ctl.registry().snapshot(3)?.mode, ControlMode::Vel);

        rig.ctl.save_params(3).await?;
        assert_eq!(rig.sim.saves(3), 1);

        assert!(matches!(
            rig.ctl.read_register(3, 99).await,
            Err(MotorError::UnknownRegister(99))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn velocity_and_mit_follow_mode() -> anyhow::Result<()> {
        let rig = rig(&[
            MotorConfig::new(1).with_mode(ControlMode::Vel),
            MotorConfig::new(2).with_mode(ControlMode::Mit),
        ])?;
        rig.ctl.enable(1).await?;
        rig.ctl.enable(2).await?;

        rig.ctl.set_velocity(1, 3.0).await?;
        assert_eq!(rig.sim.velocity(1), Some(3.0));
        assert!(matches!(
            rig.ctl.rotate_to(1, 1.0, 1.0).await,
            Err(MotorError::ModeMismatch { can_id: 1, .. })
        ));

        let cmd = MitCommand {
            position: 0.5,
            velocity: 0.0,
            kp: 10.0,
            kd: 0.5,
            torque: 0.0,
        };
        rig.ctl.mit(2, cmd).await?;
        let pos = rig.sim.position(2).unwrap_or_default();
        assert!((pos - 0.5).abs() < 0.001);
        assert!(matches!(rig.ctl.mit(1, cmd).await, Err(MotorError::ModeMismatch { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn sync_learns_limits_from_the_motor() -> anyhow::Result<()> {
        let rig = rig(&[MotorConfig::new(1)])?;
        // Registry believes the defaults; the servo says otherwise.
        rig.sim.handle_frame(&protocol::write_register_frame(1, registers::VMAX, RegisterValue::Float(45.0)));
        rig.ctl.sync_parameters(1).await?;
        assert_eq!(rig.ctl.registry().snapshot(1)?.vmax, 45.0);
        Ok(())
    }

    #[tokio::test]
    async fn stop_all_reports_each_motor() -> anyhow::Result<()> {
        let rig = rig(&two_motors())?;
        rig.sim.set_silent(2, true);
        let outcomes = rig.ctl.stop_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_ok());
        assert!(matches!(outcomes[1], (2, Err(MotorError::Timeout(2)))));
        Ok(())
    }
}
