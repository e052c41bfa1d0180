use crate::error::{MotorError, Result};
use crate::protocol::{classify, ControlMode, Inbound, Limits, RawFeedback, RegisterReply};
use crate::protocol::{REG_READ, REG_WRITE, STATUS_ENABLED, STATUS_FAULT_MIN};
use crate::registers::{self, RegisterValue};
use crate::types::MotorConfig;
use can_transport::CanFrame;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Live state of one servo.
#[derive(Clone, Debug)]
pub struct Motor {
    pub can_id: u8,
    pub master_id: u32,
    pub pmax: f32,
    pub vmax: f32,
    pub tmax: f32,
    pub kp: f32,
    pub kd: f32,
    pub mode: ControlMode,
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    /// N·m
    pub torque: f32,
    pub temp_mos: u8,
    pub temp_rotor: u8,
    /// Status nibble from the last feedback frame.
    pub error_code: u8,
    pub enabled: bool,
    pub online: bool,
    /// Bumped on every feedback or register reply. Never decreases.
    pub response_counter: u64,
    pub last_seen: Option<Instant>,
    /// Consecutive confirmations that timed out.
    pub missed: u32,
    /// A multi-step operation holds this motor.
    pub busy: bool,
    /// Last value seen per register address.
    pub registers: HashMap<u8, RegisterValue>,
}

impl Motor {
    fn from_config(cfg: &MotorConfig) -> Self {
        Self {
            can_id: cfg.can_id,
            master_id: cfg.feedback_id(),
            pmax: cfg.pmax,
            vmax: cfg.vmax,
            tmax: cfg.tmax,
            kp: cfg.kp,
            kd: cfg.kd,
            mode: cfg.mode,
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
            temp_mos: 0,
            temp_rotor: 0,
            error_code: 0,
            enabled: false,
            online: false,
            response_counter: 0,
            last_seen: None,
            missed: 0,
            busy: false,
            registers: HashMap::new(),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            pmax: self.pmax,
            vmax: self.vmax,
            tmax: self.tmax,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.error_code >= STATUS_FAULT_MIN
    }

    fn mark_heard(&mut self) {
        self.response_counter += 1;
        self.last_seen = Some(Instant::now());
        self.missed = 0;
        self.online = true;
    }

    fn apply_feedback(&mut self, raw: &RawFeedback) {
        let state = raw.scale(&self.limits());
        self.position = state.position;
        self.velocity = state.velocity;
        self.torque = state.torque;
        self.temp_mos = raw.temp_mos;
        self.temp_rotor = raw.temp_rotor;
        self.error_code = raw.status;
        self.enabled = raw.status == STATUS_ENABLED;
        self.mark_heard();
    }

    fn apply_register(&mut self, reply: &RegisterReply) {
        if matches!(reply.kind, REG_READ | REG_WRITE) {
            if let Some(desc) = registers::lookup(reply.register) {
                let value = RegisterValue::from_le(desc, reply.raw);
                self.learn(reply.register, value);
            } else {
                debug!(can_id = self.can_id, register = reply.register, "reply for unlisted register");
            }
        }
        self.mark_heard();
    }

    /// Record a register value and fold scaling/addressing registers into the motor.
    fn learn(&mut self, register: u8, value: RegisterValue) {
        match register {
            registers::PMAX => self.pmax = value.as_f32(),
            registers::VMAX => self.vmax = value.as_f32(),
            registers::TMAX => self.tmax = value.as_f32(),
            registers::MST_ID if value.as_u32() != 0 => self.master_id = value.as_u32(),
            registers::CTRL_MODE => {
                if let Some(mode) = ControlMode::from_register(value.as_u32()) {
                    self.mode = mode;
                }
            }
            _ => {}
        }
        self.registers.insert(register, value);
    }
}

/// What an inbound CAN frame did to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingested {
    Feedback { can_id: u8 },
    Register { can_id: u8, register: u8 },
    /// Parsed, but no registered motor matches.
    Unknown,
    Ignored,
}

fn feedback_nibble(can_id: u8) -> u8 {
    can_id & 0x0F
}

/// All motors on one bus, each behind its own lock.
///
/// The map lock is only held to find a motor; commands for one motor never wait on
/// another motor's lock.
#[derive(Default)]
pub struct MotorRegistry {
    motors: RwLock<BTreeMap<u8, Arc<Mutex<Motor>>>>,
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a MotorConfig>) -> Result<Self> {
        let registry = Self::new();
        for cfg in configs {
            registry.register(cfg)?;
        }
        Ok(registry)
    }

    pub fn register(&self, cfg: &MotorConfig) -> Result<()> {
        let mut motors = self.motors.write();
        if motors.contains_key(&cfg.can_id) {
            return Err(MotorError::AlreadyRegistered(cfg.can_id));
        }
        // Feedback names its sender by the low four id bits only.
        if let Some(&existing) = motors.keys().find(|&&id| feedback_nibble(id) == feedback_nibble(cfg.can_id)) {
            return Err(MotorError::FeedbackIdClash {
                can_id: cfg.can_id,
                existing,
            });
        }
        motors.insert(cfg.can_id, Arc::new(Mutex::new(Motor::from_config(cfg))));
        debug!(can_id = cfg.can_id, mode = cfg.mode.as_str(), "motor registered");
        Ok(())
    }

    pub fn unregister(&self, can_id: u8) -> Result<Motor> {
        let entry = self
            .motors
            .write()
            .remove(&can_id)
            .ok_or(MotorError::UnknownMotor(can_id))?;
        let motor = entry.lock().clone();
        Ok(motor)
    }

    pub fn contains(&self, can_id: u8) -> bool {
        self.motors.read().contains_key(&can_id)
    }

    pub fn ids(&self) -> Vec<u8> {
        self.motors.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.motors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, can_id: u8) -> Result<Arc<Mutex<Motor>>> {
        self.motors
            .read()
            .get(&can_id)
            .cloned()
            .ok_or(MotorError::UnknownMotor(can_id))
    }

    /// Run `f` with the motor locked.
    pub fn with_motor<R>(&self, can_id: u8, f: impl FnOnce(&mut Motor) -> R) -> Result<R> {
        let entry = self.entry(can_id)?;
        let mut motor = entry.lock();
        Ok(f(&mut motor))
    }

    pub fn snapshot(&self, can_id: u8) -> Result<Motor> {
        self.with_motor(can_id, |m| m.clone())
    }

    /// Copies of every motor, ordered by id.
    pub fn snapshot_all(&self) -> Vec<Motor> {
        let entries: Vec<_> = self.motors.read().values().cloned().collect();
        entries.iter().map(|e| e.lock().clone()).collect()
    }

    pub fn response_counter(&self, can_id: u8) -> Result<u64> {
        self.with_motor(can_id, |m| m.response_counter)
    }

    pub fn online_count(&self) -> usize {
        self.snapshot_all().iter().filter(|m| m.online).count()
    }

    /// The motor whose id ends in `nibble`; registration keeps it unique.
    fn feedback_owner(&self, nibble: u8) -> Option<(u8, Arc<Mutex<Motor>>)> {
        self.motors
            .read()
            .iter()
            .find(|(&id, _)| feedback_nibble(id) == nibble)
            .map(|(&id, entry)| (id, Arc::clone(entry)))
    }

    /// Apply one received CAN frame.
    pub fn ingest(&self, frame: &CanFrame) -> Ingested {
        if frame.rtr || frame.id.is_extended() {
            return Ingested::Ignored;
        }
        let inbound = {
            let motors = self.motors.read();
            classify(frame.payload(), |id| {
                u8::try_from(id).map(|id| motors.contains_key(&id)).unwrap_or(false)
            })
        };
        match inbound {
            Inbound::Feedback(raw) => match self.feedback_owner(raw.motor_id) {
                Some((can_id, entry)) => {
                    entry.lock().apply_feedback(&raw);
                    trace!(can_id, status = raw.status, "feedback");
                    Ingested::Feedback { can_id }
                }
                None => {
                    trace!(frame = %frame, "feedback from unregistered motor");
                    Ingested::Unknown
                }
            },
            Inbound::Register(reply) => {
                // `classify` only yields ids that fit a registered u8.
                let can_id = reply.motor_id as u8;
                match self.entry(can_id) {
                    Ok(entry) => {
                        entry.lock().apply_register(&reply);
                        trace!(can_id, register = reply.register, kind = reply.kind, "register reply");
                        Ingested::Register {
                            can_id,
                            register: reply.register,
                        }
                    }
                    Err(_) => Ingested::Unknown,
                }
            }
            Inbound::Unrecognised => Ingested::Ignored,
        }
    }

    /// Acquire the busy flag for a multi-step operation.
    pub fn claim(self: &Arc<Self>, can_id: u8) -> Result<BusyGuard> {
        self.with_motor(can_id, |m| {
            if m.busy {
                Err(MotorError::Busy(can_id))
            } else {
                m.busy = true;
                Ok(())
            }
        })??;
        Ok(BusyGuard {
            registry: Arc::clone(self),
            can_id,
        })
    }

    pub fn ensure_idle(&self, can_id: u8) -> Result<()> {
        if self.with_motor(can_id, |m| m.busy)? {
            Err(MotorError::Busy(can_id))
        } else {
            Ok(())
        }
    }
}

/// Clears the motor's busy flag when dropped.
pub struct BusyGuard {
    registry: Arc<MotorRegistry>,
    can_id: u8,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = self.registry.with_motor(self.can_id, |m| m.busy = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{feedback_frame, register_reply_frame, Feedback};

    fn registry() -> MotorRegistry {
        MotorRegistry::from_configs(&[
            MotorConfig::new(1).with_master_id(0x11),
            MotorConfig::new(2).with_master_id(0x12),
        ])
        .unwrap()
    }

    fn feedback(id: u8, status: u8, position: f32) -> CanFrame {
        let limits = MotorConfig::new(id).limits();
        let state = Feedback {
            position,
            velocity: 0.0,
            torque: 0.0,
        };
        feedback_frame(0x10 + u16::from(id), id, status, &limits, &state, (30, 31))
    }

    #[test]
    fn register_twice_fails_and_unregister_removes() {
        let reg = registry();
        assert!(matches!(
            reg.register(&MotorConfig::new(1)),
            Err(MotorError::AlreadyRegistered(1))
        ));
        assert_eq!(reg.ids(), vec![1, 2]);
        let gone = reg.unregister(2).unwrap();
        assert_eq!(gone.can_id, 2);
        assert!(matches!(reg.unregister(2), Err(MotorError::UnknownMotor(2))));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn feedback_updates_only_its_motor() {
        let reg = registry();
        assert_eq!(reg.ingest(&feedback(1, STATUS_ENABLED, 1.0)), Ingested::Feedback { can_id: 1 });

        let a = reg.snapshot(1).unwrap();
        assert!((a.position - 1.0).abs() < 0.001);
        assert!(a.enabled && a.online);
        assert_eq!(a.response_counter, 1);
        assert_eq!((a.temp_mos, a.temp_rotor), (30, 31));
        assert!(a.last_seen.is_some());

        let b = reg.snapshot(2).unwrap();
        assert_eq!(b.response_counter, 0);
        assert_eq!(b.position, 0.0);
        assert!(!b.online);
    }

    #[test]
    fn ids_sharing_a_feedback_nibble_cannot_coexist() {
        let reg = registry();
        assert!(matches!(
            reg.register(&MotorConfig::new(17).with_master_id(0x21)),
            Err(MotorError::FeedbackIdClash { can_id: 17, existing: 1 })
        ));
        assert_eq!(reg.ids(), vec![1, 2]);

        reg.ingest(&feedback(17, STATUS_ENABLED, 3.0));
        let m1 = reg.snapshot(1).unwrap();
        assert!((m1.position - 3.0).abs() < 0.001);
        assert_eq!(m1.response_counter, 1);
    }

    #[test]
    fn id_above_fifteen_receives_its_own_feedback() {
        let reg = MotorRegistry::from_configs(&[
            MotorConfig::new(2).with_master_id(0x12),
            MotorConfig::new(17).with_master_id(0x21),
        ])
        .unwrap();
        assert_eq!(reg.ingest(&feedback(17, STATUS_ENABLED, 2.0)), Ingested::Feedback { can_id: 17 });
        let m17 = reg.snapshot(17).unwrap();
        assert!((m17.position - 2.0).abs() < 0.001);
        assert_eq!(m17.response_counter, 1);
        assert_eq!(reg.snapshot(2).unwrap().response_counter, 0);
    }

    #[test]
    fn fault_status_is_recorded() {
        let reg = registry();
        reg.ingest(&feedback(2, 0xB, 0.0));
        let m = reg.snapshot(2).unwrap();
        assert!(!m.enabled);
        assert_eq!(m.error_code, 0xB);
        assert!(m.is_faulted());
    }

    #[test]
    fn register_reply_rescales_feedback() {
        let reg = registry();
        let pmax = register_reply_frame(0x11, 1, REG_READ, registers::PMAX, 3.0f32.to_le_bytes());
        assert_eq!(
            reg.ingest(&pmax),
            Ingested::Register {
                can_id: 1,
                register: registers::PMAX
            }
        );
        let mode = register_reply_frame(0x11, 1, REG_WRITE, registers::CTRL_MODE, 3u32.to_le_bytes());
        reg.ingest(&mode);

        let m = reg.snapshot(1).unwrap();
        assert_eq!(m.pmax, 3.0);
        assert_eq!(m.mode, ControlMode::Vel);
        assert_eq!(m.registers.get(&registers::PMAX), Some(&RegisterValue::Float(3.0)));
        assert_eq!(m.response_counter, 2);
        assert_eq!(reg.snapshot(2).unwrap().pmax, 12.5);
    }

    #[test]
    fn unknown_and_malformed_frames_change_nothing() {
        let reg = registry();
        assert_eq!(reg.ingest(&feedback(5, STATUS_ENABLED, 0.0)), Ingested::Unknown);
        let short = CanFrame::standard(0x11, &[1, 2, 3]).unwrap();
        assert_eq!(reg.ingest(&short), Ingested::Ignored);
        assert!(reg.snapshot_all().iter().all(|m| m.response_counter == 0));
    }

    #[test]
    fn busy_guard_is_exclusive_and_released_on_drop() {
        let reg = Arc::new(registry());
        let guard = reg.claim(1).unwrap();
        assert!(matches!(reg.claim(1), Err(MotorError::Busy(1))));
        assert!(matches!(reg.ensure_idle(1), Err(MotorError::Busy(1))));
        assert!(reg.ensure_idle(2).is_ok());
        drop(guard);
        assert!(reg.ensure_idle(1).is_ok());
    }
}
