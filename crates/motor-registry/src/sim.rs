//! Software stand-in for a bus of DM-style servos.
//!
//! Plug [`ServoSim::responder`] into a `MockBus` and every transmitted frame is answered the
//! way a real motor would: a feedback frame for control and op frames, a register reply for
//! register traffic.

use crate::protocol::{
    feedback_frame, parse_mit, register_reply_frame, ControlMode, Feedback, Limits, MotorOp,
    REGISTER_ADDRESS, REG_READ, REG_REFRESH, REG_SAVE, REG_WRITE, STATUS_ENABLED,
};
use crate::registers::{self, RegisterValue};
use crate::types::MotorConfig;
use can_transport::CanFrame;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct SimServo {
    can_id: u8,
    mode: ControlMode,
    enabled: bool,
    fault: Option<u8>,
    silent: bool,
    state: Feedback,
    temps: (u8, u8),
    registers: HashMap<u8, RegisterValue>,
    saves: u32,
}

impl SimServo {
    fn new(cfg: &MotorConfig) -> Self {
        let mut regs = HashMap::new();
        regs.insert(registers::PMAX, RegisterValue::Float(cfg.pmax));
        regs.insert(registers::VMAX, RegisterValue::Float(cfg.vmax));
        regs.insert(registers::TMAX, RegisterValue::Float(cfg.tmax));
        regs.insert(registers::MST_ID, RegisterValue::UInt(cfg.feedback_id()));
        regs.insert(registers::ESC_ID, RegisterValue::UInt(u32::from(cfg.can_id)));
        regs.insert(registers::CTRL_MODE, RegisterValue::UInt(cfg.mode.register_value()));
        regs.insert(registers::TIMEOUT, RegisterValue::UInt(0));
        regs.insert(registers::MAX_SPD, RegisterValue::Float(cfg.vmax));
        Self {
            can_id: cfg.can_id,
            mode: cfg.mode,
            enabled: false,
            fault: None,
            silent: false,
            state: Feedback {
                position: 0.0,
                velocity: 0.0,
                torque: 0.0,
            },
            temps: (28, 30),
            registers: regs,
            saves: 0,
        }
    }

    fn float(&self, register: u8) -> f32 {
        self.registers.get(&register).map(|v| v.as_f32()).unwrap_or(0.0)
    }

    fn limits(&self) -> Limits {
        Limits {
            pmax: self.float(registers::PMAX),
            vmax: self.float(registers::VMAX),
            tmax: self.float(registers::TMAX),
        }
    }

    fn master_id(&self) -> u16 {
        let id = self
            .registers
            .get(&registers::MST_ID)
            .map(|v| v.as_u32())
            .unwrap_or(0);
        if id == 0 {
            u16::from(self.can_id)
        } else {
            (id & 0x7FF) as u16
        }
    }

    fn status(&self) -> u8 {
        match (self.fault, self.enabled) {
            (Some(code), _) => code,
            (None, true) => STATUS_ENABLED,
            (None, false) => 0,
        }
    }

    fn feedback(&self) -> CanFrame {
        feedback_frame(
            self.master_id(),
            self.can_id,
            self.status(),
            &self.limits(),
            &self.state,
            self.temps,
        )
    }

    fn on_op(&mut self, op: MotorOp) {
        match op {
            MotorOp::Enable => self.enabled = self.fault.is_none(),
            MotorOp::Disable => {
                self.enabled = false;
                self.state.velocity = 0.0;
            }
            MotorOp::SetZero => self.state.position = 0.0,
            MotorOp::ClearError => self.fault = None,
        }
    }

    fn on_control(&mut self, mode: ControlMode, data: &[u8]) {
        if !self.enabled || mode != self.mode {
            return;
        }
        match mode {
            ControlMode::Mit => {
                if let Some(cmd) = parse_mit(data, &self.limits()) {
                    // Stiff enough to count as "arrived"; soft commands only apply torque.
                    if cmd.kp > 0.0 {
                        self.state.position = cmd.position;
                    }
                    self.state.velocity = cmd.velocity;
                    self.state.torque = cmd.torque;
                }
            }
            ControlMode::PosVel => {
                if let Some(pos) = data.get(..4).and_then(|b| b.try_into().ok()) {
                    self.state.position = f32::from_le_bytes(pos);
                    self.state.velocity = 0.0;
                }
            }
            ControlMode::Vel => {
                if let Some(vel) = data.get(..4).and_then(|b| b.try_into().ok()) {
                    self.state.velocity = f32::from_le_bytes(vel);
                }
            }
        }
    }

    fn on_register(&mut self, kind: u8, register: u8, raw: [u8; 4]) -> Option<CanFrame> {
        let reply = |servo: &SimServo, kind: u8, value: [u8; 4]| {
            register_reply_frame(servo.master_id(), servo.can_id, kind, register, value)
        };
        match kind {
            REG_READ => {
                let value = self.registers.get(&register).map(|v| v.to_le_bytes()).unwrap_or([0; 4]);
                Some(reply(self, REG_READ, value))
            }
            REG_WRITE => {
                let desc = registers::lookup(register)?;
                if desc.writable {
                    let value = RegisterValue::from_le(desc, raw);
                    if register == registers::CTRL_MODE {
                        if let Some(mode) = ControlMode::from_register(value.as_u32()) {
                            self.mode = mode;
                        }
                    }
                    self.registers.insert(register, value);
                }
                let current = self.registers.get(&register).map(|v| v.to_le_bytes()).unwrap_or(raw);
                Some(reply(self, REG_WRITE, current))
            }
            REG_SAVE => {
                self.saves += 1;
                Some(reply(self, REG_SAVE, [0x01, 0, 0, 0]))
            }
            REG_REFRESH => Some(self.feedback()),
            _ => None,
        }
    }
}

/// Shared state of a simulated servo bus.
#[derive(Clone, Default)]
pub struct ServoSim {
    servos: Arc<Mutex<BTreeMap<u8, SimServo>>>,
}

impl ServoSim {
    pub fn new<'a>(configs: impl IntoIterator<Item = &'a MotorConfig>) -> Self {
        let servos = configs.into_iter().map(|c| (c.can_id, SimServo::new(c))).collect();
        Self {
            servos: Arc::new(Mutex::new(servos)),
        }
    }

    /// Closure suitable for `MockBus::with_responder`.
    pub fn responder(&self) -> impl FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static {
        let sim = self.clone();
        move |frame| sim.handle_frame(frame)
    }

    pub fn handle_frame(&self, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id.is_extended() {
            return Vec::new();
        }
        let id = frame.id.raw() as u16;
        let data = frame.payload();
        let mut servos = self.servos.lock();

        let reply = if id == REGISTER_ADDRESS {
            if data.len() < 4 {
                return Vec::new();
            }
            let target = u16::from_le_bytes([data[0], data[1]]);
            let servo = match u8::try_from(target) {
                Ok(t) => servos.get_mut(&t),
                Err(_) => None,
            };
            let Some(servo) = servo else {
                return Vec::new();
            };
            let raw = [
                data.get(4).copied().unwrap_or(0),
                data.get(5).copied().unwrap_or(0),
                data.get(6).copied().unwrap_or(0),
                data.get(7).copied().unwrap_or(0),
            ];
            if servo.silent {
                return Vec::new();
            }
            servo.on_register(data[2], data[3], raw)
        } else {
            let Some((mode, target)) = ControlMode::split_address(id) else {
                return Vec::new();
            };
            let Some(servo) = servos.get_mut(&target) else {
                return Vec::new();
            };
            if servo.silent {
                return Vec::new();
            }
            let op = match data {
                [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, code] => MotorOp::from_code(*code),
                _ => None,
            };
            match op {
                Some(op) => servo.on_op(op),
                None => servo.on_control(mode, data),
            }
            Some(servo.feedback())
        };
        trace!(request = %frame, reply = ?reply.as_ref().map(|f| f.to_string()), "sim");
        reply.into_iter().collect()
    }

    /// Stop answering, as if the motor lost power.
    pub fn set_silent(&self, can_id: u8, silent: bool) {
        if let Some(servo) = self.servos.lock().get_mut(&can_id) {
            servo.silent = silent;
        }
    }

    /// Latch a fault status until a clear-error op.
    pub fn inject_fault(&self, can_id: u8, status: u8) {
        if let Some(servo) = self.servos.lock().get_mut(&can_id) {
            servo.fault = Some(status);
            servo.enabled = false;
        }
    }

    pub fn position(&self, can_id: u8) -> Option<f32> {
        self.servos.lock().get(&can_id).map(|s| s.state.position)
    }

    pub fn velocity(&self, can_id: u8) -> Option<f32> {
        self.servos.lock().get(&can_id).map(|s| s.state.velocity)
    }

    pub fn set_position(&self, can_id: u8, position: f32) {
        if let Some(servo) = self.servos.lock().get_mut(&can_id) {
            servo.state.position = position;
        }
    }

    pub fn is_enabled(&self, can_id: u8) -> Option<bool> {
        self.servos.lock().get(&can_id).map(|s| s.enabled)
    }

    pub fn mode(&self, can_id: u8) -> Option<ControlMode> {
        self.servos.lock().get(&can_id).map(|s| s.mode)
    }

    pub fn saves(&self, can_id: u8) -> u32 {
        self.servos.lock().get(&can_id).map(|s| s.saves).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        op_frame, pos_vel_frame, read_register_frame, refresh_frame, RawFeedback, RegisterReply,
    };

    fn sim() -> ServoSim {
        ServoSim::new(&[MotorConfig::new(1).with_master_id(0x11)])
    }

    #[test]
    fn enable_then_move() {
        let sim = sim();
        let reply = sim.handle_frame(&op_frame(1, ControlMode::PosVel, MotorOp::Enable));
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].id.raw(), 0x11);
        let raw = RawFeedback::parse(reply[0].payload()).unwrap();
        assert_eq!((raw.motor_id, raw.status), (1, STATUS_ENABLED));

        sim.handle_frame(&pos_vel_frame(1, 1.5, 3.0));
        assert_eq!(sim.position(1), Some(1.5));
    }

    #[test]
    fn commands_while_disabled_do_not_move() {
        let sim = sim();
        let reply = sim.handle_frame(&pos_vel_frame(1, 1.5, 3.0));
        assert_eq!(reply.len(), 1);
        assert_eq!(sim.position(1), Some(0.0));
    }

    #[test]
    fn register_read_reports_configured_limits() {
        let sim = sim();
        let reply = sim.handle_frame(&read_register_frame(1, registers::PMAX));
        let reg = RegisterReply::parse(reply[0].payload()).unwrap();
        assert_eq!(reg.motor_id, 1);
        assert_eq!(f32::from_le_bytes(reg.raw), 12.5);
    }

    #[test]
    fn silent_and_unknown_motors_do_not_answer() {
        let sim = sim();
        sim.set_silent(1, true);
        assert!(sim.handle_frame(&refresh_frame(1)).is_empty());
        assert!(sim.handle_frame(&refresh_frame(4)).is_empty());
        assert!(sim.handle_frame(&op_frame(4, ControlMode::Mit, MotorOp::Enable)).is_empty());
    }

    #[test]
    fn fault_blocks_enable_until_cleared() {
        let sim = sim();
        sim.inject_fault(1, 0xA);
        sim.handle_frame(&op_frame(1, ControlMode::PosVel, MotorOp::Enable));
        assert_eq!(sim.is_enabled(1), Some(false));
        sim.handle_frame(&op_frame(1, ControlMode::PosVel, MotorOp::ClearError));
        sim.handle_frame(&op_frame(1, ControlMode::PosVel, MotorOp::Enable));
        assert_eq!(sim.is_enabled(1), Some(true));
    }
}
