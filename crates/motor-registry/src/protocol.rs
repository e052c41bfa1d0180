//! CAN frames understood by DM-style servos.
//!
//! Control frames go to `mode_base + can_id`. Register traffic always goes to `0x7FF` and
//! names the motor in the first two payload bytes. Motors answer on their master id with
//! either a feedback frame or a register reply.

use crate::quant::{decode_uint, encode_uint};
use crate::registers::RegisterValue;
use can_transport::{CanFrame, CanId, MAX_STANDARD_ID};
use serde::{Deserialize, Serialize};

pub const REGISTER_ADDRESS: u16 = MAX_STANDARD_ID;

pub const REG_READ: u8 = 0x33;
pub const REG_WRITE: u8 = 0x55;
pub const REG_SAVE: u8 = 0xAA;
pub const REG_REFRESH: u8 = 0xCC;

pub const KP_MAX: f32 = 50.0;
pub const KD_MAX: f32 = 5.0;

/// Status nibble of a healthy, enabled motor.
pub const STATUS_ENABLED: u8 = 0x1;
/// Status nibbles at or above this value are faults.
pub const STATUS_FAULT_MIN: u8 = 0x8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Mit,
    PosVel,
    Vel,
}

impl ControlMode {
    pub fn base(self) -> u16 {
        match self {
            ControlMode::Mit => 0x000,
            ControlMode::PosVel => 0x100,
            ControlMode::Vel => 0x200,
        }
    }

    /// Value held by the `CTRL_MODE` register.
    pub fn register_value(self) -> u32 {
        match self {
            ControlMode::Mit => 1,
            ControlMode::PosVel => 2,
            ControlMode::Vel => 3,
        }
    }

    pub fn from_register(value: u32) -> Option<Self> {
        match value {
            1 => Some(ControlMode::Mit),
            2 => Some(ControlMode::PosVel),
            3 => Some(ControlMode::Vel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::Mit => "mit",
            ControlMode::PosVel => "pos_vel",
            ControlMode::Vel => "vel",
        }
    }

    /// Recover the mode and motor id from a control-frame CAN id.
    pub fn split_address(id: u16) -> Option<(Self, u8)> {
        let mode = match id & 0x700 {
            0x000 => ControlMode::Mit,
            0x100 => ControlMode::PosVel,
            0x200 => ControlMode::Vel,
            _ => return None,
        };
        Some((mode, (id & 0xFF) as u8))
    }
}

/// Single-byte motor commands, sent as `FF FF FF FF FF FF FF op`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotorOp {
    Enable,
    Disable,
    SetZero,
    ClearError,
}

impl MotorOp {
    pub fn code(self) -> u8 {
        match self {
            MotorOp::Enable => 0xFC,
            MotorOp::Disable => 0xFD,
            MotorOp::SetZero => 0xFE,
            MotorOp::ClearError => 0xFB,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xFC => Some(MotorOp::Enable),
            0xFD => Some(MotorOp::Disable),
            0xFE => Some(MotorOp::SetZero),
            0xFB => Some(MotorOp::ClearError),
            _ => None,
        }
    }
}

/// Scaling limits for the packed feedback and MIT fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    pub pmax: f32,
    pub vmax: f32,
    pub tmax: f32,
}

/// Impedance-control setpoint. Units are rad, rad/s and N·m.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MitCommand {
    pub position: f32,
    pub velocity: f32,
    pub kp: f32,
    pub kd: f32,
    pub torque: f32,
}

fn frame(id: u16, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id: CanId::standard_masked(id),
        len: 8,
        data,
        rtr: false,
        timestamp: None,
    }
}

fn register_frame(can_id: u8, kind: u8, tail: [u8; 5]) -> CanFrame {
    let [lo, hi] = u16::from(can_id).to_le_bytes();
    let mut data = [lo, hi, kind, 0, 0, 0, 0, 0];
    data[3..].copy_from_slice(&tail);
    frame(REGISTER_ADDRESS, data)
}

pub fn op_frame(can_id: u8, mode: ControlMode, op: MotorOp) -> CanFrame {
    let mut data = [0xFF; 8];
    data[7] = op.code();
    frame(mode.base() + u16::from(can_id), data)
}

/// Pack an MIT setpoint: p16 v12 kp12 kd12 t12, big-endian bit order.
pub fn mit_frame(can_id: u8, limits: &Limits, cmd: &MitCommand) -> CanFrame {
    let p = encode_uint(cmd.position, -limits.pmax, limits.pmax, 16) as u16;
    let v = encode_uint(cmd.velocity, -limits.vmax, limits.vmax, 12) as u16;
    let kp = encode_uint(cmd.kp, 0.0, KP_MAX, 12) as u16;
    let kd = encode_uint(cmd.kd, 0.0, KD_MAX, 12) as u16;
    let t = encode_uint(cmd.torque, -limits.tmax, limits.tmax, 12) as u16;

    let data = [
        (p >> 8) as u8,
        (p & 0xFF) as u8,
        (v >> 4) as u8,
        ((v & 0x0F) as u8) << 4 | (kp >> 8) as u8 & 0x0F,
        (kp & 0xFF) as u8,
        (kd >> 4) as u8,
        ((kd & 0x0F) as u8) << 4 | (t >> 8) as u8 & 0x0F,
        (t & 0xFF) as u8,
    ];
    frame(ControlMode::Mit.base() + u16::from(can_id), data)
}

/// Inverse of [`mit_frame`], used by the simulator.
pub fn parse_mit(data: &[u8], limits: &Limits) -> Option<MitCommand> {
    let d: &[u8; 8] = data.try_into().ok()?;
    let p = u32::from(d[0]) << 8 | u32::from(d[1]);
    let v = u32::from(d[2]) << 4 | u32::from(d[3] >> 4);
    let kp = u32::from(d[3] & 0x0F) << 8 | u32::from(d[4]);
    let kd = u32::from(d[5]) << 4 | u32::from(d[6] >> 4);
    let t = u32::from(d[6] & 0x0F) << 8 | u32::from(d[7]);
    Some(MitCommand {
        position: decode_uint(p, -limits.pmax, limits.pmax, 16),
        velocity: decode_uint(v, -limits.vmax, limits.vmax, 12),
        kp: decode_uint(kp, 0.0, KP_MAX, 12),
        kd: decode_uint(kd, 0.0, KD_MAX, 12),
        torque: decode_uint(t, -limits.tmax, limits.tmax, 12),
    })
}

/// Position target with velocity limit, two little-endian f32.
pub fn pos_vel_frame(can_id: u8, position: f32, velocity: f32) -> CanFrame {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&position.to_le_bytes());
    data[4..].copy_from_slice(&velocity.to_le_bytes());
    frame(ControlMode::PosVel.base() + u16::from(can_id), data)
}

pub fn vel_frame(can_id: u8, velocity: f32) -> CanFrame {
    let mut f = frame(ControlMode::Vel.base() + u16::from(can_id), [0; 8]);
    f.data[..4].copy_from_slice(&velocity.to_le_bytes());
    f.len = 4;
    f
}

pub fn read_register_frame(can_id: u8, register: u8) -> CanFrame {
    register_frame(can_id, REG_READ, [register, 0, 0, 0, 0])
}

pub fn write_register_frame(can_id: u8, register: u8, value: RegisterValue) -> CanFrame {
    let [a, b, c, d] = value.to_le_bytes();
    register_frame(can_id, REG_WRITE, [register, a, b, c, d])
}

/// Persist all parameters to flash. The motor must be disabled.
pub fn save_frame(can_id: u8) -> CanFrame {
    register_frame(can_id, REG_SAVE, [0x01, 0, 0, 0, 0])
}

/// Ask for a feedback frame without commanding anything.
pub fn refresh_frame(can_id: u8) -> CanFrame {
    register_frame(can_id, REG_REFRESH, [0; 5])
}

/// Feedback fields before scaling by the motor's limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawFeedback {
    /// Low nibble of byte 0, so only ids 0..=15 are distinguishable.
    pub motor_id: u8,
    pub status: u8,
    pub position: u16,
    pub velocity: u16,
    pub torque: u16,
    pub temp_mos: u8,
    pub temp_rotor: u8,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feedback {
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
}

impl RawFeedback {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let d: &[u8; 8] = data.try_into().ok()?;
        Some(Self {
            motor_id: d[0] & 0x0F,
            status: d[0] >> 4,
            position: u16::from(d[1]) << 8 | u16::from(d[2]),
            velocity: u16::from(d[3]) << 4 | u16::from(d[4] >> 4),
            torque: u16::from(d[4] & 0x0F) << 8 | u16::from(d[5]),
            temp_mos: d[6],
            temp_rotor: d[7],
        })
    }

    pub fn scale(&self, limits: &Limits) -> Feedback {
        Feedback {
            position: decode_uint(u32::from(self.position), -limits.pmax, limits.pmax, 16),
            velocity: decode_uint(u32::from(self.velocity), -limits.vmax, limits.vmax, 12),
            torque: decode_uint(u32::from(self.torque), -limits.tmax, limits.tmax, 12),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        [
            (self.status & 0x0F) << 4 | (self.motor_id & 0x0F),
            (self.position >> 8) as u8,
            (self.position & 0xFF) as u8,
            (self.velocity >> 4) as u8,
            ((self.velocity & 0x0F) as u8) << 4 | ((self.torque >> 8) as u8 & 0x0F),
            (self.torque & 0xFF) as u8,
            self.temp_mos,
            self.temp_rotor,
        ]
    }
}

/// Build a feedback frame the way a servo reports its state.
pub fn feedback_frame(
    master_id: u16,
    motor_id: u8,
    status: u8,
    limits: &Limits,
    state: &Feedback,
    temps: (u8, u8),
) -> CanFrame {
    let raw = RawFeedback {
        motor_id,
        status,
        position: encode_uint(state.position, -limits.pmax, limits.pmax, 16) as u16,
        velocity: encode_uint(state.velocity, -limits.vmax, limits.vmax, 12) as u16,
        torque: encode_uint(state.torque, -limits.tmax, limits.tmax, 12) as u16,
        temp_mos: temps.0,
        temp_rotor: temps.1,
    };
    frame(master_id, raw.to_bytes())
}

/// Register read reply or write/save acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterReply {
    pub motor_id: u16,
    pub kind: u8,
    pub register: u8,
    pub raw: [u8; 4],
}

impl RegisterReply {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let d: &[u8; 8] = data.try_into().ok()?;
        matches!(d[2], REG_READ | REG_WRITE | REG_SAVE).then(|| Self {
            motor_id: u16::from_le_bytes([d[0], d[1]]),
            kind: d[2],
            register: d[3],
            raw: [d[4], d[5], d[6], d[7]],
        })
    }
}

/// Register reply frame as a servo sends it.
pub fn register_reply_frame(master_id: u16, motor_id: u8, kind: u8, register: u8, raw: [u8; 4]) -> CanFrame {
    let [lo, hi] = u16::from(motor_id).to_le_bytes();
    let [a, b, c, d] = raw;
    frame(master_id, [lo, hi, kind, register, a, b, c, d])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    Feedback(RawFeedback),
    Register(RegisterReply),
    Unrecognised,
}

/// Decide whether an 8-byte payload is a register reply or a feedback frame.
///
/// A register reply needs a register type byte at offset 2 and an id in bytes 0..2 that
/// belongs to a known motor. Everything else 8 bytes long is treated as feedback.
pub fn classify(data: &[u8], is_known: impl Fn(u16) -> bool) -> Inbound {
    if let Some(reply) = RegisterReply::parse(data) {
        if is_known(reply.motor_id) {
            return Inbound::Register(reply);
        }
    }
    match RawFeedback::parse(data) {
        Some(raw) => Inbound::Feedback(raw),
        None => Inbound::Unrecognised,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits {
        pmax: 12.5,
        vmax: 30.0,
        tmax: 10.0,
    };

    #[test]
    fn enable_goes_to_mode_address() {
        let f = op_frame(0x03, ControlMode::PosVel, MotorOp::Enable);
        assert_eq!(f.id.raw(), 0x103);
        assert_eq!(f.payload(), &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC]);
        assert_eq!(op_frame(0x01, ControlMode::Mit, MotorOp::ClearError).data[7], 0xFB);
        assert_eq!(op_frame(0x02, ControlMode::Vel, MotorOp::SetZero).id.raw(), 0x202);
    }

    #[test]
    fn mit_zero_setpoint_is_mid_scale() {
        let f = mit_frame(0x01, &LIMITS, &MitCommand::default());
        assert_eq!(f.id.raw(), 0x001);
        // p=0x7FFF v=0x7FF kp=0 kd=0 t=0x7FF
        assert_eq!(f.payload(), &[0x7F, 0xFF, 0x7F, 0xF0, 0x00, 0x00, 0x07, 0xFF]);
    }

    #[test]
    fn mit_pack_survives_parse() {
        let cmd = MitCommand {
            position: 1.25,
            velocity: -3.0,
            kp: 20.0,
            kd: 1.5,
            torque: 0.5,
        };
        let f = mit_frame(0x02, &LIMITS, &cmd);
        let back = parse_mit(f.payload(), &LIMITS).unwrap();
        assert!((back.position - cmd.position).abs() < 25.0 / 65535.0 * 1.01);
        assert!((back.velocity - cmd.velocity).abs() < 60.0 / 4095.0 * 1.01);
        assert!((back.kp - cmd.kp).abs() < 50.0 / 4095.0 * 1.01);
        assert!((back.kd - cmd.kd).abs() < 5.0 / 4095.0 * 1.01);
        assert!((back.torque - cmd.torque).abs() < 20.0 / 4095.0 * 1.01);
    }

    #[test]
    fn pos_vel_uses_little_endian_floats() {
        let f = pos_vel_frame(0x01, 1.0, 2.0);
        assert_eq!(f.id.raw(), 0x101);
        assert_eq!(&f.data[..4], &1.0f32.to_le_bytes());
        assert_eq!(&f.data[4..], &2.0f32.to_le_bytes());
        let v = vel_frame(0x01, -0.5);
        assert_eq!(v.id.raw(), 0x201);
        assert_eq!(v.payload(), &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn register_frames_target_broadcast_address() {
        let read = read_register_frame(0x12, crate::registers::PMAX);
        assert_eq!(read.id.raw(), 0x7FF);
        assert_eq!(read.payload(), &[0x12, 0x00, 0x33, 21, 0, 0, 0, 0]);

        let write = write_register_frame(0x12, crate::registers::CTRL_MODE, RegisterValue::UInt(2));
        assert_eq!(write.payload(), &[0x12, 0x00, 0x55, 10, 2, 0, 0, 0]);

        assert_eq!(save_frame(0x12).payload(), &[0x12, 0x00, 0xAA, 0x01, 0, 0, 0, 0]);
        assert_eq!(refresh_frame(0x12).payload(), &[0x12, 0x00, 0xCC, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn feedback_parses_nibbles_and_fields() {
        let state = Feedback {
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
        };
        let f = feedback_frame(0x11, 0x03, STATUS_ENABLED, &LIMITS, &state, (35, 41));
        assert_eq!(f.id.raw(), 0x11);
        let raw = RawFeedback::parse(f.payload()).unwrap();
        assert_eq!(raw.motor_id, 3);
        assert_eq!(raw.status, 1);
        assert_eq!(raw.position, 0x7FFF);
        assert_eq!(raw.velocity, 0x7FF);
        assert_eq!(raw.torque, 0x7FF);
        assert_eq!((raw.temp_mos, raw.temp_rotor), (35, 41));
        assert_eq!(raw.to_bytes(), f.data);
        let scaled = raw.scale(&LIMITS);
        assert!(scaled.position.abs() < 0.001);
    }

    #[test]
    fn classification_prefers_known_register_replies() {
        let reply = register_reply_frame(0x11, 0x01, REG_READ, 21, 12.5f32.to_le_bytes());
        match classify(reply.payload(), |id| id == 1) {
            Inbound::Register(r) => {
                assert_eq!(r.motor_id, 1);
                assert_eq!(r.register, 21);
                assert_eq!(f32::from_le_bytes(r.raw), 12.5);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Same bytes with an unknown id fall back to feedback parsing.
        assert!(matches!(classify(reply.payload(), |_| false), Inbound::Feedback(_)));
        assert_eq!(classify(&[1, 2, 3], |_| true), Inbound::Unrecognised);
    }

    #[test]
    fn control_address_splits_back() {
        assert_eq!(ControlMode::split_address(0x105), Some((ControlMode::PosVel, 5)));
        assert_eq!(ControlMode::split_address(0x7FF), None);
        assert_eq!(ControlMode::from_register(ControlMode::Vel.register_value()), Some(ControlMode::Vel));
    }
}
