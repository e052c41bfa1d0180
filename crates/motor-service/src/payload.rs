//! Host-side payload layouts for the motor command groups.
//!
//! Floats are big-endian. Angles travel in degrees and velocities in deg/s; the CAN side
//! works in rad and rad/s.

use crate::error::{Result, ServiceError};
use frame_protocol::be;
use motor_registry::{MitCommand, Motor};

/// Bytes per motor in a `MOTOR_GET_ALL` response after the leading count byte.
pub const MOTOR_RECORD_LEN: usize = 18;

/// Cursor over a request payload.
pub struct Args<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Args<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.at)
            .ok_or(ServiceError::BadPayload("payload too short"))?;
        self.at += 1;
        Ok(b)
    }

    pub fn f32(&mut self) -> Result<f32> {
        let v = be::f32_at(self.buf, self.at).ok_or(ServiceError::BadPayload("payload too short"))?;
        if !v.is_finite() {
            return Err(ServiceError::BadPayload("non-finite float"));
        }
        self.at += 4;
        Ok(v)
    }

    /// An angle in degrees, returned in rad.
    pub fn angle(&mut self) -> Result<f32> {
        Ok(self.f32()?.to_radians())
    }
}

pub fn mit_command(args: &mut Args<'_>) -> Result<MitCommand> {
    Ok(MitCommand {
        position: args.angle()?,
        velocity: args.angle()?,
        kp: args.f32()?,
        kd: args.f32()?,
        torque: args.f32()?,
    })
}

/// `[id][position deg]`
pub fn position_reply(can_id: u8, position_rad: f32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(can_id);
    be::put_f32(&mut out, position_rad.to_degrees());
    out
}

/// `[id][enabled][online][error][pos deg][vel deg/s][torque N·m][temp_mos][temp_rotor]`
pub fn motor_record(out: &mut Vec<u8>, m: &Motor) {
    out.push(m.can_id);
    out.push(u8::from(m.enabled));
    out.push(u8::from(m.online));
    out.push(m.error_code);
    be::put_f32(out, m.position.to_degrees());
    be::put_f32(out, m.velocity.to_degrees());
    be::put_f32(out, m.torque);
    out.push(m.temp_mos);
    out.push(m.temp_rotor);
}

/// `[count]` followed by one record per motor, ordered by id.
pub fn all_motors(motors: &[Motor]) -> Vec<u8> {
    let shown = &motors[..motors.len().min(usize::from(u8::MAX))];
    let mut out = Vec::with_capacity(1 + shown.len() * MOTOR_RECORD_LEN);
    out.push(shown.len() as u8);
    for m in shown {
        motor_record(&mut out, m);
    }
    out
}
