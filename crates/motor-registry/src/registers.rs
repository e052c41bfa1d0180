//! Servo parameter address space.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Float,
    UInt32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub address: u8,
    pub name: &'static str,
    pub value_type: ValueType,
    pub writable: bool,
}

const fn rw_f(address: u8, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, name, value_type: ValueType::Float, writable: true }
}
const fn ro_f(address: u8, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, name, value_type: ValueType::Float, writable: false }
}
const fn rw_u(address: u8, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, name, value_type: ValueType::UInt32, writable: true }
}
const fn ro_u(address: u8, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, name, value_type: ValueType::UInt32, writable: false }
}

pub const UV_VALUE: u8 = 0;
pub const KT_VALUE: u8 = 1;
pub const OT_VALUE: u8 = 2;
pub const OC_VALUE: u8 = 3;
pub const ACC: u8 = 4;
pub const DEC: u8 = 5;
pub const MAX_SPD: u8 = 6;
pub const MST_ID: u8 = 7;
pub const ESC_ID: u8 = 8;
pub const TIMEOUT: u8 = 9;
pub const CTRL_MODE: u8 = 10;
pub const PMAX: u8 = 21;
pub const VMAX: u8 = 22;
pub const TMAX: u8 = 23;
pub const CAN_BR: u8 = 35;
pub const POS_MECH: u8 = 80;
pub const POS_OUT: u8 = 81;

pub static REGISTERS: &[RegisterDescriptor] = &[
    rw_f(UV_VALUE, "UV_Value"),
    rw_f(KT_VALUE, "KT_Value"),
    rw_f(OT_VALUE, "OT_Value"),
    rw_f(OC_VALUE, "OC_Value"),
    rw_f(ACC, "ACC"),
    rw_f(DEC, "DEC"),
    rw_f(MAX_SPD, "MAX_SPD"),
    rw_u(MST_ID, "MST_ID"),
    rw_u(ESC_ID, "ESC_ID"),
    rw_u(TIMEOUT, "TIMEOUT"),
    rw_u(CTRL_MODE, "CTRL_MODE"),
    ro_f(11, "Damp"),
    ro_f(12, "Inertia"),
    ro_u(13, "hw_ver"),
    ro_u(14, "sw_ver"),
    ro_u(15, "SN"),
    ro_u(16, "NPP"),
    ro_f(17, "Rs"),
    ro_f(18, "LS"),
    ro_f(19, "Flux"),
    ro_f(20, "Gr"),
    rw_f(PMAX, "PMAX"),
    rw_f(VMAX, "VMAX"),
    rw_f(TMAX, "TMAX"),
    rw_f(24, "I_BW"),
    rw_f(25, "KP_ASR"),
    rw_f(26, "KI_ASR"),
    rw_f(27, "KP_APR"),
    rw_f(28, "KI_APR"),
    rw_f(29, "OV_Value"),
    rw_f(30, "GREF"),
    rw_f(31, "Deta"),
    rw_f(32, "V_BW"),
    rw_f(33, "IQ_c1"),
    rw_f(34, "VL_c1"),
    rw_u(CAN_BR, "can_br"),
    ro_u(36, "sub_ver"),
    ro_f(50, "u_off"),
    ro_f(51, "v_off"),
    ro_f(52, "k1"),
    ro_f(53, "k2"),
    ro_f(54, "m_off"),
    ro_f(55, "dir"),
    ro_f(POS_MECH, "p_m"),
    ro_f(POS_OUT, "xout"),
];

pub fn lookup(address: u8) -> Option<&'static RegisterDescriptor> {
    REGISTERS.iter().find(|r| r.address == address)
}

/// A register value in its native representation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegisterValue {
    Float(f32),
    UInt(u32),
}

impl RegisterValue {
    /// Decode four little-endian bytes as the descriptor's type.
    pub fn from_le(desc: &RegisterDescriptor, raw: [u8; 4]) -> Self {
        match desc.value_type {
            ValueType::Float => RegisterValue::Float(f32::from_le_bytes(raw)),
            ValueType::UInt32 => RegisterValue::UInt(u32::from_le_bytes(raw)),
        }
    }

    /// Interpret a host-supplied float as the descriptor's type.
    ///
    /// Integer registers accept only finite, non-negative values and round to nearest.
    pub fn from_f32(desc: &RegisterDescriptor, value: f32) -> Option<Self> {
        match desc.value_type {
            ValueType::Float => value.is_finite().then_some(RegisterValue::Float(value)),
            ValueType::UInt32 => (value.is_finite() && value >= 0.0 && value <= u32::MAX as f32)
                .then(|| RegisterValue::UInt(value.round() as u32)),
        }
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        match self {
            RegisterValue::Float(v) => v.to_le_bytes(),
            RegisterValue::UInt(v) => v.to_le_bytes(),
        }
    }

    pub fn as_f32(self) -> f32 {
        match self {
            RegisterValue::Float(v) => v,
            RegisterValue::UInt(v) => v as f32,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            RegisterValue::Float(v) => v.max(0.0) as u32,
            RegisterValue::UInt(v) => v,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Float(v) => write!(f, "{v}"),
            RegisterValue::UInt(v) => write!(f, "{v}"),
        }
    }
}
