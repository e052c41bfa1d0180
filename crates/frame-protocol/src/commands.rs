//! Command code space. The high byte of a code selects its group.

pub const SYS_PING: u16 = 0x0001;
pub const SYS_VERSION: u16 = 0x0002;
pub const SYS_RESET: u16 = 0x0003;
pub const SYS_SLEEP: u16 = 0x0004;
pub const SYS_WAKEUP: u16 = 0x0005;
pub const SYS_SET_RTC: u16 = 0x0010;
pub const SYS_GET_RTC: u16 = 0x0011;
pub const SYS_TEMP_CTRL: u16 = 0x0020;

pub const QUERY_POWER: u16 = 0x0101;
pub const QUERY_STATUS: u16 = 0x0102;
pub const QUERY_NETWORK: u16 = 0x0103;

pub const MOTOR_ROTATE: u16 = 0x3001;
pub const MOTOR_ENABLE: u16 = 0x3002;
pub const MOTOR_DISABLE: u16 = 0x3003;
pub const MOTOR_STOP: u16 = 0x3004;
pub const MOTOR_SET_ORIGIN: u16 = 0x3005;
pub const MOTOR_GET_POS: u16 = 0x3006;
pub const MOTOR_SET_VEL: u16 = 0x3007;
pub const MOTOR_ROTATE_REL: u16 = 0x3008;
pub const MOTOR_MIT: u16 = 0x3009;
pub const MOTOR_CLEAR_ERROR: u16 = 0x300A;
pub const MOTOR_SET_MODE: u16 = 0x300B;
pub const MOTOR_GET_ALL: u16 = 0x3010;

/// Motor id addressing every registered motor (STOP only).
pub const MOTOR_ID_ALL: u8 = 0xFF;
/// NOTIFY `[id][online][error]`
pub const MOTOR_STATE_CHANGED: u16 = 0x3020;

pub const MOTOR_READ_REG: u16 = 0x3101;
pub const MOTOR_WRITE_REG: u16 = 0x3102;
pub const MOTOR_SAVE_PARAMS: u16 = 0x3103;
pub const MOTOR_REFRESH: u16 = 0x3104;

pub const SENSOR_READ_TEMP: u16 = 0x4001;
pub const SENSOR_READ_ALL: u16 = 0x4002;
pub const SENSOR_CONFIG: u16 = 0x4010;

pub const DEVICE_HEATER: u16 = 0x5001;
pub const DEVICE_FAN: u16 = 0x5002;
pub const DEVICE_LED: u16 = 0x5003;
pub const DEVICE_LASER: u16 = 0x5004;
pub const DEVICE_PWM_LIGHT: u16 = 0x5005;
pub const DEVICE_GET_STATE: u16 = 0x5010;

pub const DEBUG_METRICS: u16 = 0xF001;

/// Status provider names queried by the built-in aggregate commands.
pub mod providers {
    pub const SENSORS: &str = "sensors";
    pub const MOTORS: &str = "motors";
    pub const POWER: &str = "power";
    pub const STATUS: &str = "status";
    pub const NETWORK: &str = "network";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandGroup {
    System,
    Query,
    Motor,
    MotorRegister,
    Sensor,
    Device,
    Config,
    Debug,
    Other(u8),
}

impl CommandGroup {
    pub fn of(command: u16) -> Self {
        match (command >> 8) as u8 {
            0x00 => CommandGroup::System,
            0x01 => CommandGroup::Query,
            0x30 => CommandGroup::Motor,
            0x31 => CommandGroup::MotorRegister,
            0x40 => CommandGroup::Sensor,
            0x50 => CommandGroup::Device,
            0x60 => CommandGroup::Config,
            0xF0 => CommandGroup::Debug,
            other => CommandGroup::Other(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandGroup::System => "system",
            CommandGroup::Query => "query",
            CommandGroup::Motor => "motor",
            CommandGroup::MotorRegister => "motor_register",
            CommandGroup::Sensor => "sensor",
            CommandGroup::Device => "device",
            CommandGroup::Config => "config",
            CommandGroup::Debug => "debug",
            CommandGroup::Other(_) => "other",
        }
    }
}
