use core::fmt;
use time::OffsetDateTime;

/// Highest 11-bit identifier; servo register traffic is addressed here.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= MAX_STANDARD_ID {
            Some(Self {
                raw: u32::from(id11),
                extended: false,
            })
        } else {
            None
        }
    }

    /// Standard id from the low 11 bits of `id`.
    pub fn standard_masked(id: u16) -> Self {
        Self {
            raw: u32::from(id & MAX_STANDARD_ID),
            extended: false,
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Picks the narrowest representation that fits `raw`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match u16::try_from(raw) {
            Ok(id11) if id11 <= MAX_STANDARD_ID => Self::standard(id11),
            _ => Self::extended(raw),
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN data frame (8 bytes max)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    /// Shorthand for an 11-bit data frame.
    pub fn standard(id11: u16, data: &[u8]) -> Option<Self> {
        Self::new(CanId::standard(id11)?, data)
    }

    /// The valid bytes of the frame, `len` long.
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len.min(8))]
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.len)?;
        for b in self.payload() {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
}

impl CanFilter {
    pub fn matches(&self, id: CanId) -> bool {
        id.is_extended() == self.id.is_extended()
            && (id.raw() & self.mask) == (self.id.raw() & self.mask)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}
