//! CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF, no final xor).

const POLY: u16 = 0xA001;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC state, for checksumming a header and payload held in separate buffers.
#[derive(Clone, Copy, Debug)]
pub struct Crc16 {
    value: u16,
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc16 {
    pub const fn new() -> Self {
        Self { value: 0xFFFF }
    }

    pub fn update(mut self, bytes: &[u8]) -> Self {
        for &b in bytes {
            let idx = usize::from((self.value ^ u16::from(b)) & 0x00FF);
            self.value = (self.value >> 8) ^ TABLE[idx];
        }
        self
    }

    pub fn finish(self) -> u16 {
        self.value
    }
}

pub fn crc16_modbus(bytes: &[u8]) -> u16 {
    Crc16::new().update(bytes).finish()
}
