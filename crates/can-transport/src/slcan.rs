use crate::{BusInfo, CanBus, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, trace};

const BEL: u8 = 0x07;

/// SLCAN (Lawicel) text protocol over a USB serial adapter.
pub struct SlcanBus {
    port_path: String,
    port: Box<dyn SerialPort>,
    // Bytes received past the last `\r`; a frame may straddle two reads.
    pending: Vec<u8>,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: SlcanBitrate) -> Result<Self> {
        let mut port = serialport::new(path, 115_200)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::NotFound(path.into()),
                _ => TransportError::Io(e.to_string()),
            })?;
        // Close any session left open, select the bitrate, reopen.
        let _ = write_cmd(&mut *port, b"C\r");
        write_cmd(&mut *port, &[b'S', bitrate.code(), b'\r'])?;
        write_cmd(&mut *port, b"O\r")?;
        debug!(path, ?bitrate, "slcan channel opened");
        Ok(SlcanBus {
            port_path: path.to_string(),
            port,
            pending: Vec::with_capacity(64),
        })
    }

    pub fn path(&self) -> &str {
        &self.port_path
    }

    /// Next complete line and whether it ended in BEL (adapter error) rather than `\r`.
    fn take_line(&mut self) -> Option<(Vec<u8>, bool)> {
        let pos = self.pending.iter().position(|&b| b == b'\r' || b == BEL)?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        let bel = line.pop() == Some(BEL);
        Some((line, bel))
    }
}

fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
    port.write_all(cmd)
        .map_err(|e| TransportError::Io(e.to_string()))
}

pub(crate) fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
    if frame.len > 8 {
        return Err(TransportError::InvalidFrame("dlc > 8"));
    }
    let mut out = Vec::with_capacity(28);
    let head = match (frame.id.is_extended(), frame.rtr) {
        (false, false) => b't',
        (false, true) => b'r',
        (true, false) => b'T',
        (true, true) => b'R',
    };
    out.push(head);
    let id = if frame.id.is_extended() {
        format!("{:08X}", frame.id.raw())
    } else {
        format!("{:03X}", frame.id.raw())
    };
    out.extend_from_slice(id.as_bytes());
    out.push(b'0' + frame.len);
    if !frame.rtr {
        for b in frame.payload() {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
    }
    out.push(b'\r');
    Ok(out)
}

fn hex(field: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(field).map_err(|_| TransportError::InvalidFrame("utf8"))?;
    u32::from_str_radix(text, 16).map_err(|_| TransportError::InvalidFrame("hex"))
}

pub(crate) fn parse_frame(line: &[u8]) -> Result<CanFrame> {
    let (&kind, rest) = line
        .split_first()
        .ok_or(TransportError::InvalidFrame("empty"))?;
    let (id_digits, rtr) = match kind {
        b't' => (3, false),
        b'r' => (3, true),
        b'T' => (8, false),
        b'R' => (8, true),
        _ => return Err(TransportError::InvalidFrame("unknown header")),
    };
    if rest.len() < id_digits + 1 {
        return Err(TransportError::InvalidFrame("short header"));
    }
    let raw = hex(&rest[..id_digits])?;
    let id = if id_digits == 3 {
        u16::try_from(raw).ok().and_then(CanId::standard)
    } else {
        CanId::extended(raw)
    }
    .ok_or(TransportError::InvalidFrame("id range"))?;

    let dlc = rest[id_digits].wrapping_sub(b'0');
    if dlc > 8 {
        return Err(TransportError::InvalidFrame("dlc > 8"));
    }
    let body = &rest[id_digits + 1..];
    let mut data = [0u8; 8];
    if !rtr {
        if body.len() < usize::from(dlc) * 2 {
            return Err(TransportError::InvalidFrame("short data"));
        }
        for (i, pair) in body.chunks_exact(2).take(usize::from(dlc)).enumerate() {
            data[i] = hex(pair)? as u8;
        }
    }
    Ok(CanFrame {
        id,
        len: dlc,
        data,
        rtr,
        timestamp: None,
    }
    .stamped())
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self> {
        Self::open_with(path, SlcanBitrate::B1M)
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| BusInfo {
                driver: match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial".to_string(),
                    _ => "serial".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        if let Some(ms) = timeout_ms {
            self.port
                .set_timeout(Duration::from_millis(ms.max(1)))
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        let mut buf = [0u8; 128];
        loop {
            while let Some((line, bel)) = self.take_line() {
                if bel {
                    return Err(TransportError::AdapterError);
                }
                // Bare `\r`, `z` and `Z` acknowledge a transmit.
                if line.is_empty() || line == b"z" || line == b"Z" {
                    continue;
                }
                trace!(line = %String::from_utf8_lossy(&line), "slcan rx");
                return parse_frame(&line);
            }
            match self.port.read(&mut buf) {
                Ok(0) => return Err(TransportError::Timeout),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(TransportError::Timeout),
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let line = encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

impl FromStr for SlcanBitrate {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "10k" => SlcanBitrate::B10k,
            "20k" => SlcanBitrate::B20k,
            "50k" => SlcanBitrate::B50k,
            "100k" => SlcanBitrate::B100k,
            "125k" => SlcanBitrate::B125k,
            "250k" => SlcanBitrate::B250k,
            "500k" => SlcanBitrate::B500k,
            "800k" => SlcanBitrate::B800k,
            "1m" | "1000k" => SlcanBitrate::B1M,
            _ => return Err(TransportError::Unsupported("unknown slcan bitrate")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_standard_frame() -> anyhow::Result<()> {
        let frame = CanFrame::standard(0x7FF, &[0x01, 0x00, 0x33, 0x15])
            .ok_or(TransportError::InvalidFrame("len"))?;
        assert_eq!(encode_frame(&frame)?, b"t7FF401003315\r".to_vec());
        Ok(())
    }

    #[test]
    fn parses_extended_frame() -> anyhow::Result<()> {
        let frame = parse_frame(b"T1234567820AFF")?;
        assert!(frame.id.is_extended());
        assert_eq!(frame.id.raw(), 0x1234_5678);
        assert_eq!(frame.payload(), &[0x0A, 0xFF]);
        Ok(())
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(matches!(
            parse_frame(b"t101801"),
            Err(TransportError::InvalidFrame("short data"))
        ));
        assert!(parse_frame(b"x").is_err());
    }

    #[test]
    fn parse_inverts_encode() -> anyhow::Result<()> {
        let frame = CanFrame::standard(0x011, &[0x11, 0x7F, 0xFF, 0x80, 0x00, 0x80, 0x19, 0x1A])
            .ok_or(TransportError::InvalidFrame("len"))?;
        let mut line = encode_frame(&frame)?;
        line.pop();
        let back = parse_frame(&line)?;
        assert_eq!(back.id, frame.id);
        assert_eq!(back.payload(), frame.payload());
        Ok(())
    }

    #[test]
    fn bitrate_names() {
        assert_eq!("1M".parse::<SlcanBitrate>().ok(), Some(SlcanBitrate::B1M));
        assert_eq!("500k".parse::<SlcanBitrate>().ok(), Some(SlcanBitrate::B500k));
        assert!("9600".parse::<SlcanBitrate>().is_err());
    }
}
