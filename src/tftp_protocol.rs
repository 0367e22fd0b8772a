use anyhow::{Result, anyhow};

/// TFTP opcodes per RFC 1350.
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Data payload per DATA packet (RFC 1350). A payload shorter than this
/// marks the last block of a transfer.
pub const BLOCK_SIZE: usize = 512;

/// Maximum datagram this server ever sends or accepts: 4-byte header plus
/// one full block.
pub const MAX_PACKET: usize = 4 + BLOCK_SIZE;

/// The only mode this server supports. Mode comparison is case-insensitive
/// on the wire but compares against this lowercase form.
pub const OCTET_MODE: &str = "octet";

/// Error codes defined by RFC 1350 §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block_num: u16, data: Vec<u8> },
    ACK { block_num: u16 },
    ERROR { code: u16, msg: String },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(anyhow!("packet too short"));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            _ => Err(anyhow!("unknown opcode {opcode}")),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ { filename, mode } => encode_request(OPCODE_RRQ, filename, mode),
            Packet::WRQ { filename, mode } => encode_request(OPCODE_WRQ, filename, mode),
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
        }
    }

    /// Build an ERROR packet from a named error code.
    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        Packet::ERROR {
            code: code.code(),
            msg: msg.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

/// Parse RRQ / WRQ: 2-byte opcode | filename\0 | mode\0
fn parse_request(buf: &[u8], is_rrq: bool) -> Result<Packet> {
    let payload = &buf[2..];
    let mut fields = payload.splitn(3, |&b| b == 0);

    let filename = fields.next().ok_or_else(|| anyhow!("missing filename"))?;
    let mode = fields.next().ok_or_else(|| anyhow!("missing mode"))?;

    let filename = String::from_utf8(filename.to_vec())?;
    let mode = String::from_utf8(mode.to_vec())?.to_ascii_lowercase();

    if filename.is_empty() {
        return Err(anyhow!("empty filename"));
    }

    if is_rrq {
        Ok(Packet::RRQ { filename, mode })
    } else {
        Ok(Packet::WRQ { filename, mode })
    }
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0..N bytes
fn parse_data(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("DATA packet too short"));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    let data = buf[4..].to_vec();
    Ok(Packet::DATA { block_num, data })
}

/// Parse ACK: 2-byte opcode | 2-byte block#
fn parse_ack(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("ACK packet too short"));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block_num })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0
fn parse_error(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 5 {
        return Err(anyhow!("ERROR packet too short"));
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(msg_bytes.len());
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

fn encode_request(opcode: u16, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

/// Circular block-number comparison: true if `a` is strictly ahead of `b`,
/// treating the u16 space as wrapping at 65536 (RFC 1350 block numbers wrap
/// 65535 -> 0). Assumes the two never differ by more than half the space,
/// which always holds for a single lock-step transfer.
pub fn seq_after(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rrq() {
        let pkt = Packet::RRQ {
            filename: "hello.txt".into(),
            mode: "octet".into(),
        };
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        match parsed {
            Packet::RRQ { filename, mode } => {
                assert_eq!(filename, "hello.txt");
                assert_eq!(mode, "octet");
            }
            _ => panic!("expected RRQ"),
        }
    }

    #[test]
    fn round_trip_wrq() {
        let pkt = Packet::WRQ {
            filename: "upload.bin".into(),
            mode: "OCTET".into(),
        };
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        match parsed {
            Packet::WRQ { filename, mode } => {
                assert_eq!(filename, "upload.bin");
                // mode is lowercased on parse, not on encode.
                assert_eq!(mode, "OCTET");
            }
            _ => panic!("expected WRQ"),
        }
    }

    #[test]
    fn round_trip_data() {
        let pkt = Packet::DATA {
            block_num: 42,
            data: vec![1, 2, 3],
        };
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        match parsed {
            Packet::DATA { block_num, data } => {
                assert_eq!(block_num, 42);
                assert_eq!(data, vec![1, 2, 3]);
            }
            _ => panic!("expected DATA"),
        }
    }

    #[test]
    fn round_trip_ack() {
        let pkt = Packet::ACK { block_num: 7 };
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        match parsed {
            Packet::ACK { block_num } => assert_eq!(block_num, 7),
            _ => panic!("expected ACK"),
        }
    }

    #[test]
    fn round_trip_error() {
        let pkt = Packet::error(ErrorCode::FileNotFound, "File not found");
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        match parsed {
            Packet::ERROR { code, msg } => {
                assert_eq!(code, 1);
                assert_eq!(msg, "File not found");
            }
            _ => panic!("expected ERROR"),
        }
    }

    #[test]
    fn mode_is_lowercased_on_parse() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"f.bin\0NetASCII\0");
        let parsed = Packet::from_bytes(&buf).unwrap();
        match parsed {
            Packet::RRQ { mode, .. } => assert_eq!(mode, "netascii"),
            _ => panic!("expected RRQ"),
        }
    }

    #[test]
    fn unknown_opcode_errors() {
        let buf = 99u16.to_be_bytes();
        assert!(Packet::from_bytes(&buf).is_err());
    }

    #[test]
    fn seq_after_handles_rollover() {
        assert!(seq_after(0, 65535));
        assert!(seq_after(1, 65535));
        assert!(!seq_after(5, 5));
        assert!(seq_after(6, 5));
        assert!(!seq_after(65535, 0));
    }
}
