//! TFTP wire format (RFC 1350) with option extension (RFC 2347)

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short")]
    Truncated,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("string field is not terminated")]
    Unterminated,

    #[error("string field is not valid UTF-8")]
    InvalidString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    OptionRejected = 8,
}

impl ErrorCode {
    fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            8 => ErrorCode::OptionRejected,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Read or write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: String,
    /// Option names lowercased, in request order
    pub options: Vec<(String, String)>,
}

impl Request {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Both transfer modes are served byte-for-byte
    pub fn mode_supported(&self) -> bool {
        self.mode.eq_ignore_ascii_case("octet") || self.mode.eq_ignore_ascii_case("netascii")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Read(Request),
    Write(Request),
    Data { block: u16, data: Vec<u8> },
    Ack(u16),
    Error { code: ErrorCode, message: String },
    OptionAck(Vec<(String, String)>),
}

fn take_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, PacketError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated)?;
    let s = std::str::from_utf8(&buf[..end]).map_err(|_| PacketError::InvalidString)?;
    *buf = &buf[end + 1..];
    Ok(s)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, PacketError> {
    if buf.len() < 2 {
        return Err(PacketError::Truncated);
    }
    let value = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(value)
}

fn parse_request(mut buf: &[u8]) -> Result<Request, PacketError> {
    let filename = take_string(&mut buf)?.to_string();
    let mode = take_string(&mut buf)?.to_string();

    let mut options = Vec::new();
    while !buf.is_empty() {
        let name = take_string(&mut buf)?.to_ascii_lowercase();
        let value = take_string(&mut buf)?.to_string();
        options.push((name, value));
    }

    Ok(Request {
        filename,
        mode,
        options,
    })
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

impl Packet {
    pub fn parse(mut buf: &[u8]) -> Result<Self, PacketError> {
        let opcode = take_u16(&mut buf)?;
        match opcode {
            OP_RRQ => Ok(Packet::Read(parse_request(buf)?)),
            OP_WRQ => Ok(Packet::Write(parse_request(buf)?)),
            OP_DATA => {
                let block = take_u16(&mut buf)?;
                Ok(Packet::Data {
                    block,
                    data: buf.to_vec(),
                })
            }
            OP_ACK => Ok(Packet::Ack(take_u16(&mut buf)?)),
            OP_ERROR => {
                let code = ErrorCode::from_u16(take_u16(&mut buf)?);
                // some clients omit the terminator
                let message = match take_string(&mut buf) {
                    Ok(message) => message.to_string(),
                    Err(_) => String::from_utf8_lossy(buf).into_owned(),
                };
                Ok(Packet::Error { code, message })
            }
            OP_OACK => {
                let mut options = Vec::new();
                while !buf.is_empty() {
                    let name = take_string(&mut buf)?.to_ascii_lowercase();
                    let value = take_string(&mut buf)?.to_string();
                    options.push((name, value));
                }
                Ok(Packet::OptionAck(options))
            }
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        match self {
            Packet::Read(request) | Packet::Write(request) => {
                let opcode = if matches!(self, Packet::Read(_)) {
                    OP_RRQ
                } else {
                    OP_WRQ
                };
                out.extend_from_slice(&opcode.to_be_bytes());
                put_string(&mut out, &request.filename);
                put_string(&mut out, &request.mode);
                for (name, value) in &request.options {
                    put_string(&mut out, name);
                    put_string(&mut out, value);
                }
            }
            Packet::Data { block, data } => {
                out.reserve(data.len());
                out.extend_from_slice(&OP_DATA.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack(block) => {
                out.extend_from_slice(&OP_ACK.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&OP_ERROR.to_be_bytes());
                out.extend_from_slice(&(*code as u16).to_be_bytes());
                put_string(&mut out, message);
            }
            Packet::OptionAck(options) => {
                out.extend_from_slice(&OP_OACK.to_be_bytes());
                for (name, value) in options {
                    put_string(&mut out, name);
                    put_string(&mut out, value);
                }
            }
        }
        out
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}

/// Negotiated transfer parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: usize,
    pub timeout: Duration,
    /// Options to confirm in an OACK; empty means no OACK is sent
    pub acknowledged: Vec<(String, String)>,
}

impl fmt::Display for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blksize={} timeout={}s",
            self.block_size,
            self.timeout.as_secs()
        )
    }
}

impl TransferOptions {
    /// Accept the options we understand with in-range values; everything
    /// else is silently dropped.
    pub fn negotiate(request: &Request, size: u64) -> Self {
        let mut options = TransferOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            acknowledged: Vec::new(),
        };

        for (name, value) in &request.options {
            match name.as_str() {
                "blksize" => {
                    if let Ok(size) = value.parse::<usize>() {
                        if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                            options.block_size = size;
                            options.acknowledged.push((name.clone(), size.to_string()));
                        }
                    }
                }
                "timeout" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        if (1..=255).contains(&secs) {
                            options.timeout = Duration::from_secs(secs);
                            options.acknowledged.push((name.clone(), secs.to_string()));
                        }
                    }
                }
                "tsize" => options.acknowledged.push((name.clone(), size.to_string())),
                _ => {}
            }
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrq(options: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = vec![0, 1];
        buf.extend_from_slice(b"efi/aa-bb-cc-dd-ee-ff/grub.cfg\0octet\0");
        for (name, value) in options {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn test_parse_read_request() {
        let packet = Packet::parse(&rrq(&[("BLKSIZE", "1428"), ("tsize", "0")])).unwrap();
        let Packet::Read(request) = packet else {
            panic!("expected read request");
        };
        assert_eq!(request.filename, "efi/aa-bb-cc-dd-ee-ff/grub.cfg");
        assert!(request.mode_supported());
        assert_eq!(request.option("blksize"), Some("1428"));
        assert_eq!(request.option("tsize"), Some("0"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Packet::parse(&[0]), Err(PacketError::Truncated));
        assert_eq!(Packet::parse(&[0, 9, 1]), Err(PacketError::UnknownOpcode(9)));
        assert_eq!(
            Packet::parse(b"\x00\x01file-without-terminator"),
            Err(PacketError::Unterminated)
        );
    }

    #[test]
    fn test_encode_data_and_error() {
        let data = Packet::Data {
            block: 258,
            data: b"abc".to_vec(),
        };
        assert_eq!(data.encode(), vec![0, 3, 1, 2, b'a', b'b', b'c']);

        let err = Packet::error(ErrorCode::AccessViolation, "writing not supported");
        let encoded = err.encode();
        assert_eq!(&encoded[..4], &[0, 5, 0, 2]);
        assert_eq!(encoded.last(), Some(&0));
        assert_eq!(Packet::parse(&encoded).unwrap(), err);
    }

    #[test]
    fn test_negotiate_options() {
        let Packet::Read(request) =
            Packet::parse(&rrq(&[("blksize", "1428"), ("tsize", "0"), ("timeout", "3")])).unwrap()
        else {
            panic!("expected read request");
        };

        let options = TransferOptions::negotiate(&request, 4096);
        assert_eq!(options.block_size, 1428);
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert_eq!(
            options.acknowledged,
            vec![
                ("blksize".to_string(), "1428".to_string()),
                ("tsize".to_string(), "4096".to_string()),
                ("timeout".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_negotiate_ignores_out_of_range() {
        let Packet::Read(request) = Packet::parse(&rrq(&[
            ("blksize", "4"),
            ("timeout", "0"),
            ("windowsize", "4"),
        ]))
        .unwrap() else {
            panic!("expected read request");
        };

        let options = TransferOptions::negotiate(&request, 10);
        assert_eq!(options.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert!(options.acknowledged.is_empty());

        let Packet::Read(request) = Packet::parse(&rrq(&[("blksize", "65465")])).unwrap() else {
            panic!("expected read request");
        };
        assert_eq!(TransferOptions::negotiate(&request, 10).block_size, DEFAULT_BLOCK_SIZE);
    }
}
