//! Wire framing of the board protocol.
//!
//! Commands are an opcode byte followed by an escaped body:
//!
//! * GET: `'G' addr_lo addr_hi length`
//! * SET: `'S' addr_lo addr_hi length payload..`
//!
//! A GET is answered with `payload.. ACK` (or NACK), a SET with a single ACK or NACK.
//! Reserved octets inside a body are sent as `ESC, byte ^ ESC ^ 0x55`.
//!
//! Everything in here is pure, the link module does the I/O.

use strum_macros::EnumIter;

use crate::error::{Error, ProtocolError, Result};

/// Reserved octets of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum ControlByte {
    Escape = 0x1B,
    /// `'X'`
    Exit = 0x58,
    /// `'G'`
    Get = 0x47,
    /// `'S'`
    Set = 0x53,
    Ack = 0x17,
    Nack = 0x15,
}

impl ControlByte {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        use ControlByte as CB;
        match byte {
            0x1B => Some(CB::Escape),
            0x58 => Some(CB::Exit),
            0x47 => Some(CB::Get),
            0x53 => Some(CB::Set),
            0x17 => Some(CB::Ack),
            0x15 => Some(CB::Nack),
            _ => None,
        }
    }

    /// Octets that must be escaped inside a command body.
    pub const fn escaped_in_command(self) -> bool {
        matches!(
            self,
            ControlByte::Escape | ControlByte::Exit | ControlByte::Get | ControlByte::Set
        )
    }

    /// Octets a board may send escaped inside a reply payload.
    pub const fn escaped_in_reply(self) -> bool {
        matches!(
            self,
            ControlByte::Escape | ControlByte::Ack | ControlByte::Nack
        )
    }
}

pub const ESCAPE: u8 = ControlByte::Escape.byte();
pub const ACK: u8 = ControlByte::Ack.byte();
pub const NACK: u8 = ControlByte::Nack.byte();

/// Second octet of an escape sequence for `byte`. The transform is its own inverse.
#[inline]
pub const fn escape_transform(byte: u8) -> u8 {
    byte ^ ESCAPE ^ 0x55
}

fn is_command_reserved(byte: u8) -> bool {
    ControlByte::from_byte(byte).is_some_and(ControlByte::escaped_in_command)
}

fn is_reply_reserved(byte: u8) -> bool {
    ControlByte::from_byte(byte).is_some_and(ControlByte::escaped_in_reply)
}

fn escape_with(data: &[u8], reserved: fn(u8) -> bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 1);
    for &byte in data {
        if reserved(byte) {
            out.push(ESCAPE);
            out.push(escape_transform(byte));
        } else {
            out.push(byte);
        }
    }
    out
}

/// Escape a command body (ESCAPE, EXIT, GET and SET are substituted).
pub fn escape(data: &[u8]) -> Vec<u8> {
    escape_with(data, is_command_reserved)
}

/// Escape a reply payload (ESCAPE, ACK and NACK are substituted).
pub fn escape_reply(data: &[u8]) -> Vec<u8> {
    escape_with(data, is_reply_reserved)
}

/// Reverse [`escape`] or [`escape_reply`].
///
/// Fails on a trailing lone ESCAPE or on a sequence that does not decode to a reserved octet.
pub fn unescape(data: &[u8]) -> core::result::Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        let Some(&next) = bytes.next() else {
            return Err(ProtocolError::new("escape sequence cut short"));
        };
        let decoded = escape_transform(next);
        if ControlByte::from_byte(decoded).is_none() {
            return Err(unknown_escape(next));
        }
        out.push(decoded);
    }
    Ok(out)
}

fn unknown_escape(second: u8) -> ProtocolError {
    ProtocolError::new(format!("unknown escape sequence ESC (0x1B) / 0x{second:02X}"))
}

/// One logical command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { address: u16, length: u8 },
    Set { address: u16, payload: Vec<u8> },
}

impl Command {
    pub fn address(&self) -> u16 {
        match *self {
            Command::Get { address, .. } | Command::Set { address, .. } => address,
        }
    }

    /// Wire image of this command.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (opcode, body) = match self {
            Command::Get { address, length } => {
                let [lo, hi] = address.to_le_bytes();
                (ControlByte::Get, vec![lo, hi, *length])
            }
            Command::Set { address, payload } => {
                let length = u8::try_from(payload.len()).map_err(|_| {
                    Error::range(format!(
                        "SET payload of {} bytes exceeds 255",
                        payload.len()
                    ))
                })?;
                let [lo, hi] = address.to_le_bytes();
                let mut body = Vec::with_capacity(3 + payload.len());
                body.extend_from_slice(&[lo, hi, length]);
                body.extend_from_slice(payload);
                (ControlByte::Set, body)
            }
        };

        let mut out = vec![opcode.byte()];
        out.extend(escape(&body));
        Ok(out)
    }
}

/// Progress of a [`ReplyDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Pending,
    Complete(Vec<u8>),
}

/// Byte at a time decoder of a GET reply: `expected` payload bytes then ACK.
#[derive(Debug)]
pub struct ReplyDecoder {
    expected: usize,
    payload: Vec<u8>,
    escaped: bool,
}

impl ReplyDecoder {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            payload: Vec::with_capacity(expected),
            escaped: false,
        }
    }

    /// Payload bytes decoded so far.
    pub fn received(&self) -> usize {
        self.payload.len()
    }

    pub fn push(&mut self, byte: u8) -> core::result::Result<Step, ProtocolError> {
        if self.escaped {
            self.escaped = false;
            let decoded = escape_transform(byte);
            if !is_reply_reserved(decoded) {
                return Err(unknown_escape(byte));
            }
            self.payload.push(decoded);
            return Ok(Step::Pending);
        }

        if self.payload.len() == self.expected {
            return match byte {
                ACK => Ok(Step::Complete(core::mem::take(&mut self.payload))),
                NACK => Err(ProtocolError::new("the device rejected the read")),
                other => Err(ProtocolError::new(format!(
                    "unrecognizable answer 0x{other:02X} after the payload"
                ))),
            };
        }

        match byte {
            ESCAPE => self.escaped = true,
            ACK => {
                return Err(ProtocolError::new(format!(
                    "ACK received, reception truncated ({} instead of {} bytes)",
                    self.payload.len(),
                    self.expected
                )));
            }
            NACK => {
                return Err(ProtocolError::new(format!(
                    "NACK received, reception interrupted ({} instead of {} bytes)",
                    self.payload.len(),
                    self.expected
                )));
            }
            other => self.payload.push(other),
        }
        Ok(Step::Pending)
    }
}

/// Decode the single answer octet of a SET. `true` for ACK, `false` for NACK.
pub fn decode_answer(byte: u8) -> core::result::Result<bool, ProtocolError> {
    match byte {
        ACK => Ok(true),
        NACK => Ok(false),
        other => Err(ProtocolError::new(format!(
            "the device sent an unrecognizable answer 0x{other:02X}"
        ))),
    }
}

/// Wire image of a successful GET reply, as a board sends it.
pub fn encode_reply(payload: &[u8]) -> Vec<u8> {
    let mut out = escape_reply(payload);
    out.push(ACK);
    out
}

/// Board side decoder of the command stream.
///
/// Bytes received outside a command are ignored, an opcode always starts a new command.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    opcode: Option<ControlByte>,
    body: Vec<u8>,
    escaped: bool,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> core::result::Result<Option<Command>, ProtocolError> {
        if self.escaped {
            self.escaped = false;
            let decoded = escape_transform(byte);
            if !is_command_reserved(decoded) {
                self.reset();
                return Err(unknown_escape(byte));
            }
            self.body.push(decoded);
        } else {
            match ControlByte::from_byte(byte) {
                Some(op @ (ControlByte::Get | ControlByte::Set)) => {
                    self.reset();
                    self.opcode = Some(op);
                    return Ok(None);
                }
                Some(ControlByte::Escape) if self.opcode.is_some() => {
                    self.escaped = true;
                    return Ok(None);
                }
                _ if self.opcode.is_none() => return Ok(None),
                _ => self.body.push(byte),
            }
        }
        Ok(self.try_complete())
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.body.clear();
        self.escaped = false;
    }

    fn try_complete(&mut self) -> Option<Command> {
        if self.body.len() < 3 {
            return None;
        }
        let address = u16::from_le_bytes([self.body[0], self.body[1]]);
        let length = self.body[2];
        let command = match self.opcode? {
            ControlByte::Get => Command::Get { address, length },
            ControlByte::Set if self.body.len() == 3 + length as usize => Command::Set {
                address,
                payload: self.body[3..].to_vec(),
            },
            _ => return None,
        };
        self.reset();
        Some(command)
    }
}
