//! Packing of typed values to and from the byte images stored on the boards.
//!
//! Format strings follow the `struct` module conventions the firmware tables
//! were written with: an optional byte order prefix (`<` little, `>` big)
//! followed by `[count]type` items.
//!
//! | char  | field                        | bytes |
//! |-------|------------------------------|-------|
//! | `b/B` | signed/unsigned int          | 1     |
//! | `h/H` | signed/unsigned int          | 2     |
//! | `g/G` | signed/unsigned int          | 3     |
//! | `l/L`, `i/I` | signed/unsigned int   | 4     |
//! | `j/J` | signed/unsigned int          | 5     |
//! | `q/Q` | signed/unsigned int          | 8     |
//! | `?`   | boolean                      | 1     |
//! | `s`   | byte string, count = length  | count |
//! | `x`   | pad byte, produces no value  | 1     |
//!
//! The 3 and 5 byte widths require an explicit byte order.

use crate::error::{Error, Result};

/// Byte order of multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// One decoded item of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Bool,
    Pad,
    /// Fixed length byte string.
    Bytes(usize),
    Int { width: usize, signed: bool },
}

impl Field {
    pub fn size(&self) -> usize {
        match *self {
            Field::Bool | Field::Pad => 1,
            Field::Bytes(len) => len,
            Field::Int { width, .. } => width,
        }
    }

    /// Inclusive range of an integer field.
    fn int_bounds(width: usize, signed: bool) -> (i128, i128) {
        let bits = 8 * width as u32;
        if signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        }
    }
}

/// A single packed or unpacked value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            Value::Bool(b) => Some(b as i64),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            Value::Bool(b) => Some(b as u64),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            Value::Int(v) => Some(v != 0),
            Value::UInt(v) => Some(v != 0),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte strings are ASCII on every known board.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| core::str::from_utf8(b).ok())
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Int(v) => Some(v as i128),
            Value::UInt(v) => Some(v as i128),
            Value::Bool(b) => Some(b as i128),
            Value::Bytes(_) => None,
        }
    }
}

macro_rules! value_from {
    ($variant:ident as $target:ty: $($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Value::$variant(value as $target)
            }
        })*
    };
}

value_from!(Int as i64: i8, i16, i32, i64);
value_from!(UInt as u64: u8, u16, u32, u64);

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// Largest repeat count, the span of the whole address space.
pub const MAX_REPEAT: usize = 0xFFFF;

/// A parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    order: ByteOrder,
    fields: Vec<Field>,
}

impl Format {
    pub fn parse(layout: &str) -> Result<Self> {
        let mut chars = layout.chars().peekable();
        let explicit_order = match chars.peek() {
            Some('<') => Some(ByteOrder::Little),
            Some('>') => Some(ByteOrder::Big),
            _ => None,
        };
        if explicit_order.is_some() {
            chars.next();
        }

        let mut fields = Vec::new();
        let mut count: Option<usize> = None;
        while let Some(c) = chars.next() {
            if let Some(digit) = c.to_digit(10) {
                let current = count.unwrap_or(0);
                count = Some(
                    current
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(digit as usize))
                        .filter(|n| *n <= MAX_REPEAT)
                        .ok_or_else(|| Error::format(format!("repeat count too large in '{layout}'")))?,
                );
                continue;
            }
            if c.is_whitespace() {
                if count.is_some() {
                    return Err(Error::format(format!("dangling repeat count in '{layout}'")));
                }
                continue;
            }

            let repeat = count.take().unwrap_or(1);
            let field = match c {
                's' => {
                    fields.push(Field::Bytes(repeat));
                    continue;
                }
                'x' => Field::Pad,
                '?' => Field::Bool,
                'b' | 'B' => Field::Int { width: 1, signed: c == 'b' },
                'h' | 'H' => Field::Int { width: 2, signed: c == 'h' },
                'g' | 'G' => Field::Int { width: 3, signed: c == 'g' },
                'l' | 'L' | 'i' | 'I' => Field::Int {
                    width: 4,
                    signed: c.is_ascii_lowercase(),
                },
                'j' | 'J' => Field::Int { width: 5, signed: c == 'j' },
                'q' | 'Q' => Field::Int { width: 8, signed: c == 'q' },
                other => {
                    return Err(Error::format(format!(
                        "unrecognized type character '{other}' in '{layout}'"
                    )));
                }
            };
            fields.extend(core::iter::repeat_n(field, repeat));
        }
        if count.is_some() {
            return Err(Error::format(format!("dangling repeat count in '{layout}'")));
        }

        let odd_width = fields
            .iter()
            .any(|f| matches!(f, Field::Int { width: 3 | 5, .. }));
        if odd_width && explicit_order.is_none() {
            return Err(Error::format(format!(
                "'{layout}' uses a 3 or 5 byte integer and needs an explicit byte order"
            )));
        }

        Ok(Self {
            order: explicit_order.unwrap_or_default(),
            fields,
        })
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.fields.iter().map(Field::size).sum()
    }

    /// Number of values produced by [`Self::unpack`] and expected by [`Self::pack`].
    pub fn arity(&self) -> usize {
        self.fields.iter().filter(|f| **f != Field::Pad).count()
    }

    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.arity() {
            return Err(Error::format(format!(
                "format expects {} values, got {}",
                self.arity(),
                values.len()
            )));
        }

        let mut out = Vec::with_capacity(self.size());
        let mut values = values.iter();
        for field in &self.fields {
            if *field == Field::Pad {
                out.push(0);
                continue;
            }
            // Arity was checked above.
            let Some(value) = values.next() else { break };
            match *field {
                Field::Pad => {}
                Field::Bool => {
                    let flag = match value {
                        Value::Bool(b) => *b,
                        other => match other.as_i128() {
                            Some(0) => false,
                            Some(1) => true,
                            _ => {
                                return Err(Error::range(format!(
                                    "{other:?} is not a boolean"
                                )));
                            }
                        },
                    };
                    out.push(flag as u8);
                }
                Field::Bytes(len) => {
                    let bytes = value
                        .as_bytes()
                        .ok_or_else(|| Error::format(format!("{value:?} is not a byte string")))?;
                    if bytes.len() > len {
                        return Err(Error::range(format!(
                            "string of {} bytes does not fit in {len}s",
                            bytes.len()
                        )));
                    }
                    out.extend_from_slice(bytes);
                    out.extend(core::iter::repeat_n(0u8, len - bytes.len()));
                }
                Field::Int { width, signed } => {
                    let n = value
                        .as_i128()
                        .ok_or_else(|| Error::format(format!("{value:?} is not an integer")))?;
                    let (min, max) = Field::int_bounds(width, signed);
                    if n < min || n > max {
                        return Err(Error::range(format!(
                            "{n} outside [{min}, {max}] of a {width} byte {} integer",
                            if signed { "signed" } else { "unsigned" }
                        )));
                    }
                    // Two's complement, truncated to the field width.
                    let le = (n as i64 as u64).to_le_bytes();
                    let bytes = &le[..width];
                    match self.order {
                        ByteOrder::Little => out.extend_from_slice(bytes),
                        ByteOrder::Big => out.extend(bytes.iter().rev()),
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn unpack(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        let size = self.size();
        if bytes.len() < size {
            return Err(Error::format(format!(
                "format needs {size} bytes, only {} available",
                bytes.len()
            )));
        }
        if bytes.len() > size {
            return Err(Error::format(format!(
                "format needs {size} bytes, got {}",
                bytes.len()
            )));
        }

        let mut values = Vec::with_capacity(self.arity());
        let mut offset = 0;
        for field in &self.fields {
            let chunk = &bytes[offset..offset + field.size()];
            offset += field.size();
            match *field {
                Field::Pad => {}
                Field::Bool => values.push(Value::Bool(chunk[0] != 0)),
                Field::Bytes(_) => {
                    let end = chunk.iter().position(|b| *b == 0).unwrap_or(chunk.len());
                    let trimmed = chunk[..end]
                        .iter()
                        .rposition(|b| *b != b' ')
                        .map_or(0, |last| last + 1);
                    values.push(Value::Bytes(chunk[..trimmed].to_vec()));
                }
                Field::Int { width, signed } => {
                    let mut le = [0u8; 8];
                    match self.order {
                        ByteOrder::Little => le[..width].copy_from_slice(chunk),
                        ByteOrder::Big => {
                            for (dst, src) in le[..width].iter_mut().zip(chunk.iter().rev()) {
                                *dst = *src;
                            }
                        }
                    }
                    let raw = u64::from_le_bytes(le);
                    let value = if signed {
                        let shift = 64 - 8 * width as u32;
                        Value::Int(((raw << shift) as i64) >> shift)
                    } else {
                        Value::UInt(raw)
                    };
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

/// Pack `values` with the format string `format`.
pub fn pack(format: &str, values: &[Value]) -> Result<Vec<u8>> {
    Format::parse(format)?.pack(values)
}

/// Unpack `bytes` with the format string `format`.
pub fn unpack(format: &str, bytes: &[u8]) -> Result<Vec<Value>> {
    Format::parse(format)?.unpack(bytes)
}

/// Encoded size of the format string `format`.
pub fn calcsize(format: &str) -> Result<usize> {
    Ok(Format::parse(format)?.size())
}
