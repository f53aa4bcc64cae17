//! printf style display templates, e.g. `%6.2f [0x%04X]`.
//!
//! Supported conversions are `f`, `e`, `d`, `x` and `X` with the `0`, `-` and `+` flags, a
//! width and a precision. `%%` is a literal percent sign.

use crate::error::{Error, Result};

/// An argument substituted into a template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Float(f64),
    Int(i64),
}

impl Arg {
    fn float(self) -> f64 {
        match self {
            Arg::Float(v) => v,
            Arg::Int(v) => v as f64,
        }
    }

    fn int(self) -> i64 {
        match self {
            Arg::Float(v) => v as i64,
            Arg::Int(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Fixed,
    Exponent,
    Decimal,
    HexLower,
    HexUpper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Flags {
    zero: bool,
    left: bool,
    plus: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Placeholder {
        flags: Flags,
        width: usize,
        precision: Option<usize>,
        conversion: Conversion,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                literal.push('%');
                continue;
            }

            let mut flags = Flags::default();
            while let Some(&f) = chars.peek() {
                match f {
                    '0' => flags.zero = true,
                    '-' => flags.left = true,
                    '+' => flags.plus = true,
                    _ => break,
                }
                chars.next();
            }
            let width = take_number(&mut chars, source)?.unwrap_or(0);
            let precision = if chars.peek() == Some(&'.') {
                chars.next();
                Some(take_number(&mut chars, source)?.unwrap_or(0))
            } else {
                None
            };
            let conversion = match chars.next() {
                Some('f') | Some('F') => Conversion::Fixed,
                Some('e') => Conversion::Exponent,
                Some('d') | Some('i') => Conversion::Decimal,
                Some('x') => Conversion::HexLower,
                Some('X') => Conversion::HexUpper,
                Some(other) => {
                    return Err(Error::format(format!(
                        "unsupported conversion '%{other}' in template {source:?}"
                    )));
                }
                None => {
                    return Err(Error::format(format!("dangling '%' in template {source:?}")));
                }
            };

            if !literal.is_empty() {
                pieces.push(Piece::Literal(core::mem::take(&mut literal)));
            }
            pieces.push(Piece::Placeholder {
                flags,
                width,
                precision,
                conversion,
            });
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of substitution placeholders.
    pub fn placeholders(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p, Piece::Placeholder { .. }))
            .count()
    }

    /// Render with `args` substituted in order. Missing arguments render as nothing.
    pub fn render(&self, args: &[Arg]) -> String {
        let mut out = String::new();
        let mut args = args.iter();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Placeholder {
                    flags,
                    width,
                    precision,
                    conversion,
                } => {
                    if let Some(&arg) = args.next() {
                        out.push_str(&format_arg(arg, *flags, *width, *precision, *conversion));
                    }
                }
            }
        }
        out
    }
}

impl core::fmt::Display for Template {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Widths and precisions above this are rejected.
const MAX_WIDTH: usize = 0xFF;

fn take_number(
    chars: &mut core::iter::Peekable<core::str::Chars<'_>>,
    source: &str,
) -> Result<Option<usize>> {
    let mut number: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        let next = number
            .unwrap_or(0)
            .checked_mul(10)
            .and_then(|n| n.checked_add(d as usize))
            .filter(|n| *n <= MAX_WIDTH)
            .ok_or_else(|| Error::format(format!("width too large in template {source:?}")))?;
        number = Some(next);
        chars.next();
    }
    Ok(number)
}

/// `1.5e0` becomes `1.5e+00`.
fn c_exponent(text: String) -> String {
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => text,
    }
}

fn format_arg(
    arg: Arg,
    flags: Flags,
    width: usize,
    precision: Option<usize>,
    conversion: Conversion,
) -> String {
    let (negative, digits) = match conversion {
        Conversion::Fixed => {
            let v = arg.float();
            (
                v.is_sign_negative() && v != 0.0,
                format!("{:.*}", precision.unwrap_or(6), v.abs()),
            )
        }
        Conversion::Exponent => {
            let v = arg.float();
            (
                v.is_sign_negative() && v != 0.0,
                c_exponent(format!("{:.*e}", precision.unwrap_or(6), v.abs())),
            )
        }
        Conversion::Decimal => {
            let v = arg.int();
            (v < 0, v.unsigned_abs().to_string())
        }
        Conversion::HexLower => {
            let v = arg.int();
            (v < 0, format!("{:x}", v.unsigned_abs()))
        }
        Conversion::HexUpper => {
            let v = arg.int();
            (v < 0, format!("{:X}", v.unsigned_abs()))
        }
    };

    let sign = if negative {
        "-"
    } else if flags.plus {
        "+"
    } else {
        ""
    };
    let len = sign.len() + digits.len();
    if len >= width {
        return format!("{sign}{digits}");
    }
    let fill = width - len;
    if flags.left {
        format!("{sign}{digits}{}", " ".repeat(fill))
    } else if flags.zero {
        format!("{sign}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{sign}{digits}", " ".repeat(fill))
    }
}
