//! Named parameters living in a board's memory, and the per-connection cache of their values.
//!
//! A [`ParameterDescriptor`] is plain static metadata shared by every board of a model. Values
//! are only ever kept in a [`ParameterCache`], keyed by connection and descriptor, which the
//! owner of the connection hands out through [`ParameterOwner`].

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{Field, Format, Value};
use crate::error::{Error, ProtocolError, Result};
use crate::link::{ConnectionId, Transport};

/// Whether a parameter value may be served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Volatility {
    /// Cached after the first read or write.
    #[default]
    Normal,
    /// Changed by the board itself, always read again.
    Volatile,
}

/// Static description of one board parameter.
///
/// E.g. `ParameterDescriptor::new(0xF008, "<B", "Taps")`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterDescriptor {
    address: u16,
    format: &'static str,
    name: &'static str,
    volatility: Volatility,
}

impl ParameterDescriptor {
    pub const fn new(address: u16, format: &'static str, name: &'static str) -> Self {
        Self {
            address,
            format,
            name,
            volatility: Volatility::Normal,
        }
    }

    pub const fn volatile(self) -> Self {
        Self {
            volatility: Volatility::Volatile,
            ..self
        }
    }

    /// Same parameter shape at another address, for register arrays.
    pub const fn at(self, address: u16) -> Self {
        Self { address, ..self }
    }

    pub const fn address(&self) -> u16 {
        self.address
    }

    pub const fn format_str(&self) -> &'static str {
        self.format
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn volatility(&self) -> Volatility {
        self.volatility
    }

    pub const fn is_volatile(&self) -> bool {
        matches!(self.volatility, Volatility::Volatile)
    }

    pub fn format(&self) -> Result<Format> {
        Format::parse(self.format)
    }

    /// Number of bytes the parameter occupies on the board.
    pub fn size(&self) -> Result<usize> {
        Ok(self.format()?.size())
    }

    /// Read the value, from cache unless the parameter is volatile.
    pub fn get(&self, owner: &(impl ParameterOwner + ?Sized)) -> Result<ParamValue> {
        let transport = owner.transport();
        let cache = owner.cache();

        if !self.is_volatile() {
            if let Some(value) = cache.get(transport.id(), self) {
                trace!("'{}' served from cache", self.name);
                return Ok(value);
            }
        }

        let format = self.format()?;
        let length = u8::try_from(format.size()).map_err(|_| {
            Error::range(format!(
                "'{}' is {} bytes long, a single read is limited to 255",
                self.name,
                format.size()
            ))
        })?;
        let bytes = transport.read(self.address, length)?;
        let value = ParamValue::from_values(format.unpack(&bytes)?);
        debug!("'{}' @ 0x{:04X} = {}", self.name, self.address, value);

        if !self.is_volatile() {
            cache.insert(transport.id(), *self, value.clone());
        }
        Ok(value)
    }

    /// Encode and write the value, in aligned chunks.
    ///
    /// A rejected or failed write drops the cached value and reports a protocol error.
    pub fn set(
        &self,
        owner: &(impl ParameterOwner + ?Sized),
        value: impl Into<ParamValue>,
    ) -> Result<()> {
        let transport = owner.transport();
        let cache = owner.cache();

        let format = self.format()?;
        let values = value.into().into_values(&format);
        let bytes = format.pack(&values)?;
        debug!("'{}' @ 0x{:04X} <- {:02X?}", self.name, self.address, bytes);

        match transport.write_aligned(self.address, &bytes) {
            Ok(true) => {
                if !self.is_volatile() {
                    // Cache what the board now holds, with the same trimming a read applies.
                    let stored = ParamValue::from_values(format.unpack(&bytes)?);
                    cache.insert(transport.id(), *self, stored);
                }
                Ok(())
            }
            Ok(false) => {
                cache.invalidate(transport.id(), self);
                Err(ProtocolError::new(format!(
                    "the device rejected the write of '{}' at 0x{:04X}",
                    self.name, self.address
                ))
                .into())
            }
            Err(e) => {
                cache.invalidate(transport.id(), self);
                Err(e.context(format!("could not write '{}'", self.name)))
            }
        }
    }
}

/// A decoded parameter value. Single field formats decode to a scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Scalar(Value),
    Tuple(Vec<Value>),
}

impl ParamValue {
    pub fn from_values(mut values: Vec<Value>) -> Self {
        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return ParamValue::Scalar(value);
            }
        }
        ParamValue::Tuple(values)
    }

    /// Normalize to the field list `format` packs.
    ///
    /// A byte string given for a format made of single bytes is spread over its fields.
    pub fn into_values(self, format: &Format) -> Vec<Value> {
        match self {
            ParamValue::Scalar(Value::Bytes(bytes))
                if format.arity() > 1
                    && format.arity() == bytes.len()
                    && format
                        .fields()
                        .iter()
                        .all(|f| matches!(f, Field::Int { width: 1, .. })) =>
            {
                bytes.into_iter().map(Value::from).collect()
            }
            ParamValue::Scalar(value) => vec![value],
            ParamValue::Tuple(values) => values,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ParamValue::Scalar(value) => Some(value),
            ParamValue::Tuple(_) => None,
        }
    }

    pub fn as_tuple(&self) -> &[Value] {
        match self {
            ParamValue::Scalar(value) => core::slice::from_ref(value),
            ParamValue::Tuple(values) => values,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(Value::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Value::as_str)
    }

    /// Flatten integer fields, or a byte string, to bytes.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        if let Some(bytes) = self.as_scalar().and_then(Value::as_bytes) {
            return Some(bytes.to_vec());
        }
        self.as_tuple()
            .iter()
            .map(|v| v.as_u64().and_then(|v| u8::try_from(v).ok()))
            .collect()
    }
}

impl core::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fn one(value: &Value, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match value {
                Value::Bool(b) => write!(f, "{b}"),
                Value::Int(v) => write!(f, "{v}"),
                Value::UInt(v) => write!(f, "{v}"),
                Value::Bytes(b) => match core::str::from_utf8(b) {
                    Ok(text) => write!(f, "{text:?}"),
                    Err(_) => write!(f, "{b:02X?}"),
                },
            }
        }
        match self {
            ParamValue::Scalar(value) => one(value, f),
            ParamValue::Tuple(values) => {
                write!(f, "(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    one(value, f)?;
                }
                write!(f, ")")
            }
        }
    }
}

macro_rules! param_value_from {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(value: $t) -> Self {
                ParamValue::Scalar(value.into())
            }
        })*
    };
}

param_value_from!(Value, bool, i8, i16, i32, i64, u8, u16, u32, u64, &str, &[u8], Vec<u8>);

impl From<Vec<Value>> for ParamValue {
    fn from(values: Vec<Value>) -> Self {
        ParamValue::Tuple(values)
    }
}

/// Last known values, per connection and parameter.
#[derive(Debug, Default)]
pub struct ParameterCache {
    entries: Mutex<HashMap<(ConnectionId, ParameterDescriptor), ParamValue>>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: ConnectionId, descriptor: &ParameterDescriptor) -> Option<ParamValue> {
        self.entries.lock().get(&(connection, *descriptor)).cloned()
    }

    pub fn insert(&self, connection: ConnectionId, descriptor: ParameterDescriptor, value: ParamValue) {
        self.entries.lock().insert((connection, descriptor), value);
    }

    pub fn invalidate(&self, connection: ConnectionId, descriptor: &ParameterDescriptor) {
        if self.entries.lock().remove(&(connection, *descriptor)).is_some() {
            trace!("Dropped cached '{}'", descriptor.name());
        }
    }

    /// Drop every entry of a connection. Returns how many were dropped.
    pub fn evict_connection(&self, connection: ConnectionId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _), _| *id != connection);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anything that can reach parameters: a transport plus the cache holding its values.
pub trait ParameterOwner {
    fn transport(&self) -> &dyn Transport;
    fn cache(&self) -> &ParameterCache;
}

pub fn get_parameter(
    owner: &(impl ParameterOwner + ?Sized),
    descriptor: &ParameterDescriptor,
) -> Result<ParamValue> {
    descriptor.get(owner)
}

pub fn set_parameter(
    owner: &(impl ParameterOwner + ?Sized),
    descriptor: &ParameterDescriptor,
    value: impl Into<ParamValue>,
) -> Result<()> {
    descriptor.set(owner, value)
}
