//! Parameters shown in engineering units.
//!
//! A [`ScaledParameter`] wraps an integer [`ParameterDescriptor`] with a [`ScalingRule`]:
//! the two conversions between engineering and raw values, the valid raw range and the
//! display template.

use std::sync::Arc;

use tracing::debug;

use crate::codec::Field;
use crate::error::{Error, Result};
use crate::param::{ParameterDescriptor, ParameterOwner};
use crate::template::{Arg, Template};

type ToEngineering = Arc<dyn Fn(i64) -> f64 + Send + Sync>;
type ToRaw = Arc<dyn Fn(f64) -> i64 + Send + Sync>;

/// Conversions between engineering and raw values.
#[derive(Clone)]
pub struct ScalingRule {
    to_eng: ToEngineering,
    to_raw: ToRaw,
    range: Option<(i64, i64)>,
    template: Option<String>,
}

impl ScalingRule {
    pub fn new(
        to_eng: impl Fn(i64) -> f64 + Send + Sync + 'static,
        to_raw: impl Fn(f64) -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            to_eng: Arc::new(to_eng),
            to_raw: Arc::new(to_raw),
            range: None,
            template: None,
        }
    }

    /// Raw value shown as is.
    pub fn identity() -> Self {
        Self::new(|raw| raw as f64, |eng| eng.round() as i64)
    }

    /// Inclusive raw range, instead of everything the field can hold.
    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Template with one placeholder (engineering value) or two (engineering, raw).
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn to_eng(&self, raw: i64) -> f64 {
        (self.to_eng)(raw)
    }

    pub fn to_raw(&self, eng: f64) -> i64 {
        (self.to_raw)(eng)
    }
}

impl core::fmt::Debug for ScalingRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScalingRule")
            .field("range", &self.range)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct DisplayTemplate {
    template: Template,
    with_raw: bool,
}

/// A descriptor bound to a scaling rule.
#[derive(Debug, Clone)]
pub struct ScaledParameter {
    descriptor: ParameterDescriptor,
    rule: ScalingRule,
    range: (i64, i64),
    display: Arc<DisplayTemplate>,
}

impl ScaledParameter {
    /// Bind `rule` to a descriptor holding a single integer.
    pub fn new(descriptor: ParameterDescriptor, rule: ScalingRule) -> Result<Self> {
        let format = descriptor.format()?;
        let size = match format.fields() {
            [Field::Int { width, .. }] => *width,
            _ => {
                return Err(Error::format(format!(
                    "'{}' must hold a single integer to be scaled, got {:?}",
                    descriptor.name(),
                    descriptor.format_str()
                )));
            }
        };

        let range = rule.range.unwrap_or_else(|| {
            let bits = 8 * size as u32;
            let max = if bits >= 63 { i64::MAX } else { (1i64 << bits) - 1 };
            (0, max)
        });

        let template = match &rule.template {
            Some(text) => Template::parse(text)?,
            None => Template::parse(&format!("%6.2f [0x%0{}X]", 2 * size))?,
        };
        let with_raw = match template.placeholders() {
            1 => false,
            2 => true,
            n => {
                return Err(Error::format(format!(
                    "template {:?} has {n} placeholders, expected 1 or 2",
                    template.as_str()
                )));
            }
        };

        Ok(Self {
            descriptor,
            rule,
            range,
            display: Arc::new(DisplayTemplate { template, with_raw }),
        })
    }

    pub fn descriptor(&self) -> &ParameterDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }

    pub fn range(&self) -> (i64, i64) {
        self.range
    }

    /// Engineering limits matching the raw range.
    pub fn eng_range(&self) -> (f64, f64) {
        (self.rule.to_eng(self.range.0), self.rule.to_eng(self.range.1))
    }

    pub fn get(&self, owner: &(impl ParameterOwner + ?Sized)) -> Result<ScaledValue> {
        let raw = self.descriptor.get(owner)?.as_i64().ok_or_else(|| {
            Error::format(format!("'{}' did not decode to an integer", self.name()))
        })?;
        Ok(self.value_of_raw(raw))
    }

    /// Convert and write an engineering value.
    ///
    /// Nothing is written when `eng` is not finite or its raw equivalent is outside the range.
    pub fn set(&self, owner: &(impl ParameterOwner + ?Sized), eng: f64) -> Result<ScaledValue> {
        let raw = self.validate(eng)?.internal();
        debug!("'{}' <- {eng} (raw {raw})", self.name());
        self.set_internal(owner, raw)
    }

    /// Convert `eng` without writing it, failing like [`set`](Self::set) would.
    pub fn validate(&self, eng: f64) -> Result<ScaledValue> {
        if !eng.is_finite() {
            return Err(Error::range(format!("'{}' cannot hold {eng}", self.name())));
        }
        let raw = self.rule.to_raw(eng);
        self.check(raw)?;
        Ok(self.value_of_raw(raw))
    }

    /// Write a raw value directly.
    pub fn set_internal(
        &self,
        owner: &(impl ParameterOwner + ?Sized),
        raw: i64,
    ) -> Result<ScaledValue> {
        self.check(raw)?;
        self.descriptor.set(owner, raw)?;
        Ok(self.value_of_raw(raw))
    }

    fn check(&self, raw: i64) -> Result<()> {
        let (min, max) = self.range;
        if raw < min || raw > max {
            let (eng_min, eng_max) = self.eng_range();
            return Err(Error::range(format!(
                "'{}' raw value {raw} outside [{min}, {max}] ({eng_min:.3} .. {eng_max:.3})",
                self.name()
            )));
        }
        Ok(())
    }

    pub fn value_of_raw(&self, raw: i64) -> ScaledValue {
        ScaledValue {
            eng: self.rule.to_eng(raw),
            raw,
            rule: self.rule.clone(),
            display: Arc::clone(&self.display),
        }
    }

    /// Value as the board would hold it after writing `eng`.
    pub fn value_of_eng(&self, eng: f64) -> ScaledValue {
        self.value_of_raw(self.rule.to_raw(eng))
    }
}

/// An engineering value together with its raw representation.
#[derive(Clone)]
pub struct ScaledValue {
    eng: f64,
    raw: i64,
    rule: ScalingRule,
    display: Arc<DisplayTemplate>,
}

impl ScaledValue {
    pub fn value(&self) -> f64 {
        self.eng
    }

    pub fn internal(&self) -> i64 {
        self.raw
    }

    /// Multiply the engineering value and re-derive a consistent raw value.
    pub fn rescale(&self, factor: f64) -> ScaledValue {
        let raw = self.rule.to_raw(self.eng * factor);
        ScaledValue {
            eng: self.rule.to_eng(raw),
            raw,
            rule: self.rule.clone(),
            display: Arc::clone(&self.display),
        }
    }
}

impl core::fmt::Display for ScaledValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = if self.display.with_raw {
            self.display
                .template
                .render(&[Arg::Float(self.eng), Arg::Int(self.raw)])
        } else {
            self.display.template.render(&[Arg::Float(self.eng)])
        };
        f.write_str(&text)
    }
}

impl core::fmt::Debug for ScaledValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScaledValue")
            .field("eng", &self.eng)
            .field("raw", &self.raw)
            .finish()
    }
}

impl From<ScaledValue> for f64 {
    fn from(value: ScaledValue) -> Self {
        value.eng
    }
}

impl PartialEq for ScaledValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.eng == other.eng
    }
}

impl PartialEq<f64> for ScaledValue {
    fn eq(&self, other: &f64) -> bool {
        self.eng == *other
    }
}

impl PartialOrd<f64> for ScaledValue {
    fn partial_cmp(&self, other: &f64) -> Option<core::cmp::Ordering> {
        self.eng.partial_cmp(other)
    }
}
