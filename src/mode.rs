//! The operating mode byte of the EstCard boards.

use modular_bitfield::prelude::*;
use strum_macros::EnumIter;

use crate::error::{Error, Result};

/// Function enable and selection bits, stored as one byte.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeFlags {
    pub input_enable: bool,
    pub output_enable: bool,
    pub expansion_enable: bool,
    /// Set = UV, clear = LN
    pub input_selection: bool,
    pub feedback_enable: bool,
    pub split_enable: bool,
    #[skip]
    __: B2,
}

impl ModeFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes([byte])
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }

    pub fn is_set(&self, flag: ModeFlag) -> bool {
        match flag {
            ModeFlag::CoordinationInput => self.input_enable(),
            ModeFlag::CoordinationOutput => self.output_enable(),
            ModeFlag::Expansion => self.expansion_enable(),
            ModeFlag::InputSelection => self.input_selection(),
            ModeFlag::Feedback => self.feedback_enable(),
            ModeFlag::OverlappingTaps => self.split_enable(),
        }
    }

    pub fn set(&mut self, flag: ModeFlag, on: bool) {
        match flag {
            ModeFlag::CoordinationInput => self.set_input_enable(on),
            ModeFlag::CoordinationOutput => self.set_output_enable(on),
            ModeFlag::Expansion => self.set_expansion_enable(on),
            ModeFlag::InputSelection => self.set_input_selection(on),
            ModeFlag::Feedback => self.set_feedback_enable(on),
            ModeFlag::OverlappingTaps => self.set_split_enable(on),
        }
    }

    /// Label of the current state of `flag`, e.g. `Active`.
    pub fn label(&self, flag: ModeFlag) -> &'static str {
        if self.is_set(flag) {
            flag.on_label()
        } else {
            flag.off_label()
        }
    }
}

impl core::fmt::Display for ModeFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use strum::IntoEnumIterator;
        for flag in ModeFlag::iter() {
            writeln!(f, "{:>25} : {}", flag.name(), self.label(flag))?;
        }
        Ok(())
    }
}

/// One bit of [`ModeFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ModeFlag {
    CoordinationInput,
    CoordinationOutput,
    Expansion,
    InputSelection,
    Feedback,
    OverlappingTaps,
}

impl ModeFlag {
    pub const fn name(self) -> &'static str {
        match self {
            ModeFlag::CoordinationInput => "Coordination Input",
            ModeFlag::CoordinationOutput => "Coordination Output",
            ModeFlag::Expansion => "Expansion",
            ModeFlag::InputSelection => "Input Selection",
            ModeFlag::Feedback => "Feedback",
            ModeFlag::OverlappingTaps => "Overlapping Taps",
        }
    }

    pub const fn on_label(self) -> &'static str {
        match self {
            ModeFlag::Expansion => "Enabled",
            ModeFlag::InputSelection => "UV",
            _ => "Active",
        }
    }

    pub const fn off_label(self) -> &'static str {
        match self {
            ModeFlag::Expansion => "Disabled",
            ModeFlag::InputSelection => "LN",
            _ => "Inactive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        ModeFlag::iter().find(|flag| flag.name() == name)
    }

    /// Accepts the flag's own labels, `on`/`off` and `1`/`0`, in any case.
    pub fn parse(self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(self.on_label())
            || text.eq_ignore_ascii_case("on")
            || text == "1"
        {
            Ok(true)
        } else if text.eq_ignore_ascii_case(self.off_label())
            || text.eq_ignore_ascii_case("off")
            || text == "0"
        {
            Ok(false)
        } else {
            Err(Error::InvalidValue(format!(
                "'{text}' is not a valid value for {}",
                self.name()
            )))
        }
    }
}
