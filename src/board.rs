//! EstCard boards: identification, firmware models and the parameters each one exposes.
//!
//! A [`Card`] is created from an open [`Connection`]: it reads the identification block,
//! picks the [`BoardModel`] from the software kernel name, and from then on resolves
//! parameters through that model's descriptor table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use strum_macros::{Display, EnumIter, EnumString};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::diagnostics::ConsoleControl;
use crate::error::{Error, Result};
use crate::link::{Connection, SerialChannel, SerialPortChannel, Transport};
use crate::mode::{ModeFlag, ModeFlags};
use crate::param::{ParamValue, ParameterCache, ParameterDescriptor, ParameterOwner};
use crate::sampling::{MeasureRecord, Sampler, SamplerHandle, SamplingConfig};
use crate::scaled::{ScaledParameter, ScaledValue, ScalingRule};
use crate::template::{Arg, Template};

/// Gain normalization factor of the measuring inputs.
pub const GAIN_NOM: f64 = 50362.0;

/// Unlocks remote configuration when written to the password.
pub const PASSWORD: &str = "CFG_USER";
/// Locks it again.
pub const CLEAR_PASSWORD: &str = "--------";

/// Display names of the board parameters.
pub mod names {
    pub const PASSWORD: &str = "Configuration Password";
    pub const ACTIVE_TAP: &str = "Active Tap";
    pub const MEASURE: &str = "Measure Record";
    pub const MEASURE_MODE: &str = "Measurement Mode";
    pub const UNDER_VOLTAGE_TURN_ON: &str = "Turn-on Time from Under-voltage";
    pub const OVER_VOLTAGE_TURN_ON: &str = "Turn-on Time from Over-voltage";
    pub const UNDER_VOLTAGE_TURN_OFF: &str = "Under-voltage Turn-off Time";
    pub const OVER_VOLTAGE_TURN_OFF: &str = "Over-voltage Turn-off Time";
    pub const TAPS_IN_USE: &str = "Taps In Use";
    pub const MODE: &str = "Operating Mode";
    pub const GAIN_L: &str = "Gain Phase L - Neutral";
    pub const GAIN_U: &str = "Gain Phase U - Neutral";
    pub const GAIN_V: &str = "Gain Phase V - Neutral";
    pub const SCALE: &str = "Measurement Scale";
    pub const THRESHOLDS: &str = "Voltage Thresholds";
    pub const UPPER_THRESHOLD: &str = "Upper Voltage Threshold";
    pub const LOWER_THRESHOLD: &str = "Lower Voltage Threshold";
    pub const CLIENT: &str = "Client Name";
    pub const DATE: &str = "Production Date";
    pub const SERIAL_NUMBER: &str = "Serial Number";
    pub const INPUT_VOLTAGE: &str = "Input Voltage";
    pub const REFERENCE_VOLTAGE: &str = "Reference Voltage";
    pub const OUTPUT_VOLTAGE: &str = "Output Voltage";
    pub const REGULATION: &str = "Regulation";
    pub const TAP_ORDER: &str = "Tap Order";
    pub const SERIES_RESISTANCE: &str = "Series Resistance";
    pub const DIVIDER_RESISTANCE: &str = "Divider Resistance";
    pub const EEPROM_LOW: &str = "EEPROM Low Half";
    pub const EEPROM_HIGH: &str = "EEPROM High Half";
    pub const ADRES: &str = "ADRES SFR";
    pub const TEST_COMMAND: &str = "Test Command";
}

const HARDWARE_MODEL: ParameterDescriptor = ParameterDescriptor::new(0x0000, "<18s", "Hardware Model");
const HARDWARE_VERSION: ParameterDescriptor = ParameterDescriptor::new(0x0012, "<18s", "Hardware Version");
const SOFTWARE_KERNEL: ParameterDescriptor = ParameterDescriptor::new(0x0024, "<18s", "Software Kernel");
const SOFTWARE_RELEASE: ParameterDescriptor = ParameterDescriptor::new(0x0036, "<18s", "Software Release");
const SOFTWARE_REVISION: ParameterDescriptor = ParameterDescriptor::new(0x0048, "<18s", "Software Revision");

mod tables {
    use super::names::*;
    use crate::param::ParameterDescriptor as P;

    const PASSWORD_PARAM: P = P::new(0xE400, "<8s", PASSWORD).volatile();
    const ACTIVE_TAP_PARAM: P = P::new(0xE40D, "<H", ACTIVE_TAP);
    const MEASURE_PARAM: P = P::new(0xE408, "<BHH", MEASURE).volatile();
    const TIMERS: [P; 4] = [
        P::new(0xF000, "<H", UNDER_VOLTAGE_TURN_ON),
        P::new(0xF002, "<H", OVER_VOLTAGE_TURN_ON),
        P::new(0xF004, "<H", UNDER_VOLTAGE_TURN_OFF),
        P::new(0xF006, "<H", OVER_VOLTAGE_TURN_OFF),
    ];
    const TAPS_PARAM: P = P::new(0xF008, "<B", TAPS_IN_USE);
    const MODE_PARAM: P = P::new(0xF009, "<B", MODE);
    const GAIN_L_PARAM: P = P::new(0xF00A, "<H", GAIN_L);
    const GAIN_U_PARAM: P = P::new(0xF00C, "<H", GAIN_U);
    const THRESHOLDS_PARAM: P = P::new(0xF01F, "<24H", THRESHOLDS);
    const CLIENT_PARAM: P = P::new(0xF053, "<18s", CLIENT);
    const DATE_PARAM: P = P::new(0xF064, "<10s", DATE);
    const SERIAL_PARAM: P = P::new(0xF06B, "<7s", SERIAL_NUMBER);
    const VIN_PARAM: P = P::new(0xF072, "<7s", INPUT_VOLTAGE);
    const VREF_PARAM: P = P::new(0xF075, "<6s", REFERENCE_VOLTAGE);
    const VOUT_PARAM: P = P::new(0xF079, "<7s", OUTPUT_VOLTAGE);
    const REG_PARAM: P = P::new(0xF07F, "<6s", REGULATION);
    const ORDER_PARAM: P = P::new(0xF080, "<12B", TAP_ORDER);
    const RS_PARAM: P = P::new(0xF084, "<5s", SERIES_RESISTANCE);
    const RD_PARAM: P = P::new(0xF089, "<5s", DIVIDER_RESISTANCE);
    const EEPROM_LOW_PARAM: P = P::new(0xF000, "<128B", EEPROM_LOW);
    const EEPROM_HIGH_PARAM: P = P::new(0xF080, "<128B", EEPROM_HIGH);

    pub const EST_1V0: &[P] = &[
        PASSWORD_PARAM,
        ACTIVE_TAP_PARAM,
        MEASURE_PARAM,
        TIMERS[0],
        TIMERS[1],
        TIMERS[2],
        TIMERS[3],
        TAPS_PARAM,
        MODE_PARAM,
        GAIN_L_PARAM,
        GAIN_U_PARAM,
        // Signed offset around unity gain.
        P::new(0xF00E, "<b", GAIN_V),
        P::new(0xF00F, "<16s", SCALE),
        THRESHOLDS_PARAM,
        CLIENT_PARAM,
        DATE_PARAM,
        SERIAL_PARAM,
        VIN_PARAM,
        VREF_PARAM,
        VOUT_PARAM,
        REG_PARAM,
        ORDER_PARAM,
        RS_PARAM,
        RD_PARAM,
        EEPROM_LOW_PARAM,
        EEPROM_HIGH_PARAM,
    ];

    pub const EST_1V2: &[P] = &[
        PASSWORD_PARAM,
        ACTIVE_TAP_PARAM,
        MEASURE_PARAM,
        P::new(0xE000, "<B", MEASURE_MODE).volatile(),
        TIMERS[0],
        TIMERS[1],
        TIMERS[2],
        TIMERS[3],
        TAPS_PARAM,
        MODE_PARAM,
        GAIN_L_PARAM,
        GAIN_U_PARAM,
        P::new(0xF00E, "<H", GAIN_V),
        P::new(0xF08A, "<16s", SCALE),
        THRESHOLDS_PARAM,
        CLIENT_PARAM,
        DATE_PARAM,
        SERIAL_PARAM,
        VIN_PARAM,
        VREF_PARAM,
        VOUT_PARAM,
        REG_PARAM,
        ORDER_PARAM,
        RS_PARAM,
        RD_PARAM,
        EEPROM_LOW_PARAM,
        EEPROM_HIGH_PARAM,
    ];

    /// The test kernel keeps the 1V0 layout and adds its debug registers.
    pub const EST_1V05_TEST: &[P] = &[
        PASSWORD_PARAM,
        ACTIVE_TAP_PARAM,
        MEASURE_PARAM,
        TIMERS[0],
        TIMERS[1],
        TIMERS[2],
        TIMERS[3],
        TAPS_PARAM,
        MODE_PARAM,
        GAIN_L_PARAM,
        GAIN_U_PARAM,
        P::new(0xF00E, "<b", GAIN_V),
        P::new(0xF00F, "<16s", SCALE),
        THRESHOLDS_PARAM,
        CLIENT_PARAM,
        DATE_PARAM,
        SERIAL_PARAM,
        VIN_PARAM,
        VREF_PARAM,
        VOUT_PARAM,
        REG_PARAM,
        ORDER_PARAM,
        RS_PARAM,
        RD_PARAM,
        EEPROM_LOW_PARAM,
        EEPROM_HIGH_PARAM,
        P::new(0xE09B, "<H", ADRES),
        P::new(0xE5A0, "<B", TEST_COMMAND),
        P::new(0xE5A1, "<H", "Test Variable[ 0]"),
        P::new(0xE5A3, "<H", "Test Variable[ 1]"),
        P::new(0xE5A5, "<H", "Test Variable[ 2]"),
        P::new(0xE5A7, "<H", "Test Variable[ 3]"),
        P::new(0xE5A9, "<H", "Test Variable[ 4]"),
        P::new(0xE5AB, "<H", "Test Variable[ 5]"),
        P::new(0xE5AD, "<H", "Test Variable[ 6]"),
        P::new(0xE5AF, "<H", "Test Variable[ 7]"),
        P::new(0xE5B1, "<H", "Test Variable[ 8]"),
        P::new(0xE5B3, "<H", "Test Variable[ 9]"),
        P::new(0xE5B5, "<H", "Test Variable[10]"),
        P::new(0xE5B7, "<H", "Test Variable[11]"),
        P::new(0xE5B9, "<H", "Test Variable[12]"),
        P::new(0xE5BB, "<H", "Test Variable[13]"),
        P::new(0xE5BD, "<H", "Test Variable[14]"),
        P::new(0xE5BF, "<H", "Test Variable[15]"),
    ];
}

/// Highest number of taps each hardware model can drive.
const TAP_LIMITS: &[(&str, usize)] = &[
    ("EstCard 2V3", 5),
    ("EstCard 5V1", 5),
    ("EstCard 13V1", 6),
    ("EstCard 23V0", 10),
    ("EstCard 2V5-7tap", 7),
    ("EstCard 18V0", 8),
    ("EstCard 24V0", 6),
    ("EstCard 20V1", 8),
    ("EstCard 6V1", 5),
    ("EstCard 27V0", 6),
    ("EstCard 2V5", 10),
    ("EstCard 2V5x", 10),
    ("EstCard 21V0", 4),
    ("EstCard 10V0", 6),
    ("EstCard 22V0", 10),
    ("EstCard 31V0", 9),
    ("EstCard 23V2", 10),
    ("EstCard 5V3", 5),
    ("EstCard 5V5", 5),
    ("EstCard 5V7", 5),
    ("EstCard 33V0", 7),
    ("EstCard 16V7", 6),
    ("EstCard 28V0", 9),
    ("EstCard 36V0", 10),
];

/// Hardware and software identification strings of a board.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub hardware_model: String,
    pub hardware_version: String,
    pub software_kernel: String,
    pub software_release: String,
    pub software_revision: String,
}

impl Identity {
    pub fn read(owner: &(impl ParameterOwner + ?Sized)) -> Result<Self> {
        let text = |descriptor: ParameterDescriptor| -> Result<String> {
            let value = descriptor.get(owner)?;
            Ok(value.as_str().unwrap_or_default().to_string())
        };
        Ok(Identity {
            hardware_model: text(HARDWARE_MODEL)?,
            hardware_version: text(HARDWARE_VERSION)?,
            software_kernel: text(SOFTWARE_KERNEL)?,
            software_release: text(SOFTWARE_RELEASE)?,
            software_revision: text(SOFTWARE_REVISION)?,
        })
    }
}

impl core::fmt::Display for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "{:>18} : {}", "Hardware model", self.hardware_model)?;
        writeln!(f, "{:>18} : {}", "Hardware version", self.hardware_version)?;
        writeln!(f, "{:>18} : {}", "Software kernel", self.software_kernel)?;
        writeln!(f, "{:>18} : {}", "Software release", self.software_release)?;
        write!(f, "{:>18} : {}", "Software revision", self.software_revision)
    }
}

/// Firmware family, told apart by the software kernel string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum BoardModel {
    #[strum(serialize = "CtrEst 1V0")]
    Est1V0,
    #[strum(serialize = "CtrEst 1V05_T")]
    Est1V05Test,
    #[strum(serialize = "CtrEst 1V2")]
    Est1V2,
    #[strum(serialize = "unknown")]
    Unknown,
}

impl BoardModel {
    pub fn from_identity(identity: &Identity) -> Self {
        identity
            .software_kernel
            .parse()
            .unwrap_or(BoardModel::Unknown)
    }

    pub fn is_known(self) -> bool {
        self != BoardModel::Unknown
    }

    pub fn parameters(self) -> &'static [ParameterDescriptor] {
        match self {
            BoardModel::Est1V0 => tables::EST_1V0,
            BoardModel::Est1V05Test => tables::EST_1V05_TEST,
            BoardModel::Est1V2 => tables::EST_1V2,
            BoardModel::Unknown => &[],
        }
    }

    pub fn descriptor(self, name: &str) -> Option<ParameterDescriptor> {
        self.parameters().iter().find(|p| p.name() == name).copied()
    }
}

/// Input pairing used while calibrating a 1V2 board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[repr(u8)]
pub enum MeasureMode {
    /// L-N and U-V, the working measurement.
    #[strum(serialize = "L Cal")]
    LCal = 0,
    /// L-N and U-N, V forced to 0.
    #[strum(serialize = "U Cal")]
    UCal = 1,
    /// L-N and V-N, U forced to 0.
    #[strum(serialize = "V Cal")]
    VCal = 2,
}

impl MeasureMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MeasureMode::LCal),
            1 => Some(MeasureMode::UCal),
            2 => Some(MeasureMode::VCal),
            _ => None,
        }
    }
}

/// The two measured phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum PhaseLabel {
    #[strum(serialize = "LN")]
    Ln,
    #[strum(serialize = "UV")]
    Uv,
}

impl PhaseLabel {
    fn gain_name(self) -> &'static str {
        match self {
            PhaseLabel::Ln => names::GAIN_L,
            PhaseLabel::Uv => names::GAIN_U,
        }
    }
}

fn gain_rule() -> ScalingRule {
    ScalingRule::new(
        |raw| (raw as f64 / GAIN_NOM).sqrt(),
        |eng| (eng * eng * GAIN_NOM).round() as i64,
    )
    .with_template("%7.5f [0x%04X]")
}

fn signed_gain_rule() -> ScalingRule {
    ScalingRule::new(
        |raw| 1.0 + raw as f64 / 1641.28,
        |eng| (1641.28 * (eng - 1.0)).trunc() as i64,
    )
    .with_range(-127, 127)
    .with_template("%6.4f [%+d]")
}

fn threshold_rule(scale: f64) -> ScalingRule {
    ScalingRule::new(
        move |raw| scale * (raw as f64 * GAIN_NOM / 65536.0).sqrt(),
        move |eng| ((eng / scale).powi(2) * 65536.0 / GAIN_NOM + 0.5).floor() as i64,
    )
    .with_range(0, 32768)
    .with_template("%6.2f [0x%04X]")
}

/// Upper and lower switching thresholds of one tap.
#[derive(Debug, Clone)]
pub struct TapThreshold {
    pub tap: usize,
    pub upper: ScaledParameter,
    pub lower: ScaledParameter,
}

impl TapThreshold {
    pub fn read(&self, owner: &(impl ParameterOwner + ?Sized)) -> Result<(ScaledValue, ScaledValue)> {
        Ok((self.upper.get(owner)?, self.lower.get(owner)?))
    }
}

struct CardLink<S: SerialChannel> {
    link: Arc<Connection<S>>,
    cache: ParameterCache,
}

impl<S: SerialChannel> ParameterOwner for CardLink<S> {
    fn transport(&self) -> &dyn Transport {
        &*self.link
    }

    fn cache(&self) -> &ParameterCache {
        &self.cache
    }
}

/// An identified board.
pub struct Card<S: SerialChannel + 'static> {
    shared: Arc<CardLink<S>>,
    identity: Identity,
    model: BoardModel,
    remote: AtomicBool,
    sampler: Mutex<Option<SamplerHandle>>,
    sampling: SamplingConfig,
    console: Option<ConsoleControl>,
}

impl Card<SerialPortChannel> {
    /// Open the configured port and identify the board on it.
    pub fn open(config: &LinkConfig) -> Result<Self> {
        let port = config
            .port
            .as_deref()
            .ok_or_else(|| Error::Config("no serial port configured".into()))?;
        let connection = Connection::open(port, &config.link_options())?;
        Ok(Card::connect(connection)?.with_sampling(config.sampling))
    }
}

impl<S: SerialChannel + 'static> Card<S> {
    pub fn connect(connection: Connection<S>) -> Result<Self> {
        let shared = Arc::new(CardLink {
            link: Arc::new(connection),
            cache: ParameterCache::new(),
        });

        debug!("Reading the device identification");
        let identity = Identity::read(&*shared)
            .map_err(|e| e.context("could not read the device identification"))?;
        let model = BoardModel::from_identity(&identity);
        if model.is_known() {
            info!("Software kernel recognised: {}", identity.software_kernel);
        } else {
            warn!("Software kernel not recognised: {:?}", identity.software_kernel);
        }

        Ok(Card {
            shared,
            identity,
            model,
            remote: AtomicBool::new(false),
            sampler: Mutex::new(None),
            sampling: SamplingConfig::default(),
            console: None,
        })
    }

    pub fn with_sampling(mut self, config: SamplingConfig) -> Self {
        self.sampling = config;
        self
    }

    /// Console to silence while sampling.
    pub fn with_console(mut self, console: ConsoleControl) -> Self {
        self.console = Some(console);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn model(&self) -> BoardModel {
        self.model
    }

    pub fn link(&self) -> &Connection<S> {
        &self.shared.link
    }

    pub fn descriptor(&self, name: &str) -> Result<ParameterDescriptor> {
        self.model
            .descriptor(name)
            .ok_or_else(|| Error::UnknownParameter(format!("'{name}' is not a parameter of {}", self.model)))
    }

    /// Names accepted by [`Card::get`] and [`Card::set`].
    pub fn parameter_names(&self) -> Vec<&'static str> {
        use strum::IntoEnumIterator;
        let mut names: Vec<&'static str> = self.model.parameters().iter().map(|p| p.name()).collect();
        if self.model.descriptor(names::MODE).is_some() {
            names.extend(ModeFlag::iter().map(ModeFlag::name));
        }
        names
    }

    /// Read a parameter, or a mode flag label, by display name.
    pub fn get(&self, name: &str) -> Result<ParamValue> {
        if let Some(flag) = ModeFlag::from_name(name) {
            let flags = self.mode_flags()?;
            return Ok(ParamValue::from(flags.label(flag)));
        }
        self.descriptor(name)?.get(self)
    }

    /// Write a parameter, or a mode flag from its label, by display name.
    pub fn set(&self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into();
        if ModeFlag::from_name(name).is_some() {
            let text = value
                .as_str()
                .ok_or_else(|| Error::InvalidValue(format!("{name} takes a label, got {value}")))?;
            return self.set_mode_flag(name, text);
        }
        self.descriptor(name)?.set(self, value)
    }

    /// Parsed measurement scale. NaN when the board was never calibrated.
    pub fn scale(&self) -> Result<f64> {
        let value = self.descriptor(names::SCALE)?.get(self)?;
        let text = value.as_str().unwrap_or_default().trim();
        text.parse::<f64>()
            .map_err(|_| Error::InvalidValue(format!("'{text}' is not a valid measurement scale")))
    }

    pub fn set_scale(&self, scale: f64) -> Result<()> {
        let mut text = Template::parse("%.9e")?.render(&[Arg::Float(scale)]);
        text.push('\0');
        self.descriptor(names::SCALE)?.set(self, text.as_str())
    }

    pub fn tap_limit(&self) -> Result<usize> {
        TAP_LIMITS
            .iter()
            .find(|(model, _)| *model == self.identity.hardware_model)
            .map(|(_, limit)| *limit)
            .ok_or_else(|| {
                Error::InvalidValue(format!(
                    "no tap limit known for hardware model '{}'",
                    self.identity.hardware_model
                ))
            })
    }

    pub fn taps_in_use(&self) -> Result<usize> {
        let value = self.descriptor(names::TAPS_IN_USE)?.get(self)?;
        value
            .as_i64()
            .map(|n| n as usize)
            .ok_or_else(|| Error::format("taps in use is not an integer"))
    }

    pub fn set_taps_in_use(&self, taps: usize) -> Result<()> {
        let limit = self.tap_limit()?;
        if taps > limit {
            return Err(Error::range(format!(
                "{taps} taps requested, the board handles at most {limit}"
            )));
        }
        self.descriptor(names::TAPS_IN_USE)?.set(self, taps as u64)
    }

    pub fn active_tap(&self) -> Result<u16> {
        let value = self.descriptor(names::ACTIVE_TAP)?.get(self)?;
        value
            .as_i64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| Error::format("active tap is not a 16 bit integer"))
    }

    /// Thresholds of every tap the hardware can drive.
    pub fn thresholds(&self) -> Result<Vec<TapThreshold>> {
        let base = self.descriptor(names::THRESHOLDS)?.address();
        let rule = threshold_rule(self.scale()?);
        (0..self.tap_limit()?)
            .map(|tap| -> Result<TapThreshold> {
                let address = base + 4 * tap as u16;
                Ok(TapThreshold {
                    tap,
                    upper: ScaledParameter::new(
                        ParameterDescriptor::new(address, "<H", names::UPPER_THRESHOLD),
                        rule.clone(),
                    )?,
                    lower: ScaledParameter::new(
                        ParameterDescriptor::new(address + 2, "<H", names::LOWER_THRESHOLD),
                        rule.clone(),
                    )?,
                })
            })
            .collect()
    }

    pub fn phase(&self, label: PhaseLabel) -> Phase<'_, S> {
        Phase { card: self, label }
    }

    /// Gain of the V input. Its encoding depends on the model.
    pub fn gain_v(&self) -> Result<ScaledParameter> {
        let descriptor = self.descriptor(names::GAIN_V)?;
        let rule = if descriptor.format_str() == "<b" {
            signed_gain_rule()
        } else {
            gain_rule()
        };
        ScaledParameter::new(descriptor, rule)
    }

    /// Inputs that can be calibrated on this hardware.
    pub fn inputs_available(&self) -> &'static [&'static str] {
        if self.identity.hardware_model == "EstCard 23V0" {
            &["L", "U"]
        } else {
            &["L", "U", "V"]
        }
    }

    /// Prepare a gain correction for `input` so that its running RMS reads `reference` volts.
    ///
    /// L is measured on the LN phase, U and V on UV. Needs a running sampler with samples.
    pub fn calibrator(&self, input: &str, reference: f64) -> Result<Calibrator<'_, S>> {
        let Some(&input) = self.inputs_available().iter().find(|i| **i == input) else {
            return Err(Error::InvalidValue(format!(
                "'{input}' is not a calibratable input, expected one of {:?}",
                self.inputs_available()
            )));
        };
        if !(reference.is_finite() && reference > 0.0) {
            return Err(Error::InvalidValue(format!(
                "calibration reference must be a positive voltage, got {reference}"
            )));
        }

        let (parameter, label) = match input {
            "L" => (self.phase(PhaseLabel::Ln).gain_parameter()?, PhaseLabel::Ln),
            "U" => (self.phase(PhaseLabel::Uv).gain_parameter()?, PhaseLabel::Uv),
            _ => (self.gain_v()?, PhaseLabel::Uv),
        };
        let sampler = self.sampler().ok_or_else(|| {
            Error::InvalidValue("calibration needs a running measurement".into())
        })?;
        let (ln, uv) = sampler.stats();
        let stats = match label {
            PhaseLabel::Ln => ln,
            PhaseLabel::Uv => uv,
        };
        if stats.count() == 0 {
            return Err(Error::InvalidValue(format!("no {label} samples to calibrate {input} from")));
        }

        let old = parameter.get(self)?;
        let new = parameter.validate(stats.rms() / reference * old.value())?;
        info!("Calibrating {input}: {old} -> {new} ({} V against {reference} V)", stats.rms());
        Ok(Calibrator {
            card: self,
            input,
            parameter,
            old,
            new,
        })
    }

    pub fn mode_flags(&self) -> Result<ModeFlags> {
        let value = self.descriptor(names::MODE)?.get(self)?;
        value
            .as_i64()
            .and_then(|v| u8::try_from(v).ok())
            .map(ModeFlags::from_byte)
            .ok_or_else(|| Error::format("mode is not a byte"))
    }

    /// Change one flag of the mode byte, e.g. `set_mode_flag("Feedback", "on")`.
    pub fn set_mode_flag(&self, name: &str, text: &str) -> Result<()> {
        let flag = ModeFlag::from_name(name)
            .ok_or_else(|| Error::UnknownParameter(format!("'{name}' is not a mode flag")))?;
        let on = flag.parse(text)?;
        let mut flags = self.mode_flags()?;
        flags.set(flag, on);
        self.descriptor(names::MODE)?.set(self, flags.to_byte())
    }

    /// Complete EEPROM image, 256 bytes.
    pub fn eeprom(&self) -> Result<Vec<u8>> {
        let mut contents = Vec::with_capacity(256);
        for name in [names::EEPROM_LOW, names::EEPROM_HIGH] {
            let half = self.descriptor(name)?.get(self)?;
            contents.extend(
                half.to_bytes()
                    .ok_or_else(|| Error::format(format!("{name} is not a byte array")))?,
            );
        }
        Ok(contents)
    }

    pub fn is_remote(&self) -> bool {
        self.remote.load(Ordering::Acquire)
    }

    /// Unlock configuration writes.
    pub fn enter_remote_mode(&self) -> Result<()> {
        self.descriptor(names::PASSWORD)?.set(self, PASSWORD)?;
        self.remote.store(true, Ordering::Release);
        debug!("Remote mode entered");
        Ok(())
    }

    /// Lock configuration writes again.
    ///
    /// 1V0 firmware doesn't answer this write properly, so its failure is ignored there.
    pub fn exit_remote_mode(&self) -> Result<()> {
        if !self.remote.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .descriptor(names::PASSWORD)
            .and_then(|p| p.set(self, CLEAR_PASSWORD));
        match (result, self.model) {
            (Err(e), BoardModel::Est1V0) => {
                debug!("Ignoring remote mode exit failure: {e}");
                Ok(())
            }
            (result, _) => result,
        }
    }

    pub fn measure_mode(&self) -> Result<MeasureMode> {
        let raw = self.descriptor(names::MEASURE_MODE)?.get(self)?.as_i64();
        raw.and_then(|v| u8::try_from(v).ok())
            .and_then(MeasureMode::from_raw)
            .ok_or_else(|| Error::InvalidValue(format!("unknown measurement mode {raw:?}")))
    }

    pub fn set_measure_mode(&self, mode: MeasureMode) -> Result<()> {
        self.descriptor(names::MEASURE_MODE)?.set(self, mode as u8)
    }

    /// One reading of the measure record.
    pub fn measure(&self) -> Result<MeasureRecord> {
        MeasureRecord::try_from(&self.descriptor(names::MEASURE)?.get(self)?)
    }

    /// Start sampling the measure record in the background, replacing any running sampler.
    pub fn start_measure(&self) -> Result<SamplerHandle> {
        let scale = self.scale()?;
        if scale.is_nan() {
            return Err(Error::InvalidValue(
                "cannot measure, the measurement scale is invalid (NaN)".into(),
            ));
        }
        let scales = (
            self.phase(PhaseLabel::Ln).stats_scale()?,
            self.phase(PhaseLabel::Uv).stats_scale()?,
        );
        let measure = self.descriptor(names::MEASURE)?;

        // Held until the new handle is stored, so concurrent starts leave one sampler.
        let mut slot = self.sampler.lock();
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        let shared = Arc::clone(&self.shared);
        let source = move || MeasureRecord::try_from(&measure.get(&*shared)?);
        let handle = Sampler::spawn(source, scales, &self.sampling, self.console.clone())?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Select the measurement mode of a 1V2 board, then start sampling.
    pub fn start_measure_in(&self, mode: MeasureMode) -> Result<SamplerHandle> {
        self.set_measure_mode(mode)?;
        self.start_measure()
    }

    pub fn stop_measure(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.stop();
        }
    }

    pub fn sampler(&self) -> Option<SamplerHandle> {
        self.sampler.lock().clone()
    }

    /// Stop sampling, leave remote mode, forget cached values and close the link.
    ///
    /// Everything is released even when leaving remote mode fails; that error is returned.
    pub fn close(self) -> Result<()> {
        self.stop_measure();
        let exit = match self.model {
            // The test kernel never locks configuration on close.
            BoardModel::Est1V05Test => Ok(()),
            _ => self.exit_remote_mode(),
        };
        let evicted = self.shared.cache.evict_connection(self.shared.link.id());
        debug!("Evicted {evicted} cached values");
        self.shared.link.close();
        exit
    }
}

impl<S: SerialChannel + 'static> ParameterOwner for Card<S> {
    fn transport(&self) -> &dyn Transport {
        &*self.shared.link
    }

    fn cache(&self) -> &ParameterCache {
        &self.shared.cache
    }
}

impl<S: SerialChannel + 'static> Drop for Card<S> {
    fn drop(&mut self) {
        self.stop_measure();
    }
}

impl<S: SerialChannel + 'static> core::fmt::Debug for Card<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Card")
            .field("port", &self.shared.link.label())
            .field("model", &self.model)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// One measured phase of a card: its gain and the scale of its statistics.
pub struct Phase<'a, S: SerialChannel + 'static> {
    card: &'a Card<S>,
    label: PhaseLabel,
}

impl<S: SerialChannel + 'static> Phase<'_, S> {
    pub fn label(&self) -> PhaseLabel {
        self.label
    }

    pub fn gain_parameter(&self) -> Result<ScaledParameter> {
        ScaledParameter::new(self.card.descriptor(self.label.gain_name())?, gain_rule())
    }

    pub fn gain(&self) -> Result<ScaledValue> {
        self.gain_parameter()?.get(self.card)
    }

    pub fn set_gain(&self, gain: f64) -> Result<ScaledValue> {
        self.gain_parameter()?.set(self.card, gain)
    }

    /// Volts per unit of square root of the squared magnitude.
    pub fn stats_scale(&self) -> Result<f64> {
        Ok(self.card.scale()? / self.gain()?.value())
    }
}

/// A gain correction computed by [`Card::calibrator`], written by [`commit`](Self::commit).
pub struct Calibrator<'a, S: SerialChannel + 'static> {
    card: &'a Card<S>,
    input: &'static str,
    parameter: ScaledParameter,
    old: ScaledValue,
    new: ScaledValue,
}

impl<S: SerialChannel + 'static> Calibrator<'_, S> {
    pub fn input(&self) -> &'static str {
        self.input
    }

    /// Gain on the board when the correction was computed.
    pub fn current(&self) -> &ScaledValue {
        &self.old
    }

    pub fn corrected(&self) -> &ScaledValue {
        &self.new
    }

    pub fn commit(&self) -> Result<ScaledValue> {
        self.parameter.set_internal(self.card, self.new.internal())
    }
}

impl<S: SerialChannel + 'static> core::fmt::Debug for Calibrator<'_, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Calibrator")
            .field("input", &self.input)
            .field("old", &self.old)
            .field("new", &self.new)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkOptions;
    use crate::mock_serial::{MockBoard, MockSerial};
    use crate::sampling::SamplerStatus;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    fn board(kernel: &str, hardware: &str) -> MockBoard {
        let board = MockBoard::new();
        board.load_str(0x0000, hardware, 18);
        board.load_str(0x0012, "A", 18);
        board.load_str(0x0024, kernel, 18);
        board.load_str(0x0036, "1", 18);
        board.load_str(0x0048, "7", 18);
        board
    }

    fn est_1v0() -> MockBoard {
        let board = board("CtrEst 1V0", "EstCard 18V0");
        board.load_str(0xF00F, "2.300000000e+02", 16);
        board.load(0xF00A, &50362u16.to_le_bytes());
        board.load(0xF00C, &50362u16.to_le_bytes());
        board.load(0xF008, &[6]);
        board
    }

    fn est_1v2() -> MockBoard {
        let board = board("CtrEst 1V2", "EstCard 23V0");
        board.load_str(0xF08A, "2.000000000e+02", 16);
        board.load(0xF00A, &50362u16.to_le_bytes());
        board.load(0xF00C, &50362u16.to_le_bytes());
        board
    }

    fn connect(board: &MockBoard) -> Card<MockSerial> {
        Card::connect(Connection::new(board.serial(), "mock", LinkOptions::default())).unwrap()
    }

    #[test]
    #[traced_test]
    fn identifies_models() {
        let card = connect(&est_1v0());
        assert_eq!(card.model(), BoardModel::Est1V0);
        assert_eq!(card.identity().hardware_model, "EstCard 18V0");
        assert_eq!(card.identity().software_revision, "7");
        assert!(logs_contain("Software kernel recognised: CtrEst 1V0"));

        assert_eq!(connect(&est_1v2()).model(), BoardModel::Est1V2);
        assert_eq!(
            connect(&board("CtrEst 1V05_T", "EstCard 2V5")).model(),
            BoardModel::Est1V05Test
        );

        let unknown = connect(&board("CtrEst 9V9", "EstCard 2V5"));
        assert_eq!(unknown.model(), BoardModel::Unknown);
        assert!(matches!(unknown.get(names::SCALE), Err(Error::UnknownParameter(_))));
        assert!(unknown.parameter_names().is_empty());
    }

    #[test]
    fn kernel_names() {
        assert_eq!("CtrEst 1V05_T".parse::<BoardModel>().ok(), Some(BoardModel::Est1V05Test));
        assert_eq!(BoardModel::Est1V2.to_string(), "CtrEst 1V2");
        assert!(BoardModel::Est1V0.descriptor(names::MEASURE_MODE).is_none());
        assert!(BoardModel::Est1V2.descriptor(names::MEASURE_MODE).unwrap().is_volatile());
    }

    #[test]
    fn identification_failure_is_a_connection_error() {
        let board = est_1v0();
        board.set_silent(true);
        let result = Card::connect(Connection::new(board.serial(), "mock", LinkOptions::default()));
        match result {
            Err(Error::Protocol(e)) => {
                assert_eq!(e.message(), "could not read the device identification");
                assert!(e.chain().contains("timeout"));
            }
            other => panic!("Unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn get_and_set_by_name() {
        let board = est_1v0();
        let card = connect(&board);

        assert_eq!(card.get(names::TAPS_IN_USE).unwrap().as_i64(), Some(6));
        card.set(names::CLIENT, "ACME Power").unwrap();
        assert_eq!(card.get(names::CLIENT).unwrap().as_str(), Some("ACME Power"));
        assert_eq!(&board.memory(0xF053, 11), b"ACME Power\0");

        assert!(matches!(card.get("Turbo"), Err(Error::UnknownParameter(_))));
        assert!(matches!(card.set("Turbo", 1u8), Err(Error::UnknownParameter(_))));
        // 1V0 has no measurement mode.
        assert!(matches!(card.measure_mode(), Err(Error::UnknownParameter(_))));
        assert!(card.parameter_names().contains(&"Feedback"));
    }

    #[test]
    fn scale_location_depends_on_model() {
        let card = connect(&est_1v0());
        assert_eq!(card.scale().unwrap(), 230.0);

        let board = est_1v2();
        let card = connect(&board);
        assert_eq!(card.scale().unwrap(), 200.0);

        card.set_scale(231.5).unwrap();
        assert_eq!(&board.memory(0xF08A, 16), b"2.315000000e+02\0");
        assert_eq!(card.scale().unwrap(), 231.5);
    }

    #[test]
    fn uncalibrated_scale_refuses_sampling() {
        let board = est_1v0();
        board.load_str(0xF00F, "nan", 16);
        let card = connect(&board);
        assert!(card.scale().unwrap().is_nan());
        assert!(matches!(card.start_measure(), Err(Error::InvalidValue(_))));

        board.load_str(0xF00F, "garbage", 16);
        let card = connect(&board);
        assert!(matches!(card.scale(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn taps_are_limited_by_hardware() {
        let board = est_1v0();
        let card = connect(&board);
        assert_eq!(card.tap_limit().unwrap(), 8);

        card.set_taps_in_use(8).unwrap();
        assert_eq!(board.memory(0xF008, 1), [8]);
        let sets = board.sets();
        assert!(matches!(card.set_taps_in_use(9), Err(Error::Range(_))));
        assert_eq!(board.sets(), sets);
        assert_eq!(card.taps_in_use().unwrap(), 8);

        let odd = connect(&board_with_hardware("EstCard 99V9"));
        assert!(matches!(odd.tap_limit(), Err(Error::InvalidValue(_))));
    }

    fn board_with_hardware(hardware: &str) -> MockBoard {
        board("CtrEst 1V0", hardware)
    }

    #[test]
    fn thresholds_follow_the_scale() {
        let board = est_1v0();
        // Tap 2: upper 0x1000 at 0xF01F + 8, lower 0x0800 at + 2.
        board.load(0xF027, &[0x00, 0x10, 0x00, 0x08]);
        let card = connect(&board);

        let thresholds = card.thresholds().unwrap();
        assert_eq!(thresholds.len(), 8);
        let (upper, lower) = thresholds[2].read(&card).unwrap();
        assert_eq!(upper.internal(), 0x1000);
        assert_eq!(lower.internal(), 0x0800);
        let expected = 230.0 * (4096.0 * GAIN_NOM / 65536.0f64).sqrt();
        assert!((upper.value() - expected).abs() < 1e-9);
        assert_eq!(upper.to_string(), format!("{expected:6.2} [0x1000]"));

        let written = thresholds[0].upper.set(&card, 250.0).unwrap();
        let raw = ((250.0f64 / 230.0).powi(2) * 65536.0 / GAIN_NOM + 0.5).floor() as u16;
        assert_eq!(written.internal(), raw as i64);
        assert_eq!(board.memory(0xF01F, 2), raw.to_le_bytes());

        // Far above the top of the range.
        assert!(matches!(thresholds[0].upper.set(&card, 100_000.0), Err(Error::Range(_))));
    }

    #[test]
    fn phase_gains() {
        let board = est_1v0();
        let card = connect(&board);
        let ln = card.phase(PhaseLabel::Ln);
        assert_eq!(ln.label().to_string(), "LN");
        assert!((ln.gain().unwrap().value() - 1.0).abs() < 1e-12);
        assert_eq!(ln.stats_scale().unwrap(), 230.0);

        let uv = card.phase(PhaseLabel::Uv);
        let written = uv.set_gain(1.1).unwrap();
        assert_eq!(written.internal(), (1.21 * GAIN_NOM).round() as i64);
        assert_eq!(written.to_string(), format!("{:7.5} [0x{:04X}]", written.value(), written.internal()));
        assert!(matches!(uv.set_gain(1.2), Err(Error::Range(_))));
    }

    #[test]
    fn gain_v_encoding_per_model() {
        let board = est_1v0();
        board.load(0xF00E, &[0xF6]);
        let card = connect(&board);
        let gain = card.gain_v().unwrap();
        let value = gain.get(&card).unwrap();
        assert_eq!(value.internal(), -10);
        assert!((value.value() - (1.0 - 10.0 / 1641.28)).abs() < 1e-12);
        assert!(matches!(gain.set(&card, 1.1), Err(Error::Range(_))));
        gain.set(&card, 1.05).unwrap();
        assert_eq!(board.memory(0xF00E, 1), [82]);

        let board = est_1v2();
        board.load(0xF00E, &50362u16.to_le_bytes());
        let card = connect(&board);
        assert!((card.gain_v().unwrap().get(&card).unwrap().value() - 1.0).abs() < 1e-12);
        assert_eq!(card.inputs_available(), ["L", "U"]);
    }

    #[test]
    fn mode_flags_by_name() {
        let board = est_1v0();
        board.load(0xF009, &[0x01]);
        let card = connect(&board);

        assert_eq!(card.get("Coordination Input").unwrap().as_str(), Some("Active"));
        assert_eq!(card.get("Input Selection").unwrap().as_str(), Some("LN"));

        card.set("Input Selection", "UV").unwrap();
        card.set_mode_flag("Feedback", "on").unwrap();
        assert_eq!(board.memory(0xF009, 1), [0x19]);
        assert!(card.mode_flags().unwrap().is_set(ModeFlag::Feedback));

        assert!(matches!(card.set("Feedback", "sometimes"), Err(Error::InvalidValue(_))));
        assert!(matches!(card.set("Feedback", 1u8), Err(Error::InvalidValue(_))));
        assert_eq!(board.memory(0xF009, 1), [0x19]);
    }

    #[test]
    fn eeprom_image() {
        let board = est_1v0();
        let image: Vec<u8> = (0..=255).collect();
        board.load(0xF000, &image);
        let card = connect(&board);
        assert_eq!(card.eeprom().unwrap(), image);
    }

    #[test]
    fn remote_mode_on_1v0_ignores_exit_failure() {
        let board = est_1v0();
        let card = connect(&board);

        card.enter_remote_mode().unwrap();
        assert!(card.is_remote());
        assert_eq!(&board.memory(0xE400, 8), b"CFG_USER");

        board.reject_writes_at(0xE400);
        card.exit_remote_mode().unwrap();
        assert!(!card.is_remote());

        board.accept_all_writes();
        card.enter_remote_mode().unwrap();
        card.exit_remote_mode().unwrap();
        assert_eq!(&board.memory(0xE400, 8), b"--------");
    }

    #[test]
    fn remote_mode_on_1v2_reports_exit_failure() {
        let board = est_1v2();
        let card = connect(&board);
        card.enter_remote_mode().unwrap();
        board.reject_writes_at(0xE400);
        assert!(matches!(card.exit_remote_mode(), Err(Error::Protocol(_))));
        // Not in remote mode any more, nothing to do.
        card.exit_remote_mode().unwrap();
    }

    #[test]
    fn measure_mode_on_1v2() {
        let board = est_1v2();
        let card = connect(&board);
        card.set_measure_mode(MeasureMode::VCal).unwrap();
        assert_eq!(board.memory(0xE000, 1), [2]);
        assert_eq!(card.measure_mode().unwrap(), MeasureMode::VCal);
        assert_eq!(MeasureMode::UCal.to_string(), "U Cal");

        board.load(0xE000, &[7]);
        assert!(matches!(card.measure_mode(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_kernel_registers() {
        let board = board("CtrEst 1V05_T", "EstCard 2V5");
        board.load(0xE5BF, &[0x34, 0x12]);
        let card = connect(&board);
        assert_eq!(card.get("Test Variable[15]").unwrap().as_i64(), Some(0x1234));
        card.set(names::TEST_COMMAND, 3u8).unwrap();
        assert_eq!(board.memory(0xE5A0, 1), [3]);
        assert_eq!(card.parameter_names().iter().filter(|n| n.starts_with("Test Variable")).count(), 16);
    }

    #[test]
    fn sampling_runs_beside_foreground_commands() {
        let board = est_1v0();
        // Tap 3, LN = 100^2, UV = 50^2.
        board.load(0xE408, &[3, 0x10, 0x27, 0xC4, 0x09]);
        let card = connect(&board);

        let handle = card.start_measure().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.records().len() < 50 {
            assert!(Instant::now() < deadline, "no samples");
            // Foreground traffic on the same link.
            assert_eq!(card.get(names::TAPS_IN_USE).unwrap().as_i64(), Some(6));
            card.set(names::DATE, "2024-01-01").unwrap();
        }

        assert_eq!(handle.last(), Some(MeasureRecord { tap: 3, ln: 10_000, uv: 2_500 }));
        let (ln, uv) = handle.stats();
        assert!((ln.rms() - 100.0 * 230.0).abs() < 1e-6);
        assert!((uv.rms() - 50.0 * 230.0).abs() < 1e-6);
        assert_eq!(handle.status(), SamplerStatus::Running);

        card.stop_measure();
        assert_eq!(handle.status(), SamplerStatus::Stopped);
        assert!(card.sampler().is_none());
    }

    fn wait_for_samples(handle: &SamplerHandle, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.records().len() < count {
            assert!(Instant::now() < deadline, "no samples");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn concurrent_starts_leave_one_sampler() {
        let board = est_1v0();
        board.load(0xE408, &[3, 0x10, 0x27, 0xC4, 0x09]);
        let card = connect(&board);

        let handles: Vec<SamplerHandle> = std::thread::scope(|s| {
            let starts: Vec<_> = (0..4).map(|_| s.spawn(|| card.start_measure().unwrap())).collect();
            starts.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert_eq!(handles.iter().filter(|h| h.is_running()).count(), 1);
        let current = card.sampler().unwrap();
        assert!(current.is_running());
        card.stop_measure();
        assert!(handles.iter().all(|h| !h.is_running()));
    }

    #[test]
    fn calibrates_phase_gain_from_running_rms() {
        let board = est_1v0();
        // LN = 100^2, UV = 50^2, scale 230 and unit gains: 23000 V and 11500 V.
        board.load(0xE408, &[3, 0x10, 0x27, 0xC4, 0x09]);
        let card = connect(&board);
        let handle = card.start_measure().unwrap();
        wait_for_samples(&handle, 5);

        let calibrator = card.calibrator("L", 23_000.0 / 1.02).unwrap();
        assert_eq!(calibrator.input(), "L");
        assert_eq!(calibrator.current().internal(), 50362);
        assert!((calibrator.corrected().value() - 1.02).abs() < 1e-4);
        assert_eq!(calibrator.corrected().internal(), 52397);
        // Nothing written until committed.
        assert_eq!(board.memory(0xF00A, 2), 50362u16.to_le_bytes());

        calibrator.commit().unwrap();
        assert_eq!(board.memory(0xF00A, 2), 52397u16.to_le_bytes());
        assert_eq!(card.phase(PhaseLabel::Ln).gain().unwrap().internal(), 52397);

        // V is measured on UV and uses the signed encoding on 1V0.
        let calibrator = card.calibrator("V", 11_500.0 / 1.05).unwrap();
        assert_eq!(calibrator.current().internal(), 0);
        calibrator.commit().unwrap();
        assert_eq!(board.memory(0xF00E, 1), [82]);
        card.stop_measure();
    }

    #[test]
    fn calibration_rejects_bad_requests() {
        let board = est_1v2();
        board.load(0xE408, &[3, 0x10, 0x27, 0xC4, 0x09]);
        let card = connect(&board);

        // No sampler yet.
        assert!(matches!(card.calibrator("L", 230.0), Err(Error::InvalidValue(_))));

        let handle = card.start_measure().unwrap();
        wait_for_samples(&handle, 5);
        let sets = board.sets();

        // 23V0 hardware has no V input.
        assert!(matches!(card.calibrator("V", 230.0), Err(Error::InvalidValue(_))));
        assert!(matches!(card.calibrator("N", 230.0), Err(Error::InvalidValue(_))));
        assert!(matches!(card.calibrator("L", 0.0), Err(Error::InvalidValue(_))));
        assert!(matches!(card.calibrator("L", f64::NAN), Err(Error::InvalidValue(_))));
        // A gain above what the register holds.
        assert!(matches!(card.calibrator("U", 10_000.0 / 1.5), Err(Error::Range(_))));
        assert_eq!(board.sets(), sets);
        card.stop_measure();
    }

    #[test]
    fn close_releases_everything() {
        let board = est_1v0();
        let card = connect(&board);
        card.enter_remote_mode().unwrap();
        let handle = card.start_measure().unwrap();
        assert!(!card.cache().is_empty());
        let id = card.link().id();
        let cache_len_for_link = card.cache().len();
        assert!(cache_len_for_link > 0);

        let link = Arc::clone(&card.shared.link);
        let shared = Arc::clone(&card.shared);
        card.close().unwrap();

        assert!(!handle.is_running());
        assert!(!link.is_open());
        assert_eq!(&board.memory(0xE400, 8), b"--------");
        assert_eq!(shared.cache.evict_connection(id), 0);
    }
}
