//! Layered settings: built in defaults, then an optional TOML file, then `EST_LINK_`
//! environment variables (`__` separates nested keys, e.g. `EST_LINK_SAMPLING__ERROR_LEAK`).

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use fugit::MillisDurationU32;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{LogConfig, parse_level};
use crate::error::{Error, Result};
use crate::link::LinkOptions;
use crate::sampling::SamplingConfig;

pub const ENV_PREFIX: &str = "EST_LINK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port to open, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub byte_timeout_ms: u32,
    pub response_timeout_ms: u32,
    /// Delay after each transmitted byte. 50 ms is known to work on every adapter.
    pub pacing_ms: Option<u32>,
    pub sampling: SamplingConfig,
    pub log: LogConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let options = LinkOptions::default();
        Self {
            port: None,
            baud_rate: options.baud_rate,
            byte_timeout_ms: options.byte_timeout.to_millis(),
            response_timeout_ms: options.response_timeout.to_millis(),
            pacing_ms: None,
            sampling: SamplingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            baud_rate: self.baud_rate,
            byte_timeout: MillisDurationU32::millis(self.byte_timeout_ms),
            response_timeout: MillisDurationU32::millis(self.response_timeout_ms),
            pacing: self.pacing_ms.map(MillisDurationU32::millis),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be positive".into()));
        }
        if self.byte_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.response_timeout_ms < self.byte_timeout_ms {
            return Err(Error::Config(format!(
                "response_timeout_ms ({}) is shorter than byte_timeout_ms ({})",
                self.response_timeout_ms, self.byte_timeout_ms
            )));
        }
        let sampling = &self.sampling;
        if sampling.error_threshold.is_nan() || sampling.error_threshold <= 0.0 {
            return Err(Error::Config("sampling.error_threshold must be positive".into()));
        }
        if sampling.error_leak.is_nan() || sampling.error_leak < 0.0 {
            return Err(Error::Config("sampling.error_leak must not be negative".into()));
        }
        parse_level(&self.log.console_level)?;
        Ok(())
    }
}

/// Load the settings, `path` being an optional TOML file.
pub fn load_config(path: Option<&Path>) -> Result<LinkConfig> {
    let mut figment = Figment::from(Serialized::defaults(LinkConfig::default()));
    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Config(format!("{} does not exist", path.display())));
        }
        figment = figment.merge(Toml::file(path));
    }
    let config: LinkConfig = figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()?;
    config.validate()?;
    Ok(config)
}
