//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `APDCAM_DAQ_`, nested keys separated by
//!    `__` (e.g. `APDCAM_DAQ_ACQUISITION__PROCESS_PERIOD=50`)
//!
//! # Example
//! ```no_run
//! use apdcam_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load_from("config/apdcam_daq.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), apdcam_daq::error::DaqError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::data::MAX_CHANNELS;
use crate::error::{AppResult, DaqError};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "APDCAM_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Buffer geometry and producer cadence
    pub acquisition: AcquisitionConfig,
    /// Processors in execution order
    pub processors: Vec<ProcessorDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "APDCAM DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Acquisition buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Size of the channel table
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Ring buffer capacity per channel, a power of two
    #[serde(default = "default_sample_buffer_size")]
    pub sample_buffer_size: usize,
    /// Shots accumulated by the producer before a new range is published
    #[serde(default = "default_process_period")]
    pub process_period: u64,
    /// Absolute channel numbers to enable; empty enables every channel
    #[serde(default)]
    pub enabled_channels: Vec<usize>,
    /// Resolution of the synthetic samples
    #[serde(default = "default_sample_bits")]
    pub sample_bits: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            sample_buffer_size: default_sample_buffer_size(),
            process_period: default_process_period(),
            enabled_channels: Vec::new(),
            sample_bits: default_sample_bits(),
        }
    }
}

impl AcquisitionConfig {
    /// The channels to enable, with the "empty means all" rule applied.
    pub fn enabled_channels(&self) -> Vec<usize> {
        if self.enabled_channels.is_empty() {
            (0..self.max_channels).collect()
        } else {
            self.enabled_channels.clone()
        }
    }

    /// Longest trailing window a processor may keep resident without stalling the
    /// producer: one period of free slots must remain for the next batch.
    pub fn max_retained_window(&self) -> u64 {
        (self.sample_buffer_size as u64)
            .saturating_sub(self.process_period)
            .saturating_add(1)
    }
}

/// Processor definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorDefinition {
    /// Processor type (`diskdump`, `moving_average`, `offset`, `native`)
    pub r#type: String,
    /// Name used in logs; defaults to `<type>-<index>`
    #[serde(default)]
    pub name: Option<String>,
    /// Whether this processor is registered
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Processor-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

impl ProcessorDefinition {
    /// Name of the entry at position `index`.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.r#type, index))
    }
}

// Default value functions
fn default_max_channels() -> usize {
    MAX_CHANNELS
}

fn default_sample_buffer_size() -> usize {
    1 << 18
}

fn default_process_period() -> u64 {
    100
}

fn default_sample_bits() -> u32 {
    14
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl DaqConfig {
    /// Load configuration from a specific file path, merged with the environment.
    ///
    /// Keys missing from the file fall back to the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: DaqConfig = Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acquisition = &self.acquisition;
        if !acquisition.sample_buffer_size.is_power_of_two() {
            return Err(DaqError::Configuration(format!(
                "sample_buffer_size {} must be a non-zero power of two",
                acquisition.sample_buffer_size
            )));
        }
        if acquisition.process_period == 0 {
            return Err(DaqError::Configuration(
                "process_period must be at least 1".to_string(),
            ));
        }
        if acquisition.process_period >= acquisition.sample_buffer_size as u64 {
            return Err(DaqError::Configuration(format!(
                "process_period {} must be smaller than sample_buffer_size {}",
                acquisition.process_period, acquisition.sample_buffer_size
            )));
        }
        if acquisition.sample_bits == 0 || acquisition.sample_bits > 16 {
            return Err(DaqError::Configuration(format!(
                "sample_bits {} must be within 1..=16",
                acquisition.sample_bits
            )));
        }

        let mut seen = HashSet::new();
        for &channel in &acquisition.enabled_channels {
            if channel >= acquisition.max_channels {
                return Err(DaqError::Configuration(format!(
                    "Enabled channel {} is out of range (max_channels = {})",
                    channel, acquisition.max_channels
                )));
            }
            if !seen.insert(channel) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate enabled channel: {channel}"
                )));
            }
        }

        let max_window = acquisition.max_retained_window();
        for (index, definition) in self.processors.iter().enumerate() {
            if !definition.enabled || definition.r#type != "moving_average" {
                continue;
            }
            let window = definition
                .config
                .get("window")
                .and_then(toml::Value::as_integer)
                .unwrap_or(0);
            if window > 0 && window as u64 > max_window {
                return Err(DaqError::Configuration(format!(
                    "Processor '{}': window {} exceeds the {} shots the ring can retain",
                    definition.display_name(index),
                    window,
                    max_window
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled processor definitions
    pub fn enabled_processors(&self) -> Vec<&ProcessorDefinition> {
        self.processors.iter().filter(|p| p.enabled).collect()
    }
}
