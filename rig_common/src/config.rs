//! TOML configuration loading and validation.
//!
//! All configuration is volatile: nothing here is written back, and a
//! restart starts from the file again. Channel counts size the input and
//! output arrays once at startup; they are never resized afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::{DEFAULT_CODE_BITS, DEFAULT_TIC_HZ, FREQ_MULTIPLIER};

/// Error type for configuration loading.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Rig engine configuration.
///
/// # TOML Example
///
/// ```toml
/// tic_hz = 1000
/// digital_inputs = 8
/// analog_inputs = 8
/// outputs = 8
/// code_bits = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigConfig {
    /// Control-tic frequency [Hz]. The hardware timer fires at
    /// `tic_hz * FREQ_MULTIPLIER`.
    #[serde(default = "default_tic_hz")]
    pub tic_hz: u32,

    /// Number of digital acquisition channels (inputs 0..digital_inputs).
    pub digital_inputs: u16,

    /// Number of analog acquisition channels (inputs after the digital block).
    pub analog_inputs: u16,

    /// Number of output channels.
    pub outputs: u16,

    /// Event-code line width in bits.
    #[serde(default = "default_code_bits")]
    pub code_bits: u16,
}

fn default_tic_hz() -> u32 {
    DEFAULT_TIC_HZ
}

fn default_code_bits() -> u16 {
    DEFAULT_CODE_BITS
}

impl RigConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tic_hz == 0 {
            return Err(ConfigError::Validation("tic_hz must be > 0".into()));
        }
        if self.input_count() == 0 {
            return Err(ConfigError::Validation(
                "at least one input channel is required".into(),
            ));
        }
        if self.outputs == 0 {
            return Err(ConfigError::Validation(
                "at least one output channel is required".into(),
            ));
        }
        if !(2..=15).contains(&self.code_bits) {
            return Err(ConfigError::Validation(
                "code_bits must be within 2..=15".into(),
            ));
        }
        Ok(())
    }

    /// Total number of inputs (digital block first, then analog).
    #[inline]
    pub fn input_count(&self) -> u16 {
        self.digital_inputs + self.analog_inputs
    }

    /// Timer frequency the scheduler callback is bound to [Hz].
    #[inline]
    pub fn timer_hz(&self) -> u32 {
        self.tic_hz * u32::from(FREQ_MULTIPLIER)
    }

    /// Largest transmittable event code for the configured line width.
    #[inline]
    pub fn max_code(&self) -> u16 {
        (1u16 << self.code_bits) - 1
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            tic_hz: DEFAULT_TIC_HZ,
            digital_inputs: 8,
            analog_inputs: 8,
            outputs: 8,
            code_bits: DEFAULT_CODE_BITS,
        }
    }
}
