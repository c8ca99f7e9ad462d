use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slot count of the emulated USBv5 driver.
pub const DEFAULT_MAX_DEVICES: usize = 32;
/// Slot indices are encoded in one byte of the guest handle.
pub const MAX_DEVICES_LIMIT: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("max_devices must be in 1..=256, got {0}")]
    MaxDevices(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HidV5Config {
    /// Registry capacity.
    pub max_devices: usize,
    /// Log unrecognized commands at `warn` instead of `debug`.
    pub log_unknown_requests: bool,
}

impl Default for HidV5Config {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
            log_unknown_requests: true,
        }
    }
}

impl HidV5Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_devices == 0 || self.max_devices > MAX_DEVICES_LIMIT {
            return Err(ConfigError::MaxDevices(self.max_devices));
        }
        Ok(())
    }
}
