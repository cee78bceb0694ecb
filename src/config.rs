use std::{fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Location of one GPIO line on a chip.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct GpioSpec {
    pub chip: String,
    pub line: u32,
}

/// One node of the hardware description, the unit the registry binds drivers to.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub compatible: String,
    #[serde(default)]
    pub gpios: FxHashMap<String, GpioSpec>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InputConfig {
    pub max_devices: usize,
    pub max_registered: usize,
    pub broadcast_capacity: usize,
    pub event_history_capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_devices: 16,
            max_registered: 16,
            broadcast_capacity: 64,
            event_history_capacity: 32,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BoardConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub input: InputConfig,
}

impl BoardConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DriverError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| DriverError::Config(format!("Failed to read board description: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, DriverError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| DriverError::Config(format!("Invalid board description json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DriverError> {
        let mut seen = FxHashMap::default();
        for dev in &self.devices {
            if dev.name.is_empty() {
                return Err(DriverError::Config("device with empty name".into()));
            }
            if seen.insert(dev.name.as_str(), ()).is_some() {
                return Err(DriverError::Config(format!(
                    "duplicate device name {}",
                    dev.name
                )));
            }
        }
        if self.input.broadcast_capacity == 0 {
            return Err(DriverError::Config(
                "input.broadcast_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
