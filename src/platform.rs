use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::{DeviceConfig, GpioSpec};
use crate::error::DriverError;

/// A device discovered in the hardware description.
#[derive(Debug, Clone)]
pub struct PlatformDevice {
    config: Arc<DeviceConfig>,
}

impl PlatformDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn compatible(&self) -> &str {
        &self.config.compatible
    }

    pub fn gpio(&self, name: &str) -> Option<&GpioSpec> {
        self.config.gpios.get(name)
    }
}

impl fmt::Display for PlatformDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.config.name, self.config.compatible)
    }
}

pub trait PlatformDriver: Send + Sync {
    /// Per-device state kept by the registry between bind and unbind.
    type Context: Send;

    fn name(&self) -> &'static str;
    fn compatible(&self) -> &'static [&'static str];
    fn bind(&self, device: &PlatformDevice) -> Result<Self::Context, DriverError>;
    fn unbind(&self, device: &PlatformDevice, context: Self::Context);

    fn matches(&self, device: &PlatformDevice) -> bool {
        self.compatible().contains(&device.compatible())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    Unbound,
    Probing,
    Bound,
    Removing,
}

enum Slot<C> {
    Probing,
    Bound { device: PlatformDevice, context: C },
    Removing,
}

impl<C> Slot<C> {
    fn state(&self) -> DeviceState {
        match self {
            Slot::Probing => DeviceState::Probing,
            Slot::Bound { .. } => DeviceState::Bound,
            Slot::Removing => DeviceState::Removing,
        }
    }
}

pub struct DeviceRegistry<D: PlatformDriver> {
    driver: D,
    slots: Mutex<FxHashMap<String, Slot<D::Context>>>,
}

impl<D: PlatformDriver> DeviceRegistry<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn state(&self, name: &str) -> DeviceState {
        self.slots
            .lock()
            .get(name)
            .map(Slot::state)
            .unwrap_or(DeviceState::Unbound)
    }

    pub fn bound_devices(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Bound { .. }))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Runs `f` against the context of a bound device.
    pub fn with_context<R>(&self, name: &str, f: impl FnOnce(&D::Context) -> R) -> Option<R> {
        match self.slots.lock().get(name) {
            Some(Slot::Bound { context, .. }) => Some(f(context)),
            _ => None,
        }
    }

    /// Binds the driver to `device`. A device that does not match the
    /// driver is skipped with `Ok(false)`.
    pub fn probe(&self, device: &PlatformDevice) -> Result<bool, DriverError> {
        if !self.driver.matches(device) {
            debug!("{}: no match for {device}", self.driver.name());
            return Ok(false);
        }

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get(device.name()) {
                return Err(DriverError::Busy(format!(
                    "{} is {:?}",
                    device.name(),
                    slot.state()
                )));
            }
            slots.try_reserve(1).map_err(|e| {
                DriverError::AllocationFailure(format!("context slot for {}: {e}", device.name()))
            })?;
            slots.insert(device.name().to_string(), Slot::Probing);
        }

        // bind runs unlocked so handlers it installs may query the registry
        let result = self.driver.bind(device);

        let mut slots = self.slots.lock();
        match result {
            Ok(context) => {
                slots.insert(
                    device.name().to_string(),
                    Slot::Bound {
                        device: device.clone(),
                        context,
                    },
                );
                info!("{}: bound {device}", self.driver.name());
                Ok(true)
            }
            Err(e) => {
                slots.remove(device.name());
                error!(
                    "{}: probe of {device} failed with error {}: {e}",
                    self.driver.name(),
                    e.errno()
                );
                Err(e)
            }
        }
    }

    /// Probes every device and returns how many were bound. Failures are
    /// logged and do not stop the remaining devices.
    pub fn probe_all<'a>(&self, devices: impl IntoIterator<Item = &'a PlatformDevice>) -> usize {
        devices
            .into_iter()
            .filter(|device| matches!(self.probe(device), Ok(true)))
            .count()
    }

    pub fn remove(&self, name: &str) -> Result<(), DriverError> {
        let (device, context) = {
            let mut slots = self.slots.lock();
            match slots.remove(name) {
                Some(Slot::Bound { device, context }) => {
                    slots.insert(name.to_string(), Slot::Removing);
                    (device, context)
                }
                Some(other) => {
                    let state = other.state();
                    slots.insert(name.to_string(), other);
                    warn!("{}: cannot remove {name} while {state:?}", self.driver.name());
                    return Err(DriverError::Busy(format!("{name} is {state:?}")));
                }
                None => {
                    return Err(DriverError::NotBound(name.to_string()));
                }
            }
        };

        self.driver.unbind(&device, context);
        self.slots.lock().remove(name);
        info!("{}: unbound {device}", self.driver.name());
        Ok(())
    }

    pub fn remove_all(&self) {
        for name in self.bound_devices() {
            if let Err(e) = self.remove(&name) {
                warn!("{}: {e}", self.driver.name());
            }
        }
    }
}

impl<D: PlatformDriver> Drop for DeviceRegistry<D> {
    fn drop(&mut self) {
        self.remove_all();
    }
}
