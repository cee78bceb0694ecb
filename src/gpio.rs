use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::platform::PlatformDevice;

/// Interrupt number handed out by a [`GpioLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Irq(pub u32);

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq {}", self.0)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Rising,
    Falling,
    Both,
}

impl Trigger {
    pub fn matches(&self, edge: Edge) -> bool {
        match self {
            Trigger::Rising => edge == Edge::Rising,
            Trigger::Falling => edge == Edge::Falling,
            Trigger::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn between(old: bool, new: bool) -> Option<Self> {
        match (old, new) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

/// Exclusive claim on one input line. The claim is released when the last
/// [`LineHandle`] referencing it is dropped.
pub trait GpioLine: Send + Sync {
    fn name(&self) -> &str;
    fn read_level(&self) -> Result<bool, DriverError>;
    fn to_irq(&self) -> Result<Irq, DriverError>;
}

pub type LineHandle = Arc<dyn GpioLine>;

pub trait GpioController: Send + Sync {
    /// Claims the line `name` described for `parent`, configured as input.
    fn acquire_input_line(
        &self,
        parent: &PlatformDevice,
        name: &str,
    ) -> Result<LineHandle, DriverError>;
}

pub type IrqHandler = Box<dyn Fn(Irq) -> IrqReturn + Send + Sync>;

pub trait InterruptController: Send + Sync {
    /// Installs `handler` on `irq`. The returned guard uninstalls it on drop,
    /// after any invocation already running has returned.
    fn install(
        &self,
        irq: Irq,
        trigger: Trigger,
        label: &str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration, DriverError>;
}

pub struct IrqRegistration {
    irq: Irq,
    label: String,
    uninstall: Option<Box<dyn FnOnce() + Send>>,
}

impl IrqRegistration {
    pub fn new(irq: Irq, label: &str, uninstall: impl FnOnce() + Send + 'static) -> Self {
        Self {
            irq,
            label: label.to_string(),
            uninstall: Some(Box::new(uninstall)),
        }
    }
}

impl fmt::Debug for IrqRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqRegistration")
            .field("irq", &self.irq)
            .field("label", &self.label)
            .finish()
    }
}

impl Drop for IrqRegistration {
    fn drop(&mut self) {
        if let Some(uninstall) = self.uninstall.take() {
            uninstall();
        }
    }
}
