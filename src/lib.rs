mod backend;
mod button;
mod config;
mod error;
mod gpio;
mod input;
mod platform;

pub use button::{
    BUTTON_GPIO, ButtonBridge, ButtonContext, ButtonDriver, COMPATIBLE, DEVICE_NAME, IRQ_LABEL,
};
pub use config::{BoardConfig, DeviceConfig, GpioSpec, InputConfig};
pub use error::DriverError;
pub use gpio::{
    Edge, GpioController, GpioLine, InterruptController, Irq, IrqHandler, IrqRegistration,
    IrqReturn, LineHandle, Trigger,
};
pub use input::{
    BTN_0, CloseCallback, EventType, InputCore, InputDevice, InputDeviceInfo, InputEvent,
    InputRegistration, InputReporter, InputStats, InputSubscription, OpenCallback, SYN_REPORT,
};
pub use platform::{DeviceRegistry, DeviceState, PlatformDevice, PlatformDriver};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, MockOp, MockStats};
