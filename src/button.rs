use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::DriverError;
use crate::gpio::{
    GpioController, InterruptController, Irq, IrqRegistration, IrqReturn, LineHandle, Trigger,
};
use crate::input::{
    BTN_0, EventType, InputCore, InputDevice, InputDeviceInfo, InputRegistration, InputReporter,
};
use crate::platform::{PlatformDevice, PlatformDriver};

pub const COMPATIBLE: &str = "vendor,input-button";
pub const BUTTON_GPIO: &str = "button";
pub const DEVICE_NAME: &str = "GPIO Button";
pub const IRQ_LABEL: &str = "gpio-input-button";

/// Interrupt handler body. Owns shared references to the line and to the
/// reporting half of the input device, nothing else.
pub struct ButtonBridge {
    line: LineHandle,
    reporter: InputReporter,
}

impl ButtonBridge {
    pub fn new(line: LineHandle, reporter: InputReporter) -> Self {
        Self { line, reporter }
    }

    pub fn handle(&self, irq: Irq) -> IrqReturn {
        match self.line.read_level() {
            Ok(level) => {
                self.reporter.report_key(BTN_0, level);
                self.reporter.sync();
                IrqReturn::Handled
            }
            Err(e) => {
                warn!("{irq}: failed to read {}: {e}", self.line.name());
                IrqReturn::None
            }
        }
    }
}

/// Per-device state published by a successful bind.
///
/// Fields are listed in teardown order.
pub struct ButtonContext {
    irq_registration: IrqRegistration,
    input_registration: InputRegistration,
    line: LineHandle,
    input: InputDevice,
    irq: Irq,
    parent: String,
}

impl ButtonContext {
    pub fn irq(&self) -> Irq {
        self.irq
    }

    pub fn input_id(&self) -> u32 {
        self.input.id()
    }
}

pub struct ButtonDriver {
    gpio: Arc<dyn GpioController>,
    interrupts: Arc<dyn InterruptController>,
    input: InputCore,
}

impl ButtonDriver {
    pub fn new(
        gpio: Arc<dyn GpioController>,
        interrupts: Arc<dyn InterruptController>,
        input: InputCore,
    ) -> Self {
        Self {
            gpio,
            interrupts,
            input,
        }
    }

    fn setup_input(&self, device: &PlatformDevice) -> Result<InputDevice, DriverError> {
        let input = self.input.allocate()?;
        input.set_name(DEVICE_NAME);
        input.set_parent(device.name());
        input.set_capability(EventType::Key, BTN_0);
        input.set_open(Arc::new(button_open));
        input.set_close(Arc::new(button_close));
        Ok(input)
    }
}

fn button_open(info: &InputDeviceInfo) -> Result<(), DriverError> {
    info!("input{} ({}) opened", info.id, info.name);
    Ok(())
}

fn button_close(info: &InputDeviceInfo) {
    info!("input{} ({}) closed", info.id, info.name);
}

impl PlatformDriver for ButtonDriver {
    type Context = ButtonContext;

    fn name(&self) -> &'static str {
        "input-button"
    }

    fn compatible(&self) -> &'static [&'static str] {
        &[COMPATIBLE]
    }

    fn bind(&self, device: &PlatformDevice) -> Result<ButtonContext, DriverError> {
        let input = self.setup_input(device)?;

        let line = self.gpio.acquire_input_line(device, BUTTON_GPIO)?;

        let input_registration = self.input.register(&input)?;

        let irq = line.to_irq()?;
        let bridge = ButtonBridge::new(line.clone(), input.reporter());
        let irq_registration = self
            .interrupts
            .install(
                irq,
                Trigger::Both,
                IRQ_LABEL,
                Box::new(move |irq| bridge.handle(irq)),
            )
            .inspect_err(|e| warn!("{device}: unable to acquire interrupt for GPIO line: {e}"))?;

        debug!("{device}: input{} on {irq}", input.id());
        Ok(ButtonContext {
            irq_registration,
            input_registration,
            line,
            input,
            irq,
            parent: device.name().to_string(),
        })
    }

    fn unbind(&self, device: &PlatformDevice, context: ButtonContext) {
        let ButtonContext {
            irq_registration,
            input_registration,
            line,
            input,
            irq,
            parent,
        } = context;
        debug_assert_eq!(parent, device.name());

        drop(irq_registration);
        debug!("{device}: released {irq}");
        drop(input_registration);
        debug!("{device}: unregistered input device");
        drop(line);
        debug!("{device}: released GPIO line");
        drop(input);
        debug!("{device}: freed input device");
    }
}
