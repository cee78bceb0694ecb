use std::sync::Arc;

use input_button::{
    BTN_0, ButtonBridge, ButtonDriver, DeviceConfig, DeviceRegistry, DeviceState, DriverError,
    EventType, GpioController, GpioLine, GpioSpec, InputConfig, InputCore, InputEvent,
    InputStats, InterruptController, Irq, IrqHandler, IrqRegistration, IrqReturn, LineHandle,
    MockGpioBackend, MockOp, PlatformDevice, Trigger,
};
use parking_lot::Mutex;
use serde_json::json;

const CHIP: &str = "/dev/gpiochip0";
const LINE: u32 = 17;

fn button_device(name: &str) -> PlatformDevice {
    let config: DeviceConfig = serde_json::from_value(json!({
        "name": name,
        "compatible": "vendor,input-button",
        "gpios": { "button": { "chip": CHIP, "line": LINE } }
    }))
    .expect("valid device config");
    PlatformDevice::new(config)
}

struct Rig {
    mock: MockGpioBackend,
    input: InputCore,
    registry: DeviceRegistry<ButtonDriver>,
}

fn rig_with(config: InputConfig) -> Rig {
    let mock = MockGpioBackend::new();
    mock.add_line(CHIP, LINE);
    let input = InputCore::new(config);
    let backend = Arc::new(mock.clone());
    let registry = DeviceRegistry::new(ButtonDriver::new(
        backend.clone(),
        backend,
        input.clone(),
    ));
    Rig {
        mock,
        input,
        registry,
    }
}

fn rig() -> Rig {
    rig_with(InputConfig::default())
}

fn drain(sub: &mut input_button::InputSubscription) -> Vec<InputEvent> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

/// Forwards to the mock and snapshots the input core's counters each time a
/// line is released or a handler uninstalled.
#[derive(Clone)]
struct Recorder {
    mock: MockGpioBackend,
    input: InputCore,
    log: Arc<Mutex<Vec<(MockOp, InputStats)>>>,
}

impl Recorder {
    fn note(&self, op: MockOp) {
        self.log.lock().push((op, self.input.stats()));
    }

    fn log(&self) -> Vec<(MockOp, InputStats)> {
        self.log.lock().clone()
    }
}

struct RecordedLine {
    line: LineHandle,
    spec: GpioSpec,
    recorder: Recorder,
}

impl GpioLine for RecordedLine {
    fn name(&self) -> &str {
        self.line.name()
    }

    fn read_level(&self) -> Result<bool, DriverError> {
        self.line.read_level()
    }

    fn to_irq(&self) -> Result<Irq, DriverError> {
        self.line.to_irq()
    }
}

impl Drop for RecordedLine {
    // runs right before the wrapped mock line is released
    fn drop(&mut self) {
        self.recorder.note(MockOp::Release(self.spec.clone()));
    }
}

impl GpioController for Recorder {
    fn acquire_input_line(
        &self,
        parent: &PlatformDevice,
        name: &str,
    ) -> Result<LineHandle, DriverError> {
        let line = self.mock.acquire_input_line(parent, name)?;
        let spec = parent.gpio(name).cloned().expect("described line");
        Ok(Arc::new(RecordedLine {
            line,
            spec,
            recorder: self.clone(),
        }))
    }
}

impl InterruptController for Recorder {
    fn install(
        &self,
        irq: Irq,
        trigger: Trigger,
        label: &str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration, DriverError> {
        let registration = self.mock.install(irq, trigger, label, handler)?;
        let recorder = self.clone();
        Ok(IrqRegistration::new(irq, label, move || {
            drop(registration);
            recorder.note(MockOp::Uninstall(irq));
        }))
    }
}

fn recorded_rig() -> (Recorder, DeviceRegistry<ButtonDriver>) {
    let mock = MockGpioBackend::new();
    mock.add_line(CHIP, LINE);
    let recorder = Recorder {
        mock,
        input: InputCore::new(InputConfig::default()),
        log: Arc::default(),
    };
    let backend = Arc::new(recorder.clone());
    let registry = DeviceRegistry::new(ButtonDriver::new(
        backend.clone(),
        backend,
        recorder.input.clone(),
    ));
    (recorder, registry)
}

#[test]
fn press_and_release_produce_two_frames() {
    let rig = rig();
    let device = button_device("button0");

    assert_eq!(rig.registry.probe(&device), Ok(true));
    assert_eq!(rig.registry.state("button0"), DeviceState::Bound);

    let input_id = rig
        .registry
        .with_context("button0", |ctx| ctx.input_id())
        .expect("bound context");
    let mut sub = rig.input.subscribe(input_id).expect("subscribe");

    rig.mock.set_level(CHIP, LINE, true).unwrap();
    rig.mock.set_level(CHIP, LINE, false).unwrap();

    let events = drain(&mut sub);
    assert_eq!(events.len(), 4);
    assert!(events[0].is_key(BTN_0, 1));
    assert!(events[1].is_sync());
    assert!(events[2].is_key(BTN_0, 0));
    assert!(events[3].is_sync());
    assert_eq!(rig.input.events(input_id, None), events);
    assert_eq!(rig.mock.handled(), 2);
}

#[test]
fn missing_button_gpio_fails_with_resource_unavailable() {
    let rig = rig();
    let config: DeviceConfig = serde_json::from_value(json!({
        "name": "button0",
        "compatible": "vendor,input-button",
        "gpios": { "led": { "chip": CHIP, "line": LINE } }
    }))
    .unwrap();
    let device = PlatformDevice::new(config);

    let err = rig.registry.probe(&device).unwrap_err();
    assert!(matches!(err, DriverError::ResourceUnavailable(_)));
    assert_eq!(rig.registry.state("button0"), DeviceState::Unbound);

    let stats = rig.input.stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.freed, 1);
    assert_eq!(stats.registered, 0);
    assert!(rig.mock.ops().is_empty());
}

#[test]
fn claimed_line_fails_with_resource_unavailable() {
    let rig = rig();
    let other = button_device("other");
    let held = rig.mock.acquire_input_line(&other, "button").unwrap();

    let err = rig.registry.probe(&button_device("button0")).unwrap_err();
    assert!(matches!(err, DriverError::ResourceUnavailable(_)));
    assert_eq!(rig.mock.consumer(CHIP, LINE).as_deref(), Some("other"));
    assert_eq!(rig.input.stats().live(), 0);

    drop(held);
    assert_eq!(rig.mock.consumer(CHIP, LINE), None);
    assert_eq!(rig.registry.probe(&button_device("button0")), Ok(true));
}

#[test]
fn registration_failure_releases_line_and_frees_device() {
    let rig = rig_with(InputConfig {
        max_registered: 0,
        ..InputConfig::default()
    });

    let err = rig.registry.probe(&button_device("button0")).unwrap_err();
    assert!(matches!(err, DriverError::RegistrationFailure(_)));

    let irq = rig.mock.irq_of(CHIP, LINE).unwrap();
    assert_eq!(
        rig.mock.ops(),
        vec![
            MockOp::Acquire(GpioSpec {
                chip: CHIP.into(),
                line: LINE
            }),
            MockOp::Release(GpioSpec {
                chip: CHIP.into(),
                line: LINE
            }),
        ]
    );
    assert!(!rig.mock.is_installed(irq));
    assert_eq!(rig.mock.consumer(CHIP, LINE), None);

    let stats = rig.input.stats();
    assert_eq!((stats.allocated, stats.freed, stats.registered), (1, 1, 0));
}

#[test]
fn interrupt_failure_unwinds_everything() {
    let rig = rig();
    let irq = rig.mock.irq_of(CHIP, LINE).unwrap();
    let _busy = rig
        .mock
        .install(irq, Trigger::Both, "other-driver", Box::new(|_: Irq| IrqReturn::None))
        .unwrap();

    let err = rig.registry.probe(&button_device("button0")).unwrap_err();
    assert!(matches!(err, DriverError::InterruptUnavailable(_)));
    assert_eq!(rig.registry.state("button0"), DeviceState::Unbound);

    let stats = rig.input.stats();
    assert_eq!(stats.registered, 1);
    assert_eq!(stats.unregistered, 1);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.freed, 1);
    assert!(rig.input.devices().is_empty());

    let mock_stats = rig.mock.stats();
    assert_eq!(mock_stats.acquired, 1);
    assert_eq!(mock_stats.released, 1);
    assert_eq!(mock_stats.installed, 1);
    assert_eq!(rig.mock.consumer(CHIP, LINE), None);
}

#[test]
fn interrupt_failure_unregisters_then_releases_then_frees() {
    let (recorder, registry) = recorded_rig();
    let irq = recorder.mock.irq_of(CHIP, LINE).unwrap();
    let _busy = recorder
        .mock
        .install(irq, Trigger::Both, "other-driver", Box::new(|_: Irq| IrqReturn::None))
        .unwrap();

    let err = registry.probe(&button_device("button0")).unwrap_err();
    assert!(matches!(err, DriverError::InterruptUnavailable(_)));

    let log = recorder.log();
    assert_eq!(log.len(), 1);
    let (op, at_release) = &log[0];
    assert!(matches!(op, MockOp::Release(_)));
    // unregistered before the line went, freed after
    assert_eq!(at_release.registered, 1);
    assert_eq!(at_release.unregistered, 1);
    assert_eq!(at_release.freed, 0);

    let after = recorder.input.stats();
    assert_eq!((after.unregistered, after.freed), (1, 1));
}

#[test]
fn unbind_tears_down_in_mirror_order() {
    let (recorder, registry) = recorded_rig();
    let irq = recorder.mock.irq_of(CHIP, LINE).unwrap();
    registry.probe(&button_device("button0")).unwrap();
    assert!(recorder.log().is_empty());

    registry.remove("button0").unwrap();

    let log = recorder.log();
    assert_eq!(log.len(), 2);
    let (first, at_uninstall) = &log[0];
    assert_eq!(*first, MockOp::Uninstall(irq));
    assert_eq!((at_uninstall.unregistered, at_uninstall.freed), (0, 0));

    let (second, at_release) = &log[1];
    assert!(matches!(second, MockOp::Release(_)));
    assert_eq!((at_release.unregistered, at_release.freed), (1, 0));

    let after = recorder.input.stats();
    assert_eq!((after.unregistered, after.freed), (1, 1));
    assert_eq!(recorder.mock.consumer(CHIP, LINE), None);
}

#[test]
fn allocation_failure_acquires_nothing() {
    let rig = rig_with(InputConfig {
        max_devices: 0,
        ..InputConfig::default()
    });

    let err = rig.registry.probe(&button_device("button0")).unwrap_err();
    assert!(matches!(err, DriverError::AllocationFailure(_)));
    assert!(rig.mock.ops().is_empty());
    assert_eq!(rig.input.stats().allocated, 0);
}

#[test]
fn unbind_uninstalls_before_releasing_line() {
    let rig = rig();
    let irq = rig.mock.irq_of(CHIP, LINE).unwrap();
    rig.registry.probe(&button_device("button0")).unwrap();
    rig.registry.remove("button0").unwrap();

    let ops = rig.mock.ops();
    let uninstall = ops
        .iter()
        .position(|op| *op == MockOp::Uninstall(irq))
        .expect("uninstalled");
    let release = ops
        .iter()
        .position(|op| matches!(op, MockOp::Release(_)))
        .expect("released");
    assert!(uninstall < release);
    assert_eq!(rig.registry.state("button0"), DeviceState::Unbound);

    rig.mock.set_level(CHIP, LINE, true).unwrap();
    assert_eq!(rig.mock.handled(), 0);
}

#[test]
fn handler_is_not_installed_before_bind() {
    let rig = rig();
    let irq = rig.mock.irq_of(CHIP, LINE).unwrap();

    rig.mock.set_level(CHIP, LINE, true).unwrap();
    assert_eq!(rig.mock.level(CHIP, LINE), Some(true));
    assert!(!rig.mock.is_installed(irq));
    assert_eq!(rig.mock.handled(), 0);

    rig.registry.probe(&button_device("button0")).unwrap();
    assert!(rig.mock.is_installed(irq));
    let input_id = rig
        .registry
        .with_context("button0", |ctx| ctx.input_id())
        .unwrap();
    assert!(rig.input.events(input_id, None).is_empty());
}

#[test]
fn repeated_bind_unbind_cycles_stay_balanced() {
    let rig = rig();
    let device = button_device("button0");

    for _ in 0..5 {
        assert_eq!(rig.registry.probe(&device), Ok(true));
        rig.mock.set_level(CHIP, LINE, true).unwrap();
        rig.mock.set_level(CHIP, LINE, false).unwrap();
        rig.registry.remove("button0").unwrap();
    }

    let mock_stats = rig.mock.stats();
    assert_eq!(mock_stats.acquired, 5);
    assert_eq!(mock_stats.released, 5);
    assert_eq!(mock_stats.installed, 5);
    assert_eq!(mock_stats.uninstalled, 5);

    let stats = rig.input.stats();
    assert_eq!(stats.allocated, 5);
    assert_eq!(stats.freed, 5);
    assert_eq!(stats.registered, 5);
    assert_eq!(stats.unregistered, 5);
    assert_eq!(rig.mock.handled(), 10);
}

#[test]
fn failed_level_read_reports_nothing() {
    let rig = rig();
    rig.registry.probe(&button_device("button0")).unwrap();
    let input_id = rig
        .registry
        .with_context("button0", |ctx| ctx.input_id())
        .unwrap();

    rig.mock.set_read_error(CHIP, LINE, true);
    rig.mock.set_level(CHIP, LINE, true).unwrap();

    assert_eq!(rig.mock.handled(), 0);
    assert!(rig.input.events(input_id, None).is_empty());
}

#[test]
fn second_probe_of_bound_device_is_rejected() {
    let rig = rig();
    let device = button_device("button0");
    rig.registry.probe(&device).unwrap();

    let err = rig.registry.probe(&device).unwrap_err();
    assert!(matches!(err, DriverError::Busy(_)));
    assert_eq!(rig.registry.state("button0"), DeviceState::Bound);
    assert_eq!(rig.mock.stats().acquired, 1);
}

#[test]
fn non_matching_device_is_skipped() {
    let rig = rig();
    let config: DeviceConfig = serde_json::from_value(json!({
        "name": "led0",
        "compatible": "vendor,gpio-led",
        "gpios": { "button": { "chip": CHIP, "line": LINE } }
    }))
    .unwrap();

    assert_eq!(rig.registry.probe(&PlatformDevice::new(config)), Ok(false));
    assert_eq!(rig.input.stats().allocated, 0);
    assert!(rig.mock.ops().is_empty());
}

#[test]
fn removing_unbound_device_reports_not_bound() {
    let rig = rig();
    assert!(matches!(
        rig.registry.remove("button0"),
        Err(DriverError::NotBound(_))
    ));
}

#[test]
fn unbind_closes_open_subscribers() {
    let rig = rig();
    rig.registry.probe(&button_device("button0")).unwrap();
    let input_id = rig
        .registry
        .with_context("button0", |ctx| ctx.input_id())
        .unwrap();

    let mut sub = rig.input.subscribe(input_id).unwrap();
    assert_eq!(rig.input.devices()[0].users, 1);
    assert_eq!(rig.input.devices()[0].parent.as_deref(), Some("button0"));

    rig.registry.remove("button0").unwrap();
    assert!(rig.input.devices().is_empty());
    assert!(sub.try_recv().is_none());
    drop(sub);
}

#[test]
fn bridge_reports_current_level() {
    let mock = MockGpioBackend::new();
    let irq = mock.add_line(CHIP, LINE);
    let input = InputCore::new(InputConfig::default());

    let dev = input.allocate().unwrap();
    dev.set_name("bridge");
    dev.set_capability(EventType::Key, BTN_0);
    let _registration = input.register(&dev).unwrap();
    let mut sub = input.subscribe(dev.id()).unwrap();

    let line = mock
        .acquire_input_line(&button_device("button0"), "button")
        .unwrap();
    let bridge = ButtonBridge::new(line, dev.reporter());

    mock.set_level(CHIP, LINE, true).unwrap();
    assert_eq!(bridge.handle(irq), IrqReturn::Handled);
    let events = drain(&mut sub);
    assert_eq!(events.len(), 2);
    assert!(events[0].is_key(BTN_0, 1));
    assert!(events[1].is_sync());

    mock.set_level(CHIP, LINE, false).unwrap();
    assert_eq!(bridge.handle(irq), IrqReturn::Handled);
    let events = drain(&mut sub);
    assert_eq!(events.len(), 2);
    assert!(events[0].is_key(BTN_0, 0));
    assert!(events[1].is_sync());
}

#[test]
fn two_buttons_bind_independently() {
    let mock = MockGpioBackend::new();
    mock.add_line(CHIP, LINE);
    mock.add_line(CHIP, LINE + 1);
    let input = InputCore::new(InputConfig::default());
    let backend = Arc::new(mock.clone());
    let registry = DeviceRegistry::new(ButtonDriver::new(
        backend.clone(),
        backend,
        input.clone(),
    ));

    let second: DeviceConfig = serde_json::from_value(json!({
        "name": "button1",
        "compatible": "vendor,input-button",
        "gpios": { "button": { "chip": CHIP, "line": LINE + 1 } }
    }))
    .unwrap();
    let devices = vec![button_device("button0"), PlatformDevice::new(second)];

    assert_eq!(registry.probe_all(&devices), 2);
    assert_eq!(registry.bound_devices(), vec!["button0", "button1"]);

    let first_irq = registry.with_context("button0", |ctx| ctx.irq()).unwrap();
    let second_irq = registry.with_context("button1", |ctx| ctx.irq()).unwrap();
    assert_ne!(first_irq, second_irq);

    registry.remove("button0").unwrap();
    mock.set_level(CHIP, LINE + 1, true).unwrap();
    assert_eq!(mock.handled(), 1);

    registry.remove_all();
    assert!(registry.bound_devices().is_empty());
    assert_eq!(input.stats().live(), 0);
}
