use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{BoardConfig, GpioSpec};
use crate::error::DriverError;
use crate::gpio::{
    Edge, GpioController, GpioLine, InterruptController, Irq, IrqHandler, IrqRegistration,
    IrqReturn, LineHandle, Trigger,
};
use crate::platform::PlatformDevice;

const MOCK_IRQ_BASE: u32 = 64;

/// Resource operation recorded by the mock, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Acquire(GpioSpec),
    Release(GpioSpec),
    Install(Irq),
    Uninstall(Irq),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub acquired: usize,
    pub released: usize,
    pub installed: usize,
    pub uninstalled: usize,
}

/// In-memory GPIO chip and interrupt controller. Driving a line with
/// [`MockGpioBackend::set_level`] runs the installed handler on the calling
/// thread, as a hardware interrupt would.
#[derive(Clone, Default)]
pub struct MockGpioBackend {
    shared: Arc<MockShared>,
}

#[derive(Default)]
struct MockShared {
    lines: Mutex<FxHashMap<GpioSpec, MockLineState>>,
    irqs: RwLock<FxHashMap<Irq, Arc<IrqSlot>>>,
    next_irq: Mutex<u32>,
    ops: Mutex<Vec<MockOp>>,
    handled: AtomicUsize,
}

struct MockLineState {
    level: bool,
    irq: Irq,
    consumer: Option<String>,
    read_error: bool,
}

struct IrqSlot {
    trigger: Trigger,
    label: String,
    // None once uninstalled; the write lock waits for a running handler
    handler: RwLock<Option<IrqHandler>>,
}

struct MockLine {
    spec: GpioSpec,
    name: String,
    irq: Irq,
    shared: Arc<MockShared>,
}

impl GpioLine for MockLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_level(&self) -> Result<bool, DriverError> {
        let lines = self.shared.lines.lock();
        let state = lines
            .get(&self.spec)
            .ok_or_else(|| DriverError::Gpio(format!("{} vanished", self.name)))?;
        if state.read_error {
            return Err(DriverError::Gpio(format!("get value of {}: I/O error", self.name)));
        }
        Ok(state.level)
    }

    fn to_irq(&self) -> Result<Irq, DriverError> {
        Ok(self.irq)
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        if let Some(state) = self.shared.lines.lock().get_mut(&self.spec) {
            state.consumer = None;
        }
        self.shared.record(MockOp::Release(self.spec.clone()));
        debug!("mock: released {}", self.name);
    }
}

impl MockShared {
    fn record(&self, op: MockOp) {
        self.ops.lock().push(op);
    }
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with every line referenced by `board`.
    pub fn from_board(board: &BoardConfig) -> Self {
        let backend = Self::new();
        for device in &board.devices {
            for spec in device.gpios.values() {
                backend.add_line(&spec.chip, spec.line);
            }
        }
        backend
    }

    /// Adds a line, initially low. Returns the interrupt it maps to.
    pub fn add_line(&self, chip: &str, line: u32) -> Irq {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        let mut lines = self.shared.lines.lock();
        if let Some(state) = lines.get(&spec) {
            return state.irq;
        }
        let irq = {
            let mut next = self.shared.next_irq.lock();
            let irq = Irq(MOCK_IRQ_BASE + *next);
            *next += 1;
            irq
        };
        lines.insert(
            spec,
            MockLineState {
                level: false,
                irq,
                consumer: None,
                read_error: false,
            },
        );
        irq
    }

    pub fn irq_of(&self, chip: &str, line: u32) -> Option<Irq> {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        self.shared.lines.lock().get(&spec).map(|s| s.irq)
    }

    pub fn level(&self, chip: &str, line: u32) -> Option<bool> {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        self.shared.lines.lock().get(&spec).map(|s| s.level)
    }

    pub fn consumer(&self, chip: &str, line: u32) -> Option<String> {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        self.shared
            .lines
            .lock()
            .get(&spec)
            .and_then(|s| s.consumer.clone())
    }

    /// Makes subsequent reads of the line fail.
    pub fn set_read_error(&self, chip: &str, line: u32, failing: bool) {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        if let Some(state) = self.shared.lines.lock().get_mut(&spec) {
            state.read_error = failing;
        }
    }

    /// Drives the line to `level`, firing the interrupt on a matching edge.
    pub fn set_level(&self, chip: &str, line: u32, level: bool) -> Result<(), DriverError> {
        let spec = GpioSpec {
            chip: chip.to_string(),
            line,
        };
        let (edge, irq) = {
            let mut lines = self.shared.lines.lock();
            let state = lines
                .get_mut(&spec)
                .ok_or_else(|| DriverError::Gpio(format!("{chip} line {line} does not exist")))?;
            let old = state.level;
            state.level = level;
            (Edge::between(old, level), state.irq)
        };

        if let Some(edge) = edge {
            self.fire(irq, edge);
        }
        Ok(())
    }

    fn fire(&self, irq: Irq, edge: Edge) -> IrqReturn {
        let Some(slot) = self.shared.irqs.read().get(&irq).cloned() else {
            return IrqReturn::None;
        };
        if !slot.trigger.matches(edge) {
            return IrqReturn::None;
        }
        let guard = slot.handler.read();
        let Some(handler) = guard.as_ref() else {
            return IrqReturn::None;
        };
        trace!("mock: {irq} ({}) {edge:?}", slot.label);
        let ret = handler(irq);
        if ret == IrqReturn::Handled {
            self.shared.handled.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.shared.ops.lock().clone()
    }

    pub fn stats(&self) -> MockStats {
        self.shared
            .ops
            .lock()
            .iter()
            .fold(MockStats::default(), |mut stats, op| {
                match op {
                    MockOp::Acquire(_) => stats.acquired += 1,
                    MockOp::Release(_) => stats.released += 1,
                    MockOp::Install(_) => stats.installed += 1,
                    MockOp::Uninstall(_) => stats.uninstalled += 1,
                }
                stats
            })
    }

    pub fn handled(&self) -> usize {
        self.shared.handled.load(Ordering::Relaxed)
    }

    pub fn is_installed(&self, irq: Irq) -> bool {
        self.shared.irqs.read().contains_key(&irq)
    }
}

impl GpioController for MockGpioBackend {
    fn acquire_input_line(
        &self,
        parent: &PlatformDevice,
        name: &str,
    ) -> Result<LineHandle, DriverError> {
        let spec = parent.gpio(name).cloned().ok_or_else(|| {
            DriverError::ResourceUnavailable(format!("no {name} GPIO described for {parent}"))
        })?;

        let irq = {
            let mut lines = self.shared.lines.lock();
            let state = lines.get_mut(&spec).ok_or_else(|| {
                DriverError::ResourceUnavailable(format!(
                    "{} line {} does not exist",
                    spec.chip, spec.line
                ))
            })?;
            if let Some(consumer) = &state.consumer {
                return Err(DriverError::ResourceUnavailable(format!(
                    "{} line {} already claimed by {consumer}",
                    spec.chip, spec.line
                )));
            }
            state.consumer = Some(parent.name().to_string());
            state.irq
        };

        self.shared.record(MockOp::Acquire(spec.clone()));
        let name = format!("{}:{}:{name}", parent.name(), spec.line);
        debug!("mock: acquired {name} as input");
        Ok(Arc::new(MockLine {
            spec,
            name,
            irq,
            shared: self.shared.clone(),
        }))
    }
}

impl InterruptController for MockGpioBackend {
    fn install(
        &self,
        irq: Irq,
        trigger: Trigger,
        label: &str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration, DriverError> {
        {
            let mut irqs = self.shared.irqs.write();
            if let Some(existing) = irqs.get(&irq) {
                return Err(DriverError::InterruptUnavailable(format!(
                    "{irq} already in use by {}",
                    existing.label
                )));
            }
            irqs.insert(
                irq,
                Arc::new(IrqSlot {
                    trigger,
                    label: label.to_string(),
                    handler: RwLock::new(Some(handler)),
                }),
            );
        }
        self.shared.record(MockOp::Install(irq));
        debug!("mock: installed {irq} ({label})");

        let shared = self.shared.clone();
        Ok(IrqRegistration::new(irq, label, move || {
            let slot = shared.irqs.write().remove(&irq);
            if let Some(slot) = slot {
                let handler = slot.handler.write().take();
                drop(handler);
            }
            shared.record(MockOp::Uninstall(irq));
            debug!("mock: uninstalled {irq}");
        }))
    }
}
