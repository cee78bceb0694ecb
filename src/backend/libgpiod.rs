use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, request};
use parking_lot::{FairMutex, Mutex, RwLock as PLRwLock};
use rustc_hash::FxHashMap;

use crate::error::DriverError;
use crate::gpio::{
    GpioController, GpioLine, InterruptController, Irq, IrqHandler, IrqRegistration, LineHandle,
    Trigger,
};
use crate::platform::PlatformDevice;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);
const LIBGPIOD_BACKEND_IRQ_BASE: u32 = 512;

/// GPIO character device backend. Each claimed line gets a synthetic
/// interrupt number; installing a handler on it enables edge detection on
/// the line request and starts a listener thread that runs the handler once
/// per edge event.
pub struct LibgpiodBackend {
    shared: Arc<LibgpiodShared>,
}

struct LibgpiodShared {
    lines: PLRwLock<FxHashMap<Irq, Arc<FairMutex<GpiodHandle>>>>, // keyed by irq
    listeners: Mutex<FxHashMap<Irq, EdgeListener>>,
    next_irq: AtomicU32,
}

struct GpiodHandle {
    offset: u32,
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, offset: u32, line_cfg: &line::Config) -> Result<Self, DriverError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { offset, request })
    }

    fn open_chip(path: &str) -> Result<Chip, DriverError> {
        let p = PathBuf::from(path);
        Chip::open(&p)
            .map_err(|e| DriverError::ResourceUnavailable(format!("open chip {path}: {e}")))
    }

    fn request_lines(
        chip: &Chip,
        line_cfg: &line::Config,
    ) -> Result<request::Request, DriverError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| DriverError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| DriverError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| DriverError::ResourceUnavailable(format!("request lines: {e}")))
    }

    fn reconfigure(&mut self, edge: Option<Trigger>) -> Result<(), DriverError> {
        let line_cfg = make_line_config(self.offset, make_line_settings(edge)?)?;
        self.request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| DriverError::Gpio(format!("reconfigure lines: {e}")))?;
        Ok(())
    }
}

fn make_line_settings(edge: Option<Trigger>) -> Result<line::Settings, DriverError> {
    let mut ls =
        line::Settings::new().map_err(|e| DriverError::Gpio(format!("libgpiod settings: {e}")))?;
    ls.set_direction(line::Direction::Input)
        .map_err(|e| DriverError::Gpio(format!("set direction: {e}")))?;

    let edge = edge.map(|trigger| match trigger {
        Trigger::Rising => line::Edge::Rising,
        Trigger::Falling => line::Edge::Falling,
        Trigger::Both => line::Edge::Both,
    });
    ls.set_edge_detection(edge)
        .map_err(|e| DriverError::Gpio(format!("set edge detection: {e}")))?;
    Ok(ls)
}

fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, DriverError> {
    let mut cfg =
        line::Config::new().map_err(|e| DriverError::Gpio(format!("line config: {e}")))?;
    cfg.add_line_settings(&[offset], settings)
        .map_err(|e| DriverError::Gpio(format!("line config add settings: {e}")))?;
    Ok(cfg)
}

struct LibgpiodLine {
    name: String,
    irq: Irq,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    shared: Arc<LibgpiodShared>,
}

impl GpioLine for LibgpiodLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_level(&self) -> Result<bool, DriverError> {
        let hdl = self.gpiod_handle.lock();
        let value = hdl
            .request
            .value(hdl.offset)
            .map_err(|e| DriverError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => false,
            line::Value::Active => true,
        })
    }

    fn to_irq(&self) -> Result<Irq, DriverError> {
        Ok(self.irq)
    }
}

impl Drop for LibgpiodLine {
    fn drop(&mut self) {
        // the request itself is released with the last handle reference
        self.shared.lines.write().remove(&self.irq);
        debug!("libgpiod: released {}", self.name);
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        irq: Irq,
        label: &str,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: IrqHandler,
    ) -> Result<Self, DriverError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| DriverError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::Builder::new()
            .name(format!("{label}-{}", irq.0))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    let hdl = gpiod_handle.lock();
                    let req = &hdl.request;

                    let has_event =
                        match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("wait edge events error for {irq}: {e}");
                                drop(hdl);
                                yield_now();
                                continue;
                            }
                        };
                    if !has_event {
                        continue;
                    }

                    let edges = req.read_edge_events(&mut buffer).map(|evts| {
                        evts.filter(|evt| matches!(evt, Ok(e) if e.event_type().is_ok()))
                            .count()
                    });
                    // the handler reads the line, so the request lock must be free
                    drop(hdl);

                    let edges = match edges {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("read edge events error for {irq}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                    for _ in 0..edges {
                        handler(irq);
                    }
                }
            })
            .map_err(|e| DriverError::InterruptUnavailable(format!("spawn listener: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, DriverError> {
        Ok(Self {
            shared: Arc::new(LibgpiodShared {
                lines: PLRwLock::new(FxHashMap::default()),
                listeners: Mutex::new(FxHashMap::default()),
                next_irq: AtomicU32::new(LIBGPIOD_BACKEND_IRQ_BASE),
            }),
        })
    }
}

impl GpioController for LibgpiodBackend {
    fn acquire_input_line(
        &self,
        parent: &PlatformDevice,
        name: &str,
    ) -> Result<LineHandle, DriverError> {
        let spec = parent.gpio(name).ok_or_else(|| {
            DriverError::ResourceUnavailable(format!("no {name} GPIO described for {parent}"))
        })?;

        let line_cfg = make_line_config(spec.line, make_line_settings(None)?)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(
            &spec.chip, spec.line, &line_cfg,
        )?));

        let irq = Irq(self.shared.next_irq.fetch_add(1, Ordering::Relaxed));
        self.shared.lines.write().insert(irq, gpiod_handle.clone());

        let name = format!("{}:{}:{name}", spec.chip, spec.line);
        debug!("libgpiod: acquired {name} as input ({irq})");
        Ok(Arc::new(LibgpiodLine {
            name,
            irq,
            gpiod_handle,
            shared: self.shared.clone(),
        }))
    }
}

impl InterruptController for LibgpiodBackend {
    fn install(
        &self,
        irq: Irq,
        trigger: Trigger,
        label: &str,
        handler: IrqHandler,
    ) -> Result<IrqRegistration, DriverError> {
        let gpiod_handle = self
            .shared
            .lines
            .read()
            .get(&irq)
            .cloned()
            .ok_or_else(|| {
                DriverError::InterruptUnavailable(format!("{irq} is not a claimed GPIO line"))
            })?;

        let mut listeners = self.shared.listeners.lock();
        if listeners.contains_key(&irq) {
            return Err(DriverError::InterruptUnavailable(format!(
                "{irq} already in use"
            )));
        }

        gpiod_handle
            .lock()
            .reconfigure(Some(trigger))
            .map_err(|e| DriverError::InterruptUnavailable(e.to_string()))?;
        let listener = match EdgeListener::new(irq, label, gpiod_handle.clone(), handler) {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(e) = gpiod_handle.lock().reconfigure(None) {
                    warn!("libgpiod: {irq}: {e}");
                }
                return Err(e);
            }
        };
        listeners.insert(irq, listener);
        drop(listeners);
        debug!("libgpiod: installed {irq} ({label})");

        let shared = self.shared.clone();
        Ok(IrqRegistration::new(irq, label, move || {
            let listener = shared.listeners.lock().remove(&irq);
            drop(listener);
            if let Err(e) = gpiod_handle.lock().reconfigure(None) {
                warn!("libgpiod: disable edge detection on {irq}: {e}");
            }
            debug!("libgpiod: uninstalled {irq}");
        }))
    }
}
