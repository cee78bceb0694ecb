use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::config::InputConfig;
use crate::error::DriverError;

pub const SYN_REPORT: u16 = 0x00;
pub const BTN_0: u16 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Syn,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputEvent {
    pub device_id: u32,
    pub event_type: EventType,
    pub code: u16,
    pub value: i32,
    pub timestamp_ms: u64,
}

impl InputEvent {
    pub fn is_key(&self, code: u16, value: i32) -> bool {
        self.event_type == EventType::Key && self.code == code && self.value == value
    }

    pub fn is_sync(&self) -> bool {
        self.event_type == EventType::Syn && self.code == SYN_REPORT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputStats {
    pub allocated: usize,
    pub freed: usize,
    pub registered: usize,
    pub unregistered: usize,
}

impl InputStats {
    pub fn live(&self) -> usize {
        self.allocated.saturating_sub(self.freed)
    }

    pub fn active(&self) -> usize {
        self.registered.saturating_sub(self.unregistered)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputDeviceInfo {
    pub id: u32,
    pub name: String,
    pub parent: Option<String>,
    pub users: usize,
}

pub type OpenCallback = Arc<dyn Fn(&InputDeviceInfo) -> Result<(), DriverError> + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&InputDeviceInfo) + Send + Sync>;

#[derive(Default)]
struct DeviceSetup {
    name: String,
    parent: Option<String>,
    event_types: FxHashSet<EventType>,
    keys: FxHashSet<u16>,
    open: Option<OpenCallback>,
    close: Option<CloseCallback>,
}

struct DeviceInner {
    id: u32,
    core: Arc<CoreShared>,
    setup: RwLock<DeviceSetup>,
    registered: AtomicBool,
    users: Mutex<usize>,
    pending: Mutex<Vec<InputEvent>>,
}

impl DeviceInner {
    fn info(&self) -> InputDeviceInfo {
        let users = *self.users.lock();
        self.describe(users)
    }

    fn describe(&self, users: usize) -> InputDeviceInfo {
        let setup = self.setup.read();
        InputDeviceInfo {
            id: self.id,
            name: setup.name.clone(),
            parent: setup.parent.clone(),
            users,
        }
    }

    fn accepts(&self, event_type: EventType, code: u16) -> bool {
        match event_type {
            EventType::Syn => true,
            EventType::Key => {
                let setup = self.setup.read();
                setup.event_types.contains(&EventType::Key) && setup.keys.contains(&code)
            }
        }
    }

    fn push(&self, event_type: EventType, code: u16, value: i32) {
        if !self.registered.load(Ordering::Acquire) {
            trace!("input{}: dropping event on unregistered device", self.id);
            return;
        }
        if !self.accepts(event_type, code) {
            trace!(
                "input{}: event {event_type:?}/{code:#x} outside capability set",
                self.id
            );
            return;
        }
        self.pending.lock().push(InputEvent {
            device_id: self.id,
            event_type,
            code,
            value,
            timestamp_ms: epoch_millis(),
        });
    }

    fn flush(&self) {
        let mut pending = self.pending.lock();
        for event in pending.drain(..) {
            self.core.dispatch(event);
        }
    }

    fn unregister(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        self.core.registered.write().remove(&self.id);
        self.core.history.write().remove(&self.id);
        self.pending.lock().clear();
        self.core.unregistered.fetch_add(1, Ordering::Relaxed);

        let close = {
            let mut users = self.users.lock();
            let had_users = *users > 0;
            *users = 0;
            if had_users {
                self.setup.read().close.clone()
            } else {
                None
            }
        };
        if let Some(close) = close {
            close(&self.describe(0));
        }
        debug!("input{}: unregistered", self.id);
    }
}

struct CoreShared {
    config: InputConfig,
    event_tx: broadcast::Sender<InputEvent>,
    history: RwLock<FxHashMap<u32, VecDeque<InputEvent>>>,
    registered: RwLock<FxHashMap<u32, Arc<DeviceInner>>>,
    next_id: AtomicU32,
    live: AtomicUsize,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    registrations: AtomicUsize,
    unregistered: AtomicUsize,
}

impl CoreShared {
    fn dispatch(&self, event: InputEvent) {
        if let Some(history) = self.history.write().get_mut(&event.device_id) {
            while history.len() >= self.config.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }
}

/// Handle to the input subsystem. Cheap to clone.
#[derive(Clone)]
pub struct InputCore {
    shared: Arc<CoreShared>,
}

impl InputCore {
    pub fn new(config: InputConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            shared: Arc::new(CoreShared {
                config,
                event_tx,
                history: RwLock::new(FxHashMap::default()),
                registered: RwLock::new(FxHashMap::default()),
                next_id: AtomicU32::new(0),
                live: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
                freed: AtomicUsize::new(0),
                registrations: AtomicUsize::new(0),
                unregistered: AtomicUsize::new(0),
            }),
        }
    }

    pub fn allocate(&self) -> Result<InputDevice, DriverError> {
        let shared = &self.shared;
        let max = shared.config.max_devices;
        shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .map_err(|live| {
                DriverError::AllocationFailure(format!("input device pool exhausted ({live} live)"))
            })?;
        shared.allocated.fetch_add(1, Ordering::AcqRel);

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("input{id}: allocated");
        Ok(InputDevice {
            inner: Arc::new(DeviceInner {
                id,
                core: shared.clone(),
                setup: RwLock::new(DeviceSetup::default()),
                registered: AtomicBool::new(false),
                users: Mutex::new(0),
                pending: Mutex::new(Vec::with_capacity(4)),
            }),
        })
    }

    pub fn register(&self, device: &InputDevice) -> Result<InputRegistration, DriverError> {
        let inner = &device.inner;
        let name = {
            let setup = inner.setup.read();
            if setup.name.is_empty() {
                return Err(DriverError::RegistrationFailure(format!(
                    "input{}: device has no name",
                    inner.id
                )));
            }
            if setup.event_types.is_empty() {
                return Err(DriverError::RegistrationFailure(format!(
                    "input{}: no event types declared",
                    inner.id
                )));
            }
            setup.name.clone()
        };

        let mut registered = self.shared.registered.write();
        if registered.contains_key(&inner.id) {
            return Err(DriverError::RegistrationFailure(format!(
                "input{}: already registered",
                inner.id
            )));
        }
        if registered.len() >= self.shared.config.max_registered {
            return Err(DriverError::RegistrationFailure(format!(
                "no free input slots for {name}"
            )));
        }
        registered.insert(inner.id, inner.clone());
        let capacity = self.shared.config.event_history_capacity.max(1);
        self.shared
            .history
            .write()
            .insert(inner.id, VecDeque::with_capacity(capacity));
        inner.registered.store(true, Ordering::Release);
        self.shared.registrations.fetch_add(1, Ordering::Relaxed);
        drop(registered);

        info!("input: {name} as input{}", inner.id);
        Ok(InputRegistration {
            inner: inner.clone(),
        })
    }

    /// Opens device `device_id` for reading. The first subscriber runs the
    /// device's open callback; dropping the last one runs its close callback.
    pub fn subscribe(&self, device_id: u32) -> Result<InputSubscription, DriverError> {
        let inner = self
            .shared
            .registered
            .read()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| DriverError::NotBound(format!("input{device_id}")))?;

        let rx = self.shared.event_tx.subscribe();
        {
            let mut users = inner.users.lock();
            // unregister clears the flag before it takes `users`
            if !inner.registered.load(Ordering::Acquire) {
                return Err(DriverError::NotBound(format!("input{device_id}")));
            }
            if *users == 0 {
                let open = inner.setup.read().open.clone();
                if let Some(open) = open {
                    open(&inner.describe(0))?;
                }
            }
            *users += 1;
        }

        Ok(InputSubscription {
            opened: OpenHandle { inner },
            rx,
        })
    }

    pub fn devices(&self) -> Vec<InputDeviceInfo> {
        let mut devices: Vec<_> = self
            .shared
            .registered
            .read()
            .values()
            .map(|d| d.info())
            .collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub fn events(&self, device_id: u32, limit: Option<usize>) -> Vec<InputEvent> {
        self.shared
            .history
            .read()
            .get(&device_id)
            .map(|d| {
                let skip = limit.map(|lim| d.len().saturating_sub(lim)).unwrap_or(0);
                d.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> InputStats {
        InputStats {
            allocated: self.shared.allocated.load(Ordering::Acquire),
            freed: self.shared.freed.load(Ordering::Acquire),
            registered: self.shared.registrations.load(Ordering::Acquire),
            unregistered: self.shared.unregistered.load(Ordering::Acquire),
        }
    }
}

/// Owning handle of an allocated input device. Dropping it frees the device.
pub struct InputDevice {
    inner: Arc<DeviceInner>,
}

impl InputDevice {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn set_name(&self, name: &str) {
        self.inner.setup.write().name = name.to_string();
    }

    pub fn set_parent(&self, parent: &str) {
        self.inner.setup.write().parent = Some(parent.to_string());
    }

    pub fn set_capability(&self, event_type: EventType, code: u16) {
        let mut setup = self.inner.setup.write();
        setup.event_types.insert(event_type);
        if event_type == EventType::Key {
            setup.keys.insert(code);
        }
    }

    pub fn set_open(&self, open: OpenCallback) {
        self.inner.setup.write().open = Some(open);
    }

    pub fn set_close(&self, close: CloseCallback) {
        self.inner.setup.write().close = Some(close);
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    pub fn info(&self) -> InputDeviceInfo {
        self.inner.info()
    }

    pub fn reporter(&self) -> InputReporter {
        InputReporter {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        if self.inner.registered.load(Ordering::Acquire) {
            warn!("input{}: freed while registered", self.inner.id);
            self.inner.unregister();
        }
        self.inner.core.freed.fetch_add(1, Ordering::AcqRel);
        self.inner.core.live.fetch_sub(1, Ordering::AcqRel);
        debug!("input{}: freed", self.inner.id);
    }
}

/// Proof of registration. Dropping it unregisters the device.
pub struct InputRegistration {
    inner: Arc<DeviceInner>,
}

impl Drop for InputRegistration {
    fn drop(&mut self) {
        self.inner.unregister();
    }
}

/// Reporting half of an input device, usable from interrupt context.
#[derive(Clone)]
pub struct InputReporter {
    inner: Arc<DeviceInner>,
}

impl InputReporter {
    pub fn report_key(&self, code: u16, pressed: bool) {
        self.inner.push(EventType::Key, code, i32::from(pressed));
    }

    /// Terminates the current frame and delivers it to subscribers.
    pub fn sync(&self) {
        self.inner.push(EventType::Syn, SYN_REPORT, 0);
        self.inner.flush();
    }
}

struct OpenHandle {
    inner: Arc<DeviceInner>,
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        let close = {
            let mut users = self.inner.users.lock();
            if *users == 0 {
                // already closed by unregistration
                return;
            }
            *users -= 1;
            if *users == 0 {
                self.inner.setup.read().close.clone()
            } else {
                None
            }
        };
        if let Some(close) = close {
            close(&self.inner.describe(0));
        }
    }
}

pub struct InputSubscription {
    opened: OpenHandle,
    rx: broadcast::Receiver<InputEvent>,
}

impl InputSubscription {
    pub fn device_id(&self) -> u32 {
        self.opened.inner.id
    }

    pub async fn recv(&mut self) -> Option<InputEvent> {
        let device_id = self.device_id();
        loop {
            match self.rx.recv().await {
                Ok(event) if event.device_id == device_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("input{device_id}: subscriber lagged by {n} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<InputEvent> {
        let device_id = self.device_id();
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.device_id == device_id => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => {
                    warn!("input{device_id}: subscriber lagged by {n} events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = InputEvent> + Send + 'static {
        let InputSubscription { opened, rx } = self;
        let device_id = opened.inner.id;
        BroadcastStream::new(rx).filter_map(move |event| {
            let _open = &opened;
            match event {
                Ok(event) if event.device_id == device_id => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("input{device_id}: subscriber lagged by {n} events");
                    None
                }
            }
        })
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
