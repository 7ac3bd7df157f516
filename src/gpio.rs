use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{AppConfig, Direction};
use crate::debounce::Transition;
use crate::dispatch::Dispatcher;
use crate::error::{CallbackError, GpioError};
use crate::line::{GpioBackend, LineHandle};
use crate::registry::{PinDescriptor, PinRegistry};

/// An accepted, debounced transition on an input pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: u32,
    pub transition: Transition,
    pub timestamp: Instant,
}

pub type EdgeCallback = Arc<dyn Fn(&EdgeEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Handle returned by [`GpioManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    pin: u32,
}

impl Subscription {
    pub fn pin(&self) -> u32 {
        self.pin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub poll_interval: Duration,
    pub broadcast_capacity: usize,
    pub event_history_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            broadcast_capacity: 64,
            event_history_capacity: 32,
        }
    }
}

impl From<&AppConfig> for ManagerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            broadcast_capacity: config.broadcast_capacity,
            event_history_capacity: config.event_history_capacity,
        }
    }
}

/// Snapshot of one configured pin, as returned by [`GpioManager::list_pins`].
#[derive(Debug, Clone)]
pub struct PinStatus {
    pub descriptor: Arc<PinDescriptor>,
    /// `None` when the line could not be read.
    pub level: Option<bool>,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    by_pin: FxHashMap<u32, Vec<(u64, EdgeCallback)>>,
}

/// Fan-out of accepted edges to async consumers plus a bounded per-pin
/// history.
struct EventHub {
    event_tx: broadcast::Sender<EdgeEvent>,
    history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    history_capacity: usize,
}

impl EventHub {
    fn new(registry: &PinRegistry, options: &ManagerOptions) -> Self {
        let (event_tx, _) = broadcast::channel(options.broadcast_capacity.max(1));
        let history = registry
            .iter()
            .filter(|d| d.is_input())
            .map(|d| (d.id, RwLock::new(VecDeque::new())))
            .collect();
        Self {
            event_tx,
            history,
            history_capacity: options.event_history_capacity,
        }
    }

    fn record(&self, event: EdgeEvent) {
        if self.history_capacity > 0
            && let Some(history_lock) = self.history.get(&event.pin)
        {
            let mut history = history_lock.write();
            while history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(event);
        }
        // no receivers is not an error
        let _ = self.event_tx.send(event);
    }
}

type SharedLine<L> = Arc<Mutex<LineHandle<L>>>;

/// State shared between the manager and its dispatch thread.
pub(crate) struct Shared<B: GpioBackend> {
    registry: Arc<PinRegistry>,
    backend: Arc<B>,
    lines: RwLock<FxHashMap<u32, SharedLine<B::Line>>>,
    subscribers: Mutex<SubscriberTable>,
    events: EventHub,
    /// Set once shutdown begins. No line is claimed after that.
    closed: AtomicBool,
}

impl<B: GpioBackend> Shared<B> {
    pub(crate) fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    fn line(&self, descriptor: &Arc<PinDescriptor>) -> Result<SharedLine<B::Line>, GpioError> {
        if let Some(handle) = self.lines.read().get(&descriptor.id) {
            return Ok(handle.clone());
        }

        // upgradable reads are exclusive with each other, so only one caller
        // can get here for a given pin and the claim happens once
        let lines = self.lines.upgradable_read();
        if let Some(handle) = lines.get(&descriptor.id) {
            return Ok(handle.clone());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(GpioError::ManagerClosed);
        }
        let handle = Arc::new(Mutex::new(LineHandle::open(
            self.backend.as_ref(),
            descriptor.clone(),
        )?));
        RwLockUpgradableReadGuard::upgrade(lines).insert(descriptor.id, handle.clone());
        Ok(handle)
    }

    /// Runs `op` on the open line of `pin_id`. A handle found closed was
    /// released after it was looked up, so the line is resolved again.
    fn with_line<T>(
        &self,
        pin_id: u32,
        op: impl Fn(&mut LineHandle<B::Line>) -> Result<T, GpioError>,
    ) -> Result<T, GpioError> {
        let descriptor = self.registry.get(pin_id)?;
        loop {
            let shared_line = self.line(descriptor)?;
            let mut handle = shared_line.lock();
            if handle.is_open() {
                return op(&mut handle);
            }
        }
    }

    pub(crate) fn read(&self, pin_id: u32) -> Result<bool, GpioError> {
        self.with_line(pin_id, |handle| handle.read())
    }

    fn write(&self, pin_id: u32, value: bool) -> Result<(), GpioError> {
        self.with_line(pin_id, |handle| handle.write(value))
    }

    // Handles are closed while the map is still write-locked, so nobody can
    // claim the same line again before it is actually free. Lock order is
    // always the map first, then the handle.
    fn release(&self, pin_id: u32) -> bool {
        let mut lines = self.lines.write();
        match lines.remove(&pin_id) {
            Some(handle) => {
                handle.lock().close();
                true
            }
            None => false,
        }
    }

    fn close_all(&self) {
        let mut lines = self.lines.write();
        for (_, handle) in lines.drain() {
            handle.lock().close();
        }
    }

    pub(crate) fn subscribed_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.subscribers.lock().by_pin.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Records `event` and runs every callback registered for its pin, in
    /// registration order.
    pub(crate) fn publish(&self, event: EdgeEvent) {
        self.events.record(event);

        let callbacks: Vec<(u64, EdgeCallback)> = self
            .subscribers
            .lock()
            .by_pin
            .get(&event.pin)
            .cloned()
            .unwrap_or_default();

        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "subscriber {id} failed handling {:?} on pin {}: {e}",
                        event.transition, event.pin
                    );
                }
                Err(_) => {
                    error!(
                        "subscriber {id} panicked handling {:?} on pin {}",
                        event.transition, event.pin
                    );
                }
            }
        }
    }
}

/// Owner of every claimed GPIO line in the process.
pub struct GpioManager<B: GpioBackend + 'static> {
    shared: Arc<Shared<B>>,
    state: RwLock<ManagerState>,
    dispatcher: Mutex<Option<Dispatcher>>,
    poll_interval: Duration,
}

impl<B: GpioBackend + 'static> GpioManager<B> {
    pub fn new(registry: PinRegistry, backend: Arc<B>, options: ManagerOptions) -> Self {
        let events = EventHub::new(&registry, &options);
        let shared = Arc::new(Shared {
            registry: Arc::new(registry),
            backend,
            lines: RwLock::new(FxHashMap::default()),
            subscribers: Mutex::new(SubscriberTable::default()),
            events,
            closed: AtomicBool::new(false),
        });

        Self {
            shared,
            state: RwLock::new(ManagerState::Uninitialized),
            dispatcher: Mutex::new(None),
            poll_interval: options.poll_interval,
        }
    }

    pub fn from_config(config: &AppConfig, backend: Arc<B>) -> Result<Self, GpioError> {
        let registry = PinRegistry::load(config)?;
        Ok(Self::new(registry, backend, ManagerOptions::from(config)))
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.shared.registry
    }

    fn running(&self) -> Result<RwLockReadGuard<'_, ManagerState>, GpioError> {
        let state = self.state.read();
        match *state {
            ManagerState::Running => Ok(state),
            ManagerState::Uninitialized => Err(GpioError::NotStarted),
            ManagerState::ShuttingDown | ManagerState::Stopped => Err(GpioError::ManagerClosed),
        }
    }

    /// Claims every output that has an initial level and starts the
    /// dispatch thread.
    pub fn start(&self) -> Result<(), GpioError> {
        let mut state = self.state.write();
        match *state {
            ManagerState::Uninitialized => {}
            ManagerState::Running => return Ok(()),
            ManagerState::ShuttingDown | ManagerState::Stopped => {
                return Err(GpioError::ManagerClosed);
            }
        }

        let mut outputs: Vec<_> = self
            .shared
            .registry
            .iter()
            .filter(|d| d.direction == Direction::Output && d.initial.is_some())
            .cloned()
            .collect();
        outputs.sort_by_key(|d| d.id);

        for descriptor in &outputs {
            if let Err(e) = self.shared.line(descriptor) {
                error!("failed to claim output pin {}: {e}", descriptor.id);
                self.shared.close_all();
                return Err(e);
            }
            info!(
                "pin {} ({}) driven to initial level {}",
                descriptor.id,
                descriptor.name,
                descriptor.initial.unwrap_or(false)
            );
        }

        let dispatcher = match Dispatcher::spawn(self.shared.clone(), self.poll_interval) {
            Ok(d) => d,
            Err(e) => {
                self.shared.close_all();
                return Err(e);
            }
        };
        *self.dispatcher.lock() = Some(dispatcher);
        *state = ManagerState::Running;

        info!(
            "line manager running with {} pins, polling every {:?}",
            self.shared.registry.len(),
            self.poll_interval
        );
        Ok(())
    }

    pub fn read(&self, pin_id: u32) -> Result<bool, GpioError> {
        let _state = self.running()?;
        self.shared.read(pin_id)
    }

    pub fn write(&self, pin_id: u32, value: bool) -> Result<(), GpioError> {
        let _state = self.running()?;
        self.shared.write(pin_id, value)
    }

    /// Registers `callback` for debounced edges on an input pin. The line is
    /// claimed immediately so claim failures reach the caller.
    pub fn subscribe<F>(&self, pin_id: u32, callback: F) -> Result<Subscription, GpioError>
    where
        F: Fn(&EdgeEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let _state = self.running()?;
        let descriptor = self.shared.registry.get(pin_id)?;
        if descriptor.direction != Direction::Input {
            return Err(GpioError::InvalidDirection {
                pin: pin_id,
                direction: descriptor.direction,
            });
        }
        self.shared.line(descriptor)?;

        let mut table = self.shared.subscribers.lock();
        table.next_id += 1;
        let id = table.next_id;
        table
            .by_pin
            .entry(pin_id)
            .or_default()
            .push((id, Arc::new(callback)));

        Ok(Subscription { id, pin: pin_id })
    }

    /// Removes a registration. Unknown or already removed handles are
    /// ignored.
    pub fn unsubscribe(&self, subscription: Subscription) -> Result<(), GpioError> {
        let _state = self.running()?;
        let mut table = self.shared.subscribers.lock();
        if let Some(entries) = table.by_pin.get_mut(&subscription.pin) {
            entries.retain(|(id, _)| *id != subscription.id);
            if entries.is_empty() {
                table.by_pin.remove(&subscription.pin);
            }
        }
        Ok(())
    }

    /// Closes the line of one pin. It is claimed again on the next access.
    pub fn release(&self, pin_id: u32) -> Result<(), GpioError> {
        let _state = self.running()?;
        self.shared.registry.get(pin_id)?;
        if self.shared.release(pin_id) {
            info!("released pin {pin_id}");
        }
        Ok(())
    }

    pub fn list_pins(&self) -> Result<Vec<PinStatus>, GpioError> {
        let _state = self.running()?;
        let mut descriptors: Vec<_> = self.shared.registry.iter().cloned().collect();
        descriptors.sort_by_key(|d| d.id);

        Ok(descriptors
            .into_iter()
            .map(|descriptor| {
                let level = match self.shared.read(descriptor.id) {
                    Ok(level) => Some(level),
                    Err(e) => {
                        warn!("failed to read pin {}: {e}", descriptor.id);
                        None
                    }
                };
                PinStatus { descriptor, level }
            })
            .collect())
    }

    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<EdgeEvent>, GpioError> {
        let _state = self.running()?;
        Ok(self.shared.events.event_tx.subscribe())
    }

    pub fn event_stream(&self) -> Result<BroadcastStream<EdgeEvent>, GpioError> {
        Ok(BroadcastStream::new(self.subscribe_events()?))
    }

    /// Most recent edges of `pin_id`, oldest first.
    pub fn recent_events(
        &self,
        pin_id: u32,
        limit: Option<usize>,
    ) -> Result<Vec<EdgeEvent>, GpioError> {
        let _state = self.running()?;
        self.shared.registry.get(pin_id)?;

        Ok(self
            .shared
            .events
            .history
            .get(&pin_id)
            .map(|d| {
                let d = d.read();
                let skip = limit.map_or(0, |lim| d.len().saturating_sub(lim));
                d.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default())
    }

    pub fn last_event(&self, pin_id: u32) -> Result<Option<EdgeEvent>, GpioError> {
        let _state = self.running()?;
        self.shared.registry.get(pin_id)?;

        Ok(self
            .shared
            .events
            .history
            .get(&pin_id)
            .and_then(|d| d.read().back().copied()))
    }

    /// Stops the dispatch loop, waiting for a running callback to return,
    /// then drops all subscriptions and releases every line.
    pub fn shutdown(&self) -> Result<(), GpioError> {
        {
            let mut state = self.state.write();
            match *state {
                ManagerState::Running => *state = ManagerState::ShuttingDown,
                ManagerState::Uninitialized => {
                    *state = ManagerState::Stopped;
                    return Ok(());
                }
                ManagerState::ShuttingDown | ManagerState::Stopped => {
                    return Err(GpioError::ManagerClosed);
                }
            }
        }
        info!("line manager shutting down");
        self.shared.closed.store(true, Ordering::SeqCst);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }

        self.shared.subscribers.lock().by_pin.clear();
        self.shared.close_all();

        *self.state.write() = ManagerState::Stopped;
        info!("line manager stopped");
        Ok(())
    }
}

impl<B: GpioBackend + 'static> Drop for GpioManager<B> {
    fn drop(&mut self) {
        if self.state() == ManagerState::Running {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;

    fn manager() -> (GpioManager<MockGpioBackend>, MockGpioBackend) {
        let config = AppConfig::from_json(
            r#"{
                "pins": [
                    { "id": 17, "direction": "input", "debounce_ms": 50 },
                    { "id": 27, "direction": "output", "polarity": "active-low", "initial": false },
                    { "id": 22, "direction": "output" }
                ]
            }"#,
        )
        .expect("config");
        let backend = MockGpioBackend::default();
        let manager = GpioManager::from_config(&config, Arc::new(backend.clone())).expect("manager");
        (manager, backend)
    }

    #[test]
    fn operations_before_start_are_rejected() {
        let (manager, _) = manager();
        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert!(matches!(manager.read(17), Err(GpioError::NotStarted)));
    }

    #[test]
    fn start_drives_initial_levels() {
        let (manager, backend) = manager();
        manager.start().expect("start");

        // active-low relay held off means the line sits high
        assert!(backend.is_claimed("/dev/gpiochip0", 27));
        assert_eq!(backend.physical_level("/dev/gpiochip0", 27), Some(true));
        assert!(!manager.read(27).expect("read"));
        // outputs without an initial level are claimed lazily
        assert!(!backend.is_claimed("/dev/gpiochip0", 22));
    }

    #[test]
    fn lifecycle_transitions() {
        let (manager, _) = manager();
        manager.start().expect("start");
        assert_eq!(manager.state(), ManagerState::Running);
        manager.shutdown().expect("shutdown");
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(matches!(manager.shutdown(), Err(GpioError::ManagerClosed)));
        assert!(matches!(manager.start(), Err(GpioError::ManagerClosed)));
    }

    #[test]
    fn release_frees_the_line_until_next_access() {
        let (manager, backend) = manager();
        manager.start().expect("start");
        manager.write(22, true).expect("write");
        assert!(backend.is_claimed("/dev/gpiochip0", 22));

        manager.release(22).expect("release");
        assert!(!backend.is_claimed("/dev/gpiochip0", 22));

        manager.read(22).expect("read");
        assert!(backend.is_claimed("/dev/gpiochip0", 22));
    }

    #[test]
    fn no_line_is_claimed_once_shutdown_began() {
        let (manager, backend) = manager();
        manager.start().expect("start");
        manager.shutdown().expect("shutdown");

        assert!(matches!(manager.shared.read(22), Err(GpioError::ManagerClosed)));
        assert!(!backend.is_claimed("/dev/gpiochip0", 22));
    }

    #[test]
    fn read_after_release_reclaims_instead_of_failing() {
        let (manager, backend) = manager();
        manager.start().expect("start");
        manager.write(22, true).expect("write");

        // a handle looked up before the release is closed by the time it is used
        let stale = manager.shared.line(manager.registry().get(22).expect("pin")).expect("line");
        manager.release(22).expect("release");
        assert!(!stale.lock().is_open());

        manager.read(22).expect("read");
        assert!(backend.is_claimed("/dev/gpiochip0", 22));
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let (manager, _) = manager();
        manager.start().expect("start");
        let t0 = Instant::now();
        for i in 0..40u64 {
            manager.shared.publish(EdgeEvent {
                pin: 17,
                transition: Transition::from_level(i % 2 == 0),
                timestamp: t0 + Duration::from_millis(i),
            });
        }

        let all = manager.recent_events(17, None).expect("events");
        assert_eq!(all.len(), 32);
        assert_eq!(all[0].timestamp, t0 + Duration::from_millis(8));

        let last_two = manager.recent_events(17, Some(2)).expect("events");
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].timestamp, t0 + Duration::from_millis(39));
        assert_eq!(manager.last_event(17).expect("last"), Some(last_two[1]));
    }
}
