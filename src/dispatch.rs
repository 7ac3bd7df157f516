use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::debounce::EdgeFilter;
use crate::error::GpioError;
use crate::gpio::{EdgeEvent, Shared};
use crate::line::GpioBackend;

const DISPATCH_THREAD_NAME: &str = "linemgr-dispatch";

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Sleeps for at most `timeout`. Returns true once stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn is_raised(&self) -> bool {
        *self.stopped.lock()
    }

    fn raise(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// Handle to the thread that samples subscribed inputs and delivers edges.
pub(crate) struct Dispatcher {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn<B: GpioBackend + 'static>(
        shared: Arc<Shared<B>>,
        poll_interval: Duration,
    ) -> Result<Self, GpioError> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let stop = signal.clone();

        let handle = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.into())
            .spawn(move || run(&shared, &stop, poll_interval))
            .map_err(GpioError::Spawn)?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|h| h.thread().id())
    }

    /// Requests the loop to end and waits for it, unless called from the
    /// dispatch thread itself (a callback shutting the manager down), in
    /// which case the loop exits once the callback returns.
    pub(crate) fn stop(&mut self) {
        self.signal.raise();
        if self.thread_id() == Some(thread::current().id()) {
            self.handle.take();
            return;
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("dispatch thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchedPin {
    filter: EdgeFilter,
    failing: bool,
}

fn run<B: GpioBackend>(shared: &Shared<B>, signal: &StopSignal, poll_interval: Duration) {
    info!("dispatch loop started");
    let mut watched: FxHashMap<u32, WatchedPin> = FxHashMap::default();

    loop {
        tick(shared, signal, &mut watched);
        if signal.wait(poll_interval) {
            break;
        }
    }

    info!("dispatch loop stopped");
}

fn tick<B: GpioBackend>(
    shared: &Shared<B>,
    signal: &StopSignal,
    watched: &mut FxHashMap<u32, WatchedPin>,
) {
    let pins = shared.subscribed_pins();
    // a pin that lost all subscribers starts from a fresh baseline next time
    watched.retain(|pin, _| pins.binary_search(pin).is_ok());

    for pin in pins {
        // a callback may have shut the manager down mid-tick
        if signal.is_raised() {
            break;
        }
        let Ok(descriptor) = shared.registry().get(pin) else {
            continue;
        };
        let entry = watched.entry(pin).or_insert_with(|| WatchedPin {
            filter: EdgeFilter::new(descriptor.debounce),
            failing: false,
        });

        let level = match shared.read(pin) {
            Ok(level) => level,
            Err(e) => {
                if entry.failing {
                    debug!("sampling pin {pin} still failing: {e}");
                } else {
                    warn!("sampling pin {pin} failed: {e}");
                    entry.failing = true;
                }
                continue;
            }
        };
        if entry.failing {
            info!("sampling pin {pin} recovered");
            entry.failing = false;
        }

        let now = Instant::now();
        if let Some(transition) = entry.filter.observe(level, now) {
            debug!("pin {pin} {transition:?}");
            shared.publish(EdgeEvent {
                pin,
                transition,
                timestamp: now,
            });
        }
    }
}
