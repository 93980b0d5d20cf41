//! Five-state lifecycle shared by sessions and acceptors.
//!
//! ```text
//! Stopped ─► Starting ─► Started ─► Running
//!    ▲                                 │
//!    └──────────── Stopping ◄──────────┘   (any active state may stop)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

/// Lifecycle state of a session or acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// Not started, or fully torn down.
    Stopped = 0,
    /// Close in progress.
    Stopping = 1,
    /// Start requested; handshake or bind in progress.
    Starting = 2,
    /// Handshake done; start notification being delivered.
    Started = 3,
    /// Reading, writing and registered.
    Running = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Stopping,
            2 => State::Starting,
            3 => State::Started,
            4 => State::Running,
            _ => State::Stopped,
        }
    }

    /// `Starting`, `Started` or `Running`.
    #[inline]
    pub fn is_active(self) -> bool {
        self >= State::Starting
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Stopped => "stopped",
            State::Stopping => "stopping",
            State::Starting => "starting",
            State::Started => "started",
            State::Running => "running",
        };
        f.write_str(name)
    }
}

/// Atomic state with async and blocking waiters.
///
/// Reads are lock-free. Every change goes through one mutex so that
/// compare-and-set, the watch channel and the condvar stay consistent.
pub(crate) struct StateCell {
    value: AtomicU8,
    lock: Mutex<()>,
    changed: Condvar,
    watch: watch::Sender<State>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicU8::new(State::Stopped as u8),
            lock: Mutex::new(()),
            changed: Condvar::new(),
            watch: watch::Sender::new(State::Stopped),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> State {
        State::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move `from -> to`; false if the current state is not `from`.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        let _guard = self.lock.lock();
        if self
            .value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.publish(to);
        true
    }

    pub(crate) fn set(&self, to: State) {
        let _guard = self.lock.lock();
        self.value.store(to as u8, Ordering::Release);
        self.publish(to);
    }

    /// Move any active state to `Stopping` and return the state it left.
    /// `None` when already stopping or stopped.
    pub(crate) fn begin_stop(&self) -> Option<State> {
        let _guard = self.lock.lock();
        let current = self.get();
        if !current.is_active() {
            return None;
        }
        self.value.store(State::Stopping as u8, Ordering::Release);
        self.publish(State::Stopping);
        Some(current)
    }

    fn publish(&self, to: State) {
        self.watch.send_replace(to);
        self.changed.notify_all();
    }

    /// Wait on the current task until `pred` holds.
    pub(crate) async fn wait_until(&self, pred: impl Fn(State) -> bool) {
        let mut rx = self.watch.subscribe();
        let _ = rx.wait_for(|state| pred(*state)).await;
    }

    /// Block the calling thread until `pred` holds or `timeout` passes.
    /// Returns whether `pred` holds.
    pub(crate) fn wait_blocking(&self, pred: impl Fn(State) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock();
        while !pred(self.get()) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut guard, deadline).timed_out() {
                        return pred(self.get());
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
        true
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}
