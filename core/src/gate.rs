//! Callback gate: synchronous cancellation for callback-driven handles.
//!
//! Every watch, tracker and realtime subscription dispatches its callbacks
//! through a [`CallbackGate`]. Closing the gate waits for an in-flight
//! callback on another thread to finish and prevents any further ones, so
//! once `close()` returns no callback can fire. The lock is re-entrant, which
//! lets a callback close its own gate.

use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct CallbackGate {
    closed: ReentrantMutex<Cell<bool>>,
    /// Number of callbacks that actually ran
    delivered: AtomicU64,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self {
            closed: ReentrantMutex::new(Cell::new(false)),
            delivered: AtomicU64::new(0),
        }
    }

    /// Run `f` unless the gate is closed. Returns whether it ran.
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        let guard = self.closed.lock();
        if guard.get() {
            return false;
        }
        f();
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Close the gate. Blocks until a callback running on another thread returns.
    pub fn close(&self) {
        let guard = self.closed.lock();
        guard.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().get()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for CallbackGate {
    fn default() -> Self {
        Self::new()
    }
}
