//! Auto-reset events
//!
//! Condvar-backed latches with one setter and one waiter role per
//! transition: `set` wakes the waiter, a successful wait consumes the
//! signal. The audio thread only ever uses the bounded or non-blocking
//! forms.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Auto-reset event (set / consume-on-wait).
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event; a no-op if already signaled.
    pub fn set(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Clear a pending signal without waking anyone.
    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    /// Consume the signal if present, without blocking.
    pub fn try_consume(&self) -> bool {
        let mut signaled = self.state.lock();
        let was = *signaled;
        *signaled = false;
        was
    }

    /// Block until signaled, then consume.
    pub fn wait_consume(&self) {
        let mut signaled = self.state.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Level wait: block up to `timeout` for the event to be set, without
    /// consuming it. Used where the event gates admission rather than
    /// hands off a one-shot signal.
    pub fn wait_set_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.lock();
        if !*signaled {
            let deadline = std::time::Instant::now() + timeout;
            while !*signaled {
                if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                    break;
                }
            }
        }
        *signaled
    }

    /// Block up to `timeout`; returns whether the signal was consumed.
    pub fn wait_consume_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.lock();
        if !*signaled {
            let deadline = std::time::Instant::now() + timeout;
            while !*signaled {
                if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                    break;
                }
            }
        }
        let was = *signaled;
        *signaled = false;
        was
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
