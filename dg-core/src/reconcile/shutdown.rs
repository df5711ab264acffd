use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cooperative stop flag the loop sleeps on between cycles
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop and wake it if it is sleeping
    pub fn request(&self) {
        *self.requested.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    /// Sleep up to `timeout`. Returns true if a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.requested.lock();
        while !*requested {
            if self.cond.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        *requested
    }
}
