//! Bounded platform calls
//!
//! A platform query can hang (a wedged WMI provider, a dying USB disk).
//! Every such call runs on a short-lived worker thread; the caller waits at
//! most `timeout` and treats expiry as an ordinary failure. The worker is
//! left to finish or die on its own.
//!
//! Each call site keeps at most one worker alive. While a timed-out worker
//! is still running, further calls on that site fail at once instead of
//! stacking up another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

use dg_error::{DevGuardError, Result};

/// One call site with its in-flight flag
#[derive(Debug)]
pub struct BoundedCall {
    label: String,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the worker is done, panicking or not
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BoundedCall {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// A worker from an earlier call is still running
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn call<T, F>(&self, timeout: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let label = self.label.as_str();
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!(call = label, "Previous call has not returned, not starting another");
            return Err(DevGuardError::Timeout(label.to_string()));
        }

        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let (tx, rx) = mpsc::channel();

        // On spawn failure the closure, and with it the guard, is dropped.
        thread::Builder::new()
            .name(format!("dg-call-{label}"))
            .spawn(move || {
                let result = {
                    let _guard = guard;
                    f()
                };
                // Receiver may be gone after a timeout.
                let _ = tx.send(result);
            })
            .map_err(|e| DevGuardError::generic(format!("{label}: failed to spawn worker: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(call = label, timeout_ms = timeout.as_millis() as u64, "Platform call timed out");
                Err(DevGuardError::Timeout(label.to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(DevGuardError::generic(format!("{label}: worker panicked")))
            }
        }
    }
}
