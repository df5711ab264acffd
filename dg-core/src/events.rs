//! Guard events
//!
//! Components report what they observe and do through an injected
//! [`EventSink`] rather than a global logger, so each can be tested by
//! recording what it emitted.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::device::{CanonicalDeviceIdentity, DeviceClass};
use crate::enforce::StrategyKind;
use crate::trust::VerificationOutcome;

/// Why a device was treated as unauthorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedReason {
    NotWhitelisted,
    /// Failed verification earlier in this connection
    Quarantined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardEvent {
    /// A whitelisted device appeared and needs no medium check
    DeviceAuthorized {
        identity: CanonicalDeviceIdentity,
        caption: String,
        class: DeviceClass,
    },
    UnauthorizedDevice {
        identity: CanonicalDeviceIdentity,
        caption: String,
        reason: UnauthorizedReason,
    },
    VerificationPassed {
        identity: CanonicalDeviceIdentity,
    },
    /// Security event: identity is whitelisted but the medium is not the registered one
    TrustFailure {
        identity: CanonicalDeviceIdentity,
        outcome: VerificationOutcome,
    },
    DeviceDisconnected {
        identity: CanonicalDeviceIdentity,
    },
    StrategyApplied {
        identity: CanonicalDeviceIdentity,
        strategy: StrategyKind,
    },
    StrategyFailed {
        identity: CanonicalDeviceIdentity,
        strategy: StrategyKind,
        reason: String,
    },
    MarkerCreated {
        path: PathBuf,
    },
    EnumerationFailed {
        reason: String,
    },
    /// The whitelist could not be read; the whole cycle was skipped
    WhitelistUnavailable {
        reason: String,
    },
    CycleFailed {
        reason: String,
    },
    CycleCompleted {
        observed: usize,
        unauthorized: usize,
        disconnected: usize,
    },
}

/// Receives guard events. Implementations must be cheap and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &GuardEvent);
}

/// Default sink: every event becomes a `tracing` record.
///
/// Security events go out at `warn`, failures at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &GuardEvent) {
        match event {
            GuardEvent::DeviceAuthorized { identity, caption, class } => {
                info!(device = %identity, caption = %caption, class = %class, "Authorized device connected");
            }
            GuardEvent::UnauthorizedDevice { identity, caption, reason } => {
                warn!(device = %identity, caption = %caption, reason = ?reason, "Unauthorized device present");
            }
            GuardEvent::VerificationPassed { identity } => {
                info!(device = %identity, "Medium verified");
            }
            GuardEvent::TrustFailure { identity, outcome } => {
                warn!(device = %identity, outcome = %outcome, "SECURITY: medium failed verification");
            }
            GuardEvent::DeviceDisconnected { identity } => {
                info!(device = %identity, "Device disconnected");
            }
            GuardEvent::StrategyApplied { identity, strategy } => {
                info!(device = %identity, strategy = %strategy, "Enforcement applied");
            }
            GuardEvent::StrategyFailed { identity, strategy, reason } => {
                error!(device = %identity, strategy = %strategy, reason = %reason, "Enforcement strategy failed");
            }
            GuardEvent::MarkerCreated { path } => {
                info!(path = %path.display(), "Signed marker created");
            }
            GuardEvent::EnumerationFailed { reason } => {
                error!(reason = %reason, "Device enumeration failed");
            }
            GuardEvent::WhitelistUnavailable { reason } => {
                error!(reason = %reason, "Whitelist unavailable, cycle skipped");
            }
            GuardEvent::CycleFailed { reason } => {
                error!(reason = %reason, "Reconciliation cycle failed");
            }
            GuardEvent::CycleCompleted { observed, unauthorized, disconnected } => {
                debug!(observed, unauthorized, disconnected, "Cycle complete");
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GuardEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GuardEvent> {
        self.events.lock().clone()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<GuardEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &GuardEvent) {
        self.events.lock().push(event.clone());
    }
}
