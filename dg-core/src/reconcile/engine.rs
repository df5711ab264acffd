//! Reconciliation loop
//!
//! One cycle: enumerate, resolve, plan against the whitelist, verify new
//! media, enforce, then replace the snapshot. The loop owns the snapshot;
//! nothing else reads or writes it.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use dg_error::{DevGuardError, Result};

use super::plan::{plan_cycle, MonitoringSnapshot, PendingVerification};
use super::shutdown::ShutdownSignal;
use crate::constants::timing::MAX_CONSECUTIVE_ERRORS;
use crate::device::{resolve_batch, CanonicalDeviceIdentity};
use crate::enforce::{EnforcementReport, Enforcer};
use crate::events::{EventSink, GuardEvent};
use crate::platform::bounded::BoundedCall;
use crate::platform::DeviceEnumerator;
use crate::trust::{MediumVerifier, VerificationOutcome};
use crate::whitelist::Whitelist;

/// Loop cadence and per-call bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    pub poll_interval: Duration,
    pub enumeration_timeout: Duration,
    pub verification_timeout: Duration,
}

/// What one cycle saw and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub observed: Vec<CanonicalDeviceIdentity>,
    pub unauthorized: Vec<CanonicalDeviceIdentity>,
    pub verified: Vec<CanonicalDeviceIdentity>,
    pub verification_failures: Vec<(CanonicalDeviceIdentity, VerificationOutcome)>,
    pub disconnected: Vec<CanonicalDeviceIdentity>,
    pub enforcement: Vec<(CanonicalDeviceIdentity, EnforcementReport)>,
}

impl CycleSummary {
    pub fn enforced(&self) -> Vec<&CanonicalDeviceIdentity> {
        self.enforcement.iter().map(|(id, _)| id).collect()
    }
}

pub struct Reconciler {
    enumerator: Arc<dyn DeviceEnumerator>,
    whitelist: Arc<dyn Whitelist>,
    verifier: Arc<dyn MediumVerifier>,
    enforcer: Enforcer,
    events: Arc<dyn EventSink>,
    timings: LoopTimings,
    snapshot: MonitoringSnapshot,
    enumerate_call: BoundedCall,
    verify_call: BoundedCall,
}

impl Reconciler {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        whitelist: Arc<dyn Whitelist>,
        verifier: Arc<dyn MediumVerifier>,
        enforcer: Enforcer,
        events: Arc<dyn EventSink>,
        timings: LoopTimings,
    ) -> Self {
        Self {
            enumerator,
            whitelist,
            verifier,
            enforcer,
            events,
            timings,
            snapshot: MonitoringSnapshot::new(),
            enumerate_call: BoundedCall::new("enumerate"),
            verify_call: BoundedCall::new("verify"),
        }
    }

    pub fn snapshot(&self) -> &MonitoringSnapshot {
        &self.snapshot
    }

    /// Run one cycle.
    ///
    /// Enumeration or whitelist failure skips the cycle and leaves the
    /// snapshot as it was; the error says which.
    pub fn run_cycle(&mut self) -> Result<CycleSummary> {
        let enumerator = Arc::clone(&self.enumerator);
        let raws = self
            .enumerate_call
            .call(self.timings.enumeration_timeout, move || enumerator.enumerate())
        .map_err(|e| DevGuardError::Enumeration(e.to_string()))?;

        let observed = resolve_batch(raws);
        let whitelist = &self.whitelist;
        let plan = plan_cycle(&self.snapshot, &observed, |id| whitelist.get(id))
            .map_err(|e| DevGuardError::whitelist(e.to_string()))?;

        let mut summary = CycleSummary {
            observed: observed.iter().map(|d| d.identity.clone()).collect(),
            disconnected: plan.disconnected.clone(),
            ..CycleSummary::default()
        };

        for identity in &plan.disconnected {
            self.events.emit(&GuardEvent::DeviceDisconnected {
                identity: identity.clone(),
            });
        }

        for device in &plan.newly_authorized {
            self.events.emit(&GuardEvent::DeviceAuthorized {
                identity: device.identity.clone(),
                caption: device.caption.clone(),
                class: device.class(),
            });
        }

        let mut to_enforce = Vec::new();
        let mut failed = Vec::new();

        for pending in &plan.to_verify {
            let identity = pending.device.identity.clone();
            let outcome = self.verify(pending);
            if outcome.is_verified() {
                self.events.emit(&GuardEvent::VerificationPassed {
                    identity: identity.clone(),
                });
                summary.verified.push(identity);
            } else {
                self.events.emit(&GuardEvent::TrustFailure {
                    identity: identity.clone(),
                    outcome,
                });
                summary.verification_failures.push((identity.clone(), outcome));
                failed.push(identity);
                to_enforce.push(pending.device.clone());
            }
        }

        for (device, reason) in &plan.unauthorized {
            self.events.emit(&GuardEvent::UnauthorizedDevice {
                identity: device.identity.clone(),
                caption: device.caption.clone(),
                reason: *reason,
            });
            summary.unauthorized.push(device.identity.clone());
            to_enforce.push(device.clone());
        }

        for device in &to_enforce {
            let report = self.enforcer.enforce(device);
            if !report.any_applied() {
                debug!(device = %device.identity, "No enforcement strategy took effect, retrying next cycle");
            }
            summary.enforcement.push((device.identity.clone(), report));
        }

        self.snapshot = plan.into_snapshot(&failed);

        self.events.emit(&GuardEvent::CycleCompleted {
            observed: summary.observed.len(),
            unauthorized: to_enforce.len(),
            disconnected: summary.disconnected.len(),
        });
        Ok(summary)
    }

    /// Bounded medium check. A verification that does not finish in time
    /// counts as failed.
    fn verify(&self, pending: &PendingVerification) -> VerificationOutcome {
        let Some(volume) = pending.device.volume.clone() else {
            return VerificationOutcome::FingerprintUnavailable;
        };
        let verifier = Arc::clone(&self.verifier);
        let fingerprint = pending.fingerprint.clone();
        let signature = pending.signature.clone();

        self.verify_call
            .call(self.timings.verification_timeout, move || {
                Ok(verifier.verify_medium(&volume, &fingerprint, &signature))
            })
        .unwrap_or_else(|e| {
            warn!(device = %pending.device.identity, error = %e, "Verification did not complete");
            VerificationOutcome::FingerprintUnavailable
        })
    }

    /// Run cycles until `shutdown` is requested. A stop request wakes the
    /// loop between cycles; an in-flight cycle always completes.
    pub fn run(&mut self, shutdown: &ShutdownSignal) {
        info!(
            poll_interval_ms = self.timings.poll_interval.as_millis() as u64,
            strategies = ?self.enforcer.strategy_kinds(),
            "Reconciliation loop starting"
        );

        let mut consecutive_errors: u32 = 0;

        while !shutdown.is_requested() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle()));

            match result {
                Ok(Ok(_)) => {
                    if consecutive_errors > 0 {
                        info!("Reconciliation recovered after {} failed cycles", consecutive_errors);
                        consecutive_errors = 0;
                    }
                }
                Ok(Err(e)) => {
                    consecutive_errors += 1;
                    if consecutive_errors == 1 || consecutive_errors % MAX_CONSECUTIVE_ERRORS == 0 {
                        self.events.emit(&failure_event(&e));
                        if consecutive_errors > 1 {
                            warn!("{} consecutive cycles failed", consecutive_errors);
                        }
                    }
                }
                Err(payload) => {
                    consecutive_errors += 1;
                    let reason = panic_message(payload.as_ref());
                    error!("Reconciliation cycle panicked: {}", reason);
                    self.events.emit(&GuardEvent::CycleFailed { reason });
                }
            }

            if shutdown.wait_timeout(self.timings.poll_interval) {
                break;
            }
        }

        info!("Reconciliation loop stopped");
    }
}

fn failure_event(e: &DevGuardError) -> GuardEvent {
    match e {
        DevGuardError::Enumeration(reason) => GuardEvent::EnumerationFailed {
            reason: reason.clone(),
        },
        DevGuardError::Whitelist(reason) => GuardEvent::WhitelistUnavailable {
            reason: reason.clone(),
        },
        other => GuardEvent::CycleFailed {
            reason: other.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, RawDeviceDescriptor, VolumeRef};
    use crate::enforce::StrategyKind;
    use crate::events::RecordingEventSink;
    use crate::platform::{EnforcementStrategy, MockDeviceEnumerator, MockEnforcementStrategy};
    use crate::trust::{MockMediumVerifier, StructuralFingerprint};
    use crate::whitelist::{MemoryWhitelist, WhitelistEntry};
    use parking_lot::Mutex;

    const A: &str = r"USB\VID_0781&PID_5591\AAAA";
    const B: &str = r"USB\VID_0951&PID_1666\BBBB";

    fn id_of(instance: &str) -> CanonicalDeviceIdentity {
        crate::device::resolve(&RawDeviceDescriptor::generic(instance, "")).unwrap()
    }

    fn timings() -> LoopTimings {
        LoopTimings {
            poll_interval: Duration::from_millis(5),
            enumeration_timeout: Duration::from_secs(2),
            verification_timeout: Duration::from_secs(2),
        }
    }

    /// Enumerator replaying a script of polls; the last poll repeats
    fn scripted(polls: Vec<Vec<RawDeviceDescriptor>>) -> MockDeviceEnumerator {
        let polls = Mutex::new(polls);
        let mut mock = MockDeviceEnumerator::new();
        mock.expect_enumerate().returning(move || {
            let mut polls = polls.lock();
            if polls.len() > 1 {
                Ok(polls.remove(0))
            } else {
                Ok(polls.first().cloned().unwrap_or_default())
            }
        });
        mock
    }

    fn node_strategy() -> MockEnforcementStrategy {
        let mut mock = MockEnforcementStrategy::new();
        mock.expect_kind().return_const(StrategyKind::DisableDeviceNode);
        mock.expect_applies_to().return_const(true);
        mock.expect_apply().returning(|_| Ok(()));
        mock
    }

    fn reconciler(
        enumerator: MockDeviceEnumerator,
        whitelist: MemoryWhitelist,
        verifier: MockMediumVerifier,
        events: Arc<RecordingEventSink>,
    ) -> Reconciler {
        let strategy: Arc<dyn EnforcementStrategy> = Arc::new(node_strategy());
        let enforcer = Enforcer::new(vec![strategy], Duration::from_secs(1), events.clone());
        Reconciler::new(
            Arc::new(enumerator),
            Arc::new(whitelist),
            Arc::new(verifier),
            enforcer,
            events,
            timings(),
        )
    }

    #[test]
    fn unregistered_enforced_and_identity_only_storage_left_alone() {
        let poll = vec![
            RawDeviceDescriptor::generic(A, "Stick").with_volume(VolumeRef::new("/media/a")),
            RawDeviceDescriptor::generic(B, "Unknown"),
        ];
        let whitelist = MemoryWhitelist::with_entries([WhitelistEntry::identity_only(
            id_of(A),
            "Stick",
            DeviceClass::Storage,
        )]);
        let mut verifier = MockMediumVerifier::new();
        verifier.expect_verify_medium().times(0);

        let events = Arc::new(RecordingEventSink::new());
        let mut rec = reconciler(scripted(vec![poll]), whitelist, verifier, events.clone());

        for _ in 0..2 {
            let summary = rec.run_cycle().unwrap();
            assert_eq!(summary.enforced(), vec![&id_of(B)]);
            assert!(summary.verified.is_empty());
        }
        assert_eq!(rec.snapshot().len(), 2);
    }

    #[test]
    fn failed_verification_enforces_and_quarantines() {
        let poll = vec![RawDeviceDescriptor::generic(A, "Stick").with_volume(VolumeRef::new("/media/a"))];
        let whitelist = MemoryWhitelist::with_entries([WhitelistEntry::fingerprinted(
            id_of(A),
            "Stick",
            StructuralFingerprint::from_hex(&"1".repeat(64)),
            "abcd",
        )]);
        let mut verifier = MockMediumVerifier::new();
        verifier
            .expect_verify_medium()
            .times(1)
            .returning(|_, _, _| VerificationOutcome::SignatureNotRegistered);

        let events = Arc::new(RecordingEventSink::new());
        let mut rec = reconciler(scripted(vec![poll]), whitelist, verifier, events.clone());

        let first = rec.run_cycle().unwrap();
        assert_eq!(
            first.verification_failures,
            vec![(id_of(A), VerificationOutcome::SignatureNotRegistered)]
        );
        assert_eq!(first.enforced(), vec![&id_of(A)]);

        let second = rec.run_cycle().unwrap();
        assert_eq!(second.enforced(), vec![&id_of(A)]);
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, GuardEvent::TrustFailure { .. })));
    }

    #[test]
    fn enumeration_failure_keeps_snapshot() {
        let mut enumerator = MockDeviceEnumerator::new();
        let mut calls = 0;
        enumerator.expect_enumerate().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(vec![RawDeviceDescriptor::generic(B, "Unknown")])
            } else {
                Err(DevGuardError::command("Get-CimInstance", "WMI unavailable"))
            }
        });

        let events = Arc::new(RecordingEventSink::new());
        let mut rec = reconciler(enumerator, MemoryWhitelist::new(), MockMediumVerifier::new(), events);

        rec.run_cycle().unwrap();
        let before = rec.snapshot().clone();
        assert!(matches!(rec.run_cycle(), Err(DevGuardError::Enumeration(_))));
        assert_eq!(rec.snapshot(), &before);
    }

    #[test]
    fn run_stops_on_request() {
        let events = Arc::new(RecordingEventSink::new());
        let mut rec = reconciler(scripted(vec![vec![]]), MemoryWhitelist::new(), MockMediumVerifier::new(), events.clone());
        let shutdown = Arc::new(ShutdownSignal::new());

        let stopper = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                shutdown.request();
            })
        };
        rec.run(&shutdown);
        stopper.join().unwrap();

        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, GuardEvent::CycleCompleted { .. })));
    }

    #[test]
    fn stuck_enumeration_keeps_one_worker() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut enumerator = MockDeviceEnumerator::new();
        enumerator.expect_enumerate().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        });

        let events = Arc::new(RecordingEventSink::new());
        let mut reconciler = reconciler(enumerator, MemoryWhitelist::new(), MockMediumVerifier::new(), events);
        reconciler.timings.enumeration_timeout = Duration::from_millis(5);

        for _ in 0..50 {
            assert!(matches!(reconciler.run_cycle(), Err(DevGuardError::Enumeration(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
