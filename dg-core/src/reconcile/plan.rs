//! Pure per-cycle decision function
//!
//! `(previous snapshot, observed devices, whitelist lookup) -> plan`. No
//! I/O besides the lookup callback, so every transition is unit-testable.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use dg_error::Result;

use crate::device::{CanonicalDeviceIdentity, ObservedDevice};
use crate::events::UnauthorizedReason;
use crate::trust::StructuralFingerprint;
use crate::whitelist::WhitelistEntry;

/// How a connected device was judged in the cycle that last saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Trusted,
    Unauthorized,
    /// Whitelisted identity whose medium failed verification; stays
    /// blocked until it disconnects
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub volume_bound: bool,
    pub standing: Standing,
}

/// Devices seen in the most recent completed cycle. Owned by the loop
/// thread and replaced wholesale each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringSnapshot {
    devices: BTreeMap<CanonicalDeviceIdentity, DeviceState>,
}

impl MonitoringSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CanonicalDeviceIdentity) -> Option<DeviceState> {
        self.devices.get(id).copied()
    }

    pub fn contains(&self, id: &CanonicalDeviceIdentity) -> bool {
        self.devices.contains_key(id)
    }

    pub fn identities(&self) -> impl Iterator<Item = &CanonicalDeviceIdentity> {
        self.devices.keys()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// A whitelisted medium that must be checked before it is trusted
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub device: ObservedDevice,
    pub fingerprint: StructuralFingerprint,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct CyclePlan {
    /// Enforce every one of these, this cycle
    pub unauthorized: Vec<(ObservedDevice, UnauthorizedReason)>,
    pub to_verify: Vec<PendingVerification>,
    /// Whitelisted and newly trusted without a medium check
    pub newly_authorized: Vec<ObservedDevice>,
    pub disconnected: Vec<CanonicalDeviceIdentity>,
    /// Next snapshot, assuming every pending verification passes
    next: BTreeMap<CanonicalDeviceIdentity, DeviceState>,
}

impl CyclePlan {
    /// Snapshot to keep after verification; `failed` identities are quarantined.
    pub fn into_snapshot(self, failed: &[CanonicalDeviceIdentity]) -> MonitoringSnapshot {
        let mut devices = self.next;
        for id in failed {
            if let Some(state) = devices.get_mut(id) {
                state.standing = Standing::Quarantined;
            }
        }
        MonitoringSnapshot { devices }
    }
}

/// Classify one poll against the previous snapshot.
///
/// Unregistered and quarantined devices are enforced every cycle they stay
/// present. A whitelisted medium is verified when it appears, when its
/// volume gets bound after it appeared, or when it becomes whitelisted
/// while connected. A lookup error aborts the plan; the caller keeps the
/// previous snapshot.
pub fn plan_cycle<F>(
    previous: &MonitoringSnapshot,
    observed: &[ObservedDevice],
    mut lookup: F,
) -> Result<CyclePlan>
where
    F: FnMut(&CanonicalDeviceIdentity) -> Result<Option<WhitelistEntry>>,
{
    let mut plan = CyclePlan {
        unauthorized: Vec::new(),
        to_verify: Vec::new(),
        newly_authorized: Vec::new(),
        disconnected: Vec::new(),
        next: BTreeMap::new(),
    };

    for device in observed {
        let id = &device.identity;
        if plan.next.contains_key(id) {
            continue;
        }

        let prior = previous.get(id);
        let volume_bound = device.volume.is_some();
        let entry = lookup(id)?;

        let standing = match entry {
            None => {
                plan.unauthorized
                    .push((device.clone(), UnauthorizedReason::NotWhitelisted));
                Standing::Unauthorized
            }
            Some(_) if matches!(prior, Some(s) if s.standing == Standing::Quarantined) => {
                plan.unauthorized
                    .push((device.clone(), UnauthorizedReason::Quarantined));
                Standing::Quarantined
            }
            Some(entry) => {
                let newly_trusted = !matches!(prior, Some(s) if s.standing == Standing::Trusted);
                let volume_appeared = !matches!(prior, Some(s) if s.volume_bound);

                match entry.trust_anchor() {
                    Some((fingerprint, signature))
                        if volume_bound && (newly_trusted || volume_appeared) =>
                    {
                        plan.to_verify.push(PendingVerification {
                            device: device.clone(),
                            fingerprint: fingerprint.clone(),
                            signature: signature.to_string(),
                        });
                    }
                    _ if newly_trusted => plan.newly_authorized.push(device.clone()),
                    _ => {}
                }
                Standing::Trusted
            }
        };

        plan.next.insert(
            id.clone(),
            DeviceState {
                volume_bound,
                standing,
            },
        );
    }

    let current: HashSet<&CanonicalDeviceIdentity> = plan.next.keys().collect();
    plan.disconnected = previous
        .identities()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect();

    Ok(plan)
}
