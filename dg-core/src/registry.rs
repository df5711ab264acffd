//! Administrative operations
//!
//! Registration, verification on request, removal and inventory. Each call
//! is independent of the reconciliation loop: inventory re-enumerates
//! instead of reading the loop's snapshot.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use dg_error::{DevGuardError, Result};

use crate::constants::limits::MAX_FRIENDLY_NAME_LEN;
use crate::device::{resolve_batch, CanonicalDeviceIdentity, DeviceClass, VolumeRef};
use crate::platform::DeviceEnumerator;
use crate::trust::{TrustEngine, VerificationOutcome};
use crate::whitelist::{Whitelist, WhitelistEntry};

#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub identity: CanonicalDeviceIdentity,
    pub friendly_name: String,
    /// Mounted volume of a storage device; `None` registers a peripheral
    pub volume: Option<VolumeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResult {
    Registered(WhitelistEntry),
    /// The identity was already whitelisted; nothing was touched
    AlreadyRegistered(WhitelistEntry),
}

impl RegistrationResult {
    pub fn entry(&self) -> &WhitelistEntry {
        match self {
            Self::Registered(e) | Self::AlreadyRegistered(e) => e,
        }
    }
}

/// A currently connected device, annotated with its whitelist status
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub identity: CanonicalDeviceIdentity,
    pub caption: String,
    pub class: DeviceClass,
    pub volume: Option<VolumeRef>,
    pub instance_ids: Vec<String>,
    pub is_registered: bool,
    pub is_fingerprinted: bool,
    pub friendly_name: Option<String>,
}

pub struct DeviceRegistry {
    whitelist: Arc<dyn Whitelist>,
    trust: Arc<TrustEngine>,
}

fn validate_friendly_name(name: &str) -> Result<String> {
    let name = name.trim();
    let invalid = |reason: &str| DevGuardError::InvalidConfig {
        field: "friendly_name".into(),
        reason: reason.into(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.chars().count() > MAX_FRIENDLY_NAME_LEN {
        return Err(invalid("too long"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("contains control characters"));
    }
    Ok(name.to_string())
}

impl DeviceRegistry {
    pub fn new(whitelist: Arc<dyn Whitelist>, trust: Arc<TrustEngine>) -> Self {
        Self { whitelist, trust }
    }

    pub fn trust(&self) -> &TrustEngine {
        &self.trust
    }

    /// Whitelist a device.
    ///
    /// With a volume and a host key, the medium is fingerprinted and
    /// marked; any failure there aborts with nothing stored. Without a host
    /// key, storage is registered by identity only.
    pub fn register(&self, request: RegistrationRequest) -> Result<RegistrationResult> {
        let friendly_name = validate_friendly_name(&request.friendly_name)?;
        let id = request.identity;

        if let Some(existing) = self.whitelist.get(&id)? {
            return Ok(RegistrationResult::AlreadyRegistered(existing));
        }

        let entry = self.new_entry(&id, friendly_name, request.volume.as_ref())?;
        self.store(entry)
    }

    /// Replace any existing registration, re-creating the marker.
    ///
    /// The new entry, fingerprint and marker included, is built before the
    /// old one is touched; on failure the old registration stays.
    pub fn reregister(&self, request: RegistrationRequest) -> Result<RegistrationResult> {
        let friendly_name = validate_friendly_name(&request.friendly_name)?;
        let id = request.identity;

        let entry = self.new_entry(&id, friendly_name, request.volume.as_ref())?;
        if self.whitelist.delete(&id)? {
            info!(device = %id, "Replacing previous registration");
        }
        self.store(entry)
    }

    fn new_entry(
        &self,
        id: &CanonicalDeviceIdentity,
        friendly_name: String,
        volume: Option<&VolumeRef>,
    ) -> Result<WhitelistEntry> {
        Ok(match volume {
            Some(volume) if self.trust.has_key() => {
                let fingerprint = self.trust.fingerprint(volume)?;
                let record = self.trust.create_signed_marker(volume)?;
                WhitelistEntry::fingerprinted(id.clone(), friendly_name, fingerprint, record.signature)
            }
            Some(volume) => {
                warn!(device = %id, volume = %volume, "No host key, registering storage by identity only");
                WhitelistEntry::identity_only(id.clone(), friendly_name, DeviceClass::Storage)
            }
            None => WhitelistEntry::identity_only(id.clone(), friendly_name, DeviceClass::Peripheral),
        })
    }

    fn store(&self, entry: WhitelistEntry) -> Result<RegistrationResult> {
        let id = &entry.canonical_id;
        if !self.whitelist.put(entry.clone())? {
            // Lost a race with another registration of the same identity.
            let existing = self
                .whitelist
                .get(id)?
                .ok_or_else(|| DevGuardError::whitelist(format!("{id} vanished during registration")))?;
            return Ok(RegistrationResult::AlreadyRegistered(existing));
        }

        info!(
            device = %id,
            name = %entry.friendly_name,
            class = %entry.device_class,
            fingerprinted = entry.requires_verification(),
            "Device registered"
        );
        Ok(RegistrationResult::Registered(entry))
    }

    /// Check the medium at `volume` against the registration of `id`
    pub fn verify(&self, id: &CanonicalDeviceIdentity, volume: &VolumeRef) -> Result<VerificationOutcome> {
        let entry = self
            .whitelist
            .get(id)?
            .ok_or_else(|| DevGuardError::NotRegistered(id.to_string()))?;
        let (fingerprint, signature) = entry
            .trust_anchor()
            .ok_or_else(|| DevGuardError::NotFingerprinted(id.to_string()))?;

        let outcome = self.trust.verify_detailed(volume, fingerprint, signature);
        info!(device = %id, volume = %volume, outcome = %outcome, "On-demand verification");
        Ok(outcome)
    }

    pub fn remove(&self, id: &CanonicalDeviceIdentity) -> Result<bool> {
        let removed = self.whitelist.delete(id)?;
        if removed {
            info!(device = %id, "Device removed from whitelist");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<WhitelistEntry>> {
        self.whitelist.list()
    }

    /// Fresh enumeration annotated with whitelist status
    pub fn inventory(&self, enumerator: &dyn DeviceEnumerator) -> Result<Vec<DeviceStatus>> {
        let devices = resolve_batch(enumerator.enumerate()?);

        devices
            .into_iter()
            .map(|device| {
                let entry = self.whitelist.get(&device.identity)?;
                Ok(DeviceStatus {
                    class: device.class(),
                    is_registered: entry.is_some(),
                    is_fingerprinted: entry.as_ref().is_some_and(WhitelistEntry::requires_verification),
                    friendly_name: entry.map(|e| e.friendly_name),
                    identity: device.identity,
                    caption: device.caption,
                    volume: device.volume,
                    instance_ids: device.instance_ids,
                })
            })
            .collect()
    }
}
