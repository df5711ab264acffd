//! Whitelist
//!
//! Maps a canonical identity to its registration record. The core needs
//! lookup, insert-if-absent, delete and list, each atomic per entry.

mod memory;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dg_error::Result;

use crate::device::{CanonicalDeviceIdentity, DeviceClass};
use crate::trust::StructuralFingerprint;

pub use memory::MemoryWhitelist;
pub use store::JsonWhitelist;

/// Registration record for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub canonical_id: CanonicalDeviceIdentity,
    pub friendly_name: String,
    pub device_class: DeviceClass,
    /// Present only for storage registered with a fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural_fingerprint: Option<StructuralFingerprint>,
    /// Hex signature of the marker written at registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile_signature: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl WhitelistEntry {
    /// Identity-only record (peripherals, or storage registered in degraded mode)
    pub fn identity_only(
        canonical_id: CanonicalDeviceIdentity,
        friendly_name: impl Into<String>,
        device_class: DeviceClass,
    ) -> Self {
        Self {
            canonical_id,
            friendly_name: friendly_name.into(),
            device_class,
            structural_fingerprint: None,
            lockfile_signature: None,
            registered_at: Utc::now(),
        }
    }

    /// Storage record bound to one medium
    pub fn fingerprinted(
        canonical_id: CanonicalDeviceIdentity,
        friendly_name: impl Into<String>,
        fingerprint: StructuralFingerprint,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            canonical_id,
            friendly_name: friendly_name.into(),
            device_class: DeviceClass::Storage,
            structural_fingerprint: Some(fingerprint),
            lockfile_signature: Some(signature.into()),
            registered_at: Utc::now(),
        }
    }

    /// Storage with both fingerprint and signature on record
    pub fn requires_verification(&self) -> bool {
        self.device_class == DeviceClass::Storage
            && self.structural_fingerprint.is_some()
            && self.lockfile_signature.is_some()
    }

    /// Fingerprint and signature, when this entry is verifiable
    pub fn trust_anchor(&self) -> Option<(&StructuralFingerprint, &str)> {
        if self.device_class != DeviceClass::Storage {
            return None;
        }
        Some((
            self.structural_fingerprint.as_ref()?,
            self.lockfile_signature.as_deref()?,
        ))
    }
}

/// Keyed record store. `put` never overwrites.
pub trait Whitelist: Send + Sync {
    fn get(&self, id: &CanonicalDeviceIdentity) -> Result<Option<WhitelistEntry>>;

    /// Insert if absent. `Ok(false)` when the key already exists.
    fn put(&self, entry: WhitelistEntry) -> Result<bool>;

    /// `Ok(false)` when there was nothing to delete
    fn delete(&self, id: &CanonicalDeviceIdentity) -> Result<bool>;

    /// All entries, sorted by friendly name
    fn list(&self) -> Result<Vec<WhitelistEntry>>;
}

pub(crate) fn sort_entries(entries: &mut [WhitelistEntry]) {
    entries.sort_by(|a, b| {
        a.friendly_name
            .to_lowercase()
            .cmp(&b.friendly_name.to_lowercase())
            .then_with(|| a.canonical_id.cmp(&b.canonical_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(serial: &str) -> CanonicalDeviceIdentity {
        CanonicalDeviceIdentity::new("0781", "5591", Some(serial))
    }

    #[test]
    fn only_fingerprinted_storage_requires_verification() {
        let fp = StructuralFingerprint::from_hex(&"a".repeat(64));
        assert!(WhitelistEntry::fingerprinted(id("1"), "stick", fp.clone(), "ab").requires_verification());
        assert!(!WhitelistEntry::identity_only(id("2"), "stick", DeviceClass::Storage).requires_verification());
        assert!(!WhitelistEntry::identity_only(id("3"), "mouse", DeviceClass::Peripheral).requires_verification());

        let mut half = WhitelistEntry::fingerprinted(id("4"), "stick", fp, "ab");
        half.lockfile_signature = None;
        assert!(!half.requires_verification());
        assert!(half.trust_anchor().is_none());
    }

    #[test]
    fn entry_json_omits_missing_trust_fields() {
        let entry = WhitelistEntry::identity_only(id("9"), "Keyboard", DeviceClass::Peripheral);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["canonical_id"], "VID_0781&PID_5591&SN_9");
        assert_eq!(json["device_class"], "peripheral");
        assert!(json.get("structural_fingerprint").is_none());
    }

    #[test]
    fn sort_is_by_name_case_insensitive() {
        let mut entries = vec![
            WhitelistEntry::identity_only(id("1"), "zeta", DeviceClass::Peripheral),
            WhitelistEntry::identity_only(id("2"), "Alpha", DeviceClass::Peripheral),
            WhitelistEntry::identity_only(id("3"), "beta", DeviceClass::Peripheral),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.friendly_name.as_str()).collect();
        assert_eq!(names, ["Alpha", "beta", "zeta"]);
    }
}
