//! Trust engine: fingerprinting, marker creation and two-stage verification

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use dg_error::{DevGuardError, Result};

use super::fingerprint::{PhysicalDescriptor, StructuralFingerprint};
use super::host_key::HostKey;
use super::marker::{self, SignedLockfileRecord};
use crate::device::VolumeRef;
use crate::events::{EventSink, GuardEvent};
use crate::platform::MediumInspector;

/// Result of checking a medium against its registration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    /// The medium behind the volume could not be resolved or read
    FingerprintUnavailable,
    /// A different physical medium than the one registered
    FingerprintMismatch,
    /// No host key loaded (degraded mode)
    KeyUnavailable,
    MarkerMissing,
    /// Marker exists but is unreadable or not `<hex>::<payload>`
    MarkerMalformed,
    /// Signature does not verify under the host key
    SignatureInvalid,
    /// Valid signature, but not the one recorded for this registration
    SignatureNotRegistered,
}

impl VerificationOutcome {
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Verified => "verified",
            Self::FingerprintUnavailable => "fingerprint unavailable",
            Self::FingerprintMismatch => "fingerprint mismatch",
            Self::KeyUnavailable => "host key unavailable",
            Self::MarkerMissing => "marker missing",
            Self::MarkerMalformed => "marker malformed",
            Self::SignatureInvalid => "signature invalid",
            Self::SignatureNotRegistered => "signature not registered",
        };
        f.write_str(text)
    }
}

/// Verification seam used by the reconciliation loop
#[cfg_attr(test, mockall::automock)]
pub trait MediumVerifier: Send + Sync {
    fn verify_medium(
        &self,
        volume: &VolumeRef,
        expected_fingerprint: &StructuralFingerprint,
        expected_signature: &str,
    ) -> VerificationOutcome;
}

/// Holds the host key (if any) and the platform's medium inspector.
///
/// Holds no per-call state: every fingerprint or verification opens its own
/// platform query, so calls from the loop thread and admin requests never
/// interfere.
pub struct TrustEngine {
    key: Option<Arc<HostKey>>,
    inspector: Arc<dyn MediumInspector>,
    events: Arc<dyn EventSink>,
}

impl TrustEngine {
    pub fn new(
        key: Option<HostKey>,
        inspector: Arc<dyn MediumInspector>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            key: key.map(Arc::new),
            inspector,
            events,
        }
    }

    pub fn host_key(&self) -> Option<&HostKey> {
        self.key.as_deref()
    }

    /// False in degraded mode
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn require_key(&self) -> Result<&HostKey> {
        self.key
            .as_deref()
            .ok_or_else(|| DevGuardError::HostKeyUnavailable("running without a host key".into()))
    }

    pub fn physical_descriptor(&self, volume: &VolumeRef) -> Result<PhysicalDescriptor> {
        self.inspector.physical_descriptor(volume)
    }

    /// Structural fingerprint of the medium behind `volume`
    pub fn fingerprint(&self, volume: &VolumeRef) -> Result<StructuralFingerprint> {
        let descriptor = self.inspector.physical_descriptor(volume)?;
        debug!(volume = %volume, model = %descriptor.model, size = descriptor.size_bytes, "Read physical descriptor");
        Ok(descriptor.fingerprint())
    }

    /// Sign a fresh payload and write it to the medium
    pub fn create_signed_marker(&self, volume: &VolumeRef) -> Result<SignedLockfileRecord> {
        let key = self.require_key()?;
        let payload = SignedLockfileRecord::new_payload();
        let signature = hex::encode(key.sign(payload.as_bytes())?);
        let record = SignedLockfileRecord { signature, payload };

        let path = marker::write_marker(volume, &record)?;
        self.events.emit(&GuardEvent::MarkerCreated { path });
        Ok(record)
    }

    /// Two-stage check.
    ///
    /// Stage 1 recomputes the fingerprint and stops on mismatch. Stage 2
    /// reads the marker, checks its signature under the host key, and
    /// requires the stored signature to be the one recorded at
    /// registration. A marker copied from another registered medium carries
    /// a valid signature but fails the last check.
    pub fn verify_detailed(
        &self,
        volume: &VolumeRef,
        expected_fingerprint: &StructuralFingerprint,
        expected_signature: &str,
    ) -> VerificationOutcome {
        let actual = match self.fingerprint(volume) {
            Ok(fp) => fp,
            Err(e) => {
                debug!(volume = %volume, error = %e, "Fingerprint unavailable during verification");
                return VerificationOutcome::FingerprintUnavailable;
            }
        };
        if &actual != expected_fingerprint {
            return VerificationOutcome::FingerprintMismatch;
        }

        let Some(key) = self.key.as_deref() else {
            return VerificationOutcome::KeyUnavailable;
        };

        let record = match marker::read_marker(volume) {
            Ok(Some(record)) => record,
            Ok(None) => return VerificationOutcome::MarkerMissing,
            Err(e) => {
                debug!(volume = %volume, error = %e, "Marker unreadable");
                return VerificationOutcome::MarkerMalformed;
            }
        };

        let Some(signature) = record.signature_bytes() else {
            return VerificationOutcome::MarkerMalformed;
        };
        if !key.verify(record.payload.as_bytes(), &signature) {
            return VerificationOutcome::SignatureInvalid;
        }

        if !record.signature.eq_ignore_ascii_case(expected_signature.trim()) {
            return VerificationOutcome::SignatureNotRegistered;
        }

        VerificationOutcome::Verified
    }

    pub fn verify(
        &self,
        volume: &VolumeRef,
        expected_fingerprint: &StructuralFingerprint,
        expected_signature: &str,
    ) -> bool {
        self.verify_detailed(volume, expected_fingerprint, expected_signature)
            .is_verified()
    }
}

impl MediumVerifier for TrustEngine {
    fn verify_medium(
        &self,
        volume: &VolumeRef,
        expected_fingerprint: &StructuralFingerprint,
        expected_signature: &str,
    ) -> VerificationOutcome {
        self.verify_detailed(volume, expected_fingerprint, expected_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::platform::MockMediumInspector;
    use tempfile::TempDir;

    fn descriptor() -> PhysicalDescriptor {
        PhysicalDescriptor {
            model: "Kingston DataTraveler 3.0".into(),
            size_bytes: 15_502_147_584,
            signature: Some("12345678".into()),
        }
    }

    fn engine_with(key: Option<HostKey>, desc: Result<PhysicalDescriptor>) -> TrustEngine {
        let mut inspector = MockMediumInspector::new();
        let desc = desc.ok();
        inspector
            .expect_physical_descriptor()
            .returning(move |_| desc.clone().ok_or_else(|| DevGuardError::medium("test", "gone")));
        TrustEngine::new(key, Arc::new(inspector), Arc::new(RecordingEventSink::new()))
    }

    #[test]
    fn degraded_engine_cannot_sign() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(None, Ok(descriptor()));
        let err = engine
            .create_signed_marker(&VolumeRef::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, DevGuardError::HostKeyUnavailable(_)));
        assert!(!dir.path().join(".device_guard").exists());
    }

    #[test]
    fn unavailable_medium_fails_verification() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(None, Err(DevGuardError::medium("x", "y")));
        let fp = descriptor().fingerprint();
        assert_eq!(
            engine.verify_detailed(&VolumeRef::new(dir.path()), &fp, "ab"),
            VerificationOutcome::FingerprintUnavailable
        );
    }

    #[test]
    fn mismatch_short_circuits_before_key_check() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(None, Ok(descriptor()));
        let other = StructuralFingerprint::from_hex(&"0".repeat(64));
        assert_eq!(
            engine.verify_detailed(&VolumeRef::new(dir.path()), &other, "ab"),
            VerificationOutcome::FingerprintMismatch
        );
    }

    #[test]
    fn round_trip_verifies() {
        let dir = TempDir::new().unwrap();
        let key = HostKey::manage(&dir.path().join("key.pem")).unwrap();
        let engine = engine_with(Some(key), Ok(descriptor()));
        let medium = TempDir::new().unwrap();
        let volume = VolumeRef::new(medium.path());

        let fp = engine.fingerprint(&volume).unwrap();
        let record = engine.create_signed_marker(&volume).unwrap();
        assert!(engine.verify(&volume, &fp, &record.signature));
    }

    fn registered_medium(engine: &TrustEngine) -> (TempDir, VolumeRef, StructuralFingerprint, String) {
        let medium = TempDir::new().unwrap();
        let volume = VolumeRef::new(medium.path());
        let fp = engine.fingerprint(&volume).unwrap();
        let record = engine.create_signed_marker(&volume).unwrap();
        (medium, volume, fp, record.signature)
    }

    #[test]
    fn marker_copied_from_other_medium_is_not_registered() {
        let dir = TempDir::new().unwrap();
        let key = HostKey::manage(&dir.path().join("key.pem")).unwrap();
        // Two sticks of the same model and size share a fingerprint.
        let engine = engine_with(Some(key), Ok(descriptor()));
        let (_first, first_volume, _, _) = registered_medium(&engine);
        let (_second, second_volume, fp, second_signature) = registered_medium(&engine);

        let copied = marker::read_marker(&first_volume).unwrap().unwrap();
        marker::write_marker(&second_volume, &copied).unwrap();

        assert_eq!(
            engine.verify_detailed(&second_volume, &fp, &second_signature),
            VerificationOutcome::SignatureNotRegistered
        );
    }

    #[test]
    fn altered_signature_is_invalid() {
        let dir = TempDir::new().unwrap();
        let key = HostKey::manage(&dir.path().join("key.pem")).unwrap();
        let engine = engine_with(Some(key), Ok(descriptor()));
        let (_medium, volume, fp, signature) = registered_medium(&engine);

        let mut record = marker::read_marker(&volume).unwrap().unwrap();
        let last = record.signature.pop().unwrap();
        record.signature.push(if last == '0' { '1' } else { '0' });
        marker::write_marker(&volume, &record).unwrap();

        assert_eq!(
            engine.verify_detailed(&volume, &fp, &signature),
            VerificationOutcome::SignatureInvalid
        );
    }

    #[test]
    fn altered_payload_is_invalid() {
        let dir = TempDir::new().unwrap();
        let key = HostKey::manage(&dir.path().join("key.pem")).unwrap();
        let engine = engine_with(Some(key), Ok(descriptor()));
        let (_medium, volume, fp, signature) = registered_medium(&engine);

        let mut record = marker::read_marker(&volume).unwrap().unwrap();
        record.payload = "DeviceGuardLock_RegisteredOn_1999-01-01T00:00:00Z".into();
        marker::write_marker(&volume, &record).unwrap();

        assert_eq!(
            engine.verify_detailed(&volume, &fp, &signature),
            VerificationOutcome::SignatureInvalid
        );
    }

    #[test]
    fn deleted_marker_is_missing() {
        let dir = TempDir::new().unwrap();
        let key = HostKey::manage(&dir.path().join("key.pem")).unwrap();
        let engine = engine_with(Some(key), Ok(descriptor()));
        let (medium, volume, fp, signature) = registered_medium(&engine);

        std::fs::remove_file(medium.path().join(".device_guard").join("lockfile.bin")).unwrap();

        assert_eq!(
            engine.verify_detailed(&volume, &fp, &signature),
            VerificationOutcome::MarkerMissing
        );
    }
}
