//! Fingerprint & trust subsystem
//!
//! Binds a registered identity to one physical medium: a structural
//! fingerprint of the disk plus a marker on it signed by the host key.

mod engine;
mod fingerprint;
mod host_key;
pub mod marker;

pub use engine::{MediumVerifier, TrustEngine, VerificationOutcome};
#[cfg(test)]
pub use engine::MockMediumVerifier;
pub use fingerprint::{PhysicalDescriptor, StructuralFingerprint};
pub use host_key::HostKey;
pub use marker::SignedLockfileRecord;
