//! Structural fingerprint of a physical medium

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// What the platform reports about the disk behind a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDescriptor {
    pub model: String,
    pub size_bytes: u64,
    /// On-disk volume signature (MBR disk signature or GPT disk GUID)
    pub signature: Option<String>,
}

impl PhysicalDescriptor {
    /// Hash input. Field order is fixed; changing it invalidates every
    /// registered fingerprint.
    fn source_string(&self) -> String {
        format!(
            "Model:{}-Size:{}-Signature:{}",
            self.model.trim(),
            self.size_bytes,
            self.signature.as_deref().unwrap_or("none")
        )
    }

    pub fn fingerprint(&self) -> StructuralFingerprint {
        let digest = Sha256::digest(self.source_string().as_bytes());
        StructuralFingerprint(hex::encode(digest))
    }
}

/// Lowercase hex SHA-256, 64 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuralFingerprint(String);

impl StructuralFingerprint {
    /// Wrap a stored digest, normalizing case
    pub fn from_hex(hex_digest: &str) -> Self {
        Self(hex_digest.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StructuralFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PhysicalDescriptor {
        PhysicalDescriptor {
            model: "SanDisk 3.2Gen1 USB Device".into(),
            size_bytes: 61_530_439_680,
            signature: Some("2821551270".into()),
        }
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = sample().fingerprint();
        let b = sample().fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn any_field_change_changes_fingerprint() {
        let base = sample().fingerprint();

        let mut model = sample();
        model.model.push('X');
        let mut size = sample();
        size.size_bytes += 512;
        let mut sig = sample();
        sig.signature = Some("1".into());
        let mut no_sig = sample();
        no_sig.signature = None;

        for changed in [model, size, sig, no_sig] {
            assert_ne!(changed.fingerprint(), base);
        }
    }

    #[test]
    fn known_digest() {
        let desc = PhysicalDescriptor {
            model: "M".into(),
            size_bytes: 1,
            signature: None,
        };
        let expected = hex::encode(Sha256::digest(b"Model:M-Size:1-Signature:none"));
        assert_eq!(desc.fingerprint().as_str(), expected);
    }
}
