//! Host signing key lifecycle
//!
//! One ECDSA P-256 key per host, stored as an unencrypted PKCS#8 PEM file.
//! File permissions are the only protection at rest.

use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
    ECDSA_P256_SHA256_ASN1_SIGNING,
};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use dg_error::{DevGuardError, Result};

const PEM_TAG: &str = "PRIVATE KEY";
const MAX_KEY_FILE_SIZE: u64 = 16 * 1024;

/// Loaded host key pair. Immutable after construction and shared freely
/// between threads.
pub struct HostKey {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
    path: PathBuf,
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("path", &self.path)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl HostKey {
    /// Load the key at `path`, generating and persisting a new one first if
    /// none exists.
    ///
    /// Creation uses create-new semantics: when another process writes the
    /// file between our existence check and our write, we load theirs.
    pub fn manage(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| DevGuardError::FileWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| DevGuardError::HostKeyUnavailable("key generation failed".into()))?;
        let encoded = pem::encode(&pem::Pem::new(PEM_TAG, pkcs8.as_ref().to_vec()));

        match persist_new_key(path, encoded.as_bytes(), write_and_sync)? {
            Persisted::Created => info!(path = %path.display(), "Generated new host key"),
            Persisted::AlreadyExists => {
                debug!(path = %path.display(), "Host key appeared concurrently, loading it");
                return Self::load(path);
            }
        }

        Self::from_pkcs8(pkcs8.as_ref(), path, rng)
    }

    /// Load an existing key. Fails if the file is missing or not a PKCS#8
    /// P-256 key.
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| DevGuardError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        if metadata.len() > MAX_KEY_FILE_SIZE {
            return Err(DevGuardError::FileTooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                max_size: MAX_KEY_FILE_SIZE,
            });
        }

        let content = fs::read(path).map_err(|e| DevGuardError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let parsed = pem::parse(&content)
            .map_err(|e| DevGuardError::HostKeyUnavailable(format!("{}: {}", path.display(), e)))?;
        if parsed.tag() != PEM_TAG {
            return Err(DevGuardError::HostKeyUnavailable(format!(
                "{}: unexpected PEM block {}",
                path.display(),
                parsed.tag()
            )));
        }

        let key = Self::from_pkcs8(parsed.contents(), path, SystemRandom::new())?;
        debug!(path = %path.display(), "Loaded host key");
        Ok(key)
    }

    fn from_pkcs8(pkcs8: &[u8], path: &Path, rng: SystemRandom) -> Result<Self> {
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
            .map_err(|e| DevGuardError::HostKeyUnavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            key_pair,
            rng,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uncompressed SEC1 public point
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// ASN.1 DER ECDSA signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.key_pair
            .sign(&self.rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| DevGuardError::Signing("ECDSA signing failed".into()))
    }

    /// Check `signature` over `message` against this host's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, self.public_key())
            .verify(message, signature)
            .is_ok()
    }
}

#[cfg(unix)]
fn create_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_owner_only(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

enum Persisted {
    Created,
    AlreadyExists,
}

fn write_and_sync(file: &mut fs::File, contents: &[u8]) -> std::io::Result<()> {
    file.write_all(contents)?;
    file.sync_all()
}

/// Create the key file and fill it. A failed write removes the file so the
/// next start generates a fresh key instead of tripping over a truncated one.
fn persist_new_key<W>(path: &Path, contents: &[u8], write: W) -> Result<Persisted>
where
    W: FnOnce(&mut fs::File, &[u8]) -> std::io::Result<()>,
{
    let mut file = match create_owner_only(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(Persisted::AlreadyExists),
        Err(e) => {
            return Err(DevGuardError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    if let Err(e) = write(&mut file, contents) {
        drop(file);
        if let Err(rm) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %rm, "Could not remove partial host key file");
        }
        return Err(DevGuardError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(Persisted::Created)
}
