//! On-medium signed marker
//!
//! `<volume root>/.device_guard/lockfile.bin` holds
//! `<signature-hex>::DeviceGuardLock_RegisteredOn_<timestamp>`.

use chrono::{SecondsFormat, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use dg_error::{DevGuardError, Result};

use crate::constants::marker::{
    FILE_NAME, FOLDER_NAME, MAX_MARKER_SIZE, PAYLOAD_PREFIX, SEPARATOR,
};
use crate::device::VolumeRef;

/// Signature plus the payload it covers, as stored on the medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLockfileRecord {
    /// Lowercase hex of the DER signature
    pub signature: String,
    pub payload: String,
}

impl SignedLockfileRecord {
    /// Fresh registration payload stamped with the current UTC time
    pub fn new_payload() -> String {
        format!(
            "{}{}",
            PAYLOAD_PREFIX,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.signature, SEPARATOR, self.payload)
    }

    /// Parse marker file content. `None` if it is not `<hex>::<payload>`.
    pub fn decode(content: &str) -> Option<Self> {
        let (signature, payload) = content.trim().split_once(SEPARATOR)?;
        let signature = signature.trim();
        if signature.is_empty() || payload.is_empty() {
            return None;
        }
        if signature.len() % 2 != 0 || !signature.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            signature: signature.to_ascii_lowercase(),
            payload: payload.to_string(),
        })
    }

    /// Raw signature bytes
    pub fn signature_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.signature).ok()
    }
}

pub fn marker_dir(volume: &VolumeRef) -> PathBuf {
    volume.root().join(FOLDER_NAME)
}

pub fn marker_path(volume: &VolumeRef) -> PathBuf {
    marker_dir(volume).join(FILE_NAME)
}

/// Write the marker atomically. On failure no partial marker is left
/// behind: the temp file is removed, and so is the folder if this call
/// created it.
pub fn write_marker(volume: &VolumeRef, record: &SignedLockfileRecord) -> Result<PathBuf> {
    write_marker_with(volume, record, write_and_rename)
}

/// Temp file, sync, rename over the final path
fn write_and_rename(temp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)
}

fn write_marker_with<W>(volume: &VolumeRef, record: &SignedLockfileRecord, write: W) -> Result<PathBuf>
where
    W: FnOnce(&Path, &Path, &[u8]) -> std::io::Result<()>,
{
    if !volume.root().is_dir() {
        return Err(DevGuardError::medium(volume, "volume root is not a directory"));
    }
    let dir = marker_dir(volume);
    let path = dir.join(FILE_NAME);
    let created_dir = !dir.exists();

    let result = write_marker_inner(&dir, &path, record, write);
    if result.is_err() && created_dir {
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "Could not remove marker folder after failed write");
        }
    }
    result.map(|_| path)
}

fn write_marker_inner<W>(dir: &Path, path: &Path, record: &SignedLockfileRecord, write: W) -> Result<()>
where
    W: FnOnce(&Path, &Path, &[u8]) -> std::io::Result<()>,
{
    if !dir.is_dir() {
        fs::create_dir(dir).map_err(|e| DevGuardError::marker(dir, format!("create folder: {e}")))?;
    }
    hide(dir);

    let temp_path = dir.join(format!("{FILE_NAME}.tmp"));
    if let Err(e) = write(&temp_path, path, record.encode().as_bytes()) {
        let _ = fs::remove_file(&temp_path);
        return Err(DevGuardError::marker(path, e.to_string()));
    }

    debug!(path = %path.display(), "Wrote signed marker");
    Ok(())
}

/// Read the marker. `Ok(None)` when there is no marker file; an error when
/// it exists but is unreadable or malformed.
pub fn read_marker(volume: &VolumeRef) -> Result<Option<SignedLockfileRecord>> {
    let path = marker_path(volume);
    let metadata = match fs::metadata(&path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DevGuardError::marker(&path, e.to_string())),
    };
    if metadata.len() > MAX_MARKER_SIZE {
        return Err(DevGuardError::FileTooLarge {
            path,
            size: metadata.len(),
            max_size: MAX_MARKER_SIZE,
        });
    }

    let content = fs::read_to_string(&path).map_err(|e| DevGuardError::marker(&path, e.to_string()))?;
    SignedLockfileRecord::decode(&content)
        .map(Some)
        .ok_or_else(|| DevGuardError::marker(&path, "malformed marker"))
}

#[cfg(windows)]
fn hide(dir: &Path) {
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN};

    let wide: Vec<u16> = dir.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    // SAFETY: `wide` is a NUL-terminated UTF-16 path that outlives the call.
    if let Err(e) = unsafe { SetFileAttributesW(PCWSTR(wide.as_ptr()), FILE_ATTRIBUTE_HIDDEN) } {
        warn!(dir = %dir.display(), error = %e, "Could not hide marker folder");
    }
}

// Dot-prefixed folders are already hidden on Unix.
#[cfg(not(windows))]
fn hide(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> SignedLockfileRecord {
        SignedLockfileRecord {
            signature: "3045022100ab".into(),
            payload: "DeviceGuardLock_RegisteredOn_2024-05-01T10:00:00Z".into(),
        }
    }

    #[test]
    fn payload_has_prefix_and_timestamp() {
        let payload = SignedLockfileRecord::new_payload();
        let stamp = payload.strip_prefix(PAYLOAD_PREFIX).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(SignedLockfileRecord::decode("no separator").is_none());
        assert!(SignedLockfileRecord::decode("::payload").is_none());
        assert!(SignedLockfileRecord::decode("zz::payload").is_none());
        assert!(SignedLockfileRecord::decode("abc::payload").is_none());
        assert!(SignedLockfileRecord::decode("ab::").is_none());
    }

    #[test]
    fn decode_keeps_separator_inside_payload() {
        let rec = SignedLockfileRecord::decode("ABCD::a::b\n").unwrap();
        assert_eq!(rec.signature, "abcd");
        assert_eq!(rec.payload, "a::b");
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeRef::new(dir.path());
        let path = write_marker(&volume, &record()).unwrap();
        assert_eq!(path, dir.path().join(".device_guard").join("lockfile.bin"));
        assert_eq!(read_marker(&volume).unwrap(), Some(record()));
        assert!(!dir.path().join(".device_guard").join("lockfile.bin.tmp").exists());
    }

    #[test]
    fn missing_marker_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_marker(&VolumeRef::new(dir.path())).unwrap(), None);
    }

    #[test]
    fn malformed_marker_is_error() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeRef::new(dir.path());
        fs::create_dir_all(marker_dir(&volume)).unwrap();
        fs::write(marker_path(&volume), "garbage").unwrap();
        assert!(read_marker(&volume).is_err());
    }

    #[test]
    fn root_that_is_a_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("not_a_dir");
        fs::write(&bogus, "x").unwrap();
        let volume = VolumeRef::new(&bogus);
        let err = write_marker(&volume, &record()).unwrap_err();
        assert!(matches!(err, DevGuardError::MediumUnavailable { .. }));
        assert!(fs::metadata(&bogus).unwrap().is_file());
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeRef::new(dir.path());

        // Disk full halfway through the temp file.
        let err = write_marker_with(&volume, &record(), |temp, _, content| {
            fs::write(temp, &content[..content.len() / 2])?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        })
        .unwrap_err();

        assert!(matches!(err, DevGuardError::Marker { .. }));
        assert!(!marker_dir(&volume).exists());
        assert_eq!(read_marker(&volume).unwrap(), None);
    }

    #[test]
    fn failed_rewrite_keeps_existing_marker() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeRef::new(dir.path());
        write_marker(&volume, &record()).unwrap();

        let replacement = SignedLockfileRecord {
            signature: "ff".into(),
            payload: "other".into(),
        };
        assert!(write_marker_with(&volume, &replacement, |temp, _, _| {
            fs::write(temp, "partial")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "I/O error"))
        })
        .is_err());

        assert_eq!(read_marker(&volume).unwrap(), Some(record()));
        assert!(!marker_dir(&volume).join("lockfile.bin.tmp").exists());
    }
}
