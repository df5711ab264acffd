//! JSON file whitelist
//!
//! The daemon and the CLI are separate processes sharing one file. Every
//! operation re-reads the document when the file changed on disk, and every
//! write is atomic (temp file, sync, rename).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use dg_error::{DevGuardError, Result};

use super::{sort_entries, Whitelist, WhitelistEntry};
use crate::constants::limits::MAX_WHITELIST_SIZE;
use crate::device::CanonicalDeviceIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhitelistDocument {
    version: u32,
    /// Keyed by canonical identity string
    #[serde(default)]
    devices: BTreeMap<String, WhitelistEntry>,
}

impl WhitelistDocument {
    const CURRENT_VERSION: u32 = 1;

    fn empty() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            devices: BTreeMap::new(),
        }
    }
}

/// (mtime, length) of the file when we last read or wrote it
type FileStamp = Option<(SystemTime, u64)>;

#[derive(Debug)]
struct Cache {
    doc: WhitelistDocument,
    stamp: FileStamp,
}

#[derive(Debug)]
pub struct JsonWhitelist {
    path: PathBuf,
    cache: Mutex<Cache>,
}

impl JsonWhitelist {
    /// Open (or lazily create) the whitelist at `path`. A missing file is an
    /// empty whitelist; an unreadable or corrupt one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (doc, stamp) = load(&path)?;
        info!(path = %path.display(), devices = doc.devices.len(), "Loaded whitelist");
        Ok(Self {
            path,
            cache: Mutex::new(Cache { doc, stamp }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<usize> {
        self.with_document(|doc| {
            let removed = doc.devices.len();
            doc.devices.clear();
            Ok((removed, removed > 0))
        })
    }

    /// Write all entries as a pretty JSON array to `dest`
    pub fn export(&self, dest: &Path) -> Result<usize> {
        let entries = self.list()?;
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(dest, json).map_err(|e| DevGuardError::FileWrite {
            path: dest.to_path_buf(),
            source: e,
        })?;
        info!(path = %dest.display(), devices = entries.len(), "Exported whitelist");
        Ok(entries.len())
    }

    /// Run `f` on a fresh view of the document. When `f` reports a change
    /// the document is saved before the lock is released.
    fn with_document<T>(&self, f: impl FnOnce(&mut WhitelistDocument) -> Result<(T, bool)>) -> Result<T> {
        let mut cache = self.cache.lock();
        self.refresh(&mut cache)?;

        let (value, changed) = f(&mut cache.doc)?;
        if changed {
            save(&self.path, &cache.doc)?;
            cache.stamp = stamp_of(&self.path);
        }
        Ok(value)
    }

    fn refresh(&self, cache: &mut Cache) -> Result<()> {
        let current = stamp_of(&self.path);
        if current == cache.stamp {
            return Ok(());
        }
        debug!(path = %self.path.display(), "Whitelist changed on disk, reloading");
        let (doc, stamp) = load(&self.path)?;
        cache.doc = doc;
        cache.stamp = stamp;
        Ok(())
    }
}

impl Whitelist for JsonWhitelist {
    fn get(&self, id: &CanonicalDeviceIdentity) -> Result<Option<WhitelistEntry>> {
        let key = id.to_string();
        self.with_document(|doc| Ok((doc.devices.get(&key).cloned(), false)))
    }

    fn put(&self, entry: WhitelistEntry) -> Result<bool> {
        let key = entry.canonical_id.to_string();
        self.with_document(|doc| {
            if doc.devices.contains_key(&key) {
                return Ok((false, false));
            }
            doc.devices.insert(key, entry);
            Ok((true, true))
        })
    }

    fn delete(&self, id: &CanonicalDeviceIdentity) -> Result<bool> {
        let key = id.to_string();
        self.with_document(|doc| {
            let removed = doc.devices.remove(&key).is_some();
            Ok((removed, removed))
        })
    }

    fn list(&self) -> Result<Vec<WhitelistEntry>> {
        let mut entries = self.with_document(|doc| Ok((doc.devices.values().cloned().collect::<Vec<_>>(), false)))?;
        sort_entries(&mut entries);
        Ok(entries)
    }
}

fn stamp_of(path: &Path) -> FileStamp {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

fn load(path: &Path) -> Result<(WhitelistDocument, FileStamp)> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No whitelist file, starting empty");
            return Ok((WhitelistDocument::empty(), None));
        }
        Err(e) => {
            return Err(DevGuardError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    // SECURITY: Check file size before reading (prevent DoS)
    if metadata.len() > MAX_WHITELIST_SIZE {
        return Err(DevGuardError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size: MAX_WHITELIST_SIZE,
        });
    }

    let content = fs::read_to_string(path).map_err(|e| DevGuardError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let stamp = stamp_of(path);

    if content.trim().is_empty() {
        return Ok((WhitelistDocument::empty(), stamp));
    }

    let mut doc: WhitelistDocument = serde_json::from_str(&content)
        .map_err(|e| DevGuardError::whitelist(format!("{}: {}", path.display(), e)))?;

    if doc.version > WhitelistDocument::CURRENT_VERSION {
        return Err(DevGuardError::whitelist(format!(
            "{}: unsupported version {}",
            path.display(),
            doc.version
        )));
    }

    // Re-key by each entry's own identity; hand-edited keys are not trusted.
    let devices = std::mem::take(&mut doc.devices);
    for (key, entry) in devices {
        let canonical = entry.canonical_id.to_string();
        if canonical != key {
            warn!(key = %key, canonical = %canonical, "Whitelist key does not match entry identity, using identity");
        }
        doc.devices.entry(canonical).or_insert(entry);
    }
    doc.version = WhitelistDocument::CURRENT_VERSION;

    Ok((doc, stamp))
}

fn save(path: &Path, doc: &WhitelistDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| DevGuardError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let json = serde_json::to_string_pretty(doc)?;

    // SECURITY: Atomic write - write to temp file then rename
    let temp_path = path.with_extension("json.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        DevGuardError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        }
    })?;

    debug!(path = %path.display(), devices = doc.devices.len(), "Saved whitelist");
    Ok(())
}
