use parking_lot::RwLock;
use std::collections::HashMap;

use dg_error::Result;

use super::{sort_entries, Whitelist, WhitelistEntry};
use crate::device::CanonicalDeviceIdentity;

/// In-process whitelist for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryWhitelist {
    entries: RwLock<HashMap<CanonicalDeviceIdentity, WhitelistEntry>>,
}

impl MemoryWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = WhitelistEntry>) -> Self {
        let map = entries
            .into_iter()
            .map(|e| (e.canonical_id.clone(), e))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }
}

impl Whitelist for MemoryWhitelist {
    fn get(&self, id: &CanonicalDeviceIdentity) -> Result<Option<WhitelistEntry>> {
        Ok(self.entries.read().get(id).cloned())
    }

    fn put(&self, entry: WhitelistEntry) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.canonical_id) {
            return Ok(false);
        }
        entries.insert(entry.canonical_id.clone(), entry);
        Ok(true)
    }

    fn delete(&self, id: &CanonicalDeviceIdentity) -> Result<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<WhitelistEntry>> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        sort_entries(&mut all);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;

    #[test]
    fn put_is_insert_if_absent() {
        let id = CanonicalDeviceIdentity::new("046D", "C52B", None);
        let wl = MemoryWhitelist::new();
        assert!(wl.put(WhitelistEntry::identity_only(id.clone(), "first", DeviceClass::Peripheral)).unwrap());
        assert!(!wl.put(WhitelistEntry::identity_only(id.clone(), "second", DeviceClass::Peripheral)).unwrap());
        assert_eq!(wl.get(&id).unwrap().unwrap().friendly_name, "first");

        assert!(wl.delete(&id).unwrap());
        assert!(!wl.delete(&id).unwrap());
        assert!(wl.get(&id).unwrap().is_none());
    }
}
