//! Identity Resolver
//!
//! Turns raw enumeration rows into canonical identities. Pure: no I/O,
//! no retries, no state between calls.
//!
//! Two path shapes are understood:
//!
//! - generic: `USB\VID_0781&PID_5591\4C530001234`
//! - mass-storage: `USBSTOR\DISK&VEN__USB&PROD__SANDISK_3.2GEN1&REV_1.00\4C530001234&0`
//!
//! Both of the above resolve to `VID_0781&PID_5591&SN_4C530001234`.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::trace;

use super::types::{CanonicalDeviceIdentity, EnumerationPath, ObservedDevice, RawDeviceDescriptor};
use crate::constants::identity::{MASS_STORAGE_PREFIX, PRODUCT_QUIRKS, VENDOR_QUIRKS};

static TOKEN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static LUN_SUFFIX_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// `KEY_value` tokens inside an `&`-separated segment
fn token_pattern() -> Option<&'static Regex> {
    TOKEN_RE
        .get_or_init(|| Regex::new(r"(?i)(?:^|&)(VID|PID|VEN|PROD)_([^&]*)").ok())
        .as_ref()
}

fn lun_suffix_pattern() -> Option<&'static Regex> {
    LUN_SUFFIX_RE
        .get_or_init(|| Regex::new(r"&\d+$").ok())
        .as_ref()
}

/// Value of `key` in a segment such as `DISK&VEN_KINGSTON&PROD_DT`.
fn token<'a>(segment: &'a str, key: &str) -> Option<&'a str> {
    token_pattern()?
        .captures_iter(segment)
        .find(|caps| caps[1].eq_ignore_ascii_case(key))
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str())
}

/// Map a mass-storage VEN_/PROD_ token to a hex id via the quirks table,
/// falling back to the token with underscores removed.
fn apply_quirks(raw: &str, table: &[(&str, &str)]) -> Option<String> {
    let upper = raw.to_ascii_uppercase();
    let stripped = upper.replace('_', "");

    // Padding underscores are spaces in the device string; `_USB` is the
    // one key where the padding itself is significant.
    let quirk = table
        .iter()
        .find(|(key, _)| *key == upper || *key == upper.trim_matches('_'));
    if let Some((_, id)) = quirk {
        return Some((*id).to_string());
    }

    if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Serial from the last path segment.
///
/// Only paths with more than two segments carry one. Mass-storage ids end
/// in `&<digits>` (LUN), which is removed; generic ids are taken as is.
/// Whatever still contains `&` is an OS-generated instance id and is not a
/// serial.
fn extract_serial(segments: &[&str], kind: EnumerationPath) -> Option<String> {
    if segments.len() <= 2 {
        return None;
    }
    let last = segments.last()?.trim();
    let last = match (kind, lun_suffix_pattern()) {
        (EnumerationPath::MassStorage, Some(re)) => re.replace(last, "").into_owned(),
        _ => last.to_string(),
    };
    if last.is_empty() || last.contains('&') {
        None
    } else {
        Some(last)
    }
}

/// Serial segment of a raw instance id, as used for the canonical identity.
/// The path shape is taken from the id's prefix.
pub fn serial_of(instance_id: &str) -> Option<String> {
    let kind = if instance_id.to_ascii_uppercase().starts_with(MASS_STORAGE_PREFIX) {
        EnumerationPath::MassStorage
    } else {
        EnumerationPath::Generic
    };
    let segments: Vec<&str> = instance_id.split('\\').collect();
    extract_serial(&segments, kind)
}

fn ids_from_generic(segments: &[&str]) -> Option<(String, String)> {
    segments.iter().find_map(|segment| {
        let vid = token(segment, "VID")?;
        let pid = token(segment, "PID")?;
        Some((vid.to_string(), pid.to_string()))
    })
}

fn ids_from_mass_storage(segments: &[&str]) -> Option<(String, String)> {
    let segment = segments.get(1)?;
    let vid = apply_quirks(token(segment, "VEN")?, VENDOR_QUIRKS)?;
    let pid = apply_quirks(token(segment, "PROD")?, PRODUCT_QUIRKS)?;
    Some((vid, pid))
}

/// Resolve one raw descriptor. `None` when vendor or product id cannot be
/// recovered; the descriptor is dropped from the cycle.
pub fn resolve(raw: &RawDeviceDescriptor) -> Option<CanonicalDeviceIdentity> {
    let segments: Vec<&str> = raw.instance_id.split('\\').collect();

    let (vid, pid) = match raw.path_kind {
        EnumerationPath::Generic => ids_from_generic(&segments),
        EnumerationPath::MassStorage => ids_from_mass_storage(&segments),
    }?;

    if vid.trim().is_empty() || pid.trim().is_empty() {
        return None;
    }

    let serial = extract_serial(&segments, raw.path_kind);
    Some(CanonicalDeviceIdentity::new(&vid, &pid, serial.as_deref()))
}

/// Resolve a whole poll and collapse duplicates.
///
/// The first descriptor for an identity is kept, except that a descriptor
/// carrying a volume replaces an earlier one without (in the same position).
/// Instance ids of every merged descriptor are kept, primary first.
pub fn resolve_batch<I>(raws: I) -> Vec<ObservedDevice>
where
    I: IntoIterator<Item = RawDeviceDescriptor>,
{
    let mut devices: Vec<ObservedDevice> = Vec::new();
    let mut index: HashMap<CanonicalDeviceIdentity, usize> = HashMap::new();

    for raw in raws {
        let Some(identity) = resolve(&raw) else {
            trace!(instance_id = %raw.instance_id, "Descriptor has no recoverable vendor/product id");
            continue;
        };

        match index.get(&identity) {
            Some(&slot) => {
                let existing = &mut devices[slot];
                if existing.volume.is_none() && raw.volume.is_some() {
                    existing.instance_ids.insert(0, raw.instance_id);
                    existing.caption = raw.caption;
                    existing.volume = raw.volume;
                } else if !existing.instance_ids.contains(&raw.instance_id) {
                    existing.instance_ids.push(raw.instance_id);
                }
            }
            None => {
                index.insert(identity.clone(), devices.len());
                devices.push(ObservedDevice {
                    identity,
                    caption: raw.caption,
                    instance_ids: vec![raw.instance_id],
                    volume: raw.volume,
                });
            }
        }
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VolumeRef;

    const GENERIC: &str = r"USB\VID_0781&PID_5591\4C530001234";
    const STORAGE: &str = r"USBSTOR\DISK&VEN__USB&PROD__SANDISK_3.2GEN1&REV_1.00\4C530001234&0";

    #[test]
    fn generic_path_resolves() {
        let id = resolve(&RawDeviceDescriptor::generic(GENERIC, "USB Mass Storage Device")).unwrap();
        assert_eq!(id.to_string(), "VID_0781&PID_5591&SN_4C530001234");
    }

    #[test]
    fn resolve_is_deterministic() {
        let raw = RawDeviceDescriptor::mass_storage(STORAGE, "SanDisk 3.2Gen1");
        let first = resolve(&raw);
        for _ in 0..10 {
            assert_eq!(resolve(&raw), first);
        }
    }

    #[test]
    fn both_paths_give_one_identity() {
        let generic = resolve(&RawDeviceDescriptor::generic(GENERIC, "a")).unwrap();
        let storage = resolve(&RawDeviceDescriptor::mass_storage(STORAGE, "b")).unwrap();
        assert_eq!(generic, storage);
    }

    #[test]
    fn vendor_name_quirk() {
        let raw = RawDeviceDescriptor::mass_storage(
            r"USBSTOR\DISK&VEN_KINGSTON&PROD_1666&REV_PMAP\60A44C413C5AF361B9690093&0",
            "Kingston DataTraveler",
        );
        let id = resolve(&raw).unwrap();
        assert_eq!(id.vendor_id(), "0951");
        assert_eq!(id.product_id(), "1666");
        assert_eq!(id.serial(), "60A44C413C5AF361B9690093");
    }

    #[test]
    fn unknown_vendor_strips_underscores() {
        let raw = RawDeviceDescriptor::mass_storage(r"USBSTOR\DISK&VEN_AB_CD&PROD_12_34\SER1&0", "x");
        let id = resolve(&raw).unwrap();
        assert_eq!(id.vendor_id(), "ABCD");
        assert_eq!(id.product_id(), "1234");
    }

    #[test]
    fn os_generated_instance_id_is_not_a_serial() {
        let raw = RawDeviceDescriptor::generic(r"USB\VID_046D&PID_C52B\6&2A6E1B2&0&2", "Receiver");
        assert_eq!(resolve(&raw).unwrap().serial(), "NO_SERIAL");
    }

    #[test]
    fn lun_suffix_only_stripped_on_mass_storage() {
        let raw = RawDeviceDescriptor::generic(r"USB\VID_046D&PID_C52B\7&1", "Receiver");
        assert!(!resolve(&raw).unwrap().has_serial());

        let raw = RawDeviceDescriptor::generic(r"USB\VID_0781&PID_5591\ABC&12", "Stick");
        assert!(!resolve(&raw).unwrap().has_serial());

        let raw = RawDeviceDescriptor::mass_storage(r"USBSTOR\DISK&VEN_AB&PROD_CD\ABC&12", "Stick");
        assert_eq!(resolve(&raw).unwrap().serial(), "ABC");
    }

    #[test]
    fn serial_of_follows_path_prefix() {
        assert_eq!(serial_of(STORAGE).as_deref(), Some("4C530001234"));
        assert_eq!(serial_of(GENERIC).as_deref(), Some("4C530001234"));
        assert_eq!(serial_of(r"usbstor\disk&ven_x&prod_y\SER9&0").as_deref(), Some("SER9"));
        assert_eq!(serial_of(r"USB\VID_046D&PID_C52B\7&1"), None);
    }

    #[test]
    fn two_segment_path_has_no_serial() {
        let raw = RawDeviceDescriptor::generic(r"USB\VID_046D&PID_C52B", "Receiver");
        assert!(!resolve(&raw).unwrap().has_serial());
    }

    #[test]
    fn missing_ids_discard_descriptor() {
        assert!(resolve(&RawDeviceDescriptor::generic(r"USB\ROOT_HUB30\4&1", "hub")).is_none());
        assert!(resolve(&RawDeviceDescriptor::generic(r"USB\VID_8086\x\y", "half")).is_none());
        assert!(resolve(&RawDeviceDescriptor::mass_storage(r"USBSTOR\DISK&VEN_&PROD_X\1", "e")).is_none());
        assert!(resolve(&RawDeviceDescriptor::mass_storage("USBSTOR", "short")).is_none());
    }

    #[test]
    fn batch_prefers_descriptor_with_volume() {
        let raws = vec![
            RawDeviceDescriptor::generic(GENERIC, "USB Mass Storage Device"),
            RawDeviceDescriptor::generic(r"USB\VID_046D&PID_C52B\ABC", "Receiver"),
            RawDeviceDescriptor::mass_storage(STORAGE, "SanDisk 3.2Gen1")
                .with_volume(VolumeRef::new("E:\\")),
        ];

        let devices = resolve_batch(raws);
        assert_eq!(devices.len(), 2);

        let stick = &devices[0];
        assert_eq!(stick.caption, "SanDisk 3.2Gen1");
        assert_eq!(stick.volume, Some(VolumeRef::new("E:\\")));
        assert_eq!(stick.instance_ids, vec![STORAGE.to_string(), GENERIC.to_string()]);
        assert_eq!(devices[1].identity.product_id(), "C52B");
    }

    #[test]
    fn batch_keeps_first_when_neither_has_volume() {
        let raws = vec![
            RawDeviceDescriptor::generic(GENERIC, "first"),
            RawDeviceDescriptor::mass_storage(STORAGE, "second"),
        ];
        let devices = resolve_batch(raws);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].caption, "first");
        assert_eq!(devices[0].instance_ids.len(), 2);
    }
}
