//! sysfs / procfs access relative to a configurable root
//!
//! Production uses `/`; tests point the root at a temp dir holding a fake
//! `sys/`, `proc/self/mounts` and `dev/`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::constants::sysfs::{BLOCK_DEVICES, CLASS_BLOCK, DEV, MOUNTS, USB_DEVICES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsRoot {
    root: PathBuf,
}

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
}

/// A USB mass-storage disk and the USB device that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDisk {
    /// Kernel name, e.g. `sdb`
    pub disk: String,
    /// Disk plus its partitions
    pub block_names: Vec<String>,
    /// Canonical sysfs path of the owning USB device
    pub usb_device: PathBuf,
}

impl SysfsRoot {
    pub fn system() -> Self {
        Self::with_root_path("/")
    }

    pub fn with_root_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn usb_devices(&self) -> PathBuf {
        self.root.join(USB_DEVICES)
    }

    pub fn block_devices(&self) -> PathBuf {
        self.root.join(BLOCK_DEVICES)
    }

    pub fn class_block(&self) -> PathBuf {
        self.root.join(CLASS_BLOCK)
    }

    pub fn dev_node(&self, name: &str) -> PathBuf {
        self.root.join(DEV).join(name)
    }

    /// Parsed mount table; empty when unreadable
    pub fn mounts(&self) -> Vec<MountEntry> {
        match fs::read_to_string(self.root.join(MOUNTS)) {
            Ok(content) => parse_mounts(&content),
            Err(e) => {
                trace!(error = %e, "Mount table unreadable");
                Vec::new()
            }
        }
    }

    /// Kernel block device name for a mount source such as `/dev/sdb1`
    pub fn block_name_of(&self, device: &str) -> Option<String> {
        let node = self.root.join(device.trim_start_matches('/'));
        let resolved = fs::canonicalize(&node).unwrap_or(node);
        resolved.file_name()?.to_str().map(str::to_string)
    }

    /// The whole disk a block device (disk or partition) belongs to
    pub fn disk_of(&self, block_name: &str) -> Option<String> {
        let entry = self.class_block().join(block_name);
        if !entry.join("partition").exists() {
            return entry.exists().then(|| block_name.to_string());
        }
        let resolved = fs::canonicalize(&entry).ok()?;
        resolved.parent()?.file_name()?.to_str().map(str::to_string)
    }

    /// Every non-virtual disk that sits under a USB device
    pub fn usb_disks(&self) -> Vec<UsbDisk> {
        let Ok(entries) = fs::read_dir(self.block_devices()) else {
            return Vec::new();
        };

        let mut disks: Vec<UsbDisk> = entries
            .flatten()
            .filter_map(|entry| {
                let disk = entry.file_name().to_str()?.to_string();
                if is_virtual_block(&disk) {
                    return None;
                }
                let resolved = fs::canonicalize(entry.path()).ok()?;
                let usb_device = owning_usb_device(&resolved, &self.root)?;
                let block_names = std::iter::once(disk.clone())
                    .chain(partitions(&resolved))
                    .collect();
                Some(UsbDisk {
                    disk,
                    block_names,
                    usb_device,
                })
            })
            .collect();
        disks.sort_by(|a, b| a.disk.cmp(&b.disk));
        disks
    }
}

/// Read a sysfs attribute, trimmed. `None` when missing or empty.
pub fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn is_virtual_block(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md", "sr"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn partitions(disk_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(disk_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().join("partition").exists())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

/// First ancestor of a block device's sysfs path that is a USB device
/// (has `idVendor`). Never walks above `root`.
fn owning_usb_device(block_path: &Path, root: &Path) -> Option<PathBuf> {
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    block_path
        .ancestors()
        .skip(1)
        .take_while(|p| p.starts_with(&root) && *p != root)
        .find(|p| p.join("idVendor").exists())
        .map(Path::to_path_buf)
}

/// Parse `/proc/self/mounts`. Octal escapes (`\040` for space) are decoded.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            })
        })
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
