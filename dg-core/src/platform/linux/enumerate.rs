//! USB enumeration from `/sys/bus/usb/devices`

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use dg_error::{DevGuardError, Result};

use super::sysfs::{read_attr, SysfsRoot};
use crate::constants::sysfs::HUB_CLASS;
use crate::device::{RawDeviceDescriptor, VolumeRef};
use crate::platform::DeviceEnumerator;

/// A USB device node in sysfs with its identifying attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbNode {
    /// Canonical sysfs path
    pub path: PathBuf,
    pub vendor_id: String,
    pub product_id: String,
    pub serial: Option<String>,
    pub caption: String,
}

impl UsbNode {
    fn read(path: &Path) -> Option<Self> {
        let vendor_id = read_attr(path, "idVendor")?;
        let product_id = read_attr(path, "idProduct")?;
        if read_attr(path, "bDeviceClass").as_deref() == Some(HUB_CLASS) {
            return None;
        }

        let caption = [read_attr(path, "manufacturer"), read_attr(path, "product")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        Some(Self {
            path: fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            vendor_id: vendor_id.to_ascii_uppercase(),
            product_id: product_id.to_ascii_uppercase(),
            // Backslashes would be read as path separators.
            serial: read_attr(path, "serial").map(|s| s.replace('\\', "_")),
            caption,
        })
    }

    /// Generic-path instance id, `USB\VID_xxxx&PID_yyyy[\serial]`
    pub fn instance_id(&self) -> String {
        match &self.serial {
            Some(serial) => format!(r"USB\VID_{}&PID_{}\{}", self.vendor_id, self.product_id, serial),
            None => format!(r"USB\VID_{}&PID_{}", self.vendor_id, self.product_id),
        }
    }
}

/// Every USB device node except interfaces and hubs
pub fn usb_nodes(root: &SysfsRoot) -> Result<Vec<UsbNode>> {
    let dir = root.usb_devices();
    let entries = fs::read_dir(&dir).map_err(|e| {
        DevGuardError::Enumeration(format!("{}: {}", dir.display(), e))
    })?;

    let mut nodes: Vec<UsbNode> = entries
        .flatten()
        .filter(|entry| !entry.file_name().to_string_lossy().contains(':'))
        .filter_map(|entry| UsbNode::read(&entry.path()))
        .collect();
    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(nodes)
}

#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    root: SysfsRoot,
}

impl SysfsEnumerator {
    pub fn new(root: SysfsRoot) -> Self {
        Self { root }
    }

    /// Owning USB device path -> first mount point of its disk or partitions
    fn volume_bindings(&self) -> HashMap<PathBuf, VolumeRef> {
        let mounts = self.root.mounts();
        let mut bindings = HashMap::new();

        for disk in self.root.usb_disks() {
            let mount = mounts.iter().find(|m| {
                self.root
                    .block_name_of(&m.device)
                    .is_some_and(|name| disk.block_names.contains(&name))
            });
            if let Some(mount) = mount {
                bindings
                    .entry(disk.usb_device.clone())
                    .or_insert_with(|| VolumeRef::new(&mount.mount_point));
            }
        }
        bindings
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn enumerate(&self) -> Result<Vec<RawDeviceDescriptor>> {
        let nodes = usb_nodes(&self.root)?;
        let mut bindings = self.volume_bindings();

        let descriptors: Vec<RawDeviceDescriptor> = nodes
            .into_iter()
            .map(|node| {
                let mut raw = RawDeviceDescriptor::generic(node.instance_id(), node.caption);
                raw.volume = bindings.remove(&node.path);
                raw
            })
            .collect();

        debug!(devices = descriptors.len(), "Enumerated USB devices");
        Ok(descriptors)
    }
}
