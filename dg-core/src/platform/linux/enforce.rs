//! Enforcement strategies for Linux
//!
//! - HideVolume: lazy unmount of the bound mount point
//! - EjectMedia: SCSI delete of every disk under the USB device
//! - DisableDeviceNode: clear the USB device's `authorized` attribute

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use dg_error::{DevGuardError, Result};

use super::enumerate::{usb_nodes, UsbNode};
use super::sysfs::SysfsRoot;
use crate::device::{resolve, ObservedDevice, RawDeviceDescriptor};
use crate::enforce::StrategyKind;
use crate::platform::EnforcementStrategy;

/// USB device nodes that resolve to the device's identity
fn matching_nodes(root: &SysfsRoot, device: &ObservedDevice) -> Result<Vec<UsbNode>> {
    let nodes: Vec<UsbNode> = usb_nodes(root)?
        .into_iter()
        .filter(|node| {
            let raw = RawDeviceDescriptor::generic(node.instance_id(), node.caption.clone());
            resolve(&raw).as_ref() == Some(&device.identity)
        })
        .collect();

    if nodes.is_empty() {
        return Err(DevGuardError::HardwareNotFound(device.identity.to_string()));
    }
    Ok(nodes)
}

fn write_attr(kind: StrategyKind, path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| DevGuardError::enforcement(kind, format!("{}: {}", path.display(), e)))
}

#[derive(Debug, Clone, Default)]
pub struct UnmountVolume;

impl EnforcementStrategy for UnmountVolume {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HideVolume
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let volume = device
            .volume
            .as_ref()
            .ok_or_else(|| DevGuardError::enforcement(self.kind(), "no volume bound"))?;
        let target = CString::new(volume.root().as_os_str().as_bytes())
            .map_err(|_| DevGuardError::invalid_path(volume.root(), "contains NUL"))?;

        // SAFETY: target is a valid NUL-terminated string for the duration of the call
        let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(DevGuardError::enforcement(self.kind(), format!("umount {volume}: {err}")));
        }

        info!(device = %device.identity, volume = %volume, "Volume detached");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeleteScsiDisk {
    root: SysfsRoot,
}

impl DeleteScsiDisk {
    pub fn new(root: SysfsRoot) -> Self {
        Self { root }
    }
}

impl EnforcementStrategy for DeleteScsiDisk {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EjectMedia
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        let owners: Vec<PathBuf> = matching_nodes(&self.root, device)?
            .into_iter()
            .map(|node| node.path)
            .collect();

        let disks: Vec<String> = self
            .root
            .usb_disks()
            .into_iter()
            .filter(|disk| owners.contains(&disk.usb_device))
            .map(|disk| disk.disk)
            .collect();
        if disks.is_empty() {
            return Err(DevGuardError::enforcement(self.kind(), "no disk behind device"));
        }

        for disk in &disks {
            let delete = self.root.block_devices().join(disk).join("device").join("delete");
            write_attr(self.kind(), &delete, "1")?;
            debug!(disk = %disk, "Disk deleted");
        }

        info!(device = %device.identity, disks = ?disks, "Media ejected");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeauthorizeUsbDevice {
    root: SysfsRoot,
}

impl DeauthorizeUsbDevice {
    pub fn new(root: SysfsRoot) -> Self {
        Self { root }
    }
}

impl EnforcementStrategy for DeauthorizeUsbDevice {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DisableDeviceNode
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        for node in matching_nodes(&self.root, device)? {
            write_attr(self.kind(), &node.path.join("authorized"), "0")?;
            debug!(node = %node.path.display(), "USB device deauthorized");
        }
        info!(device = %device.identity, "Device node disabled");
        Ok(())
    }
}
