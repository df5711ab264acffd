//! Linux adapter over sysfs and procfs
//!
//! Enumeration reads `/sys/bus/usb/devices` (generic path only; there is no
//! separate storage enumeration path on Linux). Volumes are bound by walking
//! each USB disk up to its owning USB device and matching the mount table.

mod enforce;
mod enumerate;
mod medium;
mod sysfs;

use std::sync::Arc;

pub use enforce::{DeauthorizeUsbDevice, DeleteScsiDisk, UnmountVolume};
pub use enumerate::{usb_nodes, SysfsEnumerator, UsbNode};
pub use medium::{disk_signature, SysfsMediumInspector};
pub use sysfs::{parse_mounts, read_attr, MountEntry, SysfsRoot, UsbDisk};

use super::Platform;

/// All Linux adapters reading from `root`
pub fn platform(root: SysfsRoot) -> Platform {
    Platform::new(
        Arc::new(SysfsEnumerator::new(root.clone())),
        Arc::new(SysfsMediumInspector::new(root.clone())),
        vec![
            Arc::new(UnmountVolume),
            Arc::new(DeleteScsiDisk::new(root.clone())),
            Arc::new(DeauthorizeUsbDevice::new(root)),
        ],
    )
}
