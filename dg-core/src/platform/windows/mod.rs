//! Windows adapter over CIM (via PowerShell), the registry and volume IOCTLs
//!
//! Query parsing and script building are plain Rust and build on every
//! target; the Win32 calls and [`platform`] only exist on Windows.

mod enforce;
mod enumerate;
mod medium;
pub mod powershell;

pub use enforce::{disable_script, no_drives_bit, IoctlEjectMedia, PnpDisableDevice, RegistryHideVolume};
pub use enumerate::{CimDisk, CimEntity, CimEnumerator, CimSnapshot};
pub use medium::{CimDiskDrive, CimMediumInspector};

#[cfg(windows)]
pub fn platform() -> super::Platform {
    use std::sync::Arc;

    super::Platform::new(
        Arc::new(CimEnumerator),
        Arc::new(CimMediumInspector),
        vec![
            Arc::new(RegistryHideVolume),
            Arc::new(IoctlEjectMedia),
            Arc::new(PnpDisableDevice),
        ],
    )
}
