//! Enforcement strategies for Windows

use tracing::{info, warn};

use dg_error::{DevGuardError, Result};

use super::powershell;
use crate::constants::timing::POWERSHELL_TIMEOUT;
use crate::device::ObservedDevice;
use crate::enforce::StrategyKind;
use crate::platform::EnforcementStrategy;

#[cfg(windows)]
fn drive_letter(kind: StrategyKind, device: &ObservedDevice) -> Result<char> {
    device
        .volume
        .as_ref()
        .and_then(|v| v.drive_letter())
        .ok_or_else(|| DevGuardError::enforcement(kind, "no drive letter bound"))
}

/// Bit for `letter` in the Explorer `NoDrives` mask (A = bit 0)
pub fn no_drives_bit(letter: char) -> Option<u32> {
    let upper = letter.to_ascii_uppercase();
    upper
        .is_ascii_uppercase()
        .then(|| 1u32 << (upper as u32 - 'A' as u32))
}

pub fn disable_script(instance_id: &str) -> String {
    format!(
        "Disable-PnpDevice -InstanceId {} -Confirm:$false -ErrorAction Stop",
        powershell::quote(instance_id)
    )
}

#[cfg(windows)]
fn wide(s: &str) -> Vec<u16> {
    use std::os::windows::prelude::*;
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Hides the drive letter from Explorer through the machine-wide `NoDrives` policy
#[derive(Debug, Clone, Default)]
pub struct RegistryHideVolume;

#[cfg(windows)]
impl RegistryHideVolume {
    const POLICY_KEY: &'static str = r"Software\Microsoft\Windows\CurrentVersion\Policies\Explorer";
    const VALUE: &'static str = "NoDrives";

    fn set_bit(bit: u32) -> ::windows::core::Result<u32> {
        use ::windows::core::PCWSTR;
        use ::windows::Win32::System::Registry::{
            RegCloseKey, RegCreateKeyExW, RegQueryValueExW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE,
            KEY_QUERY_VALUE, KEY_SET_VALUE, REG_DWORD, REG_OPTION_NON_VOLATILE, REG_VALUE_TYPE,
        };

        let subkey = wide(Self::POLICY_KEY);
        let value = wide(Self::VALUE);
        let mut key = HKEY::default();

        // SAFETY: all pointers reference locals that outlive the calls; the
        // key handle is closed before returning.
        unsafe {
            RegCreateKeyExW(
                HKEY_LOCAL_MACHINE,
                PCWSTR(subkey.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_QUERY_VALUE | KEY_SET_VALUE,
                None,
                &mut key,
                None,
            )
            .ok()?;

            let mut current = 0u32;
            let mut kind = REG_VALUE_TYPE::default();
            let mut len = std::mem::size_of::<u32>() as u32;
            let read = RegQueryValueExW(
                key,
                PCWSTR(value.as_ptr()),
                None,
                Some(&mut kind),
                Some(&mut current as *mut u32 as *mut u8),
                Some(&mut len),
            );
            if read.ok().is_err() || kind != REG_DWORD {
                current = 0;
            }

            let updated = current | bit;
            let result = RegSetValueExW(
                key,
                PCWSTR(value.as_ptr()),
                0,
                REG_DWORD,
                Some(&updated.to_le_bytes()),
            )
            .ok();
            let _ = RegCloseKey(key);
            result.map(|()| updated)
        }
    }
}

#[cfg(windows)]
impl EnforcementStrategy for RegistryHideVolume {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HideVolume
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        let letter = drive_letter(self.kind(), device)?;
        let bit = no_drives_bit(letter)
            .ok_or_else(|| DevGuardError::enforcement(self.kind(), format!("bad drive letter {letter}")))?;
        let mask = Self::set_bit(bit)
            .map_err(|e| DevGuardError::enforcement(self.kind(), format!("NoDrives: {e}")))?;
        info!(device = %device.identity, drive = %letter, mask, "Drive hidden");
        Ok(())
    }
}

/// Lock, dismount and eject the volume
#[derive(Debug, Clone, Default)]
pub struct IoctlEjectMedia;

#[cfg(windows)]
struct VolumeHandle(::windows::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl Drop for VolumeHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreateFileW and is closed once.
        let _ = unsafe { ::windows::Win32::Foundation::CloseHandle(self.0) };
    }
}

#[cfg(windows)]
impl IoctlEjectMedia {
    fn open(letter: char) -> ::windows::core::Result<VolumeHandle> {
        use ::windows::core::PCWSTR;
        use ::windows::Win32::Storage::FileSystem::{
            CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ,
            FILE_SHARE_WRITE, OPEN_EXISTING,
        };

        let path = wide(&format!(r"\\.\{letter}:"));
        // SAFETY: `path` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                None,
            )?
        };
        Ok(VolumeHandle(handle))
    }

    fn control(handle: &VolumeHandle, code: u32) -> ::windows::core::Result<()> {
        use ::windows::Win32::System::IO::DeviceIoControl;

        let mut returned = 0u32;
        // SAFETY: no buffers are passed; `returned` outlives the call.
        unsafe { DeviceIoControl(handle.0, code, None, 0, None, 0, Some(&mut returned), None) }
    }
}

#[cfg(windows)]
impl EnforcementStrategy for IoctlEjectMedia {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EjectMedia
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        use ::windows::Win32::System::Ioctl::{FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, IOCTL_STORAGE_EJECT_MEDIA};

        let kind = self.kind();
        let letter = drive_letter(kind, device)?;
        let handle = Self::open(letter)
            .map_err(|e| DevGuardError::enforcement(kind, format!("open {letter}: {e}")))?;

        // Open files elsewhere prevent the lock; dismount and eject still go ahead.
        if let Err(e) = Self::control(&handle, FSCTL_LOCK_VOLUME) {
            warn!(drive = %letter, error = %e, "Volume lock refused");
        }
        if let Err(e) = Self::control(&handle, FSCTL_DISMOUNT_VOLUME) {
            warn!(drive = %letter, error = %e, "Volume dismount refused");
        }
        Self::control(&handle, IOCTL_STORAGE_EJECT_MEDIA)
            .map_err(|e| DevGuardError::enforcement(kind, format!("eject {letter}: {e}")))?;

        info!(device = %device.identity, drive = %letter, "Media ejected");
        Ok(())
    }
}

/// `Disable-PnpDevice` for every instance id bound to the device
#[derive(Debug, Clone, Default)]
pub struct PnpDisableDevice;

impl EnforcementStrategy for PnpDisableDevice {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DisableDeviceNode
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()> {
        if device.instance_ids.is_empty() {
            return Err(DevGuardError::enforcement(self.kind(), "no instance ids"));
        }

        let mut failures = Vec::new();
        for instance_id in &device.instance_ids {
            match powershell::run("disable-pnp", &disable_script(instance_id), POWERSHELL_TIMEOUT) {
                Ok(_) => info!(device = %device.identity, instance_id = %instance_id, "Device node disabled"),
                Err(e) => failures.push(format!("{instance_id}: {e}")),
            }
        }

        if failures.len() == device.instance_ids.len() {
            return Err(DevGuardError::enforcement(self.kind(), failures.join("; ")));
        }
        for failure in &failures {
            warn!(device = %device.identity, failure = %failure, "Instance not disabled");
        }
        Ok(())
    }
}
