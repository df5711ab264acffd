//! Physical descriptor via LogicalDisk -> DiskPartition -> DiskDrive

use serde::Deserialize;

use dg_error::{DevGuardError, Result};

use super::powershell;
use crate::constants::timing::POWERSHELL_TIMEOUT;
use crate::device::VolumeRef;
use crate::platform::MediumInspector;
use crate::trust::PhysicalDescriptor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CimDiskDrive {
    pub model: Option<String>,
    pub size: Option<u64>,
    /// MBR signature; null on GPT disks
    pub signature: Option<u64>,
}

impl CimDiskDrive {
    pub fn into_descriptor(self, volume: &VolumeRef) -> Result<PhysicalDescriptor> {
        Ok(PhysicalDescriptor {
            model: self.model.unwrap_or_default(),
            size_bytes: self
                .size
                .ok_or_else(|| DevGuardError::medium(volume, "disk reports no size"))?,
            signature: self.signature.map(|s| s.to_string()),
        })
    }
}

/// Query for the disk behind `letter`. Only ever called with an ASCII letter.
fn disk_query(letter: char) -> String {
    format!(
        r#"
$ErrorActionPreference = 'Stop'
$ld = Get-CimInstance Win32_LogicalDisk -Filter "DeviceID='{letter}:'"
if (-not $ld) {{ throw 'no such logical disk' }}
$part = Get-CimAssociatedInstance -InputObject $ld -ResultClassName Win32_DiskPartition | Select-Object -First 1
if (-not $part) {{ throw 'no partition' }}
$disk = Get-CimAssociatedInstance -InputObject $part -ResultClassName Win32_DiskDrive | Select-Object -First 1
if (-not $disk) {{ throw 'no disk drive' }}
$disk | Select-Object Model, Size, Signature | ConvertTo-Json -Compress
"#
    )
}

#[derive(Debug, Clone, Default)]
pub struct CimMediumInspector;

impl MediumInspector for CimMediumInspector {
    fn physical_descriptor(&self, volume: &VolumeRef) -> Result<PhysicalDescriptor> {
        let letter = volume
            .drive_letter()
            .ok_or_else(|| DevGuardError::invalid_path(volume.root(), "not a drive letter"))?;

        let disk: Option<CimDiskDrive> =
            powershell::run_json("physical-disk", &disk_query(letter), POWERSHELL_TIMEOUT)
                .map_err(|e| DevGuardError::medium(volume, e.to_string()))?;
        disk.ok_or_else(|| DevGuardError::medium(volume, "disk not found"))?
            .into_descriptor(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt_disk_has_no_signature() {
        let disk: CimDiskDrive =
            serde_json::from_str(r#"{"Model":"SanDisk 3.2Gen1 USB Device","Size":61524983808,"Signature":null}"#)
                .unwrap();
        let desc = disk.into_descriptor(&VolumeRef::new("E:\\")).unwrap();
        assert_eq!(desc.size_bytes, 61_524_983_808);
        assert_eq!(desc.signature, None);
    }

    #[test]
    fn missing_size_is_an_error() {
        let disk: CimDiskDrive = serde_json::from_str(r#"{"Model":"x","Size":null,"Signature":7}"#).unwrap();
        assert!(disk.into_descriptor(&VolumeRef::new("E:\\")).is_err());
    }

    #[test]
    fn query_embeds_letter() {
        assert!(disk_query('E').contains("DeviceID='E:'"));
    }

    #[test]
    fn mount_point_rejected_before_query() {
        let err = CimMediumInspector
            .physical_descriptor(&VolumeRef::new("/media/stick"))
            .unwrap_err();
        assert!(matches!(err, DevGuardError::InvalidPath { .. }));
    }
}
