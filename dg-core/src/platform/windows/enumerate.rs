//! USB enumeration through one CIM query

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use dg_error::Result;

use super::powershell::{self, one_or_many};
use crate::constants::identity::{GENERIC_PREFIX, MASS_STORAGE_PREFIX};
use crate::constants::timing::POWERSHELL_TIMEOUT;
use crate::device::{serial_of, RawDeviceDescriptor, VolumeRef};
use crate::platform::DeviceEnumerator;

const ENUMERATION_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$disks = @(Get-CimInstance Win32_DiskDrive -Filter "InterfaceType='USB'" | ForEach-Object {
    $letters = @(Get-CimAssociatedInstance -InputObject $_ -ResultClassName Win32_DiskPartition |
        ForEach-Object { Get-CimAssociatedInstance -InputObject $_ -ResultClassName Win32_LogicalDisk } |
        ForEach-Object { $_.DeviceID })
    [pscustomobject]@{ PnpDeviceId = $_.PNPDeviceID; Letters = $letters }
})
$entities = @(Get-CimInstance Win32_PnPEntity |
    Where-Object { $_.DeviceID -like 'USB\*' -or $_.DeviceID -like 'USBSTOR\*' } |
    ForEach-Object { [pscustomobject]@{ DeviceId = $_.DeviceID; Caption = $_.Caption } })
[pscustomobject]@{ Disks = $disks; Entities = $entities } | ConvertTo-Json -Depth 4 -Compress
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CimSnapshot {
    #[serde(default, deserialize_with = "one_or_many")]
    pub disks: Vec<CimDisk>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub entities: Vec<CimEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CimDisk {
    pub pnp_device_id: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub letters: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CimEntity {
    pub device_id: Option<String>,
    pub caption: Option<String>,
}

impl CimSnapshot {
    /// Serial -> first drive letter of the USB disk carrying that serial
    fn drive_map(&self) -> HashMap<String, VolumeRef> {
        let mut map = HashMap::new();
        for disk in &self.disks {
            let Some(serial) = disk.pnp_device_id.as_deref().and_then(serial_of) else {
                continue;
            };
            if let Some(letter) = disk.letters.first() {
                map.entry(serial)
                    .or_insert_with(|| VolumeRef::new(format!("{}\\", letter.trim_end_matches('\\'))));
            }
        }
        map
    }

    pub fn into_descriptors(self) -> Vec<RawDeviceDescriptor> {
        let drives = self.drive_map();

        self.entities
            .into_iter()
            .filter_map(|entity| {
                let id = entity.device_id?;
                let caption = entity.caption.unwrap_or_else(|| "Unknown USB Device".to_string());
                let upper = id.to_ascii_uppercase();
                let raw = if upper.starts_with(MASS_STORAGE_PREFIX) {
                    RawDeviceDescriptor::mass_storage(id.clone(), caption)
                } else if upper.starts_with(GENERIC_PREFIX) {
                    RawDeviceDescriptor::generic(id.clone(), caption)
                } else {
                    return None;
                };
                Some(match serial_of(&id).and_then(|s| drives.get(&s)) {
                    Some(volume) => raw.with_volume(volume.clone()),
                    None => raw,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CimEnumerator;

impl DeviceEnumerator for CimEnumerator {
    fn enumerate(&self) -> Result<Vec<RawDeviceDescriptor>> {
        let snapshot: Option<CimSnapshot> =
            powershell::run_json("enumerate-usb", ENUMERATION_SCRIPT, POWERSHELL_TIMEOUT)?;
        let descriptors = snapshot.unwrap_or_default().into_descriptors();
        debug!(devices = descriptors.len(), "Enumerated USB devices");
        Ok(descriptors)
    }
}
