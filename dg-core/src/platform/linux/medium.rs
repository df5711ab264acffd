//! Physical descriptor of the disk behind a mount point

use std::fs;
use std::io::Read;
use std::path::Path;

use dg_error::{DevGuardError, Result};

use super::sysfs::{read_attr, SysfsRoot};
use crate::constants::limits::DISK_HEADER_BYTES;
use crate::constants::sysfs::SECTOR_SIZE;
use crate::device::VolumeRef;
use crate::platform::MediumInspector;
use crate::trust::PhysicalDescriptor;

const MBR_SIGNATURE_OFFSET: usize = 440;
const FIRST_PARTITION_TYPE_OFFSET: usize = 446 + 4;
const GPT_PROTECTIVE_TYPE: u8 = 0xEE;
const GPT_HEADER_OFFSET: usize = 512;
const GPT_DISK_GUID_OFFSET: usize = GPT_HEADER_OFFSET + 56;

#[derive(Debug, Clone)]
pub struct SysfsMediumInspector {
    root: SysfsRoot,
}

impl SysfsMediumInspector {
    pub fn new(root: SysfsRoot) -> Self {
        Self { root }
    }

    /// Disk name (e.g. `sdb`) backing the filesystem mounted at `volume`
    pub fn disk_for_volume(&self, volume: &VolumeRef) -> Result<String> {
        let mount = self
            .root
            .mounts()
            .into_iter()
            .rev()
            .find(|m| m.mount_point == volume.root())
            .ok_or_else(|| DevGuardError::medium(volume, "not a mount point"))?;

        let block = self
            .root
            .block_name_of(&mount.device)
            .ok_or_else(|| DevGuardError::medium(volume, format!("unknown device {}", mount.device)))?;
        self.root
            .disk_of(&block)
            .ok_or_else(|| DevGuardError::medium(volume, format!("no disk for {block}")))
    }
}

impl MediumInspector for SysfsMediumInspector {
    fn physical_descriptor(&self, volume: &VolumeRef) -> Result<PhysicalDescriptor> {
        let disk = self.disk_for_volume(volume)?;
        let disk_dir = self.root.block_devices().join(&disk);

        let model = [read_attr(&disk_dir.join("device"), "vendor"), read_attr(&disk_dir.join("device"), "model")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let sectors: u64 = read_attr(&disk_dir, "size")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DevGuardError::medium(volume, format!("no size for {disk}")))?;

        let header = read_header(&self.root.dev_node(&disk))
            .map_err(|e| DevGuardError::medium(volume, format!("read /dev/{disk}: {e}")))?;

        Ok(PhysicalDescriptor {
            model,
            size_bytes: sectors * SECTOR_SIZE,
            signature: disk_signature(&header),
        })
    }
}

fn read_header(node: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(DISK_HEADER_BYTES);
    fs::File::open(node)?
        .take(DISK_HEADER_BYTES as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// MBR disk signature as a decimal u32, or the GPT disk GUID when the
/// first partition entry is a protective one.
pub fn disk_signature(header: &[u8]) -> Option<String> {
    if header.get(FIRST_PARTITION_TYPE_OFFSET) == Some(&GPT_PROTECTIVE_TYPE) {
        if let Some(guid) = gpt_disk_guid(header) {
            return Some(guid);
        }
    }
    let bytes: [u8; 4] = header
        .get(MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 4)?
        .try_into()
        .ok()?;
    Some(u32::from_le_bytes(bytes).to_string())
}

fn gpt_disk_guid(header: &[u8]) -> Option<String> {
    if header.get(GPT_HEADER_OFFSET..GPT_HEADER_OFFSET + 8)? != b"EFI PART" {
        return None;
    }
    let g = header.get(GPT_DISK_GUID_OFFSET..GPT_DISK_GUID_OFFSET + 16)?;
    Some(format!(
        "{:08X}-{:04X}-{:04X}-{}-{}",
        u32::from_le_bytes([g[0], g[1], g[2], g[3]]),
        u16::from_le_bytes([g[4], g[5]]),
        u16::from_le_bytes([g[6], g[7]]),
        hex::encode_upper(&g[8..10]),
        hex::encode_upper(&g[10..16]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbr_signature_is_decimal() {
        let mut header = vec![0u8; 1024];
        header[440..444].copy_from_slice(&0xA82D_2F66u32.to_le_bytes());
        assert_eq!(disk_signature(&header).as_deref(), Some("2821533542"));
    }

    #[test]
    fn gpt_guid_used_for_protective_mbr() {
        let mut header = vec![0u8; 1024];
        header[450] = 0xEE;
        header[512..520].copy_from_slice(b"EFI PART");
        let guid = [
            0x78, 0x56, 0x34, 0x12, 0xBC, 0x9A, 0xF0, 0xDE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        header[568..584].copy_from_slice(&guid);
        assert_eq!(
            disk_signature(&header).as_deref(),
            Some("12345678-9ABC-DEF0-0102-030405060708")
        );
    }

    #[test]
    fn short_header_has_no_signature() {
        assert_eq!(disk_signature(&[0u8; 100]), None);
    }
}
