/*
 * Linux adapter tests against a fake sysfs tree
 *
 * The tree mimics one SanDisk stick (1-1) with a single partition mounted
 * at /media/stick, behind a root hub that must be ignored.
 */
#![cfg(target_os = "linux")]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use dg_core::device::{resolve_batch, ObservedDevice, VolumeRef};
use dg_core::platform::linux::{
    platform, DeauthorizeUsbDevice, DeleteScsiDisk, SysfsEnumerator, SysfsMediumInspector, SysfsRoot,
};
use dg_core::platform::{DeviceEnumerator, EnforcementStrategy, MediumInspector};
use tempfile::TempDir;

struct FakeTree {
    dir: TempDir,
}

impl FakeTree {
    fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn sysfs(&self) -> SysfsRoot {
        SysfsRoot::with_root_path(self.root())
    }

    fn usb_device(&self) -> PathBuf {
        self.root().join("sys/devices/pci0000:00/usb1/1-1")
    }

    fn disk_dir(&self) -> PathBuf {
        self.usb_device()
            .join("1-1:1.0/host0/target0:0:0/0:0:0:0/block/sdb")
    }
}

fn attrs(dir: &Path, pairs: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    for (name, value) in pairs {
        fs::write(dir.join(name), format!("{value}\n")).unwrap();
    }
}

fn fake_tree() -> FakeTree {
    let tree = FakeTree {
        dir: TempDir::new().unwrap(),
    };
    let root = tree.root();

    let hub = root.join("sys/devices/pci0000:00/usb1");
    attrs(&hub, &[("idVendor", "1d6b"), ("idProduct", "0002"), ("bDeviceClass", "09")]);

    let stick = tree.usb_device();
    attrs(
        &stick,
        &[
            ("idVendor", "0781"),
            ("idProduct", "5591"),
            ("bDeviceClass", "00"),
            ("serial", "4C530001234"),
            ("manufacturer", "SanDisk"),
            ("product", "Ultra"),
            ("authorized", "1"),
        ],
    );
    fs::create_dir_all(stick.join("1-1:1.0")).unwrap();

    let disk = tree.disk_dir();
    attrs(&disk, &[("size", "2048")]);
    attrs(&disk.join("device"), &[("vendor", "SanDisk"), ("model", "Ultra")]);
    attrs(&disk.join("sdb1"), &[("partition", "1"), ("size", "2000")]);

    let bus = root.join("sys/bus/usb/devices");
    fs::create_dir_all(&bus).unwrap();
    symlink(&hub, bus.join("usb1")).unwrap();
    symlink(&stick, bus.join("1-1")).unwrap();
    symlink(stick.join("1-1:1.0"), bus.join("1-1:1.0")).unwrap();

    fs::create_dir_all(root.join("sys/block")).unwrap();
    symlink(&disk, root.join("sys/block/sdb")).unwrap();
    fs::create_dir_all(root.join("sys/class/block")).unwrap();
    symlink(&disk, root.join("sys/class/block/sdb")).unwrap();
    symlink(disk.join("sdb1"), root.join("sys/class/block/sdb1")).unwrap();

    let mut header = vec![0u8; 1024];
    header[440..444].copy_from_slice(&1234u32.to_le_bytes());
    fs::create_dir_all(root.join("dev")).unwrap();
    fs::write(root.join("dev/sdb"), &header).unwrap();

    fs::create_dir_all(root.join("proc/self")).unwrap();
    fs::write(
        root.join("proc/self/mounts"),
        "proc /proc proc rw 0 0\n/dev/sdb1 /media/stick vfat rw,nosuid 0 0\n",
    )
    .unwrap();

    tree
}

fn observed(tree: &FakeTree) -> ObservedDevice {
    let raws = SysfsEnumerator::new(tree.sysfs()).enumerate().unwrap();
    resolve_batch(raws).remove(0)
}

#[test]
fn enumerates_stick_and_skips_hub_and_interfaces() {
    let tree = fake_tree();
    let raws = SysfsEnumerator::new(tree.sysfs()).enumerate().unwrap();

    assert_eq!(raws.len(), 1);
    assert_eq!(raws[0].instance_id, r"USB\VID_0781&PID_5591\4C530001234");
    assert_eq!(raws[0].caption, "SanDisk Ultra");
    assert_eq!(raws[0].volume, Some(VolumeRef::new("/media/stick")));
}

#[test]
fn enumerated_stick_resolves_to_canonical_identity() {
    let tree = fake_tree();
    let device = observed(&tree);
    assert_eq!(device.identity.to_string(), "VID_0781&PID_5591&SN_4C530001234");
}

#[test]
fn unmounted_stick_has_no_volume() {
    let tree = fake_tree();
    fs::write(tree.root().join("proc/self/mounts"), "proc /proc proc rw 0 0\n").unwrap();
    let device = observed(&tree);
    assert!(device.volume.is_none());
}

#[test]
fn medium_descriptor_from_disk_behind_mount() {
    let tree = fake_tree();
    let inspector = SysfsMediumInspector::new(tree.sysfs());
    let descriptor = inspector
        .physical_descriptor(&VolumeRef::new("/media/stick"))
        .unwrap();

    assert_eq!(descriptor.model, "SanDisk Ultra");
    assert_eq!(descriptor.size_bytes, 2048 * 512);
    assert_eq!(descriptor.signature.as_deref(), Some("1234"));
}

#[test]
fn medium_lookup_fails_for_unknown_mount_point() {
    let tree = fake_tree();
    let inspector = SysfsMediumInspector::new(tree.sysfs());
    assert!(inspector
        .physical_descriptor(&VolumeRef::new("/media/other"))
        .is_err());
}

#[test]
fn deauthorize_clears_authorized_flag() {
    let tree = fake_tree();
    let device = observed(&tree);

    DeauthorizeUsbDevice::new(tree.sysfs()).apply(&device).unwrap();

    let flag = fs::read_to_string(tree.usb_device().join("authorized")).unwrap();
    assert_eq!(flag, "0");
}

#[test]
fn eject_deletes_disk_even_after_unmount() {
    let tree = fake_tree();
    let device = observed(&tree);
    fs::write(tree.root().join("proc/self/mounts"), "").unwrap();

    DeleteScsiDisk::new(tree.sysfs()).apply(&device).unwrap();

    let delete = fs::read_to_string(tree.disk_dir().join("device/delete")).unwrap();
    assert_eq!(delete, "1");
}

#[test]
fn strategies_fail_for_absent_device() {
    let tree = fake_tree();
    let mut device = observed(&tree);
    device.identity = "VID_046D&PID_C52B&SN_X".parse().unwrap();

    assert!(DeauthorizeUsbDevice::new(tree.sysfs()).apply(&device).is_err());
    assert!(DeleteScsiDisk::new(tree.sysfs()).apply(&device).is_err());
}

#[test]
fn platform_offers_all_strategy_kinds() {
    let tree = fake_tree();
    let platform = platform(tree.sysfs());
    let kinds: Vec<_> = platform
        .strategies(&dg_core::enforce::StrategyKind::ALL)
        .iter()
        .map(|s| s.kind())
        .collect();
    assert_eq!(kinds, dg_core::enforce::StrategyKind::ALL.to_vec());
}
