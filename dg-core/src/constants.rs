//! Constants and configuration values for DevGuard
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// System paths
pub mod paths {
    use std::path::PathBuf;

    /// Environment variable overriding the configuration directory
    pub const CONFIG_DIR_ENV: &str = "DEVGUARD_CONFIG_DIR";

    /// System configuration directory when running privileged on Unix
    pub const SYSTEM_CONFIG_DIR: &str = "/etc/devguard";

    /// Settings file name inside the config directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Whitelist file name inside the config directory
    pub const WHITELIST_FILE: &str = "whitelist.json";

    /// Host private key file name inside the config directory
    pub const HOST_KEY_FILE: &str = "host_key.pem";

    /// Resolve the configuration directory.
    ///
    /// Order: `DEVGUARD_CONFIG_DIR`, then the machine-wide location for a
    /// privileged agent, then the per-user config dir.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        machine_config_dir()
            .or_else(|| dirs::config_dir().map(|d| d.join("devguard")))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR))
    }

    #[cfg(windows)]
    fn machine_config_dir() -> Option<PathBuf> {
        std::env::var("ProgramData")
            .ok()
            .map(|base| PathBuf::from(base).join("DevGuard"))
    }

    #[cfg(unix)]
    fn machine_config_dir() -> Option<PathBuf> {
        // SAFETY: geteuid is always safe - it just returns the effective user ID of the process.
        if unsafe { libc::geteuid() } == 0 {
            Some(PathBuf::from(SYSTEM_CONFIG_DIR))
        } else {
            None
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn machine_config_dir() -> Option<PathBuf> {
        None
    }
}

/// Canonical identity formatting and raw descriptor tokens
pub mod identity {
    /// Serial placeholder when no serial can be recovered
    pub const NO_SERIAL: &str = "NO_SERIAL";

    /// Generic enumeration path prefix
    pub const GENERIC_PREFIX: &str = "USB\\";

    /// Mass-storage enumeration path prefix
    pub const MASS_STORAGE_PREFIX: &str = "USBSTOR\\";

    /// Vendor-string quirks on the mass-storage path: VEN_ token -> numeric VID
    pub const VENDOR_QUIRKS: &[(&str, &str)] = &[
        ("_USB", "0781"),
        ("SANDISK", "0781"),
        ("KINGSTON", "0951"),
        ("TRANSCEND", "8564"),
        ("JETFLASH", "8564"),
        ("SAMSUNG", "04E8"),
        ("LEXAR", "05DC"),
        ("VERBATIM", "18A5"),
        ("PNY", "154B"),
    ];

    /// Product-string quirks on the mass-storage path: PROD_ token -> numeric PID
    pub const PRODUCT_QUIRKS: &[(&str, &str)] = &[("_SANDISK_3.2GEN1", "5591")];
}

/// On-medium marker layout
pub mod marker {
    /// Hidden folder at the medium root
    pub const FOLDER_NAME: &str = ".device_guard";

    /// Marker file inside the folder
    pub const FILE_NAME: &str = "lockfile.bin";

    /// Separator between signature hex and payload
    pub const SEPARATOR: &str = "::";

    /// Payload prefix; the registration timestamp follows
    pub const PAYLOAD_PREFIX: &str = "DeviceGuardLock_RegisteredOn_";

    /// Refuse to read markers larger than this
    pub const MAX_MARKER_SIZE: u64 = 16 * 1024;
}

/// Timing defaults
pub mod timing {
    use super::Duration;

    /// Reconciliation poll interval
    pub const POLL_INTERVAL_MS: u64 = 2000;

    /// Upper bound for one enumeration call. On Windows this covers a
    /// PowerShell start plus a CIM query, and stays under
    /// `POWERSHELL_TIMEOUT` so the runner never outlives the cycle's wait
    /// by much.
    #[cfg(windows)]
    pub const ENUMERATION_TIMEOUT_MS: u64 = 8000;
    #[cfg(not(windows))]
    pub const ENUMERATION_TIMEOUT_MS: u64 = 1500;

    /// Upper bound for one enforcement strategy
    pub const ENFORCEMENT_TIMEOUT_MS: u64 = 1500;

    /// Upper bound for one medium verification (fingerprint + marker read)
    #[cfg(windows)]
    pub const VERIFICATION_TIMEOUT_MS: u64 = 8000;
    #[cfg(not(windows))]
    pub const VERIFICATION_TIMEOUT_MS: u64 = 5000;

    /// Largest accepted value for any interval or timeout setting
    pub const MAX_SETTING_MS: u64 = 10 * 60 * 1000;

    /// Log every Nth consecutive cycle failure after the first
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

    /// Upper bound for a PowerShell query
    pub const POWERSHELL_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Size limits
pub mod limits {
    /// Largest whitelist document accepted
    pub const MAX_WHITELIST_SIZE: u64 = 10 * 1024 * 1024;

    /// Largest settings document accepted
    pub const MAX_SETTINGS_SIZE: u64 = 1024 * 1024;

    /// Longest accepted friendly name
    pub const MAX_FRIENDLY_NAME_LEN: usize = 128;

    /// Bytes read from the start of a disk for its signature (MBR + GPT header)
    pub const DISK_HEADER_BYTES: usize = 1024;
}

/// Linux sysfs layout
pub mod sysfs {
    /// USB devices, relative to the filesystem root
    pub const USB_DEVICES: &str = "sys/bus/usb/devices";

    /// Block devices, relative to the filesystem root
    pub const BLOCK_DEVICES: &str = "sys/block";

    /// Block class (disks and partitions), relative to the filesystem root
    pub const CLASS_BLOCK: &str = "sys/class/block";

    /// Mount table, relative to the filesystem root
    pub const MOUNTS: &str = "proc/self/mounts";

    /// Device nodes, relative to the filesystem root
    pub const DEV: &str = "dev";

    /// USB hub device class
    pub const HUB_CLASS: &str = "09";

    /// Sector size used by sysfs `size` attributes
    pub const SECTOR_SIZE: u64 = 512;
}
