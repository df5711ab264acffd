//! Device data types
//!
//! Raw descriptors as the platform yields them, and the canonical identity
//! every other component keys on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dg_error::DevGuardError;

use crate::constants::identity::NO_SERIAL;

/// Which OS enumeration path produced a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationPath {
    /// `USB\VID_xxxx&PID_yyyy\...`
    Generic,
    /// `USBSTOR\DISK&VEN_...&PROD_...\...`
    MassStorage,
}

/// A mounted volume (drive root or mount point)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeRef(PathBuf);

impl VolumeRef {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    /// Root directory of the mounted filesystem
    pub fn root(&self) -> &Path {
        &self.0
    }

    /// Drive letter for `E:` / `E:\` style volumes
    pub fn drive_letter(&self) -> Option<char> {
        let s = self.0.to_str()?;
        let mut chars = s.chars();
        let letter = chars.next()?;
        if !letter.is_ascii_alphabetic() || chars.next() != Some(':') {
            return None;
        }
        match chars.as_str() {
            "" | "\\" | "/" => Some(letter.to_ascii_uppercase()),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One row from the platform enumerator. Consumed once per poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceDescriptor {
    pub path_kind: EnumerationPath,
    /// Raw platform device path (instance id)
    pub instance_id: String,
    pub caption: String,
    pub volume: Option<VolumeRef>,
}

impl RawDeviceDescriptor {
    pub fn generic(instance_id: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            path_kind: EnumerationPath::Generic,
            instance_id: instance_id.into(),
            caption: caption.into(),
            volume: None,
        }
    }

    pub fn mass_storage(instance_id: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            path_kind: EnumerationPath::MassStorage,
            instance_id: instance_id.into(),
            caption: caption.into(),
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: VolumeRef) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Normalized vendor/product/serial key.
///
/// Serialized as `VID_<vendor>&PID_<product>&SN_<serial>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CanonicalDeviceIdentity {
    vendor_id: String,
    product_id: String,
    serial: String,
}

impl CanonicalDeviceIdentity {
    /// Build an identity. Ids are upper-cased; an empty serial becomes `NO_SERIAL`.
    pub fn new(vendor_id: &str, product_id: &str, serial: Option<&str>) -> Self {
        let serial = match serial.map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => NO_SERIAL.to_string(),
        };
        Self {
            vendor_id: vendor_id.trim().to_ascii_uppercase(),
            product_id: product_id.trim().to_ascii_uppercase(),
            serial,
        }
    }

    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn has_serial(&self) -> bool {
        self.serial != NO_SERIAL
    }
}

impl fmt::Display for CanonicalDeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VID_{}&PID_{}&SN_{}", self.vendor_id, self.product_id, self.serial)
    }
}

impl FromStr for CanonicalDeviceIdentity {
    type Err = DevGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DevGuardError::InvalidIdentity(s.to_string());

        let rest = s.trim().strip_prefix("VID_").ok_or_else(invalid)?;
        let (vendor, rest) = rest.split_once("&PID_").ok_or_else(invalid)?;
        let (product, serial) = rest.split_once("&SN_").ok_or_else(invalid)?;

        if vendor.is_empty() || product.is_empty() || serial.is_empty() {
            return Err(invalid());
        }
        if vendor.contains('&') || product.contains('&') {
            return Err(invalid());
        }

        Ok(Self::new(vendor, product, Some(serial)))
    }
}

impl From<CanonicalDeviceIdentity> for String {
    fn from(id: CanonicalDeviceIdentity) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CanonicalDeviceIdentity {
    type Error = DevGuardError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Storage devices carry a bound volume; everything else is a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Storage,
    Peripheral,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// One device as seen in a single poll, after identity resolution and de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedDevice {
    pub identity: CanonicalDeviceIdentity,
    pub caption: String,
    /// Every platform instance id that resolved to this identity, primary first
    pub instance_ids: Vec<String>,
    pub volume: Option<VolumeRef>,
}

impl ObservedDevice {
    pub fn class(&self) -> DeviceClass {
        if self.volume.is_some() {
            DeviceClass::Storage
        } else {
            DeviceClass::Peripheral
        }
    }
}
