//! Platform adapters
//!
//! The core only talks to the OS through three seams: a device enumerator,
//! a medium inspector and enforcement strategies. [`Platform::native`]
//! bundles the implementations for the running OS.

pub mod bounded;
#[cfg(target_os = "linux")]
pub mod linux;
mod privilege;
mod unsupported;
pub mod windows;

use std::sync::Arc;

use dg_error::Result;

use crate::device::{ObservedDevice, RawDeviceDescriptor, VolumeRef};
use crate::enforce::StrategyKind;
use crate::trust::PhysicalDescriptor;

pub use privilege::is_privileged;
pub use unsupported::UnsupportedPlatform;

/// Raw enumeration source. Called once per cycle; failure is an error,
/// never a partial list.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<RawDeviceDescriptor>>;
}

/// Resolves a mounted volume to the physical disk behind it
#[cfg_attr(test, mockall::automock)]
pub trait MediumInspector: Send + Sync {
    fn physical_descriptor(&self, volume: &VolumeRef) -> Result<PhysicalDescriptor>;
}

/// One independent way of blocking a device
#[cfg_attr(test, mockall::automock)]
pub trait EnforcementStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Volume strategies need a bound volume; node strategies apply to every device.
    fn applies_to(&self, device: &ObservedDevice) -> bool {
        !self.kind().needs_volume() || device.volume.is_some()
    }

    fn apply(&self, device: &ObservedDevice) -> Result<()>;
}

/// The adapters for one OS
#[derive(Clone)]
pub struct Platform {
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub inspector: Arc<dyn MediumInspector>,
    strategies: Vec<Arc<dyn EnforcementStrategy>>,
}

impl Platform {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        inspector: Arc<dyn MediumInspector>,
        strategies: Vec<Arc<dyn EnforcementStrategy>>,
    ) -> Self {
        Self {
            enumerator,
            inspector,
            strategies,
        }
    }

    #[cfg(target_os = "linux")]
    pub fn native() -> Self {
        linux::platform(linux::SysfsRoot::system())
    }

    #[cfg(windows)]
    pub fn native() -> Self {
        self::windows::platform()
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    pub fn native() -> Self {
        UnsupportedPlatform::platform()
    }

    /// Strategies in the order given by `enabled`; kinds the platform lacks are skipped
    pub fn strategies(&self, enabled: &[StrategyKind]) -> Vec<Arc<dyn EnforcementStrategy>> {
        enabled
            .iter()
            .filter_map(|kind| self.strategies.iter().find(|s| s.kind() == *kind).cloned())
            .collect()
    }
}
