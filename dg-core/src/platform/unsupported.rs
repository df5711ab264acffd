use std::sync::Arc;

use dg_error::{DevGuardError, Result};

use super::{DeviceEnumerator, EnforcementStrategy, MediumInspector, Platform};
use crate::device::{ObservedDevice, RawDeviceDescriptor, VolumeRef};
use crate::enforce::StrategyKind;
use crate::trust::PhysicalDescriptor;

/// Stand-in for operating systems without an adapter. Every call fails
/// with `NotSupported`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPlatform;

impl UnsupportedPlatform {
    pub fn platform() -> Platform {
        let strategies: Vec<Arc<dyn EnforcementStrategy>> = StrategyKind::ALL
            .iter()
            .map(|kind| Arc::new(UnsupportedStrategy(*kind)) as Arc<dyn EnforcementStrategy>)
            .collect();
        Platform::new(Arc::new(Self), Arc::new(Self), strategies)
    }
}

impl DeviceEnumerator for UnsupportedPlatform {
    fn enumerate(&self) -> Result<Vec<RawDeviceDescriptor>> {
        Err(DevGuardError::NotSupported(format!(
            "device enumeration on {}",
            std::env::consts::OS
        )))
    }
}

impl MediumInspector for UnsupportedPlatform {
    fn physical_descriptor(&self, volume: &VolumeRef) -> Result<PhysicalDescriptor> {
        Err(DevGuardError::NotSupported(format!("medium inspection of {volume}")))
    }
}

struct UnsupportedStrategy(StrategyKind);

impl EnforcementStrategy for UnsupportedStrategy {
    fn kind(&self) -> StrategyKind {
        self.0
    }

    fn apply(&self, _device: &ObservedDevice) -> Result<()> {
        Err(DevGuardError::NotSupported(self.0.to_string()))
    }
}
