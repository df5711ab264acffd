//! Device identity
//!
//! Raw descriptor types, the canonical identity and the resolver that
//! connects the two.

mod identity;
mod types;

pub use identity::{resolve, resolve_batch, serial_of};
pub use types::{
    CanonicalDeviceIdentity, DeviceClass, EnumerationPath, ObservedDevice, RawDeviceDescriptor,
    VolumeRef,
};
