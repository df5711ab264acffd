//! DevGuard Core Library
//!
//! Removable-device access control: every USB device that shows up is
//! checked against a whitelist, registered storage media must additionally
//! prove they are the same physical medium that was registered, and
//! anything else is blocked.
//!
//! # Features
//!
//! - **Identity**: Raw platform device paths resolved to one canonical `VID/PID/serial` key
//! - **Whitelist**: Persistent registry of trusted devices (JSON store or in-memory)
//! - **Trust**: Structural disk fingerprint plus a marker file signed by the host key
//! - **Reconciliation**: Polling loop that diffs connected devices against the whitelist
//! - **Enforcement**: Independent, best-effort blocking strategies per platform
//!
//! # Module Structure
//!
//! - `device/` - Raw descriptors, canonical identity, resolver
//! - `trust/` - Host key, fingerprints, signed markers, verification
//! - `whitelist/` - Whitelist contract and its stores
//! - `reconcile/` - Cycle planning and the monitoring loop
//! - `platform/` - OS adapters (Linux sysfs, Windows CIM/Win32)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dg_core::{DeviceRegistry, JsonWhitelist, Platform, TracingEventSink, TrustEngine};
//!
//! let platform = Platform::native();
//! let trust = TrustEngine::new(None, platform.inspector.clone(), Arc::new(TracingEventSink));
//! let whitelist = Arc::new(JsonWhitelist::open("/etc/devguard/whitelist.json").unwrap());
//! let registry = DeviceRegistry::new(whitelist, Arc::new(trust));
//!
//! for device in registry.inventory(platform.enumerator.as_ref()).unwrap() {
//!     println!("{} registered={}", device.identity, device.is_registered);
//! }
//! ```

// Grouped modules
pub mod device;
pub mod enforce;
pub mod platform;
pub mod reconcile;
pub mod trust;
pub mod whitelist;

// Standalone modules
pub mod config;
pub mod constants;
pub mod events;
pub mod registry;

// Re-export error types
pub use dg_error::{DevGuardError, Result};

// Re-export device types
pub use device::{
    resolve, resolve_batch, CanonicalDeviceIdentity, DeviceClass, EnumerationPath, ObservedDevice,
    RawDeviceDescriptor, VolumeRef,
};

// Re-export trust types
pub use trust::{
    HostKey, MediumVerifier, PhysicalDescriptor, SignedLockfileRecord, StructuralFingerprint, TrustEngine,
    VerificationOutcome,
};

// Re-export whitelist types
pub use whitelist::{JsonWhitelist, MemoryWhitelist, Whitelist, WhitelistEntry};

// Re-export loop and enforcement types
pub use enforce::{EnforcementReport, Enforcer, StrategyKind, StrategyOutcome};
pub use reconcile::{CycleSummary, LoopTimings, MonitoringSnapshot, Reconciler, ShutdownSignal};

// Re-export platform seams
pub use platform::{DeviceEnumerator, EnforcementStrategy, MediumInspector, Platform};

// Re-export the rest of the public surface
pub use config::GuardSettings;
pub use events::{EventSink, GuardEvent, RecordingEventSink, TracingEventSink, UnauthorizedReason};
pub use registry::{DeviceRegistry, DeviceStatus, RegistrationRequest, RegistrationResult};
