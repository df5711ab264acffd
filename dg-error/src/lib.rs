//! Unified error handling for DevGuard
//!
//! This crate provides a single error type used across all DevGuard components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using DevGuardError
pub type Result<T> = std::result::Result<T, DevGuardError>;

/// Unified error type for all DevGuard operations
#[derive(thiserror::Error, Debug)]
pub enum DevGuardError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Device Identity and Enumeration Errors
    // ============================================================================
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Hardware not found: {0}")]
    HardwareNotFound(String),

    #[error("Platform command `{command}` failed: {reason}")]
    PlatformCommand {
        command: String,
        reason: String,
    },

    // ============================================================================
    // Fingerprint and Trust Errors
    // ============================================================================
    #[error("Medium behind {volume} unavailable: {reason}")]
    MediumUnavailable {
        volume: String,
        reason: String,
    },

    #[error("Host key unavailable: {0}")]
    HostKeyUnavailable(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Marker error at {path}: {reason}")]
    Marker {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Whitelist Errors
    // ============================================================================
    #[error("Whitelist error: {0}")]
    Whitelist(String),

    #[error("Device not registered: {0}")]
    NotRegistered(String),

    #[error("Device has no fingerprint on record: {0}")]
    NotFingerprinted(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Enforcement Errors
    // ============================================================================
    #[error("Enforcement strategy {strategy} failed: {reason}")]
    Enforcement {
        strategy: String,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl DevGuardError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a medium-unavailable error for a volume
    pub fn medium(volume: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::MediumUnavailable {
            volume: volume.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a marker error
    pub fn marker(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Marker {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an enforcement error for a named strategy
    pub fn enforcement(strategy: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Enforcement {
            strategy: strategy.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a platform command error
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PlatformCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a whitelist error from a string
    pub fn whitelist(msg: impl Into<String>) -> Self {
        Self::Whitelist(msg.into())
    }

    /// True for errors that are expected to clear up on their own
    /// (medium busy, platform query failed, call timed out).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Enumeration(_)
                | Self::PlatformCommand { .. }
                | Self::MediumUnavailable { .. }
                | Self::HardwareNotFound(_)
                | Self::Timeout(_)
        )
    }
}

// Allow converting from String to DevGuardError
impl From<String> for DevGuardError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to DevGuardError
impl From<&str> for DevGuardError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_error_mentions_volume() {
        let err = DevGuardError::medium("E:\\", "disk not found");
        assert_eq!(err.to_string(), "Medium behind E:\\ unavailable: disk not found");
        assert!(err.is_transient());
    }

    #[test]
    fn trust_errors_are_not_transient() {
        assert!(!DevGuardError::HostKeyUnavailable("missing".into()).is_transient());
        assert!(!DevGuardError::Signing("bad".into()).is_transient());
    }

    #[test]
    fn string_conversion_is_generic() {
        let err: DevGuardError = "boom".into();
        assert!(matches!(err, DevGuardError::Generic(ref s) if s == "boom"));
    }
}
