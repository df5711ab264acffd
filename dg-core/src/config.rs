//! Guard settings
//!
//! Loaded from `<config_dir>/settings.json`. Every field has a default, so a
//! missing file or a partial document is fine; an invalid value is not.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use dg_error::{DevGuardError, Result};

use crate::constants::{limits, paths, timing};
use crate::enforce::StrategyKind;
use crate::reconcile::LoopTimings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Delay between reconciliation cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_enumeration_timeout")]
    pub enumeration_timeout_ms: u64,

    /// Applied to each enforcement strategy separately
    #[serde(default = "default_enforcement_timeout")]
    pub enforcement_timeout_ms: u64,

    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_ms: u64,

    /// Relative paths are taken from the config directory
    #[serde(default = "default_whitelist_file")]
    pub whitelist_file: PathBuf,

    #[serde(default = "default_host_key_file")]
    pub host_key_file: PathBuf,

    /// Enabled strategies, in application order
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
}

fn default_poll_interval() -> u64 {
    timing::POLL_INTERVAL_MS
}

fn default_enumeration_timeout() -> u64 {
    timing::ENUMERATION_TIMEOUT_MS
}

fn default_enforcement_timeout() -> u64 {
    timing::ENFORCEMENT_TIMEOUT_MS
}

fn default_verification_timeout() -> u64 {
    timing::VERIFICATION_TIMEOUT_MS
}

fn default_whitelist_file() -> PathBuf {
    PathBuf::from(paths::WHITELIST_FILE)
}

fn default_host_key_file() -> PathBuf {
    PathBuf::from(paths::HOST_KEY_FILE)
}

fn default_strategies() -> Vec<StrategyKind> {
    StrategyKind::ALL.to_vec()
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            enumeration_timeout_ms: default_enumeration_timeout(),
            enforcement_timeout_ms: default_enforcement_timeout(),
            verification_timeout_ms: default_verification_timeout(),
            whitelist_file: default_whitelist_file(),
            host_key_file: default_host_key_file(),
            strategies: default_strategies(),
        }
    }
}

impl GuardSettings {
    /// Load `<config_dir>/settings.json`, resolve relative paths against
    /// `config_dir`, and validate.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(paths::SETTINGS_FILE);

        let mut settings = match fs::metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            Err(e) => return Err(DevGuardError::FileRead { path, source: e }),
            Ok(metadata) => {
                if metadata.len() > limits::MAX_SETTINGS_SIZE {
                    return Err(DevGuardError::FileTooLarge {
                        path,
                        size: metadata.len(),
                        max_size: limits::MAX_SETTINGS_SIZE,
                    });
                }
                let content = fs::read_to_string(&path).map_err(|e| DevGuardError::FileRead {
                    path: path.clone(),
                    source: e,
                })?;
                let parsed: Self = serde_json::from_str(&content)
                    .map_err(|e| DevGuardError::config(format!("{}: {}", path.display(), e)))?;
                info!(path = %path.display(), "Loaded settings");
                parsed
            }
        };

        settings.resolve_paths(config_dir);
        settings.validate()?;
        Ok(settings)
    }

    fn resolve_paths(&mut self, config_dir: &Path) {
        if self.whitelist_file.is_relative() {
            self.whitelist_file = config_dir.join(&self.whitelist_file);
        }
        if self.host_key_file.is_relative() {
            self.host_key_file = config_dir.join(&self.host_key_file);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("enumeration_timeout_ms", self.enumeration_timeout_ms),
            ("enforcement_timeout_ms", self.enforcement_timeout_ms),
            ("verification_timeout_ms", self.verification_timeout_ms),
        ];
        for (field, value) in durations {
            if value == 0 || value > timing::MAX_SETTING_MS {
                return Err(DevGuardError::InvalidConfig {
                    field: field.into(),
                    reason: format!("must be between 1 and {} ms, got {}", timing::MAX_SETTING_MS, value),
                });
            }
        }

        if self.strategies.is_empty() {
            return Err(DevGuardError::InvalidConfig {
                field: "strategies".into(),
                reason: "at least one enforcement strategy must be enabled".into(),
            });
        }
        Ok(())
    }

    pub fn loop_timings(&self) -> LoopTimings {
        LoopTimings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            enumeration_timeout: Duration::from_millis(self.enumeration_timeout_ms),
            verification_timeout: Duration::from_millis(self.verification_timeout_ms),
        }
    }

    pub fn enforcement_timeout(&self) -> Duration {
        Duration::from_millis(self.enforcement_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults_under_config_dir() {
        let dir = TempDir::new().unwrap();
        let settings = GuardSettings::load(dir.path()).unwrap();
        assert_eq!(settings.poll_interval_ms, 2000);
        assert_eq!(settings.strategies, StrategyKind::ALL.to_vec());
        assert_eq!(settings.whitelist_file, dir.path().join("whitelist.json"));
        assert_eq!(settings.host_key_file, dir.path().join("host_key.pem"));
    }

    #[test]
    fn platform_timeouts_stay_under_powershell_limit() {
        let settings = GuardSettings::default();
        let limit = timing::POWERSHELL_TIMEOUT.as_millis() as u64;
        assert_eq!(settings.enumeration_timeout_ms, timing::ENUMERATION_TIMEOUT_MS);
        assert!(settings.enumeration_timeout_ms < limit);
        assert!(settings.verification_timeout_ms < limit);
        #[cfg(windows)]
        assert!(settings.enumeration_timeout_ms >= 5000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{ "poll_interval_ms": 500, "strategies": ["disable_device_node"], "whitelist_file": "/var/lib/dg/wl.json" }"#,
        )
        .unwrap();
        let settings = GuardSettings::load(dir.path()).unwrap();
        assert_eq!(settings.poll_interval_ms, 500);
        assert_eq!(settings.verification_timeout_ms, timing::VERIFICATION_TIMEOUT_MS);
        assert_eq!(settings.strategies, vec![StrategyKind::DisableDeviceNode]);
        assert_eq!(settings.whitelist_file, PathBuf::from("/var/lib/dg/wl.json"));
    }

    #[test]
    fn zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("settings.json"), r#"{ "poll_interval_ms": 0 }"#).unwrap();
        assert!(matches!(
            GuardSettings::load(dir.path()),
            Err(DevGuardError::InvalidConfig { ref field, .. }) if field == "poll_interval_ms"
        ));
    }

    #[test]
    fn empty_strategy_list_rejected() {
        let settings = GuardSettings {
            strategies: vec![],
            ..GuardSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_strategy_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("settings.json"), r#"{ "strategies": ["melt"] }"#).unwrap();
        assert!(matches!(GuardSettings::load(dir.path()), Err(DevGuardError::Config(_))));
    }

    #[test]
    #[serial]
    fn config_dir_env_override() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(paths::CONFIG_DIR_ENV, dir.path());
        assert_eq!(paths::config_dir(), dir.path());
        std::env::remove_var(paths::CONFIG_DIR_ENV);
    }
}
