use crate::DeviceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_UNMOUNT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub probe_timeout_ms: u64,
    pub unmount_timeout_ms: u64,
    /// Eject or power off the device once its volume is unmounted.
    pub eject_after_unmount: bool,
    /// `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            unmount_timeout_ms: DEFAULT_UNMOUNT_TIMEOUT_MS,
            eject_after_unmount: false,
            log_file: None,
            log_filter: "info".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Read a JSON config file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, DeviceError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SUBDEVIL_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self, DeviceError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides<F>(mut self, lookup: F) -> Result<Self, DeviceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SUBDEVIL_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse_millis("SUBDEVIL_PROBE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("SUBDEVIL_UNMOUNT_TIMEOUT_MS") {
            self.unmount_timeout_ms = parse_millis("SUBDEVIL_UNMOUNT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("SUBDEVIL_EJECT") {
            self.eject_after_unmount = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(DeviceError::Configuration(format!(
                        "SUBDEVIL_EJECT must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(value) = lookup("SUBDEVIL_LOG_FILE") {
            self.log_file = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(value) = lookup("SUBDEVIL_LOG") {
            self.log_filter = value;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.probe_timeout_ms == 0 {
            return Err(DeviceError::Configuration(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.unmount_timeout_ms == 0 {
            return Err(DeviceError::Configuration(
                "unmount_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.unmount_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, DeviceError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| DeviceError::Configuration(format!("{} must be milliseconds: {}", key, e)))
}
