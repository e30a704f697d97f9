//! Monitoring configuration, consulted once at initialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{HwmonError, Result};

/// What the host process was started to do.
///
/// Hardware monitoring only activates for actual device compute work;
/// informational and query invocations run without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Long-running device compute work.
    Compute,
    /// Informational query against inputs or past results.
    Query,
    /// Show/list style command.
    Show,
    /// Usage display.
    Usage,
    /// Version display.
    Version,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Compute => write!(f, "compute"),
            RunMode::Query => write!(f, "query"),
            RunMode::Show => write!(f, "show"),
            RunMode::Usage => write!(f, "usage"),
            RunMode::Version => write!(f, "version"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compute" => Ok(RunMode::Compute),
            "query" => Ok(RunMode::Query),
            "show" => Ok(RunMode::Show),
            "usage" => Ok(RunMode::Usage),
            "version" => Ok(RunMode::Version),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

/// Hardware-monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwmonConfig {
    pub run_mode: RunMode,

    /// Explicit monitoring kill switch.
    pub hwmon_disabled: bool,

    /// Backend-specific options (e.g. an alternate sysfs root).
    pub backend_options: HashMap<String, serde_json::Value>,
}

impl Default for HwmonConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Compute,
            hwmon_disabled: false,
            backend_options: HashMap::new(),
        }
    }
}

impl HwmonConfig {
    pub fn new(run_mode: RunMode) -> Self {
        Self {
            run_mode,
            ..Self::default()
        }
    }

    pub fn with_monitoring_disabled(mut self, disabled: bool) -> Self {
        self.hwmon_disabled = disabled;
        self
    }

    pub fn with_backend_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.backend_options.insert(key.into(), value);
        self
    }

    pub fn backend_option(&self, key: &str) -> Option<&serde_json::Value> {
        self.backend_options.get(key)
    }

    /// Whether this run should bring up hardware monitoring at all.
    pub fn monitoring_active(&self) -> bool {
        self.run_mode == RunMode::Compute && !self.hwmon_disabled
    }

    /// Check option sanity before a context consumes the config.
    pub fn validate(&self) -> Result<()> {
        if self.backend_options.keys().any(|key| key.is_empty()) {
            return Err(HwmonError::Configuration(
                "backend option with empty key".to_string(),
            ));
        }
        if let Some(root) = self.backend_options.get("sysfs_root") {
            if !root.is_string() {
                return Err(HwmonError::Configuration(
                    "sysfs_root must be a string".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_monitors() {
        let config = HwmonConfig::default();
        assert_eq!(config.run_mode, RunMode::Compute);
        assert!(config.monitoring_active());
    }

    #[test]
    fn test_informational_modes_short_circuit() {
        for mode in [RunMode::Query, RunMode::Show, RunMode::Usage, RunMode::Version] {
            assert!(!HwmonConfig::new(mode).monitoring_active());
        }
    }

    #[test]
    fn test_kill_switch() {
        let config = HwmonConfig::default().with_monitoring_disabled(true);
        assert!(!config.monitoring_active());
    }

    #[test]
    fn test_run_mode_parsing() {
        assert_eq!("compute".parse::<RunMode>().unwrap(), RunMode::Compute);
        assert_eq!("VERSION".parse::<RunMode>().unwrap(), RunMode::Version);
        assert!("benchmark".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(HwmonConfig::default().validate().is_ok());

        let config = HwmonConfig::default()
            .with_backend_option("sysfs_root", serde_json::json!(42));
        assert!(config.validate().is_err());

        let config = HwmonConfig::default().with_backend_option("", serde_json::json!(true));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_options_round_trip() {
        let config = HwmonConfig::default()
            .with_backend_option("sysfs_root", serde_json::json!("/sys/bus/pci/devices"));

        let json = serde_json::to_string(&config).unwrap();
        let back: HwmonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.backend_option("sysfs_root").and_then(|v| v.as_str()),
            Some("/sys/bus/pci/devices")
        );
    }
}
