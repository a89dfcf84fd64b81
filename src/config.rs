//! Host configuration.
//!
//! Settings load from an optional `host` file overlaid with `FUNCHOST_*`
//! environment variables; durations are written in milliseconds.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::manager::{MAX_LEASE_TIMEOUT, MIN_LEASE_TIMEOUT};
use crate::trace::TraceLevel;

/// When the per-function file log is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLoggingMode {
    Always,
    DebugOnly,
    Never,
}

/// Host-wide settings consumed by the lease manager and the trace writer
/// factory.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Logical host identity, shared by every instance of one deployment.
    #[serde(default)]
    pub host_id: String,
    /// Unique identity of this running instance.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Site (application) name, written to the relational log.
    #[serde(default)]
    pub site_name: String,
    /// Storage account the host lock lease lives in.
    #[serde(default)]
    pub account_name: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_lease_timeout"
    )]
    pub lease_timeout: Duration,
    /// Renewal cadence override; the manager derives one from the lease
    /// timeout when absent.
    #[serde(deserialize_with = "deserialize_opt_duration", default)]
    pub renewal_interval: Option<Duration>,
    #[serde(default = "default_file_logging_mode")]
    pub file_logging_mode: FileLoggingMode,
    #[serde(default = "default_root_log_path")]
    pub root_log_path: PathBuf,
    /// Minimum level kept by writers the factory creates.
    #[serde(default = "default_console_level")]
    pub console_level: TraceLevel,
    /// Set through `FUNCHOST_STANDALONE_MODE`; switches the factory to the
    /// relational sink combination.
    #[serde(default)]
    pub standalone_mode: bool,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = Option::<u64>::deserialize(deserializer)?;
    Ok(ms.map(Duration::from_millis))
}

fn default_instance_id() -> String {
    format!("instance-{}", std::process::id())
}

fn default_lease_timeout() -> Duration {
    crate::manager::DEFAULT_LEASE_TIMEOUT
}

fn default_file_logging_mode() -> FileLoggingMode {
    FileLoggingMode::DebugOnly
}

fn default_root_log_path() -> PathBuf {
    PathBuf::from("logs")
}

fn default_console_level() -> TraceLevel {
    TraceLevel::Info
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            instance_id: default_instance_id(),
            site_name: String::new(),
            account_name: String::new(),
            lease_timeout: default_lease_timeout(),
            renewal_interval: None,
            file_logging_mode: default_file_logging_mode(),
            root_log_path: default_root_log_path(),
            console_level: default_console_level(),
            standalone_mode: false,
        }
    }
}

impl HostConfig {
    /// Loads configuration from `host.toml` (or another supported format)
    /// and environment variables.
    ///
    /// # Priority (Highest first):
    /// 1. Environment variables (FUNCHOST_*)
    /// 2. `host` file
    /// 3. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("host").required(false))
            .add_source(config::Environment::with_prefix("FUNCHOST"));

        builder.build()?.try_deserialize()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host_id.trim().is_empty() {
            return Err("host_id must be configured".to_string());
        }
        if self.instance_id.trim().is_empty() {
            return Err("instance_id must not be blank".to_string());
        }
        if self.lease_timeout < MIN_LEASE_TIMEOUT || self.lease_timeout > MAX_LEASE_TIMEOUT {
            return Err(format!(
                "lease_timeout must lie within [{}s, {}s]",
                MIN_LEASE_TIMEOUT.as_secs(),
                MAX_LEASE_TIMEOUT.as_secs()
            ));
        }
        if let Some(renewal) = self.renewal_interval {
            if renewal >= self.lease_timeout {
                return Err("renewal_interval must be shorter than lease_timeout".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HostConfig {
        HostConfig {
            host_id: "host-1".to_string(),
            account_name: "account-1".to_string(),
            ..HostConfig::default()
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let config = HostConfig::default();
        assert_eq!(config.lease_timeout, Duration::from_secs(30));
        assert_eq!(config.file_logging_mode, FileLoggingMode::DebugOnly);
        assert_eq!(config.console_level, TraceLevel::Info);
        assert!(!config.standalone_mode);
        assert!(config.instance_id.starts_with("instance-"));
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_host_id() {
        let config = HostConfig {
            host_id: String::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_timeout() {
        let config = HostConfig {
            lease_timeout: Duration::from_secs(5),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_long_renewal_interval() {
        let config = HostConfig {
            renewal_interval: Some(Duration::from_secs(45)),
            lease_timeout: Duration::from_secs(30),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_logging_mode_deserializes_lowercase() {
        let mode: FileLoggingMode = serde_json::from_str("\"debugonly\"").unwrap();
        assert_eq!(mode, FileLoggingMode::DebugOnly);
        let mode: FileLoggingMode = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(mode, FileLoggingMode::Never);
    }
}
