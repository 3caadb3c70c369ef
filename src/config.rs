//! TOML configuration loading and validation.
//!
//! Five sections: `[daemon]`, `[sensor]`, `[storage]`, `[alerts]`,
//! `[monitoring]`. Every field has a default so a partial (or missing) file
//! still produces a usable configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub sampling_interval_seconds: u64,
    pub data_retention_days: u64,
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            sampling_interval_seconds: 30,
            data_retention_days: 365,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub i2c_device: String,
    pub i2c_address: u8,
    pub connection_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            i2c_device: "/dev/i2c-1".to_string(),
            i2c_address: 0x62,
            connection_timeout_ms: 1000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_directory: String,
    pub file_rotation_hours: u64,
    pub compression_enabled: bool,
    pub max_memory_cache_mb: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_directory: "/var/lib/sensor-daemon".to_string(),
            file_rotation_hours: 24,
            compression_enabled: true,
            max_memory_cache_mb: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub min_sensor_success_rate: f64,
    pub min_storage_success_rate: f64,
    pub alert_cooldown_minutes: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            max_memory_mb: 15.0,
            max_cpu_percent: 75.0,
            min_sensor_success_rate: 0.8,
            min_storage_success_rate: 0.95,
            alert_cooldown_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub health_endpoint_enabled: bool,
    pub http_server_port: u16,
    pub http_server_bind_address: String,
    pub status_file_path: Option<String>,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            health_endpoint_enabled: true,
            http_server_port: 8080,
            http_server_bind_address: "127.0.0.1".to_string(),
            status_file_path: None,
        }
    }
}

impl MonitoringSettings {
    pub fn bind_addr(&self) -> Result<IpAddr, ConfigError> {
        self.http_server_bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!(
                "monitoring.http_server_bind_address '{}' is not a valid IP address",
                self.http_server_bind_address
            )))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub sensor: SensorSettings,
    pub storage: StorageSettings,
    pub alerts: AlertSettings,
    pub monitoring: MonitoringSettings,
}

impl DaemonConfig {
    /// Configuration with every field at its documented default.
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DaemonConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3600).contains(&self.daemon.sampling_interval_seconds) {
            return Err(ConfigError::Invalid(format!(
                "daemon.sampling_interval_seconds must be in 1..=3600, got {}",
                self.daemon.sampling_interval_seconds
            )));
        }
        if self.daemon.data_retention_days == 0 {
            return Err(ConfigError::Invalid(
                "daemon.data_retention_days must be at least 1".to_string(),
            ));
        }
        if !matches!(
            self.daemon.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "daemon.log_level '{}' is not one of trace/debug/info/warn/error",
                self.daemon.log_level
            )));
        }

        if !(0x08..=0x77).contains(&self.sensor.i2c_address) {
            return Err(ConfigError::Invalid(format!(
                "sensor.i2c_address 0x{:02x} is outside the valid 7-bit range 0x08..=0x77",
                self.sensor.i2c_address
            )));
        }
        if !(100..=10_000).contains(&self.sensor.connection_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "sensor.connection_timeout_ms must be in 100..=10000, got {}",
                self.sensor.connection_timeout_ms
            )));
        }

        if self.storage.data_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.data_directory must not be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.alerts.min_sensor_success_rate)
            || !(0.0..=1.0).contains(&self.alerts.min_storage_success_rate)
        {
            return Err(ConfigError::Invalid(
                "alerts.min_sensor_success_rate and min_storage_success_rate must be in 0.0..=1.0"
                    .to_string(),
            ));
        }

        self.monitoring.bind_addr()?;

        Ok(())
    }

    pub fn retention_seconds(&self) -> u64 {
        self.daemon.data_retention_days * 24 * 3600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DaemonConfig::default_config().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_i2c_address() {
        let mut config = DaemonConfig::default_config();
        config.sensor.i2c_address = 0x00;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_sampling_interval() {
        let mut config = DaemonConfig::default_config();
        config.daemon.sampling_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_sampling_interval() {
        let mut config = DaemonConfig::default_config();
        config.daemon.sampling_interval_seconds = 3601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = DaemonConfig::default_config();
        config.daemon.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let text = r#"
            [sensor]
            i2c_address = 0x62
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.sensor.i2c_address, 0x62);
        assert_eq!(config.daemon.sampling_interval_seconds, 30);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_bind_address() {
        let mut config = DaemonConfig::default_config();
        config.monitoring.http_server_bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }
}
