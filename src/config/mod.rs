use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub detector: DetectorConfig,
    pub report: ReportConfig,
    pub mail: MailConfig,
    pub security: SecurityConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// API server address
    pub address: String,
    /// API server port
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Shard store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding the registry snapshot, daily activity shards
    /// and the master footfall index
    pub data_dir: PathBuf,
}

/// Offline detector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorConfig {
    /// Seconds since the last heartbeat before a device counts as offline
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: u64,
    /// Interval in seconds between detector scans
    #[serde(default = "default_detector_interval")]
    pub check_interval_secs: u64,
    /// Delivery attempts per outage before the alert latch is forced
    #[serde(default = "default_max_alert_attempts")]
    pub max_alert_attempts: u32,
}

fn default_offline_threshold() -> u64 {
    300
}

fn default_detector_interval() -> u64 {
    60
}

fn default_max_alert_attempts() -> u32 {
    3
}

/// Scheduled report job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Whether the scheduled report job runs at all
    pub enabled: bool,
    /// Interval in seconds between scheduled report runs
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
    /// Whether to ask devices to push fresh shards before building a report
    #[serde(default)]
    pub pull_before_report: bool,
    /// Timeout in seconds for a single device pull
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
}

fn default_report_interval() -> u64 {
    86400
}

fn default_pull_timeout() -> u64 {
    10
}

/// Outbound mail configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailConfig {
    /// Directory where mail envelopes are handed to the external transport
    pub outbox_dir: PathBuf,
    /// Recipient for alerts and scheduled reports
    pub recipient: String,
    /// Timeout in seconds for a single delivery
    #[serde(default = "default_mail_timeout")]
    pub timeout_secs: u64,
}

fn default_mail_timeout() -> u64 {
    10
}

/// Security configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    /// Static token required in `x-admin-token` on privileged routes.
    /// Empty disables the check.
    #[serde(default)]
    pub admin_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                address: "0.0.0.0".to_string(),
                port: 5000,
                log_level: "info".to_string(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("./data"),
            },
            detector: DetectorConfig {
                offline_threshold_secs: default_offline_threshold(),
                check_interval_secs: default_detector_interval(),
                max_alert_attempts: default_max_alert_attempts(),
            },
            report: ReportConfig {
                enabled: true,
                interval_secs: default_report_interval(),
                pull_before_report: false,
                pull_timeout_secs: default_pull_timeout(),
            },
            mail: MailConfig {
                outbox_dir: PathBuf::from("./data/outbox"),
                recipient: "fleet-alerts@localhost".to_string(),
                timeout_secs: default_mail_timeout(),
            },
            security: SecurityConfig::default(),
        }
    }
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            let config = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            };

            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
