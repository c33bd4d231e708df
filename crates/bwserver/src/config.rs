//! Configuration management for the cluster server processes.
//!
//! This module handles loading, validation and conversion of the TOML
//! configuration into the types used by the Nub, the manager and BaseApps.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use tracing::info;

use baseappmgr::BaseAppMgrConfig;
use mercury::{Address, NubConfig, ResendPolicy};
use server_common::{JoinConfig, LookupConfig};

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Networking shared by every process
    pub nub: NubSettings,
    /// BaseApp manager settings
    #[serde(default)]
    pub baseappmgr: ManagerSettings,
    /// BaseApp worker settings
    #[serde(default)]
    pub baseapp: BaseAppSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Socket and channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NubSettings {
    /// Address to bind (port 0 picks one)
    pub bind_address: String,
    /// Addresses receiving birth and death announcements and queries
    pub announce_addresses: Vec<String>,
    pub resend_period_ms: u64,
    pub irregular_resend_period_ms: u64,
    pub max_resends: u32,
    pub max_reorder_window: usize,
    pub tick_interval_ms: u64,
    pub reply_timeout_ms: u64,
    pub max_protocol_errors: u32,
    pub channel_idle_timeout_secs: u64,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

/// BaseApp manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub update_hertz: u32,
    pub base_app_overload_level: f32,
    pub update_create_base_info_period: u32,
    pub base_app_timeout_secs: u64,
    pub shut_down_server_on_base_app_death: bool,
    pub only_use_backup_on_same_machine: bool,
    pub allow_new_base_apps: bool,
    pub shut_down_stage_timeout_secs: u64,
    /// Look for a DBMgr on start up
    pub db_mgr_lookup: bool,
    pub db_mgr_lookup_retries: u32,
    pub db_mgr_lookup_timeout_ms: u64,
    /// File the registry is restored from and saved to on exit
    pub snapshot_path: Option<String>,
}

/// BaseApp worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseAppSettings {
    /// Address handed to clients; the bind address when unset
    pub external_address: Option<String>,
    /// Manager address; located by interface query when unset
    pub manager_address: Option<String>,
    pub join_max_retries: u32,
    pub join_retry_interval_ms: u64,
    pub load_report_interval_ms: u64,
    /// Entities at which the worker reports full load
    pub capacity: u32,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for NubSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:20013".to_string(),
            announce_addresses: vec![],
            resend_period_ms: 200,
            irregular_resend_period_ms: 1000,
            max_resends: 10,
            max_reorder_window: 256,
            tick_interval_ms: 50,
            reply_timeout_ms: 5000,
            max_protocol_errors: 10,
            channel_idle_timeout_secs: 60,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            update_hertz: 10,
            base_app_overload_level: 0.9,
            update_create_base_info_period: 10,
            base_app_timeout_secs: 5,
            shut_down_server_on_base_app_death: false,
            only_use_backup_on_same_machine: false,
            allow_new_base_apps: true,
            shut_down_stage_timeout_secs: 10,
            db_mgr_lookup: true,
            db_mgr_lookup_retries: 5,
            db_mgr_lookup_timeout_ms: 1000,
            snapshot_path: None,
        }
    }
}

impl Default for BaseAppSettings {
    fn default() -> Self {
        Self {
            external_address: None,
            manager_address: None,
            join_max_retries: 3,
            join_retry_interval_ms: 1000,
            load_report_interval_ms: 1000,
            capacity: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nub: NubSettings::default(),
            baseappmgr: ManagerSettings::default(),
            baseapp: BaseAppSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

fn parse_addr(field: &str, value: &str) -> anyhow::Result<Address> {
    value
        .parse::<Address>()
        .with_context(|| format!("Invalid {field}: {value}"))
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks addresses, levels and ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_addr("bind address", &self.nub.bind_address)?;
        for addr in &self.nub.announce_addresses {
            parse_addr("announce address", addr)?;
        }
        if let Some(addr) = &self.baseapp.external_address {
            parse_addr("external address", addr)?;
        }
        if let Some(addr) = &self.baseapp.manager_address {
            parse_addr("manager address", addr)?;
        }

        if self.nub.max_resends == 0 {
            bail!("max_resends must be at least 1");
        }
        if self.nub.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        if self.baseappmgr.update_hertz == 0 {
            bail!("update_hertz must be positive");
        }
        if !(0.0..=1.0).contains(&self.baseappmgr.base_app_overload_level) {
            bail!(
                "base_app_overload_level must be within [0, 1], got {}",
                self.baseappmgr.base_app_overload_level
            );
        }
        if self.baseapp.capacity == 0 {
            bail!("BaseApp capacity must be positive");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            );
        }
        Ok(())
    }

    pub fn to_nub_config(&self) -> anyhow::Result<NubConfig> {
        let announce_addresses = self
            .nub
            .announce_addresses
            .iter()
            .map(|a| parse_addr("announce address", a))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(NubConfig {
            bind_address: parse_addr("bind address", &self.nub.bind_address)?,
            announce_addresses,
            resend: ResendPolicy {
                resend_period: Duration::from_millis(self.nub.resend_period_ms),
                irregular_resend_period: Duration::from_millis(self.nub.irregular_resend_period_ms),
                max_resends: self.nub.max_resends,
                max_reorder_window: self.nub.max_reorder_window,
            },
            tick_interval: Duration::from_millis(self.nub.tick_interval_ms),
            reply_timeout: Duration::from_millis(self.nub.reply_timeout_ms),
            max_protocol_errors: self.nub.max_protocol_errors,
            channel_idle_timeout: Duration::from_secs(self.nub.channel_idle_timeout_secs),
            send_buffer_size: self.nub.send_buffer_size,
            recv_buffer_size: self.nub.recv_buffer_size,
        })
    }

    pub fn to_manager_config(&self) -> BaseAppMgrConfig {
        let m = &self.baseappmgr;
        BaseAppMgrConfig {
            update_hertz: m.update_hertz,
            base_app_overload_level: m.base_app_overload_level,
            update_create_base_info_period: m.update_create_base_info_period,
            base_app_timeout: Duration::from_secs(m.base_app_timeout_secs),
            shut_down_server_on_base_app_death: m.shut_down_server_on_base_app_death,
            only_use_backup_on_same_machine: m.only_use_backup_on_same_machine,
            allow_new_base_apps: m.allow_new_base_apps,
            shut_down_stage_timeout: Duration::from_secs(m.shut_down_stage_timeout_secs),
            db_mgr_lookup: m.db_mgr_lookup.then(|| LookupConfig {
                num_retries: m.db_mgr_lookup_retries,
                lookup_timeout: Duration::from_millis(m.db_mgr_lookup_timeout_ms),
            }),
        }
    }

    pub fn to_join_config(&self) -> JoinConfig {
        JoinConfig {
            max_retries: self.baseapp.join_max_retries,
            retry_interval: Duration::from_millis(self.baseapp.join_retry_interval_ms),
            reply_timeout: Duration::from_millis(self.nub.reply_timeout_ms),
        }
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.baseappmgr.snapshot_path.as_ref().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.to_manager_config().tick_interval(), Duration::from_millis(100));
        assert_eq!(config.to_nub_config().unwrap().resend, ResendPolicy::default());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bwserver.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        // The written file loads back to the same values
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[nub]
bind_address = "0.0.0.0:30001"
announce_addresses = ["10.0.0.255:20018"]
max_resends = 4

[baseappmgr]
update_hertz = 20
base_app_overload_level = 0.75
db_mgr_lookup = false
snapshot_path = "/tmp/baseappmgr.snap"

[logging]
level = "debug"
json_format = true
"#;

        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert!(config.validate().is_ok());

        let nub = config.to_nub_config().unwrap();
        assert_eq!(nub.bind_address, "0.0.0.0:30001".parse().unwrap());
        assert_eq!(nub.announce_addresses.len(), 1);
        assert_eq!(nub.resend.max_resends, 4);
        assert_eq!(nub.reply_timeout, Duration::from_secs(5));

        let manager = config.to_manager_config();
        assert_eq!(manager.update_hertz, 20);
        assert!(manager.db_mgr_lookup.is_none());
        assert_eq!(manager.update_create_base_info_period, 10);

        assert_eq!(config.baseapp, BaseAppSettings::default());
        assert_eq!(config.snapshot_path(), Some(PathBuf::from("/tmp/baseappmgr.snap")));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.nub.bind_address = "localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.baseappmgr.base_app_overload_level = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.nub.max_resends = 0;
        assert!(config.validate().is_err());
    }
}
