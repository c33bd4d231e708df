//! Manager configuration types and defaults.

use tokio::time::Duration;

use server_common::LookupConfig;

/// Configuration of the BaseApp manager.
///
/// Contains the tick rate, placement thresholds, failure detection and
/// shutdown parameters.
#[derive(Debug, Clone)]
pub struct BaseAppMgrConfig {
    /// Game ticks per second
    pub update_hertz: u32,

    /// Load above which a BaseApp receives no new entities
    pub base_app_overload_level: f32,

    /// Ticks between broadcasts of the best BaseApp for entity creation
    pub update_create_base_info_period: u32,

    /// A BaseApp silent for this long is considered dead
    pub base_app_timeout: Duration,

    /// Shut the whole server down when a BaseApp dies
    pub shut_down_server_on_base_app_death: bool,

    /// Only pair BaseApps with backups on the same host
    pub only_use_backup_on_same_machine: bool,

    /// Whether new BaseApps may register
    pub allow_new_base_apps: bool,

    /// Time each controlled shutdown stage waits for acknowledgements
    pub shut_down_stage_timeout: Duration,

    /// Lookup of the database manager; `None` disables it
    pub db_mgr_lookup: Option<LookupConfig>,
}

impl BaseAppMgrConfig {
    /// Interval between game ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.update_hertz.max(1)
    }
}

impl Default for BaseAppMgrConfig {
    fn default() -> Self {
        Self {
            update_hertz: 10,
            base_app_overload_level: 0.9,
            update_create_base_info_period: 10,
            base_app_timeout: Duration::from_secs(5),
            shut_down_server_on_base_app_death: false,
            only_use_backup_on_same_machine: false,
            allow_new_base_apps: true,
            shut_down_stage_timeout: Duration::from_secs(10),
            db_mgr_lookup: Some(LookupConfig::default()),
        }
    }
}
