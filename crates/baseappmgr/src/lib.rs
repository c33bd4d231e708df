//! # BaseApp Manager
//!
//! Registry of the BaseApps in a cluster and the process that coordinates
//! them over Mercury.
//!
//! ## Responsibilities
//!
//! - Assigning ids to BaseApps and backup BaseApps as they register
//! - Tracking load reports and choosing where new entities are created
//! - Detecting BaseApp death and restoring entities on a backup
//! - Holding shared data and globally registered bases
//! - Driving controlled shutdown stage by stage
//!
//! The [`BaseAppRegistry`] is usable on its own; [`BaseAppMgr`] wires it to
//! a [`mercury::Nub`] through the manager interface table.

pub mod base_app;
pub mod config;
pub mod error;
pub mod global_bases;
pub mod interface;
pub mod manager;
pub mod registry;
pub mod shared_data;
pub mod shutdown;
pub mod snapshot;

pub use base_app::{BackupBaseApp, BaseApp};
pub use config::BaseAppMgrConfig;
pub use error::ManagerError;
pub use global_bases::GlobalBases;
pub use interface::{BaseAppId, EntityMailBox, HealthSummary};
pub use manager::BaseAppMgr;
pub use registry::BaseAppRegistry;
pub use shared_data::{SharedData, SharedDataType};
pub use shutdown::{ShutDownStage, ShutdownCoordinator};
pub use snapshot::{BackupRecord, BaseAppRecord, RegistrySnapshot};
