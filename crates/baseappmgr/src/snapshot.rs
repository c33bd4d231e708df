//! Serializable image of the manager's state.
//!
//! A snapshot lets a restarted manager pick up the registry, shared data and
//! global bases where the previous instance left them. Channels are not part
//! of it; they are reopened on restore.

use serde::{Deserialize, Serialize};

use mercury::Address;

use crate::error::ManagerError;
use crate::global_bases::GlobalBases;
use crate::interface::BaseAppId;
use crate::shared_data::SharedData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAppRecord {
    pub addr: Address,
    pub external_addr: Address,
    pub id: BaseAppId,
    pub load: f32,
    pub num_bases: u32,
    pub num_proxies: u32,
    pub backup: Option<Address>,
    pub retiring: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub addr: Address,
    pub id: BaseAppId,
    pub backing_up: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub last_id: BaseAppId,
    pub game_time: u64,
    pub base_apps: Vec<BaseAppRecord>,
    pub backups: Vec<BackupRecord>,
    pub shared_data: SharedData,
    pub global_bases: GlobalBases,
}

impl RegistrySnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManagerError> {
        bincode::serialize(self).map_err(|e| ManagerError::Snapshot(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManagerError> {
        bincode::deserialize(bytes).map_err(|e| ManagerError::Snapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_snapshot_rejected() {
        let snapshot = RegistrySnapshot {
            last_id: 3,
            game_time: 100,
            base_apps: vec![BaseAppRecord {
                addr: "10.0.0.1:1".parse().unwrap(),
                external_addr: "1.2.3.4:5".parse().unwrap(),
                id: 3,
                load: 0.5,
                num_bases: 1,
                num_proxies: 0,
                backup: None,
                retiring: false,
            }],
            backups: Vec::new(),
            shared_data: SharedData::new(),
            global_bases: GlobalBases::new(),
        };
        let bytes = snapshot.to_bytes().unwrap();
        assert!(RegistrySnapshot::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
