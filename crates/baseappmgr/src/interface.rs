//! # Manager and BaseApp Interfaces
//!
//! Message ids and argument types exchanged between the BaseApp manager,
//! BaseApps and backup BaseApps. All arguments are `serde` structs carried
//! as `bincode` payloads.

use serde::{Deserialize, Serialize};

use mercury::{Address, InterfaceElement};

use crate::shared_data::SharedDataType;
use crate::shutdown::ShutDownStage;

/// Interface id of the BaseApp manager.
pub const BASE_APP_MGR_INTERFACE: u8 = 1;
/// Interface id of BaseApps and backup BaseApps.
pub const BASE_APP_INTERFACE: u8 = 2;
/// Interface id of the database manager.
pub const DB_MGR_INTERFACE: u8 = 3;

/// Names under which processes announce themselves.
pub const BASE_APP_MGR_NAME: &str = "BaseAppMgrInterface";
pub const BASE_APP_NAME: &str = "BaseAppInterface";
pub const DB_MGR_NAME: &str = "DBMgrInterface";

/// Identifier the manager assigns to a BaseApp or backup.
pub type BaseAppId = u32;

/// Messages understood by the BaseApp manager.
pub mod manager {
    use super::*;

    const fn element(method: u8, name: &'static str) -> InterfaceElement {
        InterfaceElement::new(BASE_APP_MGR_INTERFACE, method, name)
    }

    pub const ADD: InterfaceElement = element(0, "add");
    pub const ADD_BACKUP: InterfaceElement = element(1, "addBackup");
    pub const DEL: InterfaceElement = element(2, "del");
    pub const INFORM_OF_LOAD: InterfaceElement = element(3, "informOfLoad");
    pub const SHUT_DOWN: InterfaceElement = element(4, "shutDown");
    pub const CONTROLLED_SHUT_DOWN: InterfaceElement = element(5, "controlledShutDown");
    pub const CHECK_STATUS: InterfaceElement = element(6, "checkStatus");
    pub const CREATE_BASE_ENTITY: InterfaceElement = element(7, "createBaseEntity");
    pub const SET_SHARED_DATA: InterfaceElement = element(8, "setSharedData");
    pub const DEL_SHARED_DATA: InterfaceElement = element(9, "delSharedData");
    pub const REGISTER_BASE_GLOBALLY: InterfaceElement = element(10, "registerBaseGlobally");
    pub const DEREGISTER_BASE_GLOBALLY: InterfaceElement = element(11, "deregisterBaseGlobally");
    pub const RECOVER_BASE_APP: InterfaceElement = element(12, "recoverBaseApp");
    pub const HANDLE_BASE_APP_DEATH: InterfaceElement = element(13, "handleBaseAppDeath");
    pub const SHUT_DOWN_STAGE_ACK: InterfaceElement = element(14, "shutDownStageAck");
}

/// Messages understood by BaseApps and backup BaseApps.
pub mod base_app {
    use super::*;

    const fn element(method: u8, name: &'static str) -> InterfaceElement {
        InterfaceElement::new(BASE_APP_INTERFACE, method, name)
    }

    pub const SHUT_DOWN: InterfaceElement = element(0, "shutDown");
    pub const SHUT_DOWN_STAGE: InterfaceElement = element(1, "startShutDownStage");
    pub const HANDLE_BASE_APP_DEATH: InterfaceElement = element(2, "handleBaseAppDeath");
    pub const SET_SHARED_DATA: InterfaceElement = element(3, "setSharedData");
    pub const DEL_SHARED_DATA: InterfaceElement = element(4, "delSharedData");
    pub const SET_BACKUP: InterfaceElement = element(5, "setBackup");
    pub const UPDATE_CREATE_BASE_INFO: InterfaceElement = element(6, "updateCreateBaseInfo");
    pub const ADD_GLOBAL_BASE: InterfaceElement = element(7, "addGlobalBase");
    pub const DEL_GLOBAL_BASE: InterfaceElement = element(8, "delGlobalBase");
    pub const CREATE_BASE: InterfaceElement = element(9, "createBase");
    pub const RESTORE_ENTITIES: InterfaceElement = element(10, "restoreEntities");
    pub const START_BACKUP: InterfaceElement = element(11, "startBackup");
    pub const STOP_BACKUP: InterfaceElement = element(12, "stopBackup");
}

/// Messages understood by the database manager.
pub mod db_mgr {
    use super::*;

    pub const CONTROLLED_SHUT_DOWN: InterfaceElement =
        InterfaceElement::new(DB_MGR_INTERFACE, 0, "controlledShutDown");
}

/// Mailbox addressing one entity on one BaseApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMailBox {
    pub id: u32,
    pub addr: Address,
    pub entity_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddArgs {
    /// Address clients connect to
    pub external_addr: Address,
}

/// Reply to a successful `add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReply {
    pub id: BaseAppId,
    /// Game time of the manager, in ticks
    pub game_time: u64,
    /// Where new bases should currently be created
    pub create_base_addr: Address,
    pub shared_base_app_data: Vec<(String, String)>,
    pub shared_global_data: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAddReply {
    pub id: BaseAppId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelArgs {
    pub id: BaseAppId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InformOfLoadArgs {
    pub load: f32,
    pub num_bases: u32,
    pub num_proxies: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutDownArgs {
    /// Whether the BaseApps should be told to stop as well
    pub shut_down_others: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutDownStageArgs {
    pub stage: ShutDownStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBaseArgs {
    pub entity_type: u16,
    pub properties: Vec<u8>,
}

/// Outcome of a `createBaseEntity` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateBaseResult {
    Created(EntityMailBox),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataEntry {
    pub kind: SharedDataType,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataKey {
    pub kind: SharedDataType,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalBaseArgs {
    pub name: String,
    pub mailbox: EntityMailBox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalBaseName {
    pub name: String,
}

/// A BaseApp re-registering with a restarted manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverBaseAppArgs {
    pub id: BaseAppId,
    pub external_addr: Address,
    pub backup: Option<Address>,
    pub global_bases: Vec<(String, EntityMailBox)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleBaseAppDeathArgs {
    pub addr: Address,
}

/// Tells BaseApps that a peer died and where its entities went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseAppDeathArgs {
    pub dead: Address,
    pub restored_at: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBackupArgs {
    pub backup: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBaseInfo {
    pub best: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreEntitiesArgs {
    pub dead: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub base_app: Address,
}

/// Reply to `checkStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub num_base_apps: usize,
    pub num_backups: usize,
    pub num_bases: u32,
    pub num_proxies: u32,
    pub min_load: f32,
    pub avg_load: f32,
    pub max_load: f32,
    pub game_time: u64,
    pub accepting_new_base_apps: bool,
    pub shut_down_stage: ShutDownStage,
    pub db_mgr: Option<Address>,
    pub num_global_bases: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury::{decode_payload, encode_payload};

    #[test]
    fn test_element_ids_are_unique() {
        let elements = [
            manager::ADD,
            manager::ADD_BACKUP,
            manager::DEL,
            manager::INFORM_OF_LOAD,
            manager::SHUT_DOWN,
            manager::CONTROLLED_SHUT_DOWN,
            manager::CHECK_STATUS,
            manager::CREATE_BASE_ENTITY,
            manager::SET_SHARED_DATA,
            manager::DEL_SHARED_DATA,
            manager::REGISTER_BASE_GLOBALLY,
            manager::DEREGISTER_BASE_GLOBALLY,
            manager::RECOVER_BASE_APP,
            manager::HANDLE_BASE_APP_DEATH,
            manager::SHUT_DOWN_STAGE_ACK,
        ];
        let mut ids: Vec<(u8, u8)> = elements.iter().map(|e| (e.interface, e.method)).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), elements.len());
    }

    #[test]
    fn test_replies_are_never_empty() {
        // An empty payload means "not ready", so real replies must carry bytes
        let reply = BackupAddReply { id: 0 };
        assert!(!encode_payload(&reply).unwrap().is_empty());
        let result = CreateBaseResult::Failed(String::new());
        let bytes = encode_payload(&result).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(decode_payload::<CreateBaseResult>(&bytes).unwrap(), result);
    }
}
