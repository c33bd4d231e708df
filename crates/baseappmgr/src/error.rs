//! Error types for the BaseApp manager.

use mercury::{Address, MercuryError};

use crate::interface::BaseAppId;

/// Errors raised by registry and manager operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    /// Every BaseApp is overloaded, retiring or dead
    #[error("No BaseApp has capacity for new entities")]
    CapacityExhausted,
    #[error("Unknown BaseApp {0}")]
    UnknownBaseApp(Address),
    #[error("Global base '{0}' is already registered")]
    DuplicateGlobalBase(String),
    /// The manager is shutting down or new BaseApps are disallowed
    #[error("Not accepting new BaseApps")]
    NotAccepting,
    #[error("BaseApp {0} is already registered")]
    AlreadyRegistered(Address),
    /// A recovering BaseApp claimed an id that a live process holds
    #[error("BaseApp id {id} claimed by {addr} is already in use")]
    DuplicateId { id: BaseAppId, addr: Address },
    #[error("Invalid load report from {addr}: {load}")]
    InvalidLoad { addr: Address, load: f32 },
    #[error("Snapshot error: {0}")]
    Snapshot(String),
    #[error("Transport error: {0}")]
    Mercury(#[from] MercuryError),
}
