//! Components shared by the server processes built on Mercury.
//!
//! - [`AnonymousChannelClient`]: finds a singleton service by interface name
//!   and keeps a channel to it
//! - [`AddToManagerHelper`]: bounded-retry registration of a worker with its
//!   manager

pub mod add_to_manager_helper;
pub mod anonymous_channel_client;

pub use add_to_manager_helper::{AddToManagerHelper, JoinConfig, JoinError, JoinProgress, JoinState};
pub use anonymous_channel_client::{AnonymousChannelClient, ClientState, LookupConfig, LookupProgress};
