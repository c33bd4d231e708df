//! # Mercury
//!
//! Reliable, ordered messaging between the processes of a server cluster,
//! carried over UDP.
//!
//! ## Core Concepts
//!
//! - **Address**: an IPv4 address and port identifying one process endpoint
//! - **Channel**: the reliable, ordered stream to one remote address, with
//!   resends and a one-way liveness flag
//! - **ChannelOwner**: keeps a channel alive and can re-point it at a new address
//! - **Nub**: the per-process dispatcher owning sockets, channels, timers,
//!   pending replies and birth/death listeners
//! - **InterfaceTable**: static mapping from message ids to handler functions
//!
//! ## Dispatch Model
//!
//! A process runs one Nub on one task. Handlers run to completion and never
//! block; waiting is expressed with timers and reply callbacks through the
//! [`NubHandler`] trait.
//!
//! ```rust,no_run
//! use mercury::{InterfaceTable, Nub, NubConfig, NubHandler};
//!
//! struct Idle;
//! impl NubHandler for Idle {}
//!
//! # async fn example() -> Result<(), mercury::MercuryError> {
//! let mut nub = Nub::bind(NubConfig::default())?;
//! let table: InterfaceTable<Idle> = InterfaceTable::new("IdleInterface");
//! nub.run(&mut Idle, &table).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod channel;
pub mod channel_owner;
pub mod error;
pub mod interface;
pub mod machine;
pub mod nub;
mod timers;
pub mod wire;

pub use address::Address;
pub use channel::{Channel, ChannelKind, ChannelStats, ResendPolicy};
pub use channel_owner::ChannelOwner;
pub use error::{FailureReason, MercuryError};
pub use interface::{Incoming, InterfaceElement, InterfaceTable, MessageHandlerFn, MACHINE_INTERFACE};
pub use machine::{Announcement, ListenerTag};
pub use nub::{InterruptHandle, Nub, NubConfig, NubHandler, NubStats};
pub use timers::TimerId;
pub use wire::{decode_payload, encode_payload, ReplyId};
