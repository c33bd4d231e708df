//! # Interfaces and Message Dispatch
//!
//! An interface is the set of messages a process role understands. Each
//! message is described by an [`InterfaceElement`] and handled by a plain
//! function registered in an [`InterfaceTable`] when the process starts.
//! Incoming messages are looked up by `(interface id, method id)`; there is no
//! per-message virtual dispatch.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

use crate::address::Address;
use crate::error::MercuryError;
use crate::nub::Nub;
use crate::wire::{decode_payload, InterfaceId, MethodId, ReplyId};

/// Interface id reserved for birth, death and interface queries.
pub const MACHINE_INTERFACE: InterfaceId = 0;

/// Static description of one message of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceElement {
    pub interface: InterfaceId,
    pub method: MethodId,
    pub name: &'static str,
}

impl InterfaceElement {
    pub const fn new(interface: InterfaceId, method: MethodId, name: &'static str) -> Self {
        Self {
            interface,
            method,
            name,
        }
    }

    fn key(&self) -> (InterfaceId, MethodId) {
        (self.interface, self.method)
    }
}

impl fmt::Display for InterfaceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}.{})", self.name, self.interface, self.method)
    }
}

/// A message delivered by a channel, ready for its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Address of the sending process
    pub source: Address,
    pub interface: InterfaceId,
    pub method: MethodId,
    /// Set when the sender expects a reply
    pub reply_id: Option<ReplyId>,
    pub payload: Vec<u8>,
}

impl Incoming {
    /// Decodes the payload into the handler's argument type.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, MercuryError> {
        decode_payload(&self.payload)
    }

    /// Whether the payload is empty, which managers use for "not ready".
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Function handling one message for a process of type `H`.
pub type MessageHandlerFn<H> = fn(&mut H, &mut Nub, &Incoming) -> Result<(), MercuryError>;

struct TableEntry<H> {
    element: InterfaceElement,
    handler: MessageHandlerFn<H>,
}

/// Dispatch table from `(interface, method)` to handler functions.
///
/// # Examples
///
/// ```rust
/// use mercury::{Incoming, InterfaceElement, InterfaceTable, MercuryError, Nub};
///
/// const PING: InterfaceElement = InterfaceElement::new(7, 0, "ping");
///
/// struct Pinger { pings: u32 }
///
/// fn on_ping(p: &mut Pinger, _nub: &mut Nub, _msg: &Incoming) -> Result<(), MercuryError> {
///     p.pings += 1;
///     Ok(())
/// }
///
/// let mut table = InterfaceTable::new("PingInterface");
/// table.register(PING, on_ping);
/// assert!(table.lookup(7, 0).is_some());
/// ```
pub struct InterfaceTable<H> {
    name: &'static str,
    entries: HashMap<(InterfaceId, MethodId), TableEntry<H>>,
}

impl<H> InterfaceTable<H> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    /// Name of the interface set served by this table.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers a handler, replacing any previous one for the element.
    pub fn register(&mut self, element: InterfaceElement, handler: MessageHandlerFn<H>) -> &mut Self {
        if self
            .entries
            .insert(element.key(), TableEntry { element, handler })
            .is_some()
        {
            tracing::warn!("Handler for {} registered twice in {}", element, self.name);
        }
        self
    }

    /// Looks up the element and handler for a message.
    pub fn lookup(
        &self,
        interface: InterfaceId,
        method: MethodId,
    ) -> Option<(InterfaceElement, MessageHandlerFn<H>)> {
        self.entries
            .get(&(interface, method))
            .map(|entry| (entry.element, entry.handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H> fmt::Debug for InterfaceTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceTable")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}
