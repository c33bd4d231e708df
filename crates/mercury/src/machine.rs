//! # Birth and Death Announcements
//!
//! Processes announce themselves on the reserved machine interface. A birth
//! or death announcement is an unreliable datagram sent to every configured
//! announce address (a directed broadcast); an interface query asks whoever
//! implements a named interface to answer with its address.
//!
//! Subscribers register per interface name with a caller-chosen
//! [`ListenerTag`]; all listeners of a name are notified in registration order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::Address;
use crate::interface::{InterfaceElement, MACHINE_INTERFACE};

/// Caller-chosen value identifying a listener when it is notified.
pub type ListenerTag = u64;

pub const BIRTH: InterfaceElement = InterfaceElement::new(MACHINE_INTERFACE, 0, "birth");
pub const DEATH: InterfaceElement = InterfaceElement::new(MACHINE_INTERFACE, 1, "death");
pub const QUERY_INTERFACE: InterfaceElement =
    InterfaceElement::new(MACHINE_INTERFACE, 2, "queryInterface");
pub const QUERY_INTERFACE_REPLY: InterfaceElement =
    InterfaceElement::new(MACHINE_INTERFACE, 3, "queryInterfaceReply");

/// A process announcing the interface it implements and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Interface (component) name, e.g. `"DBMgrInterface"`
    pub name: String,
    pub addr: Address,
}

/// Request for the address of whoever implements `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceQuery {
    pub name: String,
}

/// Which lifecycle event a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Birth,
    Death,
}

/// Birth and death subscriptions keyed by interface name.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    birth: BTreeMap<String, Vec<ListenerTag>>,
    death: BTreeMap<String, Vec<ListenerTag>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ListenerKind) -> &BTreeMap<String, Vec<ListenerTag>> {
        match kind {
            ListenerKind::Birth => &self.birth,
            ListenerKind::Death => &self.death,
        }
    }

    fn map_mut(&mut self, kind: ListenerKind) -> &mut BTreeMap<String, Vec<ListenerTag>> {
        match kind {
            ListenerKind::Birth => &mut self.birth,
            ListenerKind::Death => &mut self.death,
        }
    }

    /// Adds a listener. Registering the same tag twice for a name is a no-op.
    pub fn register(&mut self, kind: ListenerKind, name: &str, tag: ListenerTag) {
        let listeners = self.map_mut(kind).entry(name.to_string()).or_default();
        if !listeners.contains(&tag) {
            listeners.push(tag);
        }
    }

    /// Removes a listener; returns whether it was registered.
    pub fn deregister(&mut self, kind: ListenerKind, name: &str, tag: ListenerTag) -> bool {
        let map = self.map_mut(kind);
        let Some(listeners) = map.get_mut(name) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|t| *t != tag);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            map.remove(name);
        }
        removed
    }

    /// Listeners of `name`, in registration order.
    pub fn listeners(&self, kind: ListenerKind, name: &str) -> Vec<ListenerTag> {
        self.map(kind).get(name).cloned().unwrap_or_default()
    }

    pub fn num_listeners(&self, kind: ListenerKind) -> usize {
        self.map(kind).values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_in_registration_order() {
        let mut registry = ListenerRegistry::new();
        registry.register(ListenerKind::Birth, "DBMgrInterface", 3);
        registry.register(ListenerKind::Birth, "DBMgrInterface", 1);
        registry.register(ListenerKind::Birth, "DBMgrInterface", 3);
        registry.register(ListenerKind::Death, "DBMgrInterface", 9);

        assert_eq!(registry.listeners(ListenerKind::Birth, "DBMgrInterface"), vec![3, 1]);
        assert_eq!(registry.listeners(ListenerKind::Death, "DBMgrInterface"), vec![9]);
        assert!(registry.listeners(ListenerKind::Birth, "Other").is_empty());
        assert_eq!(registry.num_listeners(ListenerKind::Birth), 2);
    }

    #[test]
    fn test_deregister() {
        let mut registry = ListenerRegistry::new();
        registry.register(ListenerKind::Death, "BaseAppInterface", 1);

        assert!(registry.deregister(ListenerKind::Death, "BaseAppInterface", 1));
        assert!(!registry.deregister(ListenerKind::Death, "BaseAppInterface", 1));
        assert_eq!(registry.num_listeners(ListenerKind::Death), 0);
    }
}
