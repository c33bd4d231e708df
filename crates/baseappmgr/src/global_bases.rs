//! Registry of bases reachable by a cluster-wide name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use mercury::Address;

use crate::error::ManagerError;
use crate::interface::EntityMailBox;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalBases {
    bases: BTreeMap<String, EntityMailBox>,
}

impl GlobalBases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`; a name can only be held by one base at a time.
    pub fn register(&mut self, name: &str, mailbox: EntityMailBox) -> Result<(), ManagerError> {
        if self.bases.contains_key(name) {
            return Err(ManagerError::DuplicateGlobalBase(name.to_string()));
        }
        self.bases.insert(name.to_string(), mailbox);
        Ok(())
    }

    pub fn deregister(&mut self, name: &str) -> Option<EntityMailBox> {
        self.bases.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&EntityMailBox> {
        self.bases.get(name)
    }

    /// Drops every base hosted on `addr` and returns their names.
    pub fn remove_hosted_by(&mut self, addr: Address) -> Vec<String> {
        let names: Vec<String> = self
            .bases
            .iter()
            .filter(|(_, mailbox)| mailbox.addr == addr)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.bases.remove(name);
        }
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntityMailBox)> {
        self.bases.iter()
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(id: u32, addr: &str) -> EntityMailBox {
        EntityMailBox {
            id,
            addr: addr.parse().unwrap(),
            entity_type: 1,
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut bases = GlobalBases::new();
        bases.register("Auctioneer", mailbox(1, "10.0.0.1:1")).unwrap();
        assert_eq!(
            bases.register("Auctioneer", mailbox(2, "10.0.0.2:1")),
            Err(ManagerError::DuplicateGlobalBase("Auctioneer".to_string()))
        );
        assert_eq!(bases.get("Auctioneer").unwrap().id, 1);
    }

    #[test]
    fn test_remove_hosted_by() {
        let mut bases = GlobalBases::new();
        bases.register("A", mailbox(1, "10.0.0.1:1")).unwrap();
        bases.register("B", mailbox(2, "10.0.0.2:1")).unwrap();
        bases.register("C", mailbox(3, "10.0.0.1:1")).unwrap();

        let removed = bases.remove_hosted_by("10.0.0.1:1".parse().unwrap());
        assert_eq!(removed, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(bases.len(), 1);
        assert!(bases.deregister("B").is_some());
        assert!(bases.is_empty());
    }
}
