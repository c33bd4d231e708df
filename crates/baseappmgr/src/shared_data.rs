//! Key/value data replicated to every BaseApp.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which shared table an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharedDataType {
    /// Data the manager holds the authoritative copy of
    BaseApp,
    /// Copy of the cluster-wide table
    Global,
}

/// The two shared tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedData {
    base_app: BTreeMap<String, String>,
    global: BTreeMap<String, String>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: SharedDataType) -> &BTreeMap<String, String> {
        match kind {
            SharedDataType::BaseApp => &self.base_app,
            SharedDataType::Global => &self.global,
        }
    }

    fn table_mut(&mut self, kind: SharedDataType) -> &mut BTreeMap<String, String> {
        match kind {
            SharedDataType::BaseApp => &mut self.base_app,
            SharedDataType::Global => &mut self.global,
        }
    }

    /// Sets an entry; returns whether the value changed.
    pub fn set(&mut self, kind: SharedDataType, key: &str, value: &str) -> bool {
        let table = self.table_mut(kind);
        if table.get(key).map(String::as_str) == Some(value) {
            return false;
        }
        table.insert(key.to_string(), value.to_string());
        true
    }

    /// Removes an entry; returns whether it existed.
    pub fn del(&mut self, kind: SharedDataType, key: &str) -> bool {
        self.table_mut(kind).remove(key).is_some()
    }

    pub fn get(&self, kind: SharedDataType, key: &str) -> Option<&str> {
        self.table(kind).get(key).map(String::as_str)
    }

    /// All entries of a table in key order.
    pub fn entries(&self, kind: SharedDataType) -> Vec<(String, String)> {
        self.table(kind)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self, kind: SharedDataType) -> usize {
        self.table(kind).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_independent() {
        let mut data = SharedData::new();
        assert!(data.set(SharedDataType::BaseApp, "weather", "rain"));
        assert!(!data.set(SharedDataType::BaseApp, "weather", "rain"));
        assert!(data.set(SharedDataType::Global, "weather", "sun"));

        assert_eq!(data.get(SharedDataType::BaseApp, "weather"), Some("rain"));
        assert_eq!(data.get(SharedDataType::Global, "weather"), Some("sun"));

        assert!(data.del(SharedDataType::BaseApp, "weather"));
        assert!(!data.del(SharedDataType::BaseApp, "weather"));
        assert_eq!(data.len(SharedDataType::BaseApp), 0);
        assert_eq!(
            data.entries(SharedDataType::Global),
            vec![("weather".to_string(), "sun".to_string())]
        );
    }
}
