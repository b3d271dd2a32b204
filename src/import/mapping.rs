use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Source id to newly assigned id, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct IdMappings(BTreeMap<String, BTreeMap<String, String>>);

impl IdMappings {
    pub fn record(&mut self, table: &str, old: String, new: String) {
        self.0.entry(table.to_string()).or_default().insert(old, new);
    }

    pub fn resolve(&self, table: &str, old: &str) -> Option<&str> {
        self.0.get(table)?.get(old).map(String::as_str)
    }

    pub fn table(&self, table: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(table)
    }

    /// Mapped ids across every table.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
