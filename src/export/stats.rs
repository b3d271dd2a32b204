use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ExportStats {
    #[ts(type = "number")]
    pub total_records: u64,
    #[ts(type = "Record<string, number>")]
    pub records_by_table: BTreeMap<String, u64>,
    /// Milliseconds.
    #[ts(type = "number")]
    pub export_duration: u64,
    /// Bytes of the sealed bundle as compact JSON.
    #[ts(type = "number")]
    pub bundle_size: u64,
}

/// Per-table row counts shared by concurrent fetches.
#[derive(Debug, Default)]
pub struct RecordCounter {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl RecordCounter {
    pub fn add(&self, table: &str, rows: usize) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(table.to_string()).or_default() += rows as u64;
    }

    pub fn into_counts(self) -> BTreeMap<String, u64> {
        self.counts
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
