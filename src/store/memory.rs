use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{new_id, Filter, Store, StoreError, StoreResult};
use crate::bundle::{record_id, Record};

/// In-process store used by tests and dry runs. Tables keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    failing: Mutex<HashMap<String, String>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads rows as-is, keeping their ids. Not counted as writes.
    pub async fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut tables = self.tables.lock().await;
        let entry = tables.entry(table.to_string()).or_default();
        entry.extend(rows.into_iter().filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        }));
    }

    /// Every later insert into `table` fails with `message`.
    pub async fn fail_inserts(&self, table: &str, message: &str) {
        self.failing
            .lock()
            .await
            .insert(table.to_string(), message.to_string());
    }

    /// Inserts, updates and deletes performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, Vec::len)
    }

    pub async fn counts(&self) -> BTreeMap<String, usize> {
        self.tables
            .lock()
            .await
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| (table.clone(), rows.len()))
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Record>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, mut row: Record) -> StoreResult<String> {
        if let Some(message) = self.failing.lock().await.get(table) {
            return Err(StoreError::Rejected {
                table: table.to_string(),
                message: message.clone(),
            });
        }
        let id = new_id();
        row.insert("id".into(), Value::String(id.clone()));
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update(&self, table: &str, id: &str, changes: Record) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| record_id(r).as_deref() == Some(id)))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        row.extend(changes.into_iter().filter(|(key, _)| key != "id"));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let rows = tables.get_mut(table);
        let position = rows
            .as_ref()
            .and_then(|rows| rows.iter().position(|r| record_id(r).as_deref() == Some(id)));
        match (rows, position) {
            (Some(rows), Some(index)) => {
                rows.remove(index);
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            }),
        }
    }
}
