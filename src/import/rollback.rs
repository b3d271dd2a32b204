use tracing::{info, warn};

use crate::store::Store;

/// Every row an import created, in creation order. Replayed in reverse on
/// failure so children are deleted before their parents.
#[derive(Debug, Default)]
pub struct CompensationLog {
    entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub deleted: u64,
    /// (table, id, error) for deletes that failed.
    pub failed: Vec<(String, String, String)>,
}

impl CompensationLog {
    pub fn push(&mut self, table: &str, id: &str) {
        self.entries.push((table.to_string(), id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deletes everything recorded, newest first. A failed delete is logged
    /// and does not stop the remaining ones.
    pub async fn rollback(&mut self, store: &dyn Store) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some((table, id)) = self.entries.pop() {
            match store.delete(&table, &id).await {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(
                        target: "clinic_bundle",
                        event = "import_rollback_delete_failed",
                        table = %table,
                        id = %id,
                        error = %err
                    );
                    report.failed.push((table, id, err.to_string()));
                }
            }
        }
        info!(
            target: "clinic_bundle",
            event = "import_rollback",
            deleted = report.deleted,
            failed = report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Record;
    use crate::store::{Filter, MemoryStore};

    #[tokio::test]
    async fn rollback_deletes_in_reverse_and_continues_past_failures() {
        let store = MemoryStore::new();
        let mut log = CompensationLog::default();
        let ws = store.insert("workspaces", Record::new()).await.unwrap();
        log.push("workspaces", &ws);
        let clinic = store.insert("clinics", Record::new()).await.unwrap();
        log.push("clinics", &clinic);
        log.push("patients", "never-inserted");

        let report = log.rollback(&store).await;
        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "patients");
        assert!(log.is_empty());
        assert!(store.select("workspaces", &Filter::All).await.unwrap().is_empty());
        assert!(store.select("clinics", &Filter::All).await.unwrap().is_empty());
    }
}
