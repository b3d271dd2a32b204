use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;

use crate::validator::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ImportStatus {
    Validating,
    Importing,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ImportProgress {
    pub status: ImportStatus,
    pub current_step: String,
    /// 0 to 100.
    pub progress: u8,
    #[ts(type = "number")]
    pub records_processed: u64,
    #[ts(type = "number")]
    pub total_records: u64,
    pub errors: Vec<ValidationError>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub completed_at: Option<String>,
}

impl ImportProgress {
    fn initial() -> Self {
        Self {
            status: ImportStatus::Validating,
            current_step: "Initializing".to_string(),
            progress: 0,
            records_processed: 0,
            total_records: 0,
            errors: Vec::new(),
            started_at: now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ImportStatus::Completed | ImportStatus::RolledBack
        )
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Publishes snapshots of one import run. Observers hold receivers and see
/// the latest snapshot; nothing blocks when nobody listens.
pub struct ProgressReporter {
    tx: watch::Sender<ImportProgress>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ImportProgress::initial());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportProgress> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ImportProgress {
        self.tx.borrow().clone()
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(ImportProgress::initial());
    }

    /// Moves to `status` with a new step label. `progress` never goes
    /// backwards while importing.
    pub(crate) fn update(&self, status: ImportStatus, step: impl Into<String>, progress: u8) {
        let step = step.into();
        self.tx.send_modify(|p| {
            p.status = status;
            p.current_step = step;
            p.progress = match status {
                ImportStatus::Importing => progress.max(p.progress).min(100),
                _ => progress.min(100),
            };
            if matches!(status, ImportStatus::Completed | ImportStatus::RolledBack) {
                p.completed_at = Some(now());
            }
        });
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.tx.send_modify(|p| p.total_records = total);
    }

    pub(crate) fn add_records(&self, count: u64) {
        if count > 0 {
            self.tx.send_modify(|p| p.records_processed += count);
        }
    }

    pub(crate) fn push_error(&self, error: ValidationError) {
        self.tx.send_modify(|p| p.errors.push(error));
    }
}

/// Cooperative cancellation flag checked between import phases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
