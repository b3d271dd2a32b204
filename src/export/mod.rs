//! Read-only assembly of a workspace bundle from a [`Store`].
//!
//! Global tables are read first, then every clinic. Within a clinic the
//! clinic-keyed tables are fetched concurrently; tables keyed by a parent's
//! ids follow once their parents are known. The assembled bundle is checked
//! for integral money fields before it is sealed with its checksum.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::bundle::tables::{
    is_parent_keyed, CLINICS_TABLE, PARENT_KEYED_TABLES, WORKSPACES_TABLE,
};
use crate::bundle::{
    record_id, str_field, Bundle, BundleData, BundleMetadata, ClinicDataBundle, ExportedBy,
    MigrationInfo, Record, Shape, CLINIC_TABLES,
};
use crate::checksum::{self, ChecksumError};
use crate::config::DEFAULT_EXPORT_CONCURRENCY;
use crate::migrations::{CURRENT_SCHEMA_VERSION, EXPORT_FORMAT_VERSION};
use crate::store::{Filter, Store, StoreError};
use crate::validator;
use crate::AppError;

pub mod stats;

pub use stats::{ExportStats, RecordCounter};

const AUDIT_TABLE: &str = "workspace_activity";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("workspace {0} not found")]
    WorkspaceNotFound(String),
    #[error("money validation failed: {}", .0.join(", "))]
    MoneyValidation(Vec<String>),
    #[error("export failed reading {table}: {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("export failed: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("export failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ExportError {
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::WorkspaceNotFound(_) => "WORKSPACE_NOT_FOUND",
            ExportError::MoneyValidation(_) => "MONEY_VALIDATION_FAILED",
            ExportError::Store { .. } | ExportError::Checksum(_) | ExportError::Serialize(_) => {
                "EXPORT_FAILED"
            }
        }
    }
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        let mut app = AppError::new(format!("EXPORT/{}", err.code()), err.to_string());
        match &err {
            ExportError::WorkspaceNotFound(id) => app = app.with_context("workspace_id", id.clone()),
            ExportError::MoneyValidation(errors) => {
                app = app.with_context("errors", errors.len().to_string())
            }
            ExportError::Store { table, source } => {
                app = app
                    .with_context("table", table.clone())
                    .with_cause(AppError::new(format!("STORE/{}", source.code()), source.to_string()))
            }
            ExportError::Checksum(_) | ExportError::Serialize(_) => {}
        }
        app
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub include_audit_logs: bool,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub app_version: Option<String>,
}

pub struct Exporter<'s> {
    store: &'s dyn Store,
    concurrency: usize,
}

impl<'s> Exporter<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self {
            store,
            concurrency: DEFAULT_EXPORT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn export(
        &self,
        workspace_id: &str,
        options: &ExportOptions,
    ) -> Result<(Bundle, ExportStats), ExportError> {
        let started = Instant::now();
        info!(
            target: "clinic_bundle",
            event = "export_started",
            workspace_id,
            include_audit_logs = options.include_audit_logs
        );

        let result = self.assemble(workspace_id, options, started).await;
        match &result {
            Ok((_, stats)) => info!(
                target: "clinic_bundle",
                event = "export_completed",
                workspace_id,
                total_records = stats.total_records,
                bundle_size = stats.bundle_size,
                duration_ms = stats.export_duration
            ),
            Err(err) => error!(
                target: "clinic_bundle",
                event = "export_failed",
                workspace_id,
                code = err.code(),
                error = %err
            ),
        }
        result
    }

    async fn assemble(
        &self,
        workspace_id: &str,
        options: &ExportOptions,
        started: Instant,
    ) -> Result<(Bundle, ExportStats), ExportError> {
        let counter = RecordCounter::default();

        let workspace = self
            .fetch(WORKSPACES_TABLE, Filter::eq("id", workspace_id), &counter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExportError::WorkspaceNotFound(workspace_id.to_string()))?;

        let organizations = self.fetch("organizations", Filter::All, &counter).await?;
        let category_types = self.fetch("category_types", Filter::All, &counter).await?;
        let role_permissions = self.fetch("role_permissions", Filter::All, &counter).await?;

        let by_workspace = Filter::eq("workspace_id", workspace_id);
        let workspace_users = self
            .fetch("workspace_users", by_workspace.clone(), &counter)
            .await?;
        let workspace_members = self
            .fetch("workspace_members", by_workspace.clone(), &counter)
            .await?;

        let clinic_rows = self.fetch(CLINICS_TABLE, by_workspace, &counter).await?;
        let mut clinics = Vec::with_capacity(clinic_rows.len());
        for clinic in clinic_rows {
            clinics.push(self.fetch_clinic(clinic, options, &counter).await?);
        }

        let records_by_table = counter.into_counts();
        let bundle = Bundle {
            metadata: BundleMetadata {
                version: EXPORT_FORMAT_VERSION.to_string(),
                schema_version: CURRENT_SCHEMA_VERSION,
                export_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                app_version: Some(
                    options
                        .app_version
                        .clone()
                        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
                ),
                exported_by: options.user_id.as_ref().map(|user_id| ExportedBy {
                    user_id: user_id.clone(),
                    email: options.user_email.clone().unwrap_or_default(),
                }),
                workspace_id: workspace_id.to_string(),
                workspace_name: str_field(&workspace, "name").unwrap_or_default().to_string(),
                clinic_count: Some(clinics.len() as u64),
                record_counts: records_by_table.clone(),
                checksum: String::new(),
                extra: Record::new(),
            },
            data: BundleData {
                workspace,
                organizations,
                category_types,
                role_permissions,
                workspace_users,
                workspace_members,
                clinics,
                extra: Record::new(),
            },
            migrations: MigrationInfo {
                schema_version: CURRENT_SCHEMA_VERSION,
                applied_migrations: Vec::new(),
                extra: Record::new(),
            },
        };

        let document = serde_json::to_value(&bundle)?;
        let money = validator::money_errors(&document);
        if !money.is_empty() {
            return Err(ExportError::MoneyValidation(
                money.into_iter().map(|e| e.message).collect(),
            ));
        }

        let bundle = checksum::add_checksum(&bundle)?;
        let bundle_size = serde_json::to_vec(&bundle)?.len() as u64;
        let stats = ExportStats {
            total_records: records_by_table.values().sum(),
            records_by_table,
            export_duration: started.elapsed().as_millis() as u64,
            bundle_size,
        };
        Ok((bundle, stats))
    }

    async fn fetch(
        &self,
        table: &str,
        filter: Filter,
        counter: &RecordCounter,
    ) -> Result<Vec<Record>, ExportError> {
        let rows = self
            .store
            .select(table, &filter)
            .await
            .map_err(|source| ExportError::Store {
                table: table.to_string(),
                source,
            })?;
        counter.add(table, rows.len());
        Ok(rows)
    }

    async fn fetch_clinic(
        &self,
        clinic: Record,
        options: &ExportOptions,
        counter: &RecordCounter,
    ) -> Result<ClinicDataBundle, ExportError> {
        let clinic_id = record_id(&clinic).unwrap_or_default();
        let direct: Vec<_> = CLINIC_TABLES
            .iter()
            .filter(|t| t.present_at(CURRENT_SCHEMA_VERSION))
            .filter(|t| !is_parent_keyed(t.name))
            .filter(|t| options.include_audit_logs || t.name != AUDIT_TABLE)
            .collect();

        let fetched: Vec<(&str, Shape, Vec<Record>)> = stream::iter(direct)
            .map(|table| {
                let filter = Filter::eq("clinic_id", clinic_id.as_str());
                async move {
                    let rows = self.fetch(table.name, filter, counter).await?;
                    Ok::<_, ExportError>((table.name, table.shape, rows))
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut entry = ClinicDataBundle::new(clinic);
        let mut ids: HashMap<&str, Vec<Value>> = HashMap::new();
        for (table, shape, rows) in fetched {
            ids.insert(table, rows.iter().filter_map(|r| r.get("id").cloned()).collect());
            place(&mut entry, table, shape, rows);
        }

        for (table, field, parent) in PARENT_KEYED_TABLES {
            let parent_ids = ids.get(parent).cloned().unwrap_or_default();
            let rows = if parent_ids.is_empty() {
                counter.add(table, 0);
                Vec::new()
            } else {
                self.fetch(table, Filter::In(field.to_string(), parent_ids), counter)
                    .await?
            };
            ids.insert(*table, rows.iter().filter_map(|r| r.get("id").cloned()).collect());
            entry.set_list(table, rows);
        }

        entry.record_counts = entry.count_records();
        Ok(entry)
    }
}

fn place(entry: &mut ClinicDataBundle, table: &str, shape: Shape, rows: Vec<Record>) {
    match (shape, table) {
        (Shape::Single, "settings_time") => entry.settings_time = rows.into_iter().next(),
        (Shape::Single, "clinic_google_calendar") => {
            entry.clinic_google_calendar = Some(rows.into_iter().next())
        }
        (Shape::Single, _) => {}
        (Shape::List, _) => {
            entry.set_list(table, rows);
        }
    }
}

/// Exports with default concurrency.
pub async fn export_workspace(
    store: &dyn Store,
    workspace_id: &str,
    options: &ExportOptions,
) -> Result<(Bundle, ExportStats), ExportError> {
    Exporter::new(store).export(workspace_id, options).await
}
