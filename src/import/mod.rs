//! Bundle import into a fresh workspace.
//!
//! The pipeline is strictly sequential: migrate, validate, then create the
//! workspace, its clinics, and every clinic's collections in dependency
//! order. Each created row is recorded so that a fatal error, including a
//! cancellation, deletes everything the run wrote before returning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};
use ts_rs::TS;

use crate::bundle::tables::{CLINICS_TABLE, WORKSPACES_TABLE};
use crate::bundle::{record_id, str_field, Bundle, ClinicDataBundle, Record, Shape};
use crate::config::DEFAULT_RECORDS_PER_SECOND;
use crate::migrations;
use crate::migrator::{migrate_bundle, MigrationError};
use crate::store::{Store, StoreError};
use crate::validator::{
    ValidationError, ValidationErrorKind, ValidationWarning, Validator, ValidatorError,
};
use crate::AppError;

mod entities;
pub mod mapping;
pub mod progress;
pub mod rollback;
mod table_order;

pub use mapping::IdMappings;
pub use progress::{CancelToken, ImportProgress, ImportStatus, ProgressReporter};
pub use rollback::{CompensationLog, RollbackReport};

use entities::Session;
use table_order::is_secondary;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("bundle validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error("failed to create workspace: {0}")]
    Workspace(#[source] StoreError),
    #[error("failed to create clinic {clinic}: {source}")]
    Clinic {
        clinic: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to import {table}: {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("cannot import expenses: system category \"otros\" not found")]
    MissingSystemCategory,
    #[error("import cancelled")]
    Cancelled,
    #[error("import mode {0:?} is not supported")]
    UnsupportedMode(ImportMode),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Validation(_) | ImportError::Validator(_) => "VALIDATION_FAILED",
            ImportError::Migration(err) => err.code(),
            ImportError::Workspace(_) => "IMPORT_WORKSPACE_FAILED",
            ImportError::Clinic { .. } => "IMPORT_CLINIC_FAILED",
            ImportError::Store { .. } => "IMPORT_FAILED",
            ImportError::MissingSystemCategory => "MISSING_SYSTEM_CATEGORY",
            ImportError::Cancelled => "IMPORT_CANCELLED",
            ImportError::UnsupportedMode(_) => "UNSUPPORTED_MODE",
        }
    }

    /// The error as report entries for [`ImportResult::errors`].
    pub fn report(&self) -> Vec<ValidationError> {
        use ValidationErrorKind as E;
        match self {
            ImportError::Validation(errors) => errors.clone(),
            ImportError::Migration(_) | ImportError::UnsupportedMode(_) => {
                vec![ValidationError::new(E::InvalidSchema, self.to_string())]
            }
            ImportError::MissingSystemCategory => vec![ValidationError::new(
                E::MissingField,
                self.to_string(),
            )
            .table("categories")],
            ImportError::Workspace(_) => {
                vec![ValidationError::new(E::ConstraintViolation, self.to_string())
                    .table(WORKSPACES_TABLE)]
            }
            ImportError::Clinic { clinic, .. } => {
                vec![ValidationError::new(E::ConstraintViolation, self.to_string())
                    .table(CLINICS_TABLE)
                    .record(Some(clinic.clone()))]
            }
            ImportError::Store { table, .. } => {
                vec![ValidationError::new(E::ConstraintViolation, self.to_string())
                    .table(table.clone())]
            }
            ImportError::Validator(_) | ImportError::Cancelled => {
                vec![ValidationError::new(E::ConstraintViolation, self.to_string())]
            }
        }
    }
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        let app = AppError::new(format!("IMPORT/{}", err.code()), err.to_string());
        match &err {
            ImportError::Store { table, .. } => app.with_context("table", table.clone()),
            ImportError::Clinic { clinic, .. } => app.with_context("clinic", clinic.clone()),
            ImportError::Validation(errors) => {
                app.with_context("errors", errors.len().to_string())
            }
            _ => app,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ImportMode {
    /// Create a new workspace for the bundle.
    #[default]
    Create,
    /// Merge into an existing workspace. Rejected before any write.
    Merge,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub mode: ImportMode,
    pub skip_validation: bool,
    pub dry_run: bool,
    /// Becomes the owner of the created workspace.
    pub user_id: String,
    pub cancel: Option<CancelToken>,
}

impl ImportOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            mode: ImportMode::Create,
            skip_validation: false,
            dry_run: false,
            user_id: user_id.into(),
            cancel: None,
        }
    }

    fn ensure_active(&self) -> Result<(), ImportError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(ImportError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ImportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub workspace_id: Option<String>,
    pub clinic_ids: Vec<String>,
    #[ts(type = "Record<string, number>")]
    pub records_imported: BTreeMap<String, u64>,
    pub id_mappings: IdMappings,
    pub errors: Vec<ValidationError>,
    /// Non-fatal problems: skipped rows, reassigned categories, rejected
    /// history tables.
    pub warnings: Vec<ValidationError>,
    pub validation_warnings: Vec<ValidationWarning>,
    pub migrations_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub error_code: Option<String>,
    /// Seconds.
    pub duration: f64,
}

impl ImportResult {
    pub fn total_imported(&self) -> u64 {
        self.records_imported.values().sum()
    }
}

pub struct Importer<'s> {
    store: &'s dyn Store,
    records_per_second: u64,
    progress: Arc<ProgressReporter>,
}

struct Preflight {
    migrations_applied: Vec<String>,
    validation_warnings: Vec<ValidationWarning>,
}

impl<'s> Importer<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self {
            store,
            records_per_second: DEFAULT_RECORDS_PER_SECOND,
            progress: Arc::new(ProgressReporter::new()),
        }
    }

    pub fn with_records_per_second(mut self, records_per_second: u64) -> Self {
        self.records_per_second = records_per_second.max(1);
        self
    }

    /// Publishes progress through `reporter` instead of a private one.
    pub fn with_reporter(mut self, reporter: Arc<ProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn reporter(&self) -> Arc<ProgressReporter> {
        Arc::clone(&self.progress)
    }

    /// Imports `bundle`. Never returns early with partial writes: on failure
    /// the result has `success == false` and the run's rows are gone.
    pub async fn import(&self, bundle: &Bundle, options: &ImportOptions) -> ImportResult {
        let started = Instant::now();
        self.progress.reset();
        info!(
            target: "clinic_bundle",
            event = "import_started",
            workspace_id = %bundle.metadata.workspace_id,
            schema_version = bundle.schema_version(),
            dry_run = options.dry_run,
            skip_validation = options.skip_validation
        );

        let mut session = Session::new(self.store, &self.progress);
        let mut preflight = Preflight {
            migrations_applied: Vec::new(),
            validation_warnings: Vec::new(),
        };
        let outcome = self.run(bundle, options, &mut session, &mut preflight).await;
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(dry_run) => {
                if dry_run {
                    self.progress
                        .update(ImportStatus::Completed, "Dry run completed", 100);
                } else {
                    self.progress.update(
                        ImportStatus::Completed,
                        "Import completed successfully",
                        100,
                    );
                }
                let clinic_ids = clinic_ids_in_order(bundle, &session.mappings);
                info!(
                    target: "clinic_bundle",
                    event = "import_completed",
                    dry_run,
                    records = session.imported.values().sum::<u64>(),
                    warnings = session.warnings.len(),
                    duration_ms = (duration * 1000.0) as u64
                );
                ImportResult {
                    success: true,
                    workspace_id: session.workspace_id.clone(),
                    clinic_ids,
                    records_imported: session.imported,
                    id_mappings: session.mappings,
                    errors: Vec::new(),
                    warnings: session.warnings,
                    validation_warnings: preflight.validation_warnings,
                    migrations_applied: preflight.migrations_applied,
                    error_code: None,
                    duration,
                }
            }
            Err(err) => {
                error!(
                    target: "clinic_bundle",
                    event = "import_failed",
                    code = err.code(),
                    error = %err,
                    written = session.log.len()
                );
                self.progress
                    .update(ImportStatus::Failed, "Import failed, rolling back", 0);
                for entry in err.report() {
                    self.progress.push_error(entry);
                }
                let rollback = session.log.rollback(self.store).await;
                for (table, id, message) in &rollback.failed {
                    session.warnings.push(
                        ValidationError::new(
                            ValidationErrorKind::ConstraintViolation,
                            format!("rollback could not delete {table} {id}: {message}"),
                        )
                        .table(table.clone())
                        .record(Some(id.clone())),
                    );
                }
                self.progress
                    .update(ImportStatus::RolledBack, "Changes rolled back", 0);
                ImportResult {
                    success: false,
                    workspace_id: None,
                    clinic_ids: Vec::new(),
                    records_imported: BTreeMap::new(),
                    id_mappings: IdMappings::default(),
                    errors: err.report(),
                    warnings: session.warnings,
                    validation_warnings: preflight.validation_warnings,
                    migrations_applied: preflight.migrations_applied,
                    error_code: Some(err.code().to_string()),
                    duration: started.elapsed().as_secs_f64(),
                }
            }
        }
    }

    /// Returns `Ok(true)` for a completed dry run.
    async fn run(
        &self,
        bundle: &Bundle,
        options: &ImportOptions,
        session: &mut Session<'_>,
        preflight: &mut Preflight,
    ) -> Result<bool, ImportError> {
        if options.mode != ImportMode::Create {
            return Err(ImportError::UnsupportedMode(options.mode));
        }

        self.progress.update(
            ImportStatus::Validating,
            "Migrating bundle to current version",
            5,
        );
        let migrated = migrate_bundle(bundle)?;
        preflight.migrations_applied = migrated.migrations_summary;
        let bundle = migrated.bundle;

        if !options.skip_validation {
            self.progress
                .update(ImportStatus::Validating, "Validating bundle", 10);
            let report = Validator::new(migrations::registry(), self.records_per_second)
                .validate_bundle(&bundle)?;
            preflight.validation_warnings = report.warnings;
            if !report.valid {
                return Err(ImportError::Validation(report.errors));
            }
            self.progress.set_total(report.stats.records_to_import);
        }

        if options.dry_run {
            return Ok(true);
        }
        options.ensure_active()?;

        self.progress
            .update(ImportStatus::Importing, "Importing workspace", 15);
        self.import_workspace(&bundle, options, session).await?;
        options.ensure_active()?;

        self.progress
            .update(ImportStatus::Importing, "Importing clinics", 20);
        let clinic_ids = self.import_clinics(&bundle, session).await?;

        let total = bundle.data.clinics.len().max(1);
        let clinics = bundle.data.clinics.iter().zip(&clinic_ids);
        for (index, (entry, clinic_id)) in clinics.enumerate() {
            options.ensure_active()?;
            self.progress.update(
                ImportStatus::Importing,
                format!("Importing data for clinic {}", index + 1),
                (30 + 60 * index / total) as u8,
            );
            self.import_clinic_data(entry, clinic_id, options, session)
                .await?;
        }

        options.ensure_active()?;
        self.progress
            .update(ImportStatus::Importing, "Finalizing import", 95);
        Ok(false)
    }

    async fn import_workspace(
        &self,
        bundle: &Bundle,
        options: &ImportOptions,
        session: &mut Session<'_>,
    ) -> Result<(), ImportError> {
        let source = &bundle.data.workspace;
        let mut row = source.clone();
        row.remove("id");
        let name = str_field(source, "name").unwrap_or_default();
        let slug = str_field(source, "slug").unwrap_or("workspace");
        row.insert("name".into(), Value::String(format!("{name} (Imported)")));
        row.insert(
            "slug".into(),
            Value::String(format!("{slug}-import-{}", Utc::now().timestamp_millis())),
        );
        row.insert("owner_id".into(), Value::String(options.user_id.clone()));

        let id = session
            .create(WORKSPACES_TABLE, record_id(source), row)
            .await
            .map_err(ImportError::Workspace)?;
        session.workspace_id = Some(id);
        Ok(())
    }

    async fn import_clinics(
        &self,
        bundle: &Bundle,
        session: &mut Session<'_>,
    ) -> Result<Vec<String>, ImportError> {
        let workspace_id = session.workspace_id.clone().unwrap_or_default();
        let mut created = Vec::with_capacity(bundle.data.clinics.len());
        for entry in &bundle.data.clinics {
            let mut row = entry.clinic.clone();
            row.remove("id");
            row.insert("workspace_id".into(), Value::String(workspace_id.clone()));
            let label = str_field(&entry.clinic, "name")
                .map(str::to_string)
                .or_else(|| entry.clinic_id())
                .unwrap_or_default();
            let id = session
                .create(CLINICS_TABLE, entry.clinic_id(), row)
                .await
                .map_err(|source| ImportError::Clinic {
                    clinic: label,
                    source,
                })?;
            created.push(id);
        }
        Ok(created)
    }

    async fn import_clinic_data(
        &self,
        entry: &ClinicDataBundle,
        clinic_id: &str,
        options: &ImportOptions,
        session: &mut Session<'_>,
    ) -> Result<(), ImportError> {
        for importer in entities::registry() {
            options.ensure_active()?;
            let table = importer.table();
            let Some(rows) = clinic_rows(entry, table) else {
                continue;
            };
            if rows.is_empty() {
                continue;
            }
            match importer.import(session, clinic_id, &rows).await {
                Ok(_) => {}
                Err(ImportError::Store { table, source }) if is_secondary(&table) => {
                    session.warn(
                        ValidationError::new(
                            ValidationErrorKind::ConstraintViolation,
                            format!("Failed to import {} {table} row(s): {source}", rows.len()),
                        )
                        .table(table.clone())
                        .field(table),
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Rows a clinic entry carries for `table`; `None` when the entry predates
/// the table.
fn clinic_rows(entry: &ClinicDataBundle, table: &str) -> Option<Vec<Record>> {
    let shape = crate::bundle::tables::clinic_table(table)?.shape;
    match shape {
        Shape::List => entry.list(table).cloned(),
        Shape::Single => Some(entry.single(table).cloned().into_iter().collect()),
    }
}

fn clinic_ids_in_order(bundle: &Bundle, mappings: &IdMappings) -> Vec<String> {
    bundle
        .data
        .clinics
        .iter()
        .filter_map(|entry| {
            let old = entry.clinic_id()?;
            mappings.resolve(CLINICS_TABLE, &old).map(str::to_string)
        })
        .collect()
}

/// Imports with a private progress reporter and default throughput.
pub async fn import_bundle(
    store: &dyn Store,
    bundle: &Bundle,
    options: &ImportOptions,
) -> ImportResult {
    Importer::new(store).import(bundle, options).await
}
