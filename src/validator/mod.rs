//! Multi-pass bundle validation.
//!
//! The passes run in a fixed order over the raw JSON document and all of them
//! run every time, so a caller sees every problem at once:
//!
//! 1. structure, 2. checksum, 3. schema version, 4. money fields,
//! 5. types, 6. foreign keys, 7. uniqueness, 8. required fields.
//!
//! Data problems come back inside [`ValidationResult`]. `Err` is reserved for
//! failing to serialize the bundle at all.

use std::collections::{BTreeMap, HashMap, HashSet};

use semver::Version;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::bundle::tables::{clinic_table_by_key, global_table_by_key, CLINICS_TABLE, WORKSPACES_TABLE};
use crate::bundle::{fk_value, record_id, Bundle, Record};
use crate::checksum;
use crate::config::DEFAULT_RECORDS_PER_SECOND;
use crate::migrations::{self, MigrationRegistry, EXPORT_FORMAT_VERSION};

pub mod foreign_keys;
pub mod report;

pub use report::{
    ValidationError, ValidationErrorKind, ValidationResult, ValidationStats, ValidationWarning,
    ValidationWarningKind,
};

use foreign_keys::CLINIC_FK_RULES;
use ValidationErrorKind as E;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("failed to serialize bundle for validation: {0}")]
    Serialize(#[from] serde_json::Error),
}

const REQUIRED_SECTIONS: &[&str] = &["metadata", "data", "migrations"];
const REQUIRED_METADATA: &[&str] = &[
    "version",
    "schemaVersion",
    "exportDate",
    "workspaceId",
    "workspaceName",
    "checksum",
];

pub struct Validator<'r> {
    registry: &'r MigrationRegistry,
    records_per_second: u64,
}

impl Default for Validator<'static> {
    fn default() -> Self {
        Validator::new(migrations::registry(), DEFAULT_RECORDS_PER_SECOND)
    }
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r MigrationRegistry, records_per_second: u64) -> Self {
        Self {
            registry,
            records_per_second: records_per_second.max(1),
        }
    }

    pub fn validate_bundle(&self, bundle: &Bundle) -> Result<ValidationResult, ValidatorError> {
        let document = serde_json::to_value(bundle)?;
        self.validate_document(&document)
    }

    pub fn validate_document(&self, document: &Value) -> Result<ValidationResult, ValidatorError> {
        let size = serde_json::to_vec(document)?.len() as u64;
        let mut pass = Pass::default();

        pass.structure(document);
        pass.checksum(document);
        pass.schema_version(document, self.registry);
        pass.money(document);
        pass.types(document);
        pass.foreign_keys(document);
        pass.uniqueness(document, self.registry.current_version());
        pass.required(document);

        let records = count_records(document);
        let stats = ValidationStats {
            records_to_import: records,
            estimated_duration: records.div_ceil(self.records_per_second),
            disk_space_required: size,
        };

        info!(
            target: "clinic_bundle",
            event = "bundle_validated",
            valid = pass.errors.is_empty(),
            errors = pass.errors.len(),
            warnings = pass.warnings.len(),
            records
        );

        Ok(ValidationResult {
            valid: pass.errors.is_empty(),
            errors: pass.errors,
            warnings: pass.warnings,
            stats,
        })
    }
}

/// Validates with the shipped catalog and default throughput.
pub fn validate_bundle(bundle: &Bundle) -> Result<ValidationResult, ValidatorError> {
    Validator::default().validate_bundle(bundle)
}

pub fn validate_document(document: &Value) -> Result<ValidationResult, ValidatorError> {
    Validator::default().validate_document(document)
}

/// Only the money pass: every `*_cents` field that is not an integer or null.
pub fn money_errors(document: &Value) -> Vec<ValidationError> {
    let mut pass = Pass::default();
    pass.money(document);
    pass.errors
}

/// One clinic entry viewed as (table name, rows) pairs.
struct ClinicView<'a> {
    id: Option<String>,
    clinic: Option<&'a Record>,
    tables: Vec<(String, Vec<&'a Record>)>,
}

impl<'a> ClinicView<'a> {
    fn new(entry: &'a Value) -> Self {
        let mut view = ClinicView {
            id: None,
            clinic: None,
            tables: Vec::new(),
        };
        let Some(object) = entry.as_object() else {
            return view;
        };
        view.clinic = object.get("clinic").and_then(Value::as_object);
        view.id = view.clinic.and_then(record_id);
        for (key, value) in object {
            if key == "clinic" || key == "recordCounts" {
                continue;
            }
            let table = clinic_table_by_key(key)
                .map(|t| t.name.to_string())
                .unwrap_or_else(|| key.clone());
            let rows = match value {
                Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                Value::Object(row) => vec![row],
                _ => continue,
            };
            view.tables.push((table, rows));
        }
        view
    }

    fn rows(&self, table: &str) -> &[&'a Record] {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[])
    }

    fn is_list(entry: &Value, table: &str) -> bool {
        let key = crate::bundle::tables::clinic_table(table).map_or(table, |t| t.key);
        entry.get(key).map_or(false, Value::is_array)
    }
}

fn clinic_entries(document: &Value) -> &[Value] {
    document
        .pointer("/data/clinics")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn global_lists(document: &Value) -> Vec<(&'static str, Vec<&Record>)> {
    let Some(data) = document.get("data").and_then(Value::as_object) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|(key, value)| {
            let table = global_table_by_key(key)?;
            let rows = value.as_array()?.iter().filter_map(Value::as_object).collect();
            Some((table, rows))
        })
        .collect()
}

fn workspace(document: &Value) -> Option<&Record> {
    document.pointer("/data/workspace").and_then(Value::as_object)
}

fn count_records(document: &Value) -> u64 {
    let mut total = u64::from(workspace(document).is_some());
    for (_, rows) in global_lists(document) {
        total += rows.len() as u64;
    }
    for entry in clinic_entries(document) {
        let view = ClinicView::new(entry);
        total += u64::from(view.clinic.is_some());
        total += view.tables.iter().map(|(_, rows)| rows.len() as u64).sum::<u64>();
    }
    total
}

/// Whole numbers, including floats such as `4500.0`.
fn is_integer(value: &Value) -> bool {
    value.is_i64()
        || value.is_u64()
        || value
            .as_f64()
            .map_or(false, |f| f.is_finite() && f.fract() == 0.0)
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[derive(Default)]
struct Pass {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
}

impl Pass {
    fn error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    fn structure(&mut self, document: &Value) {
        let Some(root) = document.as_object() else {
            self.error(ValidationError::new(E::InvalidSchema, "Bundle must be a JSON object"));
            return;
        };
        for section in REQUIRED_SECTIONS {
            if !root.contains_key(*section) {
                self.error(
                    ValidationError::new(
                        E::InvalidSchema,
                        format!("Missing required section: {section}"),
                    )
                    .field(*section),
                );
            }
        }

        if let Some(metadata) = root.get("metadata").and_then(Value::as_object) {
            for field in REQUIRED_METADATA {
                if !metadata.contains_key(*field) {
                    self.error(
                        ValidationError::new(
                            E::MissingField,
                            format!("Missing required metadata field: {field}"),
                        )
                        .table("metadata")
                        .field(*field),
                    );
                }
            }
            if let Some(version) = metadata.get("schemaVersion") {
                if version.as_u64().is_none() {
                    self.error(
                        ValidationError::new(E::InvalidType, "schemaVersion must be an integer")
                            .table("metadata")
                            .field("schemaVersion")
                            .expected("integer")
                            .actual(version.clone()),
                    );
                }
            }
            if let Some(format) = metadata.get("version") {
                self.format_version(format);
            }
        }

        if let Some(data) = root.get("data") {
            if data.get("workspace").map_or(true, Value::is_null) {
                self.error(
                    ValidationError::new(E::MissingField, "Missing workspace data")
                        .table("data")
                        .field("workspace"),
                );
            }
            if !data.get("clinics").map_or(false, Value::is_array) {
                self.error(
                    ValidationError::new(E::InvalidSchema, "data.clinics must be an array")
                        .table("data")
                        .field("clinics"),
                );
            }
        }
    }

    fn format_version(&mut self, raw: &Value) {
        let ours = Version::new(1, 0, 0);
        let ours = Version::parse(EXPORT_FORMAT_VERSION).unwrap_or(ours);
        let parsed = raw.as_str().map(Version::parse);
        match parsed {
            Some(Ok(theirs)) if theirs.major != ours.major => self.error(
                ValidationError::new(
                    E::InvalidSchema,
                    format!("Unsupported bundle format {theirs} (expected {}.x)", ours.major),
                )
                .table("metadata")
                .field("version")
                .expected(EXPORT_FORMAT_VERSION)
                .actual(raw.clone()),
            ),
            Some(Ok(theirs)) if theirs > ours => self.warnings.push(
                ValidationWarning::new(
                    ValidationWarningKind::VersionUpgrade,
                    format!("Bundle format {theirs} is newer than {ours}; unknown keys are carried through"),
                ),
            ),
            Some(Ok(_)) => {}
            _ => self.error(
                ValidationError::new(E::InvalidSchema, "metadata.version must be a semver string")
                    .table("metadata")
                    .field("version")
                    .actual(raw.clone()),
            ),
        }
    }

    fn checksum(&mut self, document: &Value) {
        let Some(stored) = document.pointer("/metadata/checksum") else {
            return;
        };
        if checksum::verify_document(document) {
            return;
        }
        self.error(
            ValidationError::new(
                E::ChecksumMismatch,
                "Bundle checksum verification failed. Data may be corrupted.",
            )
            .table("metadata")
            .field("checksum")
            .expected(checksum::checksum_document(document))
            .actual(stored.clone()),
        );
    }

    fn schema_version(&mut self, document: &Value, registry: &MigrationRegistry) {
        let Some(version) = document
            .pointer("/metadata/schemaVersion")
            .and_then(Value::as_u64)
        else {
            return;
        };
        let current = registry.current_version();
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if registry.is_from_future(version) {
            self.error(
                ValidationError::new(
                    E::InvalidSchema,
                    format!(
                        "Bundle is from a future schema version (v{version}); current is v{current}"
                    ),
                )
                .table("metadata")
                .field("schemaVersion")
                .expected(current)
                .actual(json!(version)),
            );
        } else if registry.needs_migration(version) {
            if registry.has_migration_path(version, current) {
                let summary = registry.migration_summary(version, current);
                self.warnings.push(
                    ValidationWarning::new(
                        ValidationWarningKind::MigrationRequired,
                        format!(
                            "Bundle is at v{version} and will be migrated to v{current} ({} steps)",
                            summary.len()
                        ),
                    )
                    .suggest(summary.join("; ")),
                );
            } else {
                self.error(
                    ValidationError::new(
                        E::InvalidSchema,
                        format!("No migration path exists from v{version} to v{current}"),
                    )
                    .table("metadata")
                    .field("schemaVersion")
                    .actual(json!(version)),
                );
            }
        }
    }

    fn check_money(&mut self, table: &str, row: &Record) {
        for (field, value) in row {
            if !field.ends_with("_cents") || value.is_null() || is_integer(value) {
                continue;
            }
            self.error(
                ValidationError::new(
                    E::InvalidType,
                    format!("{table}.{field} must be an integer number of cents"),
                )
                .table(table)
                .field(field.clone())
                .record(record_id(row))
                .expected("integer")
                .actual(value.clone()),
            );
        }
    }

    fn money(&mut self, document: &Value) {
        if let Some(ws) = workspace(document) {
            self.check_money(WORKSPACES_TABLE, ws);
        }
        for (table, rows) in global_lists(document) {
            for row in rows {
                self.check_money(table, row);
            }
        }
        for entry in clinic_entries(document) {
            let view = ClinicView::new(entry);
            if let Some(clinic) = view.clinic {
                self.check_money(CLINICS_TABLE, clinic);
            }
            for (table, rows) in &view.tables {
                for row in rows {
                    self.check_money(table, row);
                }
            }
        }
    }

    fn expect_string(&mut self, table: &str, row: &Record, field: &str) {
        match row.get(field) {
            Some(Value::String(_)) | None => {}
            Some(other) => self.error(
                ValidationError::new(E::InvalidType, format!("{table}.{field} must be a string"))
                    .table(table)
                    .field(field)
                    .record(record_id(row))
                    .expected("string")
                    .actual(other.clone()),
            ),
        }
    }

    fn types(&mut self, document: &Value) {
        if let Some(ws) = workspace(document) {
            self.expect_string(WORKSPACES_TABLE, ws, "id");
            self.expect_string(WORKSPACES_TABLE, ws, "name");
        }
        for (index, entry) in clinic_entries(document).iter().enumerate() {
            let view = ClinicView::new(entry);
            let Some(clinic) = view.clinic else {
                self.error(
                    ValidationError::new(
                        E::InvalidSchema,
                        format!("Clinic entry {index} has no clinic object"),
                    )
                    .table(CLINICS_TABLE),
                );
                continue;
            };
            if clinic.get("id").is_none() {
                self.error(
                    ValidationError::new(E::MissingField, format!("Clinic entry {index} has no id"))
                        .table(CLINICS_TABLE)
                        .field("id"),
                );
            }
            self.expect_string(CLINICS_TABLE, clinic, "id");
            self.expect_string(CLINICS_TABLE, clinic, "name");

            for (table, rows) in &view.tables {
                if !ClinicView::is_list(entry, table) {
                    continue;
                }
                for row in rows {
                    if row.get("id").map_or(true, Value::is_null) {
                        self.error(
                            ValidationError::new(E::MissingField, format!("{table} row has no id"))
                                .table(table.clone())
                                .field("id"),
                        );
                    } else {
                        self.expect_string(table, row, "id");
                    }
                }
            }
        }
    }

    fn fk_violation(&mut self, table: &str, field: &str, row: &Record, message: String) {
        self.error(
            ValidationError::new(E::FkViolation, message)
                .table(table)
                .field(field)
                .record(record_id(row))
                .actual(row.get(field).cloned().unwrap_or(Value::Null)),
        );
    }

    fn foreign_keys(&mut self, document: &Value) {
        let workspace_id = workspace(document).and_then(record_id);

        if let Some(ws_id) = &workspace_id {
            for (table, rows) in global_lists(document) {
                if table != "workspace_users" && table != "workspace_members" {
                    continue;
                }
                for row in rows {
                    if fk_value(row, "workspace_id").as_deref() != Some(ws_id.as_str()) {
                        self.fk_violation(
                            table,
                            "workspace_id",
                            row,
                            format!("{table} row does not belong to workspace {ws_id}"),
                        );
                    }
                }
            }
        }

        for entry in clinic_entries(document) {
            let view = ClinicView::new(entry);
            let Some(clinic) = view.clinic else { continue };

            if let (Some(ws_id), Some(owner)) = (&workspace_id, fk_value(clinic, "workspace_id")) {
                if &owner != ws_id {
                    self.fk_violation(
                        CLINICS_TABLE,
                        "workspace_id",
                        clinic,
                        format!("Clinic references workspace {owner}, bundle workspace is {ws_id}"),
                    );
                }
            }

            let clinic_id = view.id.clone();
            for (table, rows) in &view.tables {
                for row in rows {
                    let Some(owner) = fk_value(row, "clinic_id") else { continue };
                    if clinic_id.as_deref() != Some(owner.as_str()) {
                        self.fk_violation(
                            table,
                            "clinic_id",
                            row,
                            format!(
                                "{table} row belongs to clinic {owner}, not {}",
                                clinic_id.as_deref().unwrap_or("?")
                            ),
                        );
                    }
                }
            }

            let mut ids: HashMap<&str, HashSet<String>> = HashMap::new();
            for rule in CLINIC_FK_RULES {
                ids.entry(rule.parent).or_insert_with(|| {
                    view.rows(rule.parent)
                        .iter()
                        .filter_map(|row| record_id(row))
                        .collect()
                });
            }

            for rule in CLINIC_FK_RULES {
                let parents = &ids[rule.parent];
                for row in view.rows(rule.table) {
                    match fk_value(row, rule.field) {
                        None if rule.optional => {}
                        None => self.fk_violation(
                            rule.table,
                            rule.field,
                            row,
                            format!("{} row has no {}", rule.table, rule.field),
                        ),
                        Some(target) if parents.contains(&target) => {}
                        Some(target) => self.fk_violation(
                            rule.table,
                            rule.field,
                            row,
                            format!(
                                "{}.{} references {} {target}, which is not in this clinic",
                                rule.table, rule.field, rule.parent
                            ),
                        ),
                    }
                }
            }
        }
    }

    fn uniqueness(&mut self, document: &Value, current: u32) {
        if let Some(ws) = workspace(document) {
            if let Some(Value::String(slug)) = ws.get("slug") {
                if slug.trim().is_empty() {
                    self.error(
                        ValidationError::new(E::ConstraintViolation, "Workspace slug is required")
                            .table(WORKSPACES_TABLE)
                            .field("slug")
                            .record(record_id(ws)),
                    );
                }
            }
        }

        let mut clinic_ids = HashSet::new();
        for entry in clinic_entries(document) {
            let view = ClinicView::new(entry);
            if let Some(id) = &view.id {
                if !clinic_ids.insert(id.clone()) {
                    self.error(
                        ValidationError::new(E::ConstraintViolation, format!("Duplicate clinic id {id}"))
                            .table(CLINICS_TABLE)
                            .field("id")
                            .record(Some(id.clone())),
                    );
                }
            }

            for (table, rows) in &view.tables {
                let mut seen = HashSet::new();
                for row in rows {
                    let Some(id) = record_id(row) else { continue };
                    if !seen.insert(id.clone()) {
                        self.error(
                            ValidationError::new(
                                E::ConstraintViolation,
                                format!("Duplicate {table} id {id}"),
                            )
                            .table(table.clone())
                            .field("id")
                            .record(Some(id)),
                        );
                    }
                }
            }

            let mut emails: BTreeMap<String, u64> = BTreeMap::new();
            for patient in view.rows("patients") {
                if let Some(email) = patient.get("email").and_then(Value::as_str) {
                    let email = email.trim().to_lowercase();
                    if !email.is_empty() {
                        *emails.entry(email).or_default() += 1;
                    }
                }
            }
            let affected: u64 = emails.values().filter(|count| **count > 1).sum();
            if affected > 0 {
                self.warnings.push(
                    ValidationWarning::new(
                        ValidationWarningKind::DataLoss,
                        format!(
                            "Clinic {} has patients sharing an email address",
                            view.id.as_deref().unwrap_or("?")
                        ),
                    )
                    .affected(affected)
                    .suggest("Review duplicate patients after import"),
                );
            }

            let version = document
                .pointer("/metadata/schemaVersion")
                .and_then(Value::as_u64);
            if version == Some(u64::from(current)) && entry.get("tariffs").is_some() {
                self.warnings.push(
                    ValidationWarning::new(
                        ValidationWarningKind::DeprecatedField,
                        "tariffs were retired in v47 and will be ignored",
                    )
                    .affected(view.rows("tariffs").len() as u64),
                );
            }
        }
    }

    fn required(&mut self, document: &Value) {
        if let Some(ws) = workspace(document) {
            for field in ["name", "slug"] {
                let missing = match ws.get(field) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => field == "name" && s.trim().is_empty(),
                    Some(_) => false,
                };
                if missing {
                    self.error(
                        ValidationError::new(E::MissingField, format!("Workspace {field} is required"))
                            .table(WORKSPACES_TABLE)
                            .field(field)
                            .record(record_id(ws)),
                    );
                }
            }
        }

        for entry in clinic_entries(document) {
            let view = ClinicView::new(entry);
            if let Some(clinic) = view.clinic {
                if is_blank(clinic.get("name")) {
                    self.error(
                        ValidationError::new(E::MissingField, "Clinic name is required")
                            .table(CLINICS_TABLE)
                            .field("name")
                            .record(view.id.clone()),
                    );
                }
            }
            for service in view.rows("services") {
                if is_blank(service.get("name")) {
                    self.error(
                        ValidationError::new(E::MissingField, "Service name is required")
                            .table("services")
                            .field("name")
                            .record(record_id(service)),
                    );
                }
            }
        }
    }
}
