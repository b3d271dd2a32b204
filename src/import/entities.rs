//! Per-table importers for clinic-scoped collections.
//!
//! Each importer takes the rows of one table from a clinic entry, rewrites
//! ids and foreign keys against what has been created so far, and inserts
//! them. The registry is ordered so every parent table is imported before
//! the tables that reference it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::warn;

use super::mapping::IdMappings;
use super::progress::ProgressReporter;
use super::rollback::CompensationLog;
use super::table_order::{table_order_key, DEFAULT_RANK};
use super::ImportError;
use crate::bundle::tables::{is_parent_keyed, CLINIC_TABLES};
use crate::bundle::{fk_value, record_id, Record};
use crate::store::{Filter, Store, StoreResult};
use crate::validator::foreign_keys::{rules_for, FkRule};
use crate::validator::{ValidationError, ValidationErrorKind};

/// References that point at catalog rows rather than bundle entities in the
/// validator's sense, resolved only on import.
const IMPORT_LINKS: &[FkRule] = &[
    FkRule {
        table: "marketing_campaigns",
        field: "platform_id",
        parent: "custom_categories",
        optional: false,
    },
    FkRule {
        table: "patients",
        field: "platform_id",
        parent: "custom_categories",
        optional: true,
    },
];

const FALLBACK_CATEGORY: &str = "otros";
const CATEGORIES_TABLE: &str = "categories";

/// A row ready to insert, with the references to its own table that can only
/// be set once the whole table is in.
pub(crate) struct Rewritten {
    pub old_id: Option<String>,
    pub row: Record,
    deferred: Vec<(&'static str, String)>,
}

/// A self-reference waiting for its target row to be created.
struct PendingLink {
    table: &'static str,
    id: String,
    field: &'static str,
    target: String,
}

/// State shared by every phase of one import run.
pub(crate) struct Session<'s> {
    store: &'s dyn Store,
    progress: &'s ProgressReporter,
    pub workspace_id: Option<String>,
    pub mappings: IdMappings,
    pub log: CompensationLog,
    pub warnings: Vec<ValidationError>,
    pub imported: BTreeMap<String, u64>,
    fallback_category: Option<String>,
    pending: Vec<PendingLink>,
}

impl<'s> Session<'s> {
    pub fn new(store: &'s dyn Store, progress: &'s ProgressReporter) -> Self {
        Self {
            store,
            progress,
            workspace_id: None,
            mappings: IdMappings::default(),
            log: CompensationLog::default(),
            warnings: Vec::new(),
            imported: BTreeMap::new(),
            fallback_category: None,
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &'s dyn Store {
        self.store
    }

    /// Inserts a row, recording it for rollback and in the id mappings.
    pub async fn create(
        &mut self,
        table: &str,
        old_id: Option<String>,
        row: Record,
    ) -> StoreResult<String> {
        let new_id = self.store.insert(table, row).await?;
        self.log.push(table, &new_id);
        if let Some(old_id) = old_id {
            self.mappings.record(table, old_id, new_id.clone());
        }
        *self.imported.entry(table.to_string()).or_default() += 1;
        self.progress.add_records(1);
        Ok(new_id)
    }

    /// Inserts a rewritten row and queues its self-references.
    pub async fn create_rewritten(
        &mut self,
        table: &'static str,
        rewritten: Rewritten,
    ) -> Result<String, ImportError> {
        let id = self
            .create(table, rewritten.old_id, rewritten.row)
            .await
            .map_err(|source| ImportError::Store {
                table: table.to_string(),
                source,
            })?;
        for (field, target) in rewritten.deferred {
            self.pending.push(PendingLink {
                table,
                id: id.clone(),
                field,
                target,
            });
        }
        Ok(id)
    }

    /// Points queued self-references of `table` at the new ids. Targets that
    /// were not imported stay null.
    pub async fn link_pending(&mut self, table: &str) -> Result<(), ImportError> {
        let (links, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|link| link.table == table);
        self.pending = rest;

        for link in links {
            let Some(new) = self.mappings.resolve(table, &link.target).map(str::to_string) else {
                continue;
            };
            let mut changes = Record::new();
            changes.insert(link.field.into(), Value::String(new));
            self.store
                .update(table, &link.id, changes)
                .await
                .map_err(|source| ImportError::Store {
                    table: table.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn warn(&mut self, warning: ValidationError) {
        warn!(
            target: "clinic_bundle",
            event = "import_warning",
            kind = ?warning.kind,
            table = warning.table.as_deref().unwrap_or(""),
            message = %warning.message
        );
        self.progress.push_error(warning.clone());
        self.warnings.push(warning);
    }

    /// The system expense category used when a row's own category did not
    /// come across. Looked up once per run.
    async fn fallback_category(&mut self) -> Result<String, ImportError> {
        if let Some(id) = &self.fallback_category {
            return Ok(id.clone());
        }
        let candidates = self
            .store
            .select(CATEGORIES_TABLE, &Filter::eq("name", FALLBACK_CATEGORY))
            .await
            .map_err(|source| ImportError::Store {
                table: CATEGORIES_TABLE.to_string(),
                source,
            })?;
        let id = candidates
            .iter()
            .filter(|row| row.get("is_system") == Some(&Value::Bool(true)))
            .filter(|row| fk_value(row, "clinic_id").is_none())
            .filter(|row| {
                row.get("entity_type")
                    .and_then(Value::as_str)
                    .map_or(true, |kind| kind == "expense")
            })
            .find_map(record_id)
            .ok_or(ImportError::MissingSystemCategory)?;
        self.fallback_category = Some(id.clone());
        Ok(id)
    }

    /// Copies `row` for the new clinic with every reference rewritten.
    /// Self-references are nulled and handed back as deferred. `None` when a
    /// required reference cannot be resolved; a warning has been recorded in
    /// that case.
    fn rewrite(&mut self, table: &str, clinic_id: &str, row: &Record) -> Option<Rewritten> {
        let old_id = record_id(row);
        let mut deferred = Vec::new();
        let mut out = row.clone();
        out.remove("id");
        if !is_parent_keyed(table) || out.contains_key("clinic_id") {
            out.insert("clinic_id".into(), Value::String(clinic_id.to_string()));
        }
        if let (Some(ws), true) = (&self.workspace_id, out.contains_key("workspace_id")) {
            out.insert("workspace_id".into(), Value::String(ws.clone()));
        }

        let links = rules_for(table).chain(IMPORT_LINKS.iter().filter(|r| r.table == table));
        for rule in links {
            if rule.is_self_reference() {
                if let Some(target) = fk_value(&out, rule.field) {
                    out.insert(rule.field.into(), Value::Null);
                    deferred.push((rule.field, target));
                }
                continue;
            }
            let resolved = fk_value(&out, rule.field).map(|old| {
                let new = self.mappings.resolve(rule.parent, &old).map(str::to_string);
                (old, new)
            });
            match resolved {
                None if rule.optional => {}
                Some((_, Some(new))) => {
                    out.insert(rule.field.into(), Value::String(new));
                }
                Some((_, None)) if rule.optional => {
                    out.insert(rule.field.into(), Value::Null);
                }
                None => {
                    self.skip(rule, old_id, format!("{} row has no {}", table, rule.field));
                    return None;
                }
                Some((old, None)) => {
                    self.skip(
                        rule,
                        old_id,
                        format!("{} {old} was not imported; {} row skipped", rule.parent, table),
                    );
                    return None;
                }
            }
        }
        Some(Rewritten {
            old_id,
            row: out,
            deferred,
        })
    }

    fn skip(&mut self, rule: &FkRule, record: Option<String>, message: String) {
        self.warn(
            ValidationError::new(ValidationErrorKind::FkViolation, message)
                .table(rule.table)
                .field(rule.field)
                .record(record),
        );
    }
}

#[async_trait]
pub(crate) trait EntityImporter: Send + Sync {
    fn table(&self) -> &'static str;

    /// Imports `rows` into the clinic and returns how many were created.
    async fn import(
        &self,
        session: &mut Session<'_>,
        clinic_id: &str,
        rows: &[Record],
    ) -> Result<u64, ImportError>;
}

/// Rewrites references and inserts each row that resolves.
struct CollectionImporter {
    table: &'static str,
}

#[async_trait]
impl EntityImporter for CollectionImporter {
    fn table(&self) -> &'static str {
        self.table
    }

    async fn import(
        &self,
        session: &mut Session<'_>,
        clinic_id: &str,
        rows: &[Record],
    ) -> Result<u64, ImportError> {
        let mut created = 0;
        for row in rows {
            let Some(rewritten) = session.rewrite(self.table, clinic_id, row) else {
                continue;
            };
            session.create_rewritten(self.table, rewritten).await?;
            created += 1;
        }
        session.link_pending(self.table).await?;
        Ok(created)
    }
}

/// Expenses keep their category when it came across with the clinic's custom
/// categories; anything else is filed under the system fallback category.
struct ExpenseImporter;

#[async_trait]
impl EntityImporter for ExpenseImporter {
    fn table(&self) -> &'static str {
        "expenses"
    }

    async fn import(
        &self,
        session: &mut Session<'_>,
        clinic_id: &str,
        rows: &[Record],
    ) -> Result<u64, ImportError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let fallback = session.fallback_category().await?;

        let mut created = 0;
        let mut reclassified = 0u64;
        for row in rows {
            let Some(mut rewritten) = session.rewrite(self.table(), clinic_id, row) else {
                continue;
            };
            let category = fk_value(&rewritten.row, "category_id")
                .and_then(|old| session.mappings.resolve("custom_categories", &old))
                .map(str::to_string);
            let category = match category {
                Some(id) => id,
                None => {
                    reclassified += 1;
                    fallback.clone()
                }
            };
            rewritten
                .row
                .insert("category_id".into(), Value::String(category));
            session.create_rewritten(self.table(), rewritten).await?;
            created += 1;
        }
        session.link_pending(self.table()).await?;

        if reclassified > 0 {
            session.warn(
                ValidationError::new(
                    ValidationErrorKind::ConstraintViolation,
                    format!(
                        "{reclassified} expense(s) reclassified to \"{FALLBACK_CATEGORY}\" (original category not found in bundle)"
                    ),
                )
                .table(self.table())
                .field("category_id"),
            );
        }
        Ok(created)
    }
}

static REGISTRY: Lazy<Vec<Box<dyn EntityImporter>>> = Lazy::new(|| {
    let mut tables: Vec<&'static str> = CLINIC_TABLES
        .iter()
        .map(|t| t.name)
        .filter(|name| table_order_key(name).0 < DEFAULT_RANK)
        .collect();
    tables.sort_by_key(|name| table_order_key(name));
    tables
        .into_iter()
        .map(|table| -> Box<dyn EntityImporter> {
            match table {
                "expenses" => Box::new(ExpenseImporter),
                _ => Box::new(CollectionImporter { table }),
            }
        })
        .collect()
});

/// Importers for every clinic table that is carried over, in import order.
pub(crate) fn registry() -> &'static [Box<dyn EntityImporter>] {
    &REGISTRY
}
