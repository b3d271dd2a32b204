use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::bundle::Bundle;
use crate::checksum::{self, ChecksumError};
use crate::migrations::{self, MigrationRegistry, MigrationStats};
use crate::AppError;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(
        "bundle is from a future schema version (v{bundle}); this build supports up to v{current}"
    )]
    FutureVersion { bundle: u32, current: u32 },
    #[error("no migration path exists from v{from} to v{to}")]
    NoMigrationPath { from: u32, to: u32 },
    #[error("migration v{from}→v{to} validation failed: {}", errors.join(", "))]
    ValidationFailed {
        from: u32,
        to: u32,
        errors: Vec<String>,
    },
    #[error("migration v{from}→v{to} failed: {reason}")]
    MigrationFailed { from: u32, to: u32, reason: String },
    #[error("migration registry is inconsistent: {}", .0.join("; "))]
    InvalidRegistry(Vec<String>),
    #[error("failed to reseal migrated bundle: {0}")]
    Checksum(#[from] ChecksumError),
}

impl MigrationError {
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::FutureVersion { .. } => "FUTURE_VERSION",
            MigrationError::NoMigrationPath { .. } => "NO_MIGRATION_PATH",
            MigrationError::ValidationFailed { .. } => "VALIDATION_FAILED",
            MigrationError::MigrationFailed { .. } | MigrationError::Checksum(_) => {
                "MIGRATION_FAILED"
            }
            MigrationError::InvalidRegistry(_) => "INVALID_REGISTRY",
        }
    }
}

impl From<MigrationError> for AppError {
    fn from(error: MigrationError) -> Self {
        let app = AppError::new(format!("MIGRATION/{}", error.code()), error.to_string());
        match &error {
            MigrationError::FutureVersion { bundle, current } => app
                .with_context("bundle_version", bundle.to_string())
                .with_context("current_version", current.to_string()),
            MigrationError::NoMigrationPath { from, to }
            | MigrationError::ValidationFailed { from, to, .. }
            | MigrationError::MigrationFailed { from, to, .. } => app
                .with_context("from", from.to_string())
                .with_context("to", to.to_string()),
            _ => app,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateOptions {
    /// Run each step's post-condition checks.
    pub validate_each_step: bool,
    /// Downgrade post-condition failures to warnings instead of aborting.
    pub continue_on_warnings: bool,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MigrationResult {
    pub success: bool,
    pub original_version: u32,
    pub final_version: u32,
    pub migrations_applied: usize,
    pub migrations_summary: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[ts(type = "unknown")]
    pub bundle: Bundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MigrationCapability {
    pub can_migrate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub reason: Option<String>,
    pub migrations_needed: usize,
    pub summary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MigrationPreview {
    pub current_version: u32,
    pub target_version: u32,
    pub needs_migration: bool,
    pub migrations_to_apply: usize,
    pub migrations_summary: Vec<String>,
    pub can_migrate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SystemInfo {
    pub current_schema_version: u32,
    pub oldest_supported_version: u32,
    pub format_version: String,
    pub stats: MigrationStats,
    pub registry_errors: Vec<String>,
}

/// Walks a bundle forward through the migration catalog.
pub struct Migrator<'r> {
    registry: &'r MigrationRegistry,
}

impl Migrator<'static> {
    /// Migrator over the shipped catalog. Fails if the catalog is inconsistent.
    pub fn new() -> Result<Self, MigrationError> {
        Migrator::with_registry(migrations::registry())
    }
}

impl<'r> Migrator<'r> {
    pub fn with_registry(registry: &'r MigrationRegistry) -> Result<Self, MigrationError> {
        let errors = registry.validate();
        if !errors.is_empty() {
            return Err(MigrationError::InvalidRegistry(errors));
        }
        Ok(Self { registry })
    }

    pub fn current_version(&self) -> u32 {
        self.registry.current_version()
    }

    /// Migrates a copy of `bundle` to the current schema version.
    ///
    /// The input is never modified, even when a step fails. A bundle whose
    /// checksum verified on the way in is resealed after migration; a bundle
    /// that did not verify keeps its stale checksum so the validator still
    /// reports it.
    pub fn migrate(
        &self,
        bundle: &Bundle,
        options: MigrateOptions,
    ) -> Result<MigrationResult, MigrationError> {
        let original = bundle.schema_version();
        let current = self.current_version();

        if original == current {
            return Ok(MigrationResult {
                success: true,
                original_version: original,
                final_version: current,
                migrations_applied: 0,
                migrations_summary: Vec::new(),
                errors: Vec::new(),
                warnings: vec!["Bundle is already at current schema version".to_string()],
                bundle: bundle.clone(),
            });
        }
        if self.registry.is_from_future(original) {
            return Err(MigrationError::FutureVersion {
                bundle: original,
                current,
            });
        }
        if !self.registry.has_migration_path(original, current) {
            return Err(MigrationError::NoMigrationPath {
                from: original,
                to: current,
            });
        }

        let was_sealed = checksum::verify_checksum(bundle)?;
        let mut working = bundle.clone();
        let mut warnings = Vec::new();
        let mut applied = 0usize;

        for step in self.registry.migrations_to_apply(original) {
            let (from, to) = (step.from_version(), step.to_version());
            debug!(
                target: "clinic_bundle",
                event = "migration_step_started",
                from,
                to,
                description = step.description()
            );

            working = step.transform(working);
            let landed = working.schema_version();
            if landed != from && landed != to {
                return Err(MigrationError::MigrationFailed {
                    from,
                    to,
                    reason: format!("transform moved schemaVersion to v{landed}"),
                });
            }
            working.set_schema_version(to);
            working.migrations.applied_migrations.push(step.label());
            applied += 1;

            if options.validate_each_step {
                let errors = step.validate(&working);
                if !errors.is_empty() {
                    if !options.continue_on_warnings {
                        warn!(
                            target: "clinic_bundle",
                            event = "migration_validation_failed",
                            from,
                            to,
                            errors = errors.len()
                        );
                        return Err(MigrationError::ValidationFailed { from, to, errors });
                    }
                    warnings.push(format!(
                        "Migration v{from}→v{to} has validation warnings: {}",
                        errors.join(", ")
                    ));
                }
            }

            info!(
                target: "clinic_bundle",
                event = "migration_applied",
                from,
                to,
                description = step.description()
            );
        }

        if was_sealed {
            working = checksum::add_checksum(&working)?;
        }

        Ok(MigrationResult {
            success: true,
            original_version: original,
            final_version: working.schema_version(),
            migrations_applied: applied,
            migrations_summary: self.registry.migration_summary(original, current),
            errors: Vec::new(),
            warnings,
            bundle: working,
        })
    }

    pub fn can_migrate(&self, version: u32) -> MigrationCapability {
        let current = self.current_version();
        if version == current {
            return MigrationCapability {
                can_migrate: true,
                reason: None,
                migrations_needed: 0,
                summary: Vec::new(),
            };
        }
        let blocked = |reason: String| MigrationCapability {
            can_migrate: false,
            reason: Some(reason),
            migrations_needed: 0,
            summary: Vec::new(),
        };
        if self.registry.is_from_future(version) {
            return blocked(format!(
                "Bundle is from future version v{version} (current: v{current})"
            ));
        }
        if !self.registry.has_migration_path(version, current) {
            return blocked(format!(
                "No migration path exists from v{version} to v{current}"
            ));
        }
        MigrationCapability {
            can_migrate: true,
            reason: None,
            migrations_needed: self.registry.migrations_to_apply(version).len(),
            summary: self.registry.migration_summary(version, current),
        }
    }

    pub fn preview_migration(&self, bundle: &Bundle) -> MigrationPreview {
        let version = bundle.schema_version();
        let check = self.can_migrate(version);
        MigrationPreview {
            current_version: version,
            target_version: self.current_version(),
            needs_migration: self.registry.needs_migration(version),
            migrations_to_apply: check.migrations_needed,
            migrations_summary: check.summary,
            can_migrate: check.can_migrate,
            reason: check.reason,
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        let stats = self.registry.stats();
        SystemInfo {
            current_schema_version: self.current_version(),
            oldest_supported_version: stats.oldest_version,
            format_version: migrations::EXPORT_FORMAT_VERSION.to_string(),
            stats,
            registry_errors: self.registry.validate(),
        }
    }
}

/// Import-path migration: validates every step and keeps going on
/// post-condition warnings.
pub fn migrate_bundle(bundle: &Bundle) -> Result<MigrationResult, MigrationError> {
    Migrator::new()?.migrate(
        bundle,
        MigrateOptions {
            validate_each_step: true,
            continue_on_warnings: true,
        },
    )
}

pub fn preview_migration(bundle: &Bundle) -> Result<MigrationPreview, MigrationError> {
    Ok(Migrator::new()?.preview_migration(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ClinicDataBundle, Record};
    use crate::migrations::{steps::Step, ExportMigration, CURRENT_SCHEMA_VERSION};
    use serde_json::json;

    fn obj(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn bundle_at(version: u32) -> Bundle {
        let mut clinic = ClinicDataBundle::new(obj(json!({"id": "c-1", "name": "Centro"})));
        clinic.expenses = vec![obj(json!({"id": "e-1", "amount_cents": 500}))];
        clinic.treatments = vec![obj(json!({"id": "t-1", "price_cents": 1000}))];
        clinic.services = vec![obj(json!({"id": "s-1", "name": "Cleaning", "price_cents": 1000}))];
        clinic.tariffs = Some(vec![obj(json!({"id": "tf-1", "price_cents": 100}))]);
        let value = json!({
            "metadata": {
                "version": "1.0.0",
                "schemaVersion": version,
                "exportDate": "2025-01-01T00:00:00.000Z",
                "workspaceId": "ws-1",
                "workspaceName": "Dental Group",
                "checksum": ""
            },
            "data": {"workspace": {"id": "ws-1", "name": "Dental Group", "slug": "dental"}, "clinics": []},
            "migrations": {"schemaVersion": version, "appliedMigrations": []}
        });
        let mut bundle: Bundle = serde_json::from_value(value).unwrap();
        bundle.data.clinics.push(clinic);
        bundle
    }

    #[test]
    fn current_bundle_is_left_alone() {
        let bundle = bundle_at(CURRENT_SCHEMA_VERSION);
        let result = Migrator::new()
            .unwrap()
            .migrate(&bundle, MigrateOptions::default())
            .unwrap();
        assert!(result.success);
        assert_eq!(result.migrations_applied, 0);
        assert_eq!(result.bundle, bundle);
    }

    #[test]
    fn future_bundle_is_refused() {
        let err = Migrator::new()
            .unwrap()
            .migrate(&bundle_at(60), MigrateOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "FUTURE_VERSION");
    }

    #[test]
    fn pre_baseline_bundle_has_no_path() {
        let err = Migrator::new()
            .unwrap()
            .migrate(&bundle_at(30), MigrateOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::NoMigrationPath { from: 30, to: 56 }));
    }

    #[test]
    fn baseline_bundle_reaches_current_shape() {
        let input = bundle_at(41);
        let result = migrate_bundle(&input).unwrap();
        let clinic = &result.bundle.data.clinics[0];

        assert_eq!(result.migrations_applied, 15);
        assert_eq!(result.final_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(result.bundle.migrations.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(result.bundle.migrations.applied_migrations.len(), 15);
        assert!(clinic.tariffs.is_none());
        assert_eq!(clinic.expenses[0]["campaign_id"], serde_json::Value::Null);
        assert_eq!(clinic.expenses[0]["is_recurring"], false);
        assert_eq!(clinic.services[0]["final_price_with_discount_cents"], 1000);
        assert_eq!(clinic.treatments[0]["is_refunded"], false);
        assert_eq!(clinic.clinic_google_calendar, Some(None));
        assert_eq!(clinic.quote_items.as_ref().map(Vec::len), Some(0));
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);

        // input untouched
        assert_eq!(input.schema_version(), 41);
        assert!(input.data.clinics[0].tariffs.is_some());
    }

    #[test]
    fn sealed_bundle_is_resealed_and_unsealed_stays_stale() {
        let sealed = checksum::add_checksum(&bundle_at(50)).unwrap();
        let migrated = migrate_bundle(&sealed).unwrap().bundle;
        assert!(checksum::verify_checksum(&migrated).unwrap());

        let mut tampered = sealed.clone();
        tampered.data.clinics[0].expenses[0].insert("amount_cents".into(), json!(1));
        let migrated = migrate_bundle(&tampered).unwrap().bundle;
        assert!(!checksum::verify_checksum(&migrated).unwrap());
    }

    fn broken_validate(_: &Bundle) -> Vec<String> {
        vec!["always wrong".to_string()]
    }

    fn registry_with_failing_check() -> MigrationRegistry {
        let steps = crate::migrations::steps::shipped()
            .into_iter()
            .map(|mut s| {
                if s.from == 52 {
                    s.validate = Some(broken_validate);
                }
                Box::new(s) as Box<dyn ExportMigration>
            })
            .collect();
        MigrationRegistry::new(steps, CURRENT_SCHEMA_VERSION)
    }

    #[test]
    fn failing_post_condition_aborts_or_warns() {
        let registry = registry_with_failing_check();
        let migrator = Migrator::with_registry(&registry).unwrap();
        let bundle = bundle_at(50);

        let strict = MigrateOptions {
            validate_each_step: true,
            continue_on_warnings: false,
        };
        let err = migrator.migrate(&bundle, strict).unwrap_err();
        assert!(matches!(err, MigrationError::ValidationFailed { from: 52, to: 53, .. }));
        assert_eq!(bundle.schema_version(), 50);

        let lenient = MigrateOptions {
            validate_each_step: true,
            continue_on_warnings: true,
        };
        let result = migrator.migrate(&bundle, lenient).unwrap();
        assert_eq!(result.final_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("always wrong"));
    }

    fn jumps_ahead(mut bundle: Bundle) -> Bundle {
        bundle.set_schema_version(99);
        bundle
    }

    #[test]
    fn transform_that_moves_version_elsewhere_fails() {
        let steps = crate::migrations::steps::shipped()
            .into_iter()
            .map(|mut s: Step| {
                if s.from == 55 {
                    s.transform = jumps_ahead;
                }
                Box::new(s) as Box<dyn ExportMigration>
            })
            .collect();
        let registry = MigrationRegistry::new(steps, CURRENT_SCHEMA_VERSION);
        let err = Migrator::with_registry(&registry)
            .unwrap()
            .migrate(&bundle_at(54), MigrateOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "MIGRATION_FAILED");
    }

    #[test]
    fn broken_registry_is_rejected_up_front() {
        let registry = MigrationRegistry::new(Vec::new(), CURRENT_SCHEMA_VERSION);
        assert!(Migrator::with_registry(&registry).is_ok());
        let steps = crate::migrations::steps::shipped()
            .into_iter()
            .filter(|s| s.from != 44)
            .map(|s| Box::new(s) as Box<dyn ExportMigration>)
            .collect();
        let registry = MigrationRegistry::new(steps, CURRENT_SCHEMA_VERSION);
        assert!(matches!(
            Migrator::with_registry(&registry),
            Err(MigrationError::InvalidRegistry(_))
        ));
    }

    #[test]
    fn capability_and_preview() {
        let migrator = Migrator::new().unwrap();
        let cap = migrator.can_migrate(50);
        assert!(cap.can_migrate);
        assert_eq!(cap.migrations_needed, 6);
        assert_eq!(cap.summary[0], "v50→v51: Add AI chat sessions, messages and feedback");

        let cap = migrator.can_migrate(57);
        assert!(!cap.can_migrate);
        assert!(cap.reason.unwrap().contains("future"));

        let preview = migrator.preview_migration(&bundle_at(55));
        assert!(preview.needs_migration);
        assert_eq!(preview.migrations_to_apply, 1);
        assert_eq!(preview.target_version, CURRENT_SCHEMA_VERSION);

        let info = migrator.system_info();
        assert_eq!(info.oldest_supported_version, 41);
        assert!(info.registry_errors.is_empty());
    }
}
