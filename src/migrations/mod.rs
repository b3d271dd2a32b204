//! Catalog of bundle schema migrations.
//!
//! Every entry converts a bundle from generation `N` to `N + 1`. The catalog
//! has to be contiguous from [`BASELINE`] up to [`CURRENT_SCHEMA_VERSION`];
//! [`MigrationRegistry::validate`] reports anything else and the migrator
//! refuses to start with a broken catalog.
//!
//! Adding a generation: append a `Step` in `steps.rs`, bump
//! `CURRENT_SCHEMA_VERSION`, and register any new collection in
//! `bundle::tables`.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::bundle::Bundle;

pub mod steps;

pub use crate::bundle::BASELINE;

pub const CURRENT_SCHEMA_VERSION: u32 = 56;
pub const EXPORT_FORMAT_VERSION: &str = "1.0.0";

/// A pure, total conversion of a bundle from one schema generation to the next.
pub trait ExportMigration: Send + Sync {
    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32 {
        self.from_version() + 1
    }

    fn description(&self) -> &str;

    /// Reshapes the bundle. Must not fail and must not rely on fields that
    /// only later generations introduce.
    fn transform(&self, bundle: Bundle) -> Bundle;

    /// Post-conditions checked on the transformed bundle.
    fn validate(&self, _bundle: &Bundle) -> Vec<String> {
        Vec::new()
    }

    fn label(&self) -> String {
        format!(
            "v{}→v{}: {}",
            self.from_version(),
            self.to_version(),
            self.description()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MigrationStats {
    pub total_migrations: usize,
    pub oldest_version: u32,
    pub newest_version: u32,
    pub current_version: u32,
    pub has_gaps: bool,
}

pub struct MigrationRegistry {
    steps: Vec<Box<dyn ExportMigration>>,
    current: u32,
}

static SHIPPED: Lazy<MigrationRegistry> = Lazy::new(|| {
    let steps = steps::shipped()
        .into_iter()
        .map(|step| Box::new(step) as Box<dyn ExportMigration>)
        .collect();
    MigrationRegistry::new(steps, CURRENT_SCHEMA_VERSION)
});

/// The catalog compiled into this build.
pub fn registry() -> &'static MigrationRegistry {
    &SHIPPED
}

impl MigrationRegistry {
    pub fn new(steps: Vec<Box<dyn ExportMigration>>, current: u32) -> Self {
        Self { steps, current }
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn find(&self, from: u32) -> Option<&dyn ExportMigration> {
        self.steps
            .iter()
            .find(|m| m.from_version() == from && m.to_version() == from + 1)
            .map(|m| m.as_ref())
    }

    /// Steps taking `from` to the current version, in order. Missing steps are
    /// skipped; check [`Self::has_migration_path`] first.
    pub fn migrations_to_apply(&self, from: u32) -> Vec<&dyn ExportMigration> {
        (from..self.current).filter_map(|v| self.find(v)).collect()
    }

    pub fn has_migration_path(&self, from: u32, to: u32) -> bool {
        (from..to).all(|v| self.find(v).is_some())
    }

    pub fn migration_summary(&self, from: u32, to: u32) -> Vec<String> {
        (from..to)
            .filter_map(|v| self.find(v))
            .map(|m| m.label())
            .collect()
    }

    pub fn needs_migration(&self, version: u32) -> bool {
        version < self.current
    }

    pub fn is_from_future(&self, version: u32) -> bool {
        version > self.current
    }

    /// Inconsistencies in the catalog; empty when it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut versions: Vec<u32> = self.steps.iter().map(|m| m.from_version()).collect();
        versions.sort_unstable();
        versions.dedup();
        if let Some(&oldest) = versions.first() {
            if oldest != BASELINE {
                errors.push(format!(
                    "Oldest migration starts at v{oldest} but the baseline is v{BASELINE}"
                ));
            }
        }
        for pair in versions.windows(2) {
            if pair[1] != pair[0] + 1 {
                errors.push(format!("Gap in migration versions: {} → {}", pair[0], pair[1]));
            }
        }

        let mut seen = HashSet::new();
        for m in &self.steps {
            let key = (m.from_version(), m.to_version());
            if !seen.insert(key) {
                errors.push(format!("Duplicate migration: {}-{}", key.0, key.1));
            }
        }

        for m in &self.steps {
            if m.to_version() != m.from_version() + 1 {
                errors.push(format!(
                    "Non-sequential migration: {} → {} (must be +1)",
                    m.from_version(),
                    m.to_version()
                ));
            }
        }

        if let Some(newest) = self.steps.iter().map(|m| m.to_version()).max() {
            if newest != self.current {
                errors.push(format!(
                    "Newest migration ends at v{newest} but current schema is v{}",
                    self.current
                ));
            }
        }

        errors
    }

    pub fn stats(&self) -> MigrationStats {
        let oldest = self.steps.iter().map(|m| m.from_version()).min();
        let newest = self.steps.iter().map(|m| m.to_version()).max();
        let mut versions: Vec<u32> = self.steps.iter().map(|m| m.from_version()).collect();
        versions.sort_unstable();
        versions.dedup();
        MigrationStats {
            total_migrations: self.steps.len(),
            oldest_version: oldest.unwrap_or(self.current),
            newest_version: newest.unwrap_or(self.current),
            current_version: self.current,
            has_gaps: versions.windows(2).any(|pair| pair[1] != pair[0] + 1),
        }
    }
}
