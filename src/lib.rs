//! Workspace bundle engine: export a workspace and its clinics to a
//! portable JSON bundle, upgrade old bundles, validate them and import them
//! into a fresh workspace with rollback on failure.

pub mod bundle;
pub mod checksum;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod migrations;
pub mod migrator;
pub mod store;
pub mod validator;

pub use bundle::Bundle;
pub use error::{AppError, AppResult};
pub use export::{export_workspace, ExportOptions, ExportStats, Exporter};
pub use import::{import_bundle, ImportOptions, ImportResult, Importer};
pub use migrator::{migrate_bundle, preview_migration, Migrator};
pub use store::{MemoryStore, SqliteStore, Store};
pub use validator::{validate_bundle, ValidationResult, Validator};
