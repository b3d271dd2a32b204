#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;

use clinic_bundle_lib::import::{
    ImportMode, ImportOptions, ImportStatus, Importer, ProgressReporter,
};
use clinic_bundle_lib::store::{Filter, MemoryStore, Store};
use clinic_bundle_lib::validator::ValidationErrorKind;
use serde_json::Value;

mod util;

use util::{
    sample_bundle, sample_document, seal, seeded_store, v50_bundle, CHILD_ROWS_PER_CLINIC,
};

fn ids(rows: &[serde_json::Map<String, Value>]) -> HashSet<String> {
    rows.iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn every_bundle_row_is_created_and_mapped() {
    let store = seeded_store().await;
    let bundle = sample_bundle();

    let result = Importer::new(&store)
        .import(&bundle, &ImportOptions::new("owner-1"))
        .await;

    assert!(result.success, "{:?}", result.errors);
    let expected = 1 + 2 + 2 * CHILD_ROWS_PER_CLINIC as u64;
    assert_eq!(result.total_imported(), expected);
    assert_eq!(result.id_mappings.len() as u64, expected);
    assert_eq!(result.clinic_ids.len(), 2);
    assert_eq!(result.records_imported.get("workspaces"), Some(&1));
    assert_eq!(result.records_imported.get("treatments"), Some(&10));

    let workspace_id = result.workspace_id.clone().unwrap();
    let workspace = store
        .select_one("workspaces", &Filter::eq("id", workspace_id.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workspace["name"], "Dental Group (Imported)");
    assert_eq!(workspace["owner_id"], "owner-1");
    assert!(workspace["slug"]
        .as_str()
        .unwrap()
        .starts_with("dental-group-import-"));

    let clinics = store.select("clinics", &Filter::All).await.unwrap();
    assert!(clinics.iter().all(|c| c["workspace_id"] == workspace_id.as_str()));

    let patients = ids(&store.select("patients", &Filter::All).await.unwrap());
    let services = ids(&store.select("services", &Filter::All).await.unwrap());
    for treatment in store.select("treatments", &Filter::All).await.unwrap() {
        assert!(patients.contains(treatment["patient_id"].as_str().unwrap()));
        assert!(services.contains(treatment["service_id"].as_str().unwrap()));
    }
}

fn bundle_ids(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(id)) = map.get("id") {
                out.insert(id.clone());
            }
            map.values().for_each(|v| bundle_ids(v, out));
        }
        Value::Array(items) => items.iter().for_each(|v| bundle_ids(v, out)),
        _ => {}
    }
}

#[tokio::test]
async fn no_stored_row_keeps_a_source_id() {
    let mut document = sample_document();
    let clinic = &mut document["data"]["clinics"][0];
    clinic["patients"][0]["campaign_id"] = Value::from("a-camp-1");
    clinic["patients"][0]["referred_by_patient_id"] = Value::from("a-pat-2");
    clinic["patients"][0]["platform_id"] = Value::from("a-cc-1");
    clinic["expenses"][0]["related_supply_id"] = Value::from("a-sup-1");
    clinic["expenses"][1]["parent_expense_id"] = Value::from("a-exp-1");

    let mut source_ids = HashSet::new();
    bundle_ids(&document, &mut source_ids);

    let store = seeded_store().await;
    let result = Importer::new(&store)
        .import(&seal(document), &ImportOptions::new("owner-1"))
        .await;
    assert!(result.success, "{:?}", result.errors);
    let fk_warnings = result
        .warnings
        .iter()
        .filter(|w| w.kind == ValidationErrorKind::FkViolation)
        .count();
    assert_eq!(fk_warnings, 0);

    for table in store.counts().await.into_keys() {
        for row in store.select(&table, &Filter::All).await.unwrap() {
            for (field, value) in &row {
                if let Value::String(text) = value {
                    assert!(
                        !source_ids.contains(text),
                        "{table}.{field} still holds source id {text}"
                    );
                }
            }
        }
    }

    let resolve = |table: &str, old: &str| result.id_mappings.resolve(table, old).unwrap().to_string();
    let patient = store
        .select_one("patients", &Filter::eq("id", resolve("patients", "a-pat-1")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patient["referred_by_patient_id"], resolve("patients", "a-pat-2").as_str());
    assert_eq!(patient["campaign_id"], resolve("marketing_campaigns", "a-camp-1").as_str());
    assert_eq!(patient["platform_id"], resolve("custom_categories", "a-cc-1").as_str());

    let child = store
        .select_one("expenses", &Filter::eq("id", resolve("expenses", "a-exp-2")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child["parent_expense_id"], resolve("expenses", "a-exp-1").as_str());
}

#[tokio::test]
async fn unknown_expense_category_falls_back_to_system_category() {
    let store = seeded_store().await;
    let result = Importer::new(&store)
        .import(&sample_bundle(), &ImportOptions::new("owner-1"))
        .await;
    assert!(result.success);

    let expenses = store.select("expenses", &Filter::All).await.unwrap();
    assert_eq!(expenses.len(), 4);
    let reclassified = expenses
        .iter()
        .filter(|e| e["category_id"] == "sys-otros")
        .count();
    assert_eq!(reclassified, 2);

    let warnings: Vec<_> = result
        .warnings
        .iter()
        .filter(|w| w.table.as_deref() == Some("expenses"))
        .collect();
    assert_eq!(warnings.len(), 2);
    assert!(warnings
        .iter()
        .all(|w| w.kind == ValidationErrorKind::ConstraintViolation));
}

#[tokio::test]
async fn core_table_failure_rolls_back_everything() {
    let store = seeded_store().await;
    store.fail_inserts("services", "disk I/O error").await;
    let reporter = Arc::new(ProgressReporter::new());

    let result = Importer::new(&store)
        .with_reporter(Arc::clone(&reporter))
        .import(&sample_bundle(), &ImportOptions::new("owner-1"))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("IMPORT_FAILED"));
    assert!(result.workspace_id.is_none());
    assert!(result.id_mappings.is_empty());

    let remaining = store.counts().await;
    assert_eq!(remaining.len(), 1, "{remaining:?}");
    assert_eq!(remaining.get("categories"), Some(&1));

    let progress = reporter.snapshot();
    assert_eq!(progress.status, ImportStatus::RolledBack);
    assert!(progress.completed_at.is_some());
    assert!(!progress.errors.is_empty());
}

#[tokio::test]
async fn history_table_failure_is_reported_as_warning() {
    let store = seeded_store().await;
    store.fail_inserts("action_logs", "constraint failed").await;

    let result = Importer::new(&store)
        .import(&sample_bundle(), &ImportOptions::new("owner-1"))
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert!(!result.records_imported.contains_key("action_logs"));
    assert!(result.warnings.iter().any(|w| {
        w.table.as_deref() == Some("action_logs")
            && w.kind == ValidationErrorKind::ConstraintViolation
    }));
    assert_eq!(store.count("treatments").await, 10);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let store = seeded_store().await;
    let mut options = ImportOptions::new("owner-1");
    options.dry_run = true;

    let result = Importer::new(&store).import(&sample_bundle(), &options).await;

    assert!(result.success);
    assert_eq!(store.writes(), 0);
    assert!(result.records_imported.is_empty());
    assert!(result.id_mappings.is_empty());
    assert_eq!(serde_json::to_value(&result.id_mappings).unwrap(), serde_json::json!({}));
}

#[tokio::test]
async fn merge_mode_is_rejected_before_any_write() {
    let store = seeded_store().await;
    let mut options = ImportOptions::new("owner-1");
    options.mode = ImportMode::Merge;

    let result = Importer::new(&store).import(&sample_bundle(), &options).await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("UNSUPPORTED_MODE"));
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn missing_system_category_aborts_and_rolls_back() {
    let store = MemoryStore::new();

    let result = Importer::new(&store)
        .import(&sample_bundle(), &ImportOptions::new("owner-1"))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("MISSING_SYSTEM_CATEGORY"));
    assert!(store.counts().await.is_empty());
}

#[tokio::test]
async fn old_bundle_is_migrated_before_import() {
    let store = MemoryStore::new();
    let reporter = Arc::new(ProgressReporter::new());

    let result = Importer::new(&store)
        .with_reporter(Arc::clone(&reporter))
        .import(&v50_bundle(), &ImportOptions::new("owner-1"))
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.migrations_applied.len(), 6);
    assert!(result.migrations_applied[0].starts_with("v50→v51"));
    assert!(result.migrations_applied[5].starts_with("v55→v56"));
    assert_eq!(result.total_imported(), 5);

    let treatment = store
        .select_one("treatments", &Filter::All)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(treatment["google_event_id"], Value::Null);
    assert_eq!(treatment["is_refunded"], false);

    let progress = reporter.snapshot();
    assert_eq!(progress.status, ImportStatus::Completed);
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.records_processed, 5);
}
