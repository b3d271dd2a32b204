#![allow(clippy::unwrap_used, clippy::expect_used)]

use clinic_bundle_lib::checksum::{add_checksum, verify_checksum, verify_document};
use clinic_bundle_lib::migrations::CURRENT_SCHEMA_VERSION;
use clinic_bundle_lib::migrator::migrate_bundle;
use clinic_bundle_lib::validator::validate_bundle;
use proptest::prelude::*;
use serde_json::{json, Value};

mod util;

use util::{sample_bundle, sample_document, seal, WORKSPACE_ID};

/// A minimal bundle at `version` carrying only baseline collections, plus
/// tariffs while they still existed.
fn minimal_at(version: u32, patients: usize, price: i64) -> Value {
    let patients: Vec<Value> = (0..patients)
        .map(|n| json!({"id": format!("p-{n}"), "clinic_id": "c-1", "first_name": format!("P{n}")}))
        .collect();
    let mut document = json!({
        "metadata": {
            "version": "1.0.0",
            "schemaVersion": version,
            "exportDate": "2024-06-01T00:00:00.000Z",
            "workspaceId": WORKSPACE_ID,
            "workspaceName": "Dental Group",
            "checksum": ""
        },
        "data": {
            "workspace": {"id": WORKSPACE_ID, "name": "Dental Group", "slug": "dental-group"},
            "clinics": [{
                "clinic": {"id": "c-1", "name": "Centro", "workspace_id": WORKSPACE_ID},
                "settingsTime": {"id": "st-1", "clinic_id": "c-1"},
                "services": [{"id": "s-1", "clinic_id": "c-1", "name": "Cleaning", "price_cents": price}],
                "patients": patients,
                "expenses": [{"id": "e-1", "clinic_id": "c-1", "amount_cents": price}],
                "marketingCampaigns": [{"id": "m-1", "clinic_id": "c-1", "name": "Spring"}]
            }]
        },
        "migrations": {"schemaVersion": version, "appliedMigrations": []}
    });
    if version < 47 {
        document["data"]["clinics"][0]["tariffs"] =
            json!([{"id": "tar-1", "clinic_id": "c-1", "service_id": "s-1", "price_cents": price}]);
    }
    document
}

proptest! {
    #[test]
    fn any_edit_to_a_service_price_breaks_the_seal(delta in 1i64..1_000_000) {
        let bundle = sample_bundle();
        prop_assert!(verify_checksum(&bundle).unwrap());

        let mut document = serde_json::to_value(&bundle).unwrap();
        let price = &mut document["data"]["clinics"][0]["services"][0]["price_cents"];
        *price = json!(price.as_i64().unwrap() + delta);
        prop_assert!(!verify_document(&document));
    }

    #[test]
    fn renaming_any_patient_breaks_the_seal(index in 0usize..5, name in "[a-z]{1,12}") {
        let mut document = serde_json::to_value(sample_bundle()).unwrap();
        document["data"]["clinics"][1]["patients"][index]["first_name"] = json!(name);
        prop_assert!(!verify_document(&document));
    }

    #[test]
    fn every_supported_version_converges_on_current(
        version in 41u32..CURRENT_SCHEMA_VERSION,
        patients in 0usize..6,
        price in 0i64..500_000,
    ) {
        let bundle = seal(minimal_at(version, patients, price));
        let migrated = migrate_bundle(&bundle).unwrap();

        prop_assert!(migrated.success);
        prop_assert_eq!(migrated.final_version, CURRENT_SCHEMA_VERSION);
        prop_assert_eq!(
            migrated.migrations_applied,
            (CURRENT_SCHEMA_VERSION - version) as usize
        );
        prop_assert_eq!(&migrated.bundle.migrations.applied_migrations, &migrated.migrations_summary);
        prop_assert!(verify_checksum(&migrated.bundle).unwrap());

        let clinic = &migrated.bundle.data.clinics[0];
        prop_assert!(clinic.tariffs.is_none());
        prop_assert!(clinic.quote_items.is_some());
        prop_assert_eq!(clinic.patients.len(), patients);

        let report = validate_bundle(&migrated.bundle).unwrap();
        prop_assert!(report.valid, "{:?}", report.errors);
    }
}

#[test]
fn migrating_twice_is_a_no_op() {
    let once = migrate_bundle(&seal(minimal_at(41, 2, 1999))).unwrap();
    let twice = migrate_bundle(&once.bundle).unwrap();
    assert_eq!(twice.migrations_applied, 0);
    assert_eq!(twice.bundle, once.bundle);
}

#[test]
fn unsealed_input_stays_unsealed_after_migration() {
    let mut document = minimal_at(45, 1, 500);
    document["metadata"]["checksum"] = json!("0".repeat(64));
    let bundle = serde_json::from_value(document).unwrap();
    let migrated = migrate_bundle(&bundle).unwrap();
    assert!(!verify_checksum(&migrated.bundle).unwrap());
}

#[test]
fn sealing_is_stable_across_key_order() {
    let bundle = sample_bundle();
    let resealed = add_checksum(&bundle).unwrap();
    assert_eq!(resealed.metadata.checksum, bundle.metadata.checksum);

    let document = sample_document();
    let reparsed: Value = serde_json::from_str(&document.to_string()).unwrap();
    assert_eq!(seal(reparsed).metadata.checksum, bundle.metadata.checksum);
}
