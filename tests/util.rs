#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use clinic_bundle_lib::checksum::add_checksum;
use clinic_bundle_lib::migrations::CURRENT_SCHEMA_VERSION;
use clinic_bundle_lib::store::MemoryStore;
use clinic_bundle_lib::Bundle;
use serde_json::{json, Value};

pub const WORKSPACE_ID: &str = "ws-src";
pub const CHILD_ROWS_PER_CLINIC: usize = 25;

/// One clinic with `CHILD_ROWS_PER_CLINIC` child rows spread across the
/// dependency chain. Ids are prefixed with `tag` so two clinics never clash.
pub fn clinic_entry(tag: &str) -> Value {
    let id = |suffix: &str| format!("{tag}-{suffix}");
    let clinic_id = id("clinic");

    let patients: Vec<Value> = (1..=5)
        .map(|n| {
            json!({
                "id": id(&format!("pat-{n}")),
                "clinic_id": clinic_id,
                "first_name": format!("Patient {n}"),
                "email": format!("{tag}.patient{n}@example.com"),
                "source_id": id("src-1"),
            })
        })
        .collect();
    let treatments: Vec<Value> = (1..=5)
        .map(|n| {
            json!({
                "id": id(&format!("trt-{n}")),
                "clinic_id": clinic_id,
                "patient_id": id(&format!("pat-{n}")),
                "service_id": id(&format!("svc-{}", 1 + n % 3)),
                "price_cents": 4500 + n as i64 * 100,
                "status": "completed",
            })
        })
        .collect();

    json!({
        "clinic": {"id": clinic_id, "name": format!("Clinic {tag}"), "workspace_id": WORKSPACE_ID},
        "settingsTime": {"id": id("settings"), "clinic_id": clinic_id, "monthly_goal_cents": 1_500_000},
        "customCategories": [
            {"id": id("cc-1"), "clinic_id": clinic_id, "name": "Instagram", "category_type_id": "ct-platform"}
        ],
        "patientSources": [
            {"id": id("src-1"), "clinic_id": clinic_id, "name": "Referral"}
        ],
        "supplies": [
            {"id": id("sup-1"), "clinic_id": clinic_id, "name": "Gloves", "price_cents": 1200},
            {"id": id("sup-2"), "clinic_id": clinic_id, "name": "Anesthetic", "price_cents": 3400}
        ],
        "services": [
            {"id": id("svc-1"), "clinic_id": clinic_id, "name": "Cleaning", "price_cents": 4500},
            {"id": id("svc-2"), "clinic_id": clinic_id, "name": "Filling", "price_cents": 9000},
            {"id": id("svc-3"), "clinic_id": clinic_id, "name": "Whitening", "price_cents": 15000}
        ],
        "serviceSupplies": [
            {"id": id("ss-1"), "service_id": id("svc-1"), "supply_id": id("sup-1"), "qty": 2},
            {"id": id("ss-2"), "service_id": id("svc-2"), "supply_id": id("sup-2"), "qty": 1}
        ],
        "marketingCampaigns": [
            {"id": id("camp-1"), "clinic_id": clinic_id, "name": "Spring", "platform_id": id("cc-1"), "is_archived": false}
        ],
        "patients": patients,
        "treatments": treatments,
        "expenses": [
            {"id": id("exp-1"), "clinic_id": clinic_id, "amount_cents": 25000, "category_id": id("cc-1"), "campaign_id": id("camp-1")},
            {"id": id("exp-2"), "clinic_id": clinic_id, "amount_cents": 8000, "category_id": "global-rent"}
        ],
        "actionLogs": [
            {"id": id("log-1"), "clinic_id": clinic_id, "action_type": "create_patient"},
            {"id": id("log-2"), "clinic_id": clinic_id, "action_type": "create_treatment"}
        ],
        "chatSessions": [],
        "chatMessages": [],
        "aiFeedback": [],
        "emailNotifications": [],
        "smsNotifications": [],
        "scheduledReminders": [],
        "pushSubscriptions": [],
        "pushNotifications": [],
        "medications": [],
        "prescriptions": [],
        "prescriptionItems": [],
        "quotes": [],
        "quoteItems": []
    })
}

/// A current-version document with one workspace and two clinics.
pub fn sample_document() -> Value {
    json!({
        "metadata": {
            "version": "1.0.0",
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "exportDate": "2025-03-01T10:00:00.000Z",
            "workspaceId": WORKSPACE_ID,
            "workspaceName": "Dental Group",
            "checksum": ""
        },
        "data": {
            "workspace": {"id": WORKSPACE_ID, "name": "Dental Group", "slug": "dental-group"},
            "clinics": [clinic_entry("a"), clinic_entry("b")]
        },
        "migrations": {"schemaVersion": CURRENT_SCHEMA_VERSION, "appliedMigrations": []}
    })
}

pub fn seal(document: Value) -> Bundle {
    let bundle: Bundle = serde_json::from_value(document).expect("fixture bundle");
    add_checksum(&bundle).expect("seal fixture")
}

pub fn sample_bundle() -> Bundle {
    seal(sample_document())
}

/// A v50 bundle: no chat, notification, prescription or quote collections.
pub fn v50_bundle() -> Bundle {
    seal(json!({
        "metadata": {
            "version": "1.0.0",
            "schemaVersion": 50,
            "exportDate": "2024-11-20T08:30:00.000Z",
            "workspaceId": WORKSPACE_ID,
            "workspaceName": "Dental Group",
            "checksum": ""
        },
        "data": {
            "workspace": {"id": WORKSPACE_ID, "name": "Dental Group", "slug": "dental-group"},
            "clinics": [{
                "clinic": {"id": "old-clinic", "name": "Legacy", "workspace_id": WORKSPACE_ID},
                "services": [{"id": "old-svc", "clinic_id": "old-clinic", "name": "Cleaning", "price_cents": 4500}],
                "patients": [{"id": "old-pat", "clinic_id": "old-clinic", "first_name": "Ana"}],
                "treatments": [{"id": "old-trt", "clinic_id": "old-clinic", "patient_id": "old-pat", "service_id": "old-svc", "price_cents": 4500}],
                "actionLogs": [],
                "clinicGoogleCalendar": null
            }]
        },
        "migrations": {"schemaVersion": 50, "appliedMigrations": []}
    }))
}

/// An empty store carrying the system fallback expense category.
pub async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .seed(
            "categories",
            vec![json!({
                "id": "sys-otros",
                "name": "otros",
                "is_system": true,
                "clinic_id": null,
                "entity_type": "expense"
            })],
        )
        .await;
    store
}
