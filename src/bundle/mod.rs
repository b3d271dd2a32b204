//! The portable workspace bundle: one JSON document with `metadata`, `data`
//! and `migrations` sections.
//!
//! The envelope and the per-clinic collections are typed. Collections that a
//! later schema generation introduced are `Option`s, so a migration that adds
//! one is an explicit `None -> Some` conversion and code that reads them has
//! to acknowledge older bundles. Unknown keys at every level are kept in
//! `extra` so a bundle survives a read/write cycle byte-for-byte under the
//! canonical encoding.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{AppError, AppResult};

pub mod record;
pub mod tables;

pub use record::{fk_value, record_id, str_field, Record};
pub use tables::{ClinicTable, Shape, BASELINE, CLINIC_TABLES, GLOBAL_TABLES};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub metadata: BundleMetadata,
    pub data: BundleData,
    pub migrations: MigrationInfo,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedBy {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    /// Bundle format version (semver).
    pub version: String,
    pub schema_version: u32,
    pub export_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_by: Option<ExportedBy>,
    pub workspace_id: String,
    pub workspace_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_count: Option<u64>,
    #[serde(default)]
    pub record_counts: BTreeMap<String, u64>,
    /// Empty until `checksum::add_checksum` seals the bundle.
    #[serde(default)]
    pub checksum: String,
    #[serde(flatten)]
    pub extra: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleData {
    pub workspace: Record,
    #[serde(default)]
    pub organizations: Vec<Record>,
    #[serde(default)]
    pub category_types: Vec<Record>,
    #[serde(default)]
    pub role_permissions: Vec<Record>,
    #[serde(default)]
    pub workspace_users: Vec<Record>,
    #[serde(default)]
    pub workspace_members: Vec<Record>,
    pub clinics: Vec<ClinicDataBundle>,
    #[serde(flatten)]
    pub extra: Record,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
    pub schema_version: u32,
    #[serde(default)]
    pub applied_migrations: Vec<String>,
    #[serde(flatten)]
    pub extra: Record,
}

/// A clinic and every collection it owns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicDataBundle {
    pub clinic: Record,
    #[serde(default)]
    pub settings_time: Option<Record>,
    #[serde(default)]
    pub custom_categories: Vec<Record>,
    #[serde(default)]
    pub categories: Vec<Record>,
    #[serde(default)]
    pub patient_sources: Vec<Record>,
    #[serde(default)]
    pub invitations: Vec<Record>,
    #[serde(default)]
    pub clinic_users: Vec<Record>,
    #[serde(default)]
    pub assets: Vec<Record>,
    #[serde(default)]
    pub supplies: Vec<Record>,
    #[serde(default)]
    pub fixed_costs: Vec<Record>,
    #[serde(default)]
    pub services: Vec<Record>,
    #[serde(default)]
    pub service_supplies: Vec<Record>,
    /// Retired by the v47 migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tariffs: Option<Vec<Record>>,
    #[serde(default)]
    pub marketing_campaigns: Vec<Record>,
    #[serde(default)]
    pub marketing_campaign_status_history: Vec<Record>,
    #[serde(default)]
    pub patients: Vec<Record>,
    #[serde(default)]
    pub treatments: Vec<Record>,
    #[serde(default)]
    pub expenses: Vec<Record>,
    /// Only present when the export included audit logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_activity: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_logs: Option<Vec<Record>>,
    /// Outer `None`: the bundle predates the collection. `Some(None)`: no link.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub clinic_google_calendar: Option<Option<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_sessions: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_messages: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_feedback: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_notifications: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms_notifications: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_reminders: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscriptions: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_notifications: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medications: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescriptions: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescription_items: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotes: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_items: Option<Vec<Record>>,
    #[serde(default)]
    pub record_counts: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub extra: Record,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<Record>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Record>::deserialize(deserializer).map(Some)
}

impl ClinicDataBundle {
    pub fn new(clinic: Record) -> Self {
        Self {
            clinic,
            ..Self::default()
        }
    }

    pub fn clinic_id(&self) -> Option<String> {
        record_id(&self.clinic)
    }

    /// Rows of a list-shaped table; `None` when the bundle does not carry it.
    pub fn list(&self, table: &str) -> Option<&Vec<Record>> {
        match table {
            "custom_categories" => Some(&self.custom_categories),
            "categories" => Some(&self.categories),
            "patient_sources" => Some(&self.patient_sources),
            "invitations" => Some(&self.invitations),
            "clinic_users" => Some(&self.clinic_users),
            "assets" => Some(&self.assets),
            "supplies" => Some(&self.supplies),
            "fixed_costs" => Some(&self.fixed_costs),
            "services" => Some(&self.services),
            "service_supplies" => Some(&self.service_supplies),
            "tariffs" => self.tariffs.as_ref(),
            "marketing_campaigns" => Some(&self.marketing_campaigns),
            "marketing_campaign_status_history" => Some(&self.marketing_campaign_status_history),
            "patients" => Some(&self.patients),
            "treatments" => Some(&self.treatments),
            "expenses" => Some(&self.expenses),
            "workspace_activity" => self.workspace_activity.as_ref(),
            "action_logs" => self.action_logs.as_ref(),
            "chat_sessions" => self.chat_sessions.as_ref(),
            "chat_messages" => self.chat_messages.as_ref(),
            "ai_feedback" => self.ai_feedback.as_ref(),
            "email_notifications" => self.email_notifications.as_ref(),
            "sms_notifications" => self.sms_notifications.as_ref(),
            "scheduled_reminders" => self.scheduled_reminders.as_ref(),
            "push_subscriptions" => self.push_subscriptions.as_ref(),
            "push_notifications" => self.push_notifications.as_ref(),
            "medications" => self.medications.as_ref(),
            "prescriptions" => self.prescriptions.as_ref(),
            "prescription_items" => self.prescription_items.as_ref(),
            "quotes" => self.quotes.as_ref(),
            "quote_items" => self.quote_items.as_ref(),
            _ => None,
        }
    }

    pub fn list_mut(&mut self, table: &str) -> Option<&mut Vec<Record>> {
        match table {
            "custom_categories" => Some(&mut self.custom_categories),
            "categories" => Some(&mut self.categories),
            "patient_sources" => Some(&mut self.patient_sources),
            "invitations" => Some(&mut self.invitations),
            "clinic_users" => Some(&mut self.clinic_users),
            "assets" => Some(&mut self.assets),
            "supplies" => Some(&mut self.supplies),
            "fixed_costs" => Some(&mut self.fixed_costs),
            "services" => Some(&mut self.services),
            "service_supplies" => Some(&mut self.service_supplies),
            "tariffs" => self.tariffs.as_mut(),
            "marketing_campaigns" => Some(&mut self.marketing_campaigns),
            "marketing_campaign_status_history" => {
                Some(&mut self.marketing_campaign_status_history)
            }
            "patients" => Some(&mut self.patients),
            "treatments" => Some(&mut self.treatments),
            "expenses" => Some(&mut self.expenses),
            "workspace_activity" => self.workspace_activity.as_mut(),
            "action_logs" => self.action_logs.as_mut(),
            "chat_sessions" => self.chat_sessions.as_mut(),
            "chat_messages" => self.chat_messages.as_mut(),
            "ai_feedback" => self.ai_feedback.as_mut(),
            "email_notifications" => self.email_notifications.as_mut(),
            "sms_notifications" => self.sms_notifications.as_mut(),
            "scheduled_reminders" => self.scheduled_reminders.as_mut(),
            "push_subscriptions" => self.push_subscriptions.as_mut(),
            "push_notifications" => self.push_notifications.as_mut(),
            "medications" => self.medications.as_mut(),
            "prescriptions" => self.prescriptions.as_mut(),
            "prescription_items" => self.prescription_items.as_mut(),
            "quotes" => self.quotes.as_mut(),
            "quote_items" => self.quote_items.as_mut(),
            _ => None,
        }
    }

    /// Places rows for `table`, materializing optional collections.
    /// Returns false for tables this bundle type does not know.
    pub fn set_list(&mut self, table: &str, rows: Vec<Record>) -> bool {
        let slot = match table {
            "tariffs" => &mut self.tariffs,
            "workspace_activity" => &mut self.workspace_activity,
            "action_logs" => &mut self.action_logs,
            "chat_sessions" => &mut self.chat_sessions,
            "chat_messages" => &mut self.chat_messages,
            "ai_feedback" => &mut self.ai_feedback,
            "email_notifications" => &mut self.email_notifications,
            "sms_notifications" => &mut self.sms_notifications,
            "scheduled_reminders" => &mut self.scheduled_reminders,
            "push_subscriptions" => &mut self.push_subscriptions,
            "push_notifications" => &mut self.push_notifications,
            "medications" => &mut self.medications,
            "prescriptions" => &mut self.prescriptions,
            "prescription_items" => &mut self.prescription_items,
            "quotes" => &mut self.quotes,
            "quote_items" => &mut self.quote_items,
            other => {
                return match self.list_mut(other) {
                    Some(list) => {
                        *list = rows;
                        true
                    }
                    None => false,
                };
            }
        };
        *slot = Some(rows);
        true
    }

    /// The row of a single-shaped table, if present.
    pub fn single(&self, table: &str) -> Option<&Record> {
        match table {
            "settings_time" => self.settings_time.as_ref(),
            "clinic_google_calendar" => self.clinic_google_calendar.as_ref()?.as_ref(),
            _ => None,
        }
    }

    /// Number of rows per table, counting single-shaped tables as 0 or 1.
    pub fn count_records(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for table in CLINIC_TABLES {
            let count = match table.shape {
                Shape::List => match self.list(table.name) {
                    Some(rows) => rows.len() as u64,
                    None => continue,
                },
                Shape::Single => u64::from(self.single(table.name).is_some()),
            };
            counts.insert(table.name.to_string(), count);
        }
        counts
    }

    pub fn total_records(&self) -> u64 {
        self.count_records().values().sum()
    }
}

impl Bundle {
    pub fn schema_version(&self) -> u32 {
        self.metadata.schema_version
    }

    /// Sets both version markers together.
    pub fn set_schema_version(&mut self, version: u32) {
        self.metadata.schema_version = version;
        self.migrations.schema_version = version;
    }

    pub fn clinic_ids(&self) -> Vec<String> {
        self.data
            .clinics
            .iter()
            .filter_map(ClinicDataBundle::clinic_id)
            .collect()
    }

    pub fn from_json_str(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| AppError::from(err).with_context("operation", "parse_bundle"))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_bundle")
                .with_context("path", path.display().to_string())
        })?;
        Self::from_json_str(&raw).map_err(|err| err.with_context("path", path.display().to_string()))
    }

    /// Writes pretty JSON through a `.partial` sibling and renames it in place.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_bundle"))?;
        let mut partial = path.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        let partial = std::path::PathBuf::from(partial);
        fs::write(&partial, payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_bundle")
                .with_context("path", partial.display().to_string())
        })?;
        fs::rename(&partial, path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "rename_bundle")
                .with_context("path", path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc() -> Value {
        json!({
            "metadata": {
                "version": "1.0.0",
                "schemaVersion": 48,
                "exportDate": "2025-01-01T00:00:00.000Z",
                "workspaceId": "ws-1",
                "workspaceName": "Dental Group",
                "recordCounts": {"patients": 1},
                "checksum": "abc",
                "customNote": "kept"
            },
            "data": {
                "workspace": {"id": "ws-1", "name": "Dental Group", "slug": "dental"},
                "clinics": [{
                    "clinic": {"id": "c-1", "name": "Centro"},
                    "settingsTime": null,
                    "patients": [{"id": "p-1", "first_name": "Ana"}],
                    "tariffs": [],
                    "recordCounts": {}
                }]
            },
            "migrations": {"schemaVersion": 48, "appliedMigrations": []}
        })
    }

    #[test]
    fn optional_collections_follow_presence() {
        let bundle: Bundle = serde_json::from_value(doc()).unwrap();
        let clinic = &bundle.data.clinics[0];
        assert!(clinic.tariffs.is_some());
        assert!(clinic.chat_sessions.is_none());
        assert!(clinic.clinic_google_calendar.is_none());
        assert_eq!(clinic.list("patients").map(Vec::len), Some(1));
        assert!(clinic.list("quotes").is_none());
    }

    #[test]
    fn explicit_null_calendar_is_distinct_from_absent() {
        let mut value = doc();
        value["data"]["clinics"][0]["clinicGoogleCalendar"] = Value::Null;
        let bundle: Bundle = serde_json::from_value(value).unwrap();
        assert_eq!(bundle.data.clinics[0].clinic_google_calendar, Some(None));
        let back = serde_json::to_value(&bundle).unwrap();
        assert!(back["data"]["clinics"][0]
            .as_object()
            .unwrap()
            .contains_key("clinicGoogleCalendar"));
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let mut value = doc();
        value["data"]["clinics"][0]["legacyNotes"] = json!([{"id": "n-1"}]);
        let bundle: Bundle = serde_json::from_value(value).unwrap();
        let back = serde_json::to_value(&bundle).unwrap();
        assert_eq!(back["metadata"]["customNote"], "kept");
        assert_eq!(back["data"]["clinics"][0]["legacyNotes"][0]["id"], "n-1");
        let again: Bundle = serde_json::from_value(back).unwrap();
        assert_eq!(again, bundle);
    }

    #[test]
    fn set_list_materializes_optional_tables() {
        let mut clinic = ClinicDataBundle::new(json!({"id": "c"}).as_object().cloned().unwrap());
        assert!(clinic.set_list("quotes", vec![Record::new()]));
        assert!(clinic.set_list("patients", vec![Record::new(), Record::new()]));
        assert!(!clinic.set_list("unknown", vec![]));
        let counts = clinic.count_records();
        assert_eq!(counts["quotes"], 1);
        assert_eq!(counts["patients"], 2);
        assert_eq!(counts["settings_time"], 0);
        assert!(!counts.contains_key("chat_sessions"));
    }

    #[test]
    fn save_and_load_through_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bundle.json");
        let bundle: Bundle = serde_json::from_value(doc()).unwrap();
        bundle.save(&path).unwrap();
        assert!(!dir.path().join("bundle.json.partial").exists());
        assert_eq!(Bundle::load(&path).unwrap(), bundle);
    }
}
