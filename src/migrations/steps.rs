use serde_json::{json, Value};

use super::ExportMigration;
use crate::bundle::record::set_default;
use crate::bundle::{record_id, Bundle, Record};

/// One catalog entry: a typed converter from generation `from` to `from + 1`.
pub struct Step {
    pub from: u32,
    pub description: &'static str,
    pub transform: fn(Bundle) -> Bundle,
    pub validate: Option<fn(&Bundle) -> Vec<String>>,
}

impl ExportMigration for Step {
    fn from_version(&self) -> u32 {
        self.from
    }

    fn description(&self) -> &str {
        self.description
    }

    fn transform(&self, bundle: Bundle) -> Bundle {
        (self.transform)(bundle)
    }

    fn validate(&self, bundle: &Bundle) -> Vec<String> {
        self.validate.map(|check| check(bundle)).unwrap_or_default()
    }
}

pub fn shipped() -> Vec<Step> {
    vec![
        Step {
            from: 41,
            description: "Add campaign_id to expenses",
            transform: expenses_campaign_link,
            validate: Some(|b| require_field(b, "expenses", "campaign_id")),
        },
        Step {
            from: 42,
            description: "Add archive fields to marketing campaigns",
            transform: campaign_archive_fields,
            validate: Some(|b| require_field(b, "marketing_campaigns", "is_archived")),
        },
        Step {
            from: 43,
            description: "Add monthly goal to time settings",
            transform: monthly_goal,
            validate: None,
        },
        Step {
            from: 44,
            description: "Add birth date and notes to patients",
            transform: patient_profile_fields,
            validate: Some(|b| require_field(b, "patients", "birth_date")),
        },
        Step {
            from: 45,
            description: "Add discount fields to services",
            transform: service_discounts,
            validate: Some(|b| require_field(b, "services", "discount_type")),
        },
        Step {
            from: 46,
            description: "Retire tariffs in favor of service discounts",
            transform: retire_tariffs,
            validate: Some(no_tariffs),
        },
        Step {
            from: 47,
            description: "Add recurrence fields to expenses",
            transform: expense_recurrence,
            validate: Some(|b| require_field(b, "expenses", "is_recurring")),
        },
        Step {
            from: 48,
            description: "Add AI action logs",
            transform: |b| add_lists(b, &["action_logs"]),
            validate: Some(|b| require_lists(b, &["action_logs"])),
        },
        Step {
            from: 49,
            description: "Add Google Calendar link per clinic",
            transform: google_calendar_link,
            validate: None,
        },
        Step {
            from: 50,
            description: "Add AI chat sessions, messages and feedback",
            transform: |b| add_lists(b, CHAT_TABLES),
            validate: Some(|b| require_lists(b, CHAT_TABLES)),
        },
        Step {
            from: 51,
            description: "Link treatments to calendar events",
            transform: treatment_calendar_event,
            validate: Some(|b| require_field(b, "treatments", "google_event_id")),
        },
        Step {
            from: 52,
            description: "Add email, SMS and push notification tables",
            transform: |b| add_lists(b, NOTIFICATION_TABLES),
            validate: Some(|b| require_lists(b, NOTIFICATION_TABLES)),
        },
        Step {
            from: 53,
            description: "Add refund fields to treatments",
            transform: treatment_refunds,
            validate: Some(|b| require_field(b, "treatments", "is_refunded")),
        },
        Step {
            from: 54,
            description: "Add medications and prescriptions",
            transform: |b| add_lists(b, PRESCRIPTION_TABLES),
            validate: Some(|b| require_lists(b, PRESCRIPTION_TABLES)),
        },
        Step {
            from: 55,
            description: "Add quotes and quote items",
            transform: |b| add_lists(b, QUOTE_TABLES),
            validate: Some(|b| require_lists(b, QUOTE_TABLES)),
        },
    ]
}

const CHAT_TABLES: &[&str] = &["chat_sessions", "chat_messages", "ai_feedback"];
const NOTIFICATION_TABLES: &[&str] = &[
    "email_notifications",
    "sms_notifications",
    "scheduled_reminders",
    "push_subscriptions",
    "push_notifications",
];
const PRESCRIPTION_TABLES: &[&str] = &["medications", "prescriptions", "prescription_items"];
const QUOTE_TABLES: &[&str] = &["quotes", "quote_items"];

fn expenses_campaign_link(bundle: Bundle) -> Bundle {
    with_rows(bundle, "expenses", |row| {
        set_default(row, "campaign_id", Value::Null)
    })
}

fn campaign_archive_fields(bundle: Bundle) -> Bundle {
    with_rows(bundle, "marketing_campaigns", |row| {
        set_default(row, "is_archived", json!(false));
        set_default(row, "archived_at", Value::Null);
    })
}

fn monthly_goal(mut bundle: Bundle) -> Bundle {
    for clinic in &mut bundle.data.clinics {
        if let Some(settings) = clinic.settings_time.as_mut() {
            set_default(settings, "monthly_goal_cents", Value::Null);
        }
    }
    bundle
}

fn patient_profile_fields(bundle: Bundle) -> Bundle {
    with_rows(bundle, "patients", |row| {
        set_default(row, "birth_date", Value::Null);
        set_default(row, "notes", Value::Null);
    })
}

fn service_discounts(bundle: Bundle) -> Bundle {
    with_rows(bundle, "services", |row| {
        let base_price = row.get("price_cents").cloned().unwrap_or(Value::Null);
        set_default(row, "discount_type", json!("none"));
        set_default(row, "discount_value", json!(0));
        set_default(row, "discount_reason", Value::Null);
        set_default(row, "final_price_with_discount_cents", base_price);
    })
}

fn retire_tariffs(mut bundle: Bundle) -> Bundle {
    for clinic in &mut bundle.data.clinics {
        clinic.tariffs = None;
        clinic.record_counts.remove("tariffs");
    }
    bundle.metadata.record_counts.remove("tariffs");
    bundle
}

fn no_tariffs(bundle: &Bundle) -> Vec<String> {
    bundle
        .data
        .clinics
        .iter()
        .filter(|clinic| clinic.tariffs.is_some())
        .map(|clinic| {
            format!(
                "clinic {} still carries tariffs",
                clinic.clinic_id().unwrap_or_default()
            )
        })
        .collect()
}

fn expense_recurrence(bundle: Bundle) -> Bundle {
    with_rows(bundle, "expenses", |row| {
        set_default(row, "is_recurring", json!(false));
        set_default(row, "recurrence_interval", Value::Null);
    })
}

fn google_calendar_link(mut bundle: Bundle) -> Bundle {
    for clinic in &mut bundle.data.clinics {
        clinic.clinic_google_calendar.get_or_insert(None);
    }
    bundle
}

fn treatment_calendar_event(bundle: Bundle) -> Bundle {
    with_rows(bundle, "treatments", |row| {
        set_default(row, "google_event_id", Value::Null)
    })
}

fn treatment_refunds(bundle: Bundle) -> Bundle {
    with_rows(bundle, "treatments", |row| {
        set_default(row, "is_refunded", json!(false));
        set_default(row, "refunded_at", Value::Null);
        set_default(row, "refund_reason", Value::Null);
    })
}

fn with_rows(mut bundle: Bundle, table: &str, mut apply: impl FnMut(&mut Record)) -> Bundle {
    for clinic in &mut bundle.data.clinics {
        if let Some(rows) = clinic.list_mut(table) {
            rows.iter_mut().for_each(&mut apply);
        }
    }
    bundle
}

fn add_lists(mut bundle: Bundle, tables: &[&str]) -> Bundle {
    for clinic in &mut bundle.data.clinics {
        for table in tables {
            if clinic.list(table).is_none() {
                clinic.set_list(table, Vec::new());
            }
        }
    }
    bundle
}

fn require_field(bundle: &Bundle, table: &str, field: &str) -> Vec<String> {
    let mut errors = Vec::new();
    for clinic in &bundle.data.clinics {
        for row in clinic.list(table).into_iter().flatten() {
            if !row.contains_key(field) {
                errors.push(format!(
                    "{table}[{}] missing {field}",
                    record_id(row).unwrap_or_else(|| "?".to_string())
                ));
            }
        }
    }
    errors
}

fn require_lists(bundle: &Bundle, tables: &[&str]) -> Vec<String> {
    let mut errors = Vec::new();
    for clinic in &bundle.data.clinics {
        for table in tables {
            if clinic.list(table).is_none() {
                errors.push(format!(
                    "clinic {} missing {table}",
                    clinic.clinic_id().unwrap_or_default()
                ));
            }
        }
    }
    errors
}
