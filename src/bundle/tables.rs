/// Layout of a clinic-scoped collection inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// An ordered list of rows.
    List,
    /// Zero or one row, serialized as an object or `null`.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinicTable {
    /// Store table name.
    pub name: &'static str,
    /// camelCase key inside `ClinicDataBundle`.
    pub key: &'static str,
    pub shape: Shape,
    /// First schema version that carries the collection.
    pub since: u32,
    /// Version whose migration removed the collection, if any.
    pub retired_in: Option<u32>,
}

impl ClinicTable {
    const fn list(name: &'static str, key: &'static str, since: u32) -> Self {
        Self {
            name,
            key,
            shape: Shape::List,
            since,
            retired_in: None,
        }
    }

    const fn single(name: &'static str, key: &'static str, since: u32) -> Self {
        Self {
            name,
            key,
            shape: Shape::Single,
            since,
            retired_in: None,
        }
    }

    pub fn present_at(&self, version: u32) -> bool {
        version >= self.since && self.retired_in.map_or(true, |retired| version < retired)
    }
}

pub const BASELINE: u32 = 41;

/// Clinic-scoped tables in export order.
pub const CLINIC_TABLES: &[ClinicTable] = &[
    ClinicTable::single("settings_time", "settingsTime", BASELINE),
    ClinicTable::list("custom_categories", "customCategories", BASELINE),
    ClinicTable::list("categories", "categories", BASELINE),
    ClinicTable::list("patient_sources", "patientSources", BASELINE),
    ClinicTable::list("invitations", "invitations", BASELINE),
    ClinicTable::list("clinic_users", "clinicUsers", BASELINE),
    ClinicTable::list("assets", "assets", BASELINE),
    ClinicTable::list("supplies", "supplies", BASELINE),
    ClinicTable::list("fixed_costs", "fixedCosts", BASELINE),
    ClinicTable::list("services", "services", BASELINE),
    ClinicTable::list("service_supplies", "serviceSupplies", BASELINE),
    ClinicTable {
        name: "tariffs",
        key: "tariffs",
        shape: Shape::List,
        since: BASELINE,
        retired_in: Some(47),
    },
    ClinicTable::list("marketing_campaigns", "marketingCampaigns", BASELINE),
    ClinicTable::list(
        "marketing_campaign_status_history",
        "marketingCampaignStatusHistory",
        BASELINE,
    ),
    ClinicTable::list("patients", "patients", BASELINE),
    ClinicTable::list("treatments", "treatments", BASELINE),
    ClinicTable::list("expenses", "expenses", BASELINE),
    ClinicTable::list("workspace_activity", "workspaceActivity", BASELINE),
    ClinicTable::list("action_logs", "actionLogs", 49),
    ClinicTable::single("clinic_google_calendar", "clinicGoogleCalendar", 50),
    ClinicTable::list("chat_sessions", "chatSessions", 51),
    ClinicTable::list("chat_messages", "chatMessages", 51),
    ClinicTable::list("ai_feedback", "aiFeedback", 51),
    ClinicTable::list("email_notifications", "emailNotifications", 53),
    ClinicTable::list("sms_notifications", "smsNotifications", 53),
    ClinicTable::list("scheduled_reminders", "scheduledReminders", 53),
    ClinicTable::list("push_subscriptions", "pushSubscriptions", 53),
    ClinicTable::list("push_notifications", "pushNotifications", 53),
    ClinicTable::list("medications", "medications", 55),
    ClinicTable::list("prescriptions", "prescriptions", 55),
    ClinicTable::list("prescription_items", "prescriptionItems", 55),
    ClinicTable::list("quotes", "quotes", 56),
    ClinicTable::list("quote_items", "quoteItems", 56),
];

/// Workspace-level lists under `data`, as (table, key).
pub const GLOBAL_TABLES: &[(&str, &str)] = &[
    ("organizations", "organizations"),
    ("category_types", "categoryTypes"),
    ("role_permissions", "rolePermissions"),
    ("workspace_users", "workspaceUsers"),
    ("workspace_members", "workspaceMembers"),
];

/// Tables selected through their parent's ids rather than `clinic_id`, as
/// (table, fk field, parent), in dependency order.
pub const PARENT_KEYED_TABLES: &[(&str, &str, &str)] = &[
    ("service_supplies", "service_id", "services"),
    (
        "marketing_campaign_status_history",
        "campaign_id",
        "marketing_campaigns",
    ),
    ("chat_messages", "session_id", "chat_sessions"),
    ("ai_feedback", "message_id", "chat_messages"),
    ("prescription_items", "prescription_id", "prescriptions"),
    ("quote_items", "quote_id", "quotes"),
];

pub fn is_parent_keyed(table: &str) -> bool {
    PARENT_KEYED_TABLES.iter().any(|(name, _, _)| *name == table)
}

pub const WORKSPACES_TABLE: &str = "workspaces";
pub const CLINICS_TABLE: &str = "clinics";

pub fn clinic_table(name: &str) -> Option<&'static ClinicTable> {
    CLINIC_TABLES.iter().find(|t| t.name == name)
}

pub fn clinic_table_by_key(key: &str) -> Option<&'static ClinicTable> {
    CLINIC_TABLES.iter().find(|t| t.key == key)
}

pub fn global_table_by_key(key: &str) -> Option<&'static str> {
    GLOBAL_TABLES
        .iter()
        .find(|(_, k)| *k == key)
        .map(|(table, _)| *table)
}
