/// A reference from one clinic-scoped table to another inside the same clinic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FkRule {
    pub table: &'static str,
    pub field: &'static str,
    pub parent: &'static str,
    /// `null` or absent is allowed.
    pub optional: bool,
}

const fn required(table: &'static str, field: &'static str, parent: &'static str) -> FkRule {
    FkRule {
        table,
        field,
        parent,
        optional: false,
    }
}

const fn optional(table: &'static str, field: &'static str, parent: &'static str) -> FkRule {
    FkRule {
        table,
        field,
        parent,
        optional: true,
    }
}

/// Intra-clinic references checked by the validator and rewritten by the
/// importer. Expense categories and platform ids are absent on purpose: they
/// may point at global system categories outside the bundle.
///
/// A rule whose parent is its own table is a self-reference; the importer
/// links those after the whole table is in.
pub const CLINIC_FK_RULES: &[FkRule] = &[
    required("service_supplies", "service_id", "services"),
    required("service_supplies", "supply_id", "supplies"),
    required("marketing_campaign_status_history", "campaign_id", "marketing_campaigns"),
    optional("patients", "source_id", "patient_sources"),
    optional("patients", "campaign_id", "marketing_campaigns"),
    optional("patients", "referred_by_patient_id", "patients"),
    required("treatments", "patient_id", "patients"),
    required("treatments", "service_id", "services"),
    optional("expenses", "campaign_id", "marketing_campaigns"),
    optional("expenses", "related_asset_id", "assets"),
    optional("expenses", "related_supply_id", "supplies"),
    optional("expenses", "related_fixed_cost_id", "fixed_costs"),
    optional("expenses", "parent_expense_id", "expenses"),
    required("chat_messages", "session_id", "chat_sessions"),
    required("ai_feedback", "message_id", "chat_messages"),
    optional("email_notifications", "patient_id", "patients"),
    optional("email_notifications", "treatment_id", "treatments"),
    optional("sms_notifications", "patient_id", "patients"),
    optional("sms_notifications", "treatment_id", "treatments"),
    optional("scheduled_reminders", "patient_id", "patients"),
    optional("scheduled_reminders", "treatment_id", "treatments"),
    required("prescriptions", "patient_id", "patients"),
    optional("prescriptions", "treatment_id", "treatments"),
    required("prescription_items", "prescription_id", "prescriptions"),
    optional("prescription_items", "medication_id", "medications"),
    optional("quotes", "patient_id", "patients"),
    required("quote_items", "quote_id", "quotes"),
    optional("quote_items", "service_id", "services"),
];

impl FkRule {
    pub fn is_self_reference(&self) -> bool {
        self.table == self.parent
    }
}

pub fn rules_for(table: &str) -> impl Iterator<Item = &'static FkRule> + '_ {
    CLINIC_FK_RULES.iter().filter(move |rule| rule.table == table)
}
