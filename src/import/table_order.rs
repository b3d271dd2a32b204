const SETTINGS_RANK: u16 = 0;
const CATALOG_RANK: u16 = 10;
const SERVICES_RANK: u16 = 20;
const CAMPAIGNS_RANK: u16 = 30;
const PATIENTS_RANK: u16 = 40;
const TREATMENTS_RANK: u16 = 50;
const EXPENSES_RANK: u16 = 60;
/// Tables at or above this rank are optional history; their failures are
/// reported as warnings instead of aborting the import.
pub(crate) const SECONDARY_RANK: u16 = 100;
const ASSISTANT_RANK: u16 = 110;
const NOTIFICATIONS_RANK: u16 = 120;
const PRESCRIPTIONS_RANK: u16 = 130;
const QUOTES_RANK: u16 = 140;
pub(crate) const DEFAULT_RANK: u16 = 1000;

/// Sort key for clinic tables on import. Parents sort before children; ties
/// are broken by the position within the rank group.
pub(crate) fn table_order_key(table: &str) -> (u16, u16) {
    match table {
        "settings_time" => (SETTINGS_RANK, 0),
        "patient_sources" => (CATALOG_RANK, 0),
        "custom_categories" => (CATALOG_RANK, 1),
        "assets" => (CATALOG_RANK, 2),
        "supplies" => (CATALOG_RANK, 3),
        "fixed_costs" => (CATALOG_RANK, 4),
        "services" => (SERVICES_RANK, 0),
        "service_supplies" => (SERVICES_RANK, 1),
        "marketing_campaigns" => (CAMPAIGNS_RANK, 0),
        "marketing_campaign_status_history" => (CAMPAIGNS_RANK, 1),
        "patients" => (PATIENTS_RANK, 0),
        "treatments" => (TREATMENTS_RANK, 0),
        "expenses" => (EXPENSES_RANK, 0),
        "action_logs" => (SECONDARY_RANK, 0),
        "clinic_google_calendar" => (SECONDARY_RANK, 1),
        "chat_sessions" => (ASSISTANT_RANK, 0),
        "chat_messages" => (ASSISTANT_RANK, 1),
        "ai_feedback" => (ASSISTANT_RANK, 2),
        "email_notifications" => (NOTIFICATIONS_RANK, 0),
        "sms_notifications" => (NOTIFICATIONS_RANK, 1),
        "scheduled_reminders" => (NOTIFICATIONS_RANK, 2),
        "push_subscriptions" => (NOTIFICATIONS_RANK, 3),
        "push_notifications" => (NOTIFICATIONS_RANK, 4),
        "medications" => (PRESCRIPTIONS_RANK, 0),
        "prescriptions" => (PRESCRIPTIONS_RANK, 1),
        "prescription_items" => (PRESCRIPTIONS_RANK, 2),
        "quotes" => (QUOTES_RANK, 0),
        "quote_items" => (QUOTES_RANK, 1),
        _ => (DEFAULT_RANK, 0),
    }
}

pub(crate) fn is_secondary(table: &str) -> bool {
    let (rank, _) = table_order_key(table);
    (SECONDARY_RANK..DEFAULT_RANK).contains(&rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::foreign_keys::CLINIC_FK_RULES;

    #[test]
    fn parents_sort_before_children() {
        for rule in CLINIC_FK_RULES.iter().filter(|r| !r.is_self_reference()) {
            assert!(
                table_order_key(rule.parent) < table_order_key(rule.table),
                "{} must import before {}",
                rule.parent,
                rule.table
            );
        }
    }

    #[test]
    fn core_tables_are_fatal_and_history_is_not() {
        assert!(!is_secondary("services"));
        assert!(!is_secondary("expenses"));
        assert!(is_secondary("action_logs"));
        assert!(is_secondary("quote_items"));
        assert!(!is_secondary("invitations"));
    }
}
