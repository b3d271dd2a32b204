use serde_json::{Map, Value};

/// One entity row. Entity payloads stay opaque JSON objects: the engine only
/// reads ids, foreign keys, names and `*_cents` fields out of them.
pub type Record = Map<String, Value>;

/// Identifier of a row as a string; numeric ids are rendered in decimal.
pub fn record_id(record: &Record) -> Option<String> {
    id_string(record.get("id")?)
}

/// A foreign key value, `None` when absent or `null`.
pub fn fk_value(record: &Record, field: &str) -> Option<String> {
    id_string(record.get(field)?)
}

pub fn str_field<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Sets `field` to `value` only when the row does not carry it yet.
pub fn set_default(record: &mut Record, field: &str, value: Value) {
    record.entry(field.to_string()).or_insert(value);
}
