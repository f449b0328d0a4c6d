//! Record representation and client-generated identifiers.
//!
//! A record is a field map keyed by field name. The primary key lives inside
//! the map under the field declared by the model schema.

use crate::RecordId;
use serde_json::Value;

/// A stored record: field name to JSON value.
///
/// `serde_json::Map` is ordered by key, which keeps serialization and
/// field iteration deterministic.
pub type Record = serde_json::Map<String, Value>;

/// Reserved prefix of locally synthesized primary keys.
pub const CLIENT_ID_PREFIX: &str = "client.";

/// Marker field the remote sets on deleted items in delta and live payloads.
pub const DELETED_FIELD: &str = "_deleted";

/// Generate a new client-side primary key.
pub fn generate_client_id() -> RecordId {
    format!("{}{}", CLIENT_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Whether a key value was generated locally and not yet confirmed.
pub fn is_client_id(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| s.starts_with(CLIENT_ID_PREFIX))
        .unwrap_or(false)
}

/// Render a primary key value as a string id.
///
/// Strings are used as-is and numbers are formatted; anything else has no id.
pub fn key_to_id(value: &Value) -> Option<RecordId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read the primary key of a record as a string id.
pub fn record_id(record: &Record, primary_key: &str) -> Option<RecordId> {
    record.get(primary_key).and_then(key_to_id)
}

/// Whether the remote marked this item as deleted.
pub fn is_deleted(record: &Record) -> bool {
    record
        .get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Convert a JSON value into a record, rejecting non-objects.
pub fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
