//! Normalization of pulled documents before they reach the parser.

use chrono::{DateTime, Utc};
use serde_json::Value;

use wcpos_store::DATE_MODIFIED_FIELD;

/// Format of `date_modified_gmt`: UTC, whole seconds, no offset.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Render a pull time the way the backend renders modification times.
pub fn pull_timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Backfill a missing modification time with the pull time.
///
/// A field that is absent, `null` or an empty string counts as missing.
/// Non-object payloads are returned untouched and left to the parser.
pub fn normalize_document(mut raw: Value, now: DateTime<Utc>) -> Value {
    if let Value::Object(fields) = &mut raw {
        let missing = match fields.get(DATE_MODIFIED_FIELD) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            fields.insert(
                DATE_MODIFIED_FIELD.to_string(),
                Value::String(pull_timestamp(now)),
            );
        }
    }
    raw
}
