//! Total extraction helpers over loosely-typed JSON records.
//!
//! Every event decoder goes through these instead of indexing `Value`s ad hoc.
//! None of them panic; a missing or mistyped field is simply `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

pub type Record = Map<String, Value>;

pub fn as_record(value: &Value) -> Option<&Record> {
    value.as_object()
}

pub fn get_record<'a>(record: &'a Record, key: &str) -> Option<&'a Record> {
    record.get(key).and_then(as_record)
}

/// String value under `key`. Empty strings are returned as-is.
pub fn get_text<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// First non-empty string among `keys`.
pub fn first_text<'a>(record: &'a Record, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| get_text(record, key))
        .find(|text| !text.is_empty())
}

/// Numeric value under `key`; numeric strings are accepted.
pub fn get_number(record: &Record, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_u64(record: &Record, key: &str) -> Option<u64> {
    match record.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Identifier under the first matching key. Accepts strings and integers.
pub fn get_id(record: &Record, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

/// RFC 3339 strings or epoch milliseconds.
pub fn get_timestamp(record: &Record, key: &str) -> Option<DateTime<Utc>> {
    match record.get(key)? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

/// Tool-call arguments arrive either as a JSON string or as a structured value.
/// Both normalize to JSON text; null and absent become the empty string.
pub fn arguments_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

pub(crate) fn de_arguments<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(arguments_text(value.as_ref()))
}
