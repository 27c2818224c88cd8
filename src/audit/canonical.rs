// # Canonical Encoding
//
// Deterministic JSON used for every hash in the system: UTF-8, keys sorted
// lexicographically, no insignificant whitespace, timestamps as UTC ISO-8601
// with millisecond precision. Any structural drift here breaks all future
// chain verifications, so the canonical form is a versioned contract.

use serde_json::Value;

/// Canonical form version. Bump only with a chain migration plan.
pub const CANONICAL_VERSION: u32 = 1;

/// Render a JSON value into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

/// Canonical string form, for hashing and digests.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars already have a single serde_json rendering.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Serde adapter for UTC timestamps at fixed millisecond precision.
pub mod ts_millis {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

/// Truncate a timestamp to millisecond precision so a serialize/deserialize
/// round trip is the identity.
pub fn truncate_to_millis(ts: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
    let millis = ts.timestamp_millis();
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or(ts)
}
