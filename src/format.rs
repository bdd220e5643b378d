use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Reads a stored `createdAt` value: RFC 3339 text, epoch seconds, or a
/// `{ "seconds": n, "nanoseconds": n }` object.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::Object(map) => {
            let secs = map.get("seconds").and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            Utc.timestamp_opt(secs, nanos).single()
        }
        _ => None,
    }
}

/// Fixed-width UTC timestamp, so stored values sort lexically.
pub fn timestamp_value(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_value() -> String {
    timestamp_value(Utc::now())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
