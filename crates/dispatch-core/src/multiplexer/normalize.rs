// ── Raw message normalization ──
//
// Turns a decoded SSE message into a `StreamEvent`. Backends differ in
// where they put the event name: some use the SSE `event:` line, others
// wrap the payload in an envelope carrying `event_type` (or `event`) next
// to `data`. The payload wins over the transport.

use chrono::{DateTime, Utc};
use dispatch_api::RawMessage;
use serde_json::Value;

use crate::model::StreamEvent;

const NAME_FIELDS: [&str; 2] = ["event_type", "event"];
const FALLBACK_NAME: &str = "message";

/// Parse `raw` as JSON and derive its name, data and timestamp.
pub fn normalize(raw: &RawMessage, received_at: DateTime<Utc>) -> Result<StreamEvent, serde_json::Error> {
    let payload: Value = serde_json::from_str(&raw.data)?;

    let inner_name = NAME_FIELDS
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_str))
        .filter(|n| !n.is_empty())
        .map(str::to_owned);

    let timestamp = payload.get("timestamp").and_then(parse_timestamp);

    let is_envelope = inner_name.is_some() && payload.get("data").is_some();
    let data = match payload {
        Value::Object(mut map) if is_envelope => map.remove("data").unwrap_or(Value::Null),
        other => other,
    };

    let timestamp = timestamp
        .or_else(|| data.get("timestamp").and_then(parse_timestamp))
        .unwrap_or(received_at);

    let name = inner_name
        .or_else(|| raw.event_type.clone())
        .unwrap_or_else(|| FALLBACK_NAME.to_owned());

    Ok(StreamEvent {
        name,
        data,
        timestamp,
    })
}

/// RFC 3339 string or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
