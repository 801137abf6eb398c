// ── API-to-domain conversions ──
//
// Bridges the raw JSON items returned by `dispatch_api` bulk loads into
// domain types. One bad item never costs the whole load: unparsable
// items are logged and skipped.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Deserialize each item of a bulk load, dropping the ones that fail.
pub(crate) fn entities_from_json<T: DeserializeOwned>(kind: &str, items: Vec<Value>) -> Vec<T> {
    let total = items.len();
    let parsed: Vec<T> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value(item) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(kind, index, error = %e, "skipping unparsable item");
                None
            }
        })
        .collect();

    if parsed.len() < total {
        warn!(kind, skipped = total - parsed.len(), total, "bulk load partially parsed");
    }
    parsed
}
