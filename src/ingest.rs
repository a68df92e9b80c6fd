//! ==============================================================================
//! ingest.rs - scan batch normalizer
//! ==============================================================================
//!
//! purpose:
//!     turns the raw body of POST /api/scan into typed rows.
//!     scanners send either one observation object or an array of them, and
//!     field types are loose (rssi as "-67", ts as a string, missing names...).
//!     every field goes through one named coercion rule here, so the rest of
//!     the hub only deals with `Observation` / `ObservationView`.
//!
//! relationships:
//!     - used by: server.rs (scan handler)
//!     - produces: domain.rs types consumed by store.rs and hub.rs
//!
//! rules:
//!     - request level: empty body, scalar body, bad json and oversized
//!       batches reject the whole request. nothing is written.
//!     - item level: a missing `mac` skips that item only. the batch goes on.
//!
//! ==============================================================================

use crate::domain::{Observation, ObservationView, SkipReason, SkippedItem};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// most observations accepted in one request
pub const MAX_BATCH: usize = 500;

pub const DEFAULT_NAME: &str = "Unknown";
pub const DEFAULT_KIND: &str = "BLE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Empty body")]
    EmptyBody,

    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Payload must be an object or an array")]
    WrongShape,

    #[error("Batch too large (max {max})")]
    BatchTooLarge { max: usize },
}

/// batch split into what gets stored and what gets broadcast
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// items with a usable address, in request order
    pub observations: Vec<Observation>,
    /// one view per request item, in request order
    pub views: Vec<ObservationView>,
    /// items rejected before reaching the store
    pub skipped: Vec<SkippedItem>,
}

/// Parse a request body into its list of raw items.
///
/// A single object is treated as a batch of one. The size check happens
/// before any item is looked at.
pub fn parse_batch(body: &[u8], max_batch: usize) -> Result<Vec<Value>, IngestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::EmptyBody);
    }

    let payload: Value = serde_json::from_slice(body).map_err(|_| IngestError::InvalidJson)?;

    let items = match payload {
        Value::Array(items) => items,
        Value::Object(_) => vec![payload],
        other if is_blank(&other) => return Err(IngestError::EmptyBody),
        _ => return Err(IngestError::WrongShape),
    };

    if items.len() > max_batch {
        return Err(IngestError::BatchTooLarge { max: max_batch });
    }
    Ok(items)
}

/// Normalize every item of a parsed batch.
///
/// `now` is the server receipt time in epoch millis, used for missing
/// timestamps.
pub fn normalize(items: &[Value], now: i64) -> NormalizedBatch {
    let mut batch = NormalizedBatch {
        observations: Vec::with_capacity(items.len()),
        views: Vec::with_capacity(items.len()),
        skipped: Vec::new(),
    };

    for (index, item) in items.iter().enumerate() {
        let fields = item.as_object();
        let get = |key: &str| fields.and_then(|f| f.get(key));

        let mac = text_or_none(get("mac"));
        let name = text_or_none(get("name")).unwrap_or_else(|| DEFAULT_NAME.to_string());
        let kind = text_or_none(get("type")).unwrap_or_else(|| DEFAULT_KIND.to_string());
        let protocol = text_or_none(get("protocol"));
        let rssi = integer_or_null(get("rssi"));
        let adv_data = adv_data_or_empty(get("adv_data"));
        let ts = timestamp_or_now(get("ts"), now);
        let major = integer_or_null(get("major"));
        let minor = integer_or_null(get("minor"));
        let tx_power = integer_or_null(get("tx_power"));
        let tx_beacon_name = text_or_none(get("tx_beacon_name"));

        batch.views.push(ObservationView {
            mac: mac.clone(),
            name: name.clone(),
            kind: kind.clone(),
            protocol: protocol.clone(),
            rssi,
            adv_data: adv_data.clone(),
            ts,
            major,
            minor,
            tx_power,
            tx_beacon_name: tx_beacon_name.clone(),
        });

        let Some(mac) = mac else {
            warn!(index, item = %item, "skipping scan item without mac");
            batch.skipped.push(SkippedItem { index, mac: None, reason: SkipReason::MissingMac });
            continue;
        };

        batch.observations.push(Observation {
            index,
            mac,
            name,
            kind,
            protocol,
            rssi,
            adv_data,
            ts,
            major,
            minor,
            tx_power,
            tx_beacon_name,
        });
    }

    batch
}

/// numeric-or-null coercion
///
/// missing, `null` and `""` give `None`. strings are trimmed and parsed as
/// decimals, booleans count as 1/0. anything that isn't a finite number
/// afterwards gives `None`.
///
/// a whitespace-only string is `None` here, not 0: a blank field from a
/// scanner means "no value", never a reading of zero.
pub fn number_or_null(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Null => return None,
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        Value::Array(_) | Value::Object(_) => return None,
    };
    n.is_finite().then_some(n)
}

/// numeric-or-null, rounded for integer columns
pub fn integer_or_null(value: Option<&Value>) -> Option<i64> {
    number_or_null(value).map(|n| n.round() as i64)
}

/// text-or-absent coercion
///
/// blank values (missing, null, false, 0, "") are absent. other scalars use
/// their json text, containers their compact json.
pub fn text_or_none(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if is_blank(value) {
        return None;
    }
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// A zero, missing or unusable `ts` falls back to receipt time.
///
/// The result is used for both the stored reading and the broadcast view,
/// so dashboards get this coerced millisecond value rather than whatever
/// raw `ts` the scanner sent.
pub fn timestamp_or_now(value: Option<&Value>, now: i64) -> i64 {
    number_or_null(value)
        .filter(|n| *n != 0.0)
        .map(|n| n.round() as i64)
        .unwrap_or(now)
}

fn adv_data_or_empty(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v.clone(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn number_or_null_follows_coercion_rules() {
        assert_eq!(number_or_null(None), None);
        assert_eq!(number_or_null(Some(&json!(null))), None);
        assert_eq!(number_or_null(Some(&json!(""))), None);
        assert_eq!(number_or_null(Some(&json!("   "))), None);
        assert_eq!(number_or_null(Some(&json!("abc"))), None);
        assert_eq!(number_or_null(Some(&json!("NaN"))), None);
        assert_eq!(number_or_null(Some(&json!("inf"))), None);
        assert_eq!(number_or_null(Some(&json!({"a": 1}))), None);
        assert_eq!(number_or_null(Some(&json!(-67))), Some(-67.0));
        assert_eq!(number_or_null(Some(&json!(" -67 "))), Some(-67.0));
        assert_eq!(number_or_null(Some(&json!("1e3"))), Some(1000.0));
        assert_eq!(number_or_null(Some(&json!(true))), Some(1.0));
        assert_eq!(number_or_null(Some(&json!(0))), Some(0.0));
    }

    #[test]
    fn integer_or_null_rounds() {
        assert_eq!(integer_or_null(Some(&json!(-67.6))), Some(-68));
        assert_eq!(integer_or_null(Some(&json!("10"))), Some(10));
    }

    #[test]
    fn text_or_none_treats_blank_values_as_absent() {
        assert_eq!(text_or_none(Some(&json!(""))), None);
        assert_eq!(text_or_none(Some(&json!(false))), None);
        assert_eq!(text_or_none(Some(&json!(0))), None);
        assert_eq!(text_or_none(Some(&json!(null))), None);
        assert_eq!(text_or_none(Some(&json!("Tag"))), Some("Tag".to_string()));
        assert_eq!(text_or_none(Some(&json!(42))), Some("42".to_string()));
    }

    #[test]
    fn timestamp_falls_back_to_now() {
        assert_eq!(timestamp_or_now(None, NOW), NOW);
        assert_eq!(timestamp_or_now(Some(&json!(0)), NOW), NOW);
        assert_eq!(timestamp_or_now(Some(&json!("garbage")), NOW), NOW);
        assert_eq!(timestamp_or_now(Some(&json!("1234")), NOW), 1234);
        assert_eq!(timestamp_or_now(Some(&json!(99)), NOW), 99);
        assert_eq!(timestamp_or_now(Some(&json!("   ")), NOW), NOW);
    }

    #[test]
    fn views_carry_coerced_values() {
        let batch = normalize(
            &[json!({"mac": "AA", "rssi": "  ", "ts": " 1234.6 "}), json!({"mac": "BB", "ts": 0})],
            NOW,
        );
        assert_eq!(batch.views[0].rssi, None);
        assert_eq!(batch.views[0].ts, 1235);
        assert_eq!(batch.views[1].ts, NOW);
        assert_eq!(batch.observations[0].ts, batch.views[0].ts);
    }

    #[test]
    fn parse_batch_wraps_single_object() {
        let items = parse_batch(br#"{"mac":"AA"}"#, MAX_BATCH).expect("parse");
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn parse_batch_request_level_rejections() {
        assert_eq!(parse_batch(b"", MAX_BATCH), Err(IngestError::EmptyBody));
        assert_eq!(parse_batch(b"  \n", MAX_BATCH), Err(IngestError::EmptyBody));
        assert_eq!(parse_batch(b"null", MAX_BATCH), Err(IngestError::EmptyBody));
        assert_eq!(parse_batch(b"{\"mac\":", MAX_BATCH), Err(IngestError::InvalidJson));
        assert_eq!(parse_batch(b"42", MAX_BATCH), Err(IngestError::WrongShape));
        assert_eq!(parse_batch(b"\"text\"", MAX_BATCH), Err(IngestError::WrongShape));
    }

    #[test]
    fn parse_batch_enforces_capacity() {
        let body = serde_json::to_vec(&vec![json!({"mac": "AA", "rssi": -50}); 501]).unwrap();
        assert_eq!(
            parse_batch(&body, MAX_BATCH),
            Err(IngestError::BatchTooLarge { max: 500 })
        );
        let body = serde_json::to_vec(&vec![json!({"mac": "AA", "rssi": -50}); 500]).unwrap();
        assert_eq!(parse_batch(&body, MAX_BATCH).map(|v| v.len()), Ok(500));
    }

    #[test]
    fn normalize_applies_defaults() {
        let batch = normalize(&[json!({"mac": "AA:BB", "rssi": "-70"})], NOW);
        let obs = &batch.observations[0];
        assert_eq!(obs.mac, "AA:BB");
        assert_eq!(obs.name, "Unknown");
        assert_eq!(obs.kind, "BLE");
        assert_eq!(obs.protocol, None);
        assert_eq!(obs.rssi, Some(-70));
        assert_eq!(obs.adv_data, json!({}));
        assert_eq!(obs.ts, NOW);
        assert!(batch.skipped.is_empty());
    }

    #[test]
    fn normalize_keeps_beacon_metadata() {
        let batch = normalize(
            &[json!({
                "mac": "AA", "name": "Tag", "type": "iBeacon", "protocol": "ibeacon",
                "rssi": -60, "ts": 1234, "major": 10, "minor": "2", "tx_power": -59,
                "tx_beacon_name": "lobby", "adv_data": {"uuid": "f7826da6"}
            })],
            NOW,
        );
        let obs = &batch.observations[0];
        assert_eq!(obs.kind, "iBeacon");
        assert_eq!(obs.protocol.as_deref(), Some("ibeacon"));
        assert_eq!((obs.major, obs.minor, obs.tx_power), (Some(10), Some(2), Some(-59)));
        assert_eq!(obs.tx_beacon_name.as_deref(), Some("lobby"));
        assert_eq!(obs.adv_data, json!({"uuid": "f7826da6"}));
        assert_eq!(obs.ts, 1234);
    }

    #[test]
    fn items_without_mac_are_skipped_but_still_broadcast() {
        let items = [
            json!({"rssi": -40}),
            json!(7),
            json!({"mac": "", "rssi": -41}),
            json!({"mac": "BB", "rssi": -42}),
        ];
        let batch = normalize(&items, NOW);

        assert_eq!(batch.views.len(), 4);
        assert_eq!(batch.views[0].mac, None);
        assert_eq!(batch.views[0].rssi, Some(-40));

        assert_eq!(batch.observations.len(), 1);
        assert_eq!(batch.observations[0].index, 3);

        let skipped: Vec<usize> = batch.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![0, 1, 2]);
        assert!(batch.skipped.iter().all(|s| s.reason == SkipReason::MissingMac));
    }

    #[test]
    fn invalid_rssi_still_produces_observation() {
        let batch = normalize(&[json!({"mac": "AA", "rssi": "n/a"})], NOW);
        assert_eq!(batch.observations.len(), 1);
        assert_eq!(batch.observations[0].rssi, None);
        assert_eq!(batch.views[0].rssi, None);
    }
}
