use serde::{Deserialize, Serialize};
use serde_json::Value;

/// one scan item after normalization, ready for the store
///
/// only items with a usable hardware address become an `Observation`;
/// `rssi` may still be `None`, in which case the device is upserted but no
/// reading row is written.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// position of the item in the request batch
    pub index: usize,
    pub mac: String,
    pub name: String,
    pub kind: String,
    pub protocol: Option<String>,
    pub rssi: Option<i64>,
    /// opaque advertising payload, `{}` when absent
    pub adv_data: Value,
    /// observation time in epoch millis
    pub ts: i64,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub tx_power: Option<i64>,
    pub tx_beacon_name: Option<String>,
}

/// what dashboards receive for every item of an accepted batch
///
/// unlike `Observation` this keeps items with no address or no rssi, so the
/// realtime view mirrors the batch exactly as the scanner sent it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationView {
    pub mac: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: Option<String>,
    pub rssi: Option<i64>,
    pub adv_data: Value,
    pub ts: i64,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub tx_power: Option<i64>,
    pub tx_beacon_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// no usable `mac`; nothing was written for the item
    MissingMac,
    /// device was upserted but the reading was dropped
    InvalidRssi,
    /// device row could not be found again after the upsert
    DeviceUnresolved,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub reason: SkipReason,
}

/// result of applying one batch inside a single transaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// reading rows inserted
    pub stored: usize,
    pub skipped: Vec<SkippedItem>,
}

/// response body of POST /api/scan
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanAck {
    pub status: String,
    /// number of items in the request, skipped ones included
    pub received: usize,
    pub stored: usize,
    pub skipped: Vec<SkippedItem>,
}

/// one row of GET /api/devices
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub mac: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub protocol: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    /// mean rssi over all readings, one decimal; `None` without readings
    pub avg_rssi: Option<f64>,
    /// beacon fields of the device's latest reading
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub tx_power: Option<i64>,
}

/// one row of GET /api/devices/:mac/readings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    pub rssi: i64,
    pub ts: i64,
    pub tx_beacon_name: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub tx_power: Option<i64>,
    pub adv_data: Value,
}

/// frames pushed to websocket subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    #[serde(rename = "hello")]
    Hello { connection_id: u64 },
    #[serde(rename = "scan:batch")]
    ScanBatch(Vec<ObservationView>),
}
