//! ==============================================================================
//! store.rs - sqlite persistence for devices and readings
//! ==============================================================================
//!
//! purpose:
//!     owns the durable state of the hub: one `devices` row per hardware
//!     address and one `readings` row per accepted rssi sample.
//!
//! schema:
//!
//! ```text
//!     devices                              readings
//!     ┌──────────────────────────┐         ┌──────────────────────────────┐
//!     │ id          INTEGER PK   │◄────────│ device_id  INTEGER FK CASCADE │
//!     │ mac         TEXT UNIQUE  │         │ rssi       INTEGER NOT NULL   │
//!     │ name, type, protocol     │         │ adv_data   TEXT (json)        │
//!     │ first_seen  INTEGER (ms) │         │ ts         INTEGER (ms)       │
//!     │ last_seen   INTEGER (ms) │         │ tx_beacon_name, major, minor, │
//!     └──────────────────────────┘         │ tx_power                      │
//!                                          └──────────────────────────────┘
//! ```
//!
//! relationships:
//!     - used by: server.rs (through the `ScanStore` trait)
//!     - consumes: domain.rs `Observation` produced by ingest.rs
//!
//! concurrency:
//!     a single connection sits behind a mutex. every batch runs inside one
//!     transaction, so two scanners posting at once never interleave rows and
//!     readers see a batch either fully or not at all.
//!
//! ==============================================================================

use crate::domain::{
    BatchOutcome, DeviceSummary, Observation, ReadingRecord, SkipReason, SkippedItem,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// most rows returned by one history query
pub const READINGS_LIMIT: usize = 5000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  mac TEXT UNIQUE NOT NULL,
  name TEXT,
  type TEXT,
  protocol TEXT,
  first_seen INTEGER,
  last_seen INTEGER
);

CREATE TABLE IF NOT EXISTS readings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id INTEGER NOT NULL,
  rssi INTEGER NOT NULL,
  adv_data TEXT,
  ts INTEGER NOT NULL,
  tx_beacon_name TEXT,
  major INTEGER,
  minor INTEGER,
  tx_power INTEGER,
  FOREIGN KEY(device_id) REFERENCES devices(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_readings_device_ts ON readings(device_id, ts);
";

const INSERT_DEVICE: &str = "INSERT OR IGNORE INTO devices (mac, name, type, protocol, first_seen, last_seen)
     VALUES (?1, ?2, ?3, ?4, ?5, ?5)";

// last_seen never moves backwards, even if the host clock does
const TOUCH_DEVICE: &str = "UPDATE devices
     SET last_seen = MAX(COALESCE(last_seen, ?1), ?1), protocol = ?2
     WHERE mac = ?3";

const DEVICE_ID: &str = "SELECT id FROM devices WHERE mac = ?1";

const INSERT_READING: &str = "INSERT INTO readings (device_id, rssi, adv_data, ts, tx_beacon_name, major, minor, tx_power)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

// beacon fields come from the latest reading (by ts, then insertion order)
const LIST_DEVICES: &str = "
SELECT
  d.mac,
  d.name,
  d.type,
  d.protocol,
  d.first_seen,
  d.last_seen,
  (SELECT ROUND(AVG(r.rssi), 1) FROM readings r WHERE r.device_id = d.id) AS avg_rssi,
  latest.major,
  latest.minor,
  latest.tx_power
FROM devices d
LEFT JOIN readings latest ON latest.id = (
  SELECT r2.id FROM readings r2
  WHERE r2.device_id = d.id
  ORDER BY r2.ts DESC, r2.id DESC
  LIMIT 1
)
ORDER BY d.last_seen DESC, d.id DESC
";

const DEVICE_READINGS: &str = "
SELECT rssi, ts, tx_beacon_name, major, minor, tx_power, adv_data
FROM readings
WHERE device_id = ?1
ORDER BY ts DESC, id DESC
LIMIT ?2
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode adv_data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage seam used by the http handlers.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait ScanStore: Send + Sync {
    /// Apply a whole batch atomically. `now` is the receipt time in epoch ms.
    fn apply_batch(&self, batch: &[Observation], now: i64) -> StoreResult<BatchOutcome>;

    /// Every device with its rssi average, most recently seen first.
    fn list_devices(&self) -> StoreResult<Vec<DeviceSummary>>;

    /// Newest readings of one device, at most `limit` rows.
    fn device_readings(&self, mac: &str, limit: usize) -> StoreResult<Vec<ReadingRecord>>;

    fn device_count(&self) -> StoreResult<usize>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and run the idempotent migration.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn).inspect(|_| info!(path = %path.display(), "database ready"))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ScanStore for SqliteStore {
    fn apply_batch(&self, batch: &[Observation], now: i64) -> StoreResult<BatchOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut outcome = BatchOutcome::default();

        {
            let mut insert_device = tx.prepare_cached(INSERT_DEVICE)?;
            let mut touch_device = tx.prepare_cached(TOUCH_DEVICE)?;
            let mut device_id = tx.prepare_cached(DEVICE_ID)?;
            let mut insert_reading = tx.prepare_cached(INSERT_READING)?;

            for obs in batch {
                // the device is recorded even when the sample itself is unusable
                insert_device.execute(params![obs.mac, obs.name, obs.kind, obs.protocol, now])?;
                touch_device.execute(params![now, obs.protocol, obs.mac])?;

                let id: Option<i64> = device_id
                    .query_row(params![obs.mac], |row| row.get(0))
                    .optional()?;
                let Some(id) = id else {
                    warn!(mac = %obs.mac, "device upserted but not found afterwards");
                    outcome.skipped.push(skip(obs, SkipReason::DeviceUnresolved));
                    continue;
                };

                let Some(rssi) = obs.rssi else {
                    warn!(mac = %obs.mac, index = obs.index, "skipping reading with invalid rssi");
                    outcome.skipped.push(skip(obs, SkipReason::InvalidRssi));
                    continue;
                };

                insert_reading.execute(params![
                    id,
                    rssi,
                    serde_json::to_string(&obs.adv_data)?,
                    obs.ts,
                    obs.tx_beacon_name,
                    obs.major,
                    obs.minor,
                    obs.tx_power,
                ])?;
                outcome.stored += 1;
            }
        }

        tx.commit()?;
        debug!(items = batch.len(), stored = outcome.stored, "batch committed");
        Ok(outcome)
    }

    fn list_devices(&self) -> StoreResult<Vec<DeviceSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(LIST_DEVICES)?;
        let rows = stmt.query_map([], device_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn device_readings(&self, mac: &str, limit: usize) -> StoreResult<Vec<ReadingRecord>> {
        let conn = self.lock()?;
        let id: i64 = conn
            .query_row(DEVICE_ID, params![mac], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::DeviceNotFound(mac.to_string()))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare_cached(DEVICE_READINGS)?;
        let rows = stmt.query_map(params![id, limit], reading_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn device_count(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn skip(obs: &Observation, reason: SkipReason) -> SkippedItem {
    SkippedItem { index: obs.index, mac: Some(obs.mac.clone()), reason }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceSummary> {
    Ok(DeviceSummary {
        mac: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        protocol: row.get(3)?,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        avg_rssi: row.get(6)?,
        major: row.get(7)?,
        minor: row.get(8)?,
        tx_power: row.get(9)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<ReadingRecord> {
    let adv_data: Option<String> = row.get(6)?;
    Ok(ReadingRecord {
        rssi: row.get(0)?,
        ts: row.get(1)?,
        tx_beacon_name: row.get(2)?,
        major: row.get(3)?,
        minor: row.get(4)?,
        tx_power: row.get(5)?,
        adv_data: adv_data
            .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
            .unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obs(index: usize, mac: &str, rssi: Option<i64>, ts: i64) -> Observation {
        Observation {
            index,
            mac: mac.to_string(),
            name: "Unknown".to_string(),
            kind: "BLE".to_string(),
            protocol: None,
            rssi,
            adv_data: json!({}),
            ts,
            major: None,
            minor: None,
            tx_power: None,
            tx_beacon_name: None,
        }
    }

    fn device(store: &SqliteStore, mac: &str) -> DeviceSummary {
        store
            .list_devices()
            .expect("list")
            .into_iter()
            .find(|d| d.mac == mac)
            .expect("device present")
    }

    #[test]
    fn migration_is_idempotent() {
        let store = SqliteStore::open_in_memory().expect("open");
        let conn = store.lock().expect("lock");
        conn.execute_batch(SCHEMA).expect("second migration");
    }

    #[test]
    fn invalid_rssi_upserts_device_without_reading() {
        let store = SqliteStore::open_in_memory().expect("open");
        let outcome = store.apply_batch(&[obs(0, "AA", None, 10)], 1_000).expect("apply");

        assert_eq!(outcome.stored, 0);
        assert_eq!(outcome.skipped, vec![SkippedItem {
            index: 0,
            mac: Some("AA".into()),
            reason: SkipReason::InvalidRssi,
        }]);
        let d = device(&store, "AA");
        assert_eq!((d.first_seen, d.last_seen), (1_000, 1_000));
        assert_eq!(d.avg_rssi, None);
        assert!(store.device_readings("AA", READINGS_LIMIT).expect("readings").is_empty());
    }

    #[test]
    fn second_batch_moves_last_seen_but_not_first_seen() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.apply_batch(&[obs(0, "AA", Some(-50), 1)], 1_000).expect("first");

        let mut later = obs(0, "AA", Some(-60), 2);
        later.name = "Renamed".to_string();
        later.protocol = Some("ibeacon".to_string());
        store.apply_batch(&[later], 2_000).expect("second");

        let d = device(&store, "AA");
        assert_eq!(d.first_seen, 1_000);
        assert_eq!(d.last_seen, 2_000);
        assert_eq!(d.protocol.as_deref(), Some("ibeacon"));
        assert_eq!(d.name.as_deref(), Some("Unknown"));
        assert_eq!(d.avg_rssi, Some(-55.0));
    }

    #[test]
    fn last_seen_never_decreases() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.apply_batch(&[obs(0, "AA", Some(-50), 1)], 2_000).expect("first");
        store.apply_batch(&[obs(0, "AA", Some(-50), 1)], 1_500).expect("second");
        assert_eq!(device(&store, "AA").last_seen, 2_000);
    }

    #[test]
    fn device_list_uses_latest_reading_for_beacon_fields() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut old = obs(0, "AA", Some(-70), 100);
        old.major = Some(1);
        let mut newest = obs(1, "AA", Some(-60), 300);
        newest.major = Some(3);
        newest.minor = Some(7);
        newest.tx_power = Some(-59);
        let mut middle = obs(2, "AA", Some(-65), 200);
        middle.major = Some(2);
        store.apply_batch(&[old, newest, middle], 1_000).expect("apply");

        let d = device(&store, "AA");
        assert_eq!((d.major, d.minor, d.tx_power), (Some(3), Some(7), Some(-59)));
        assert_eq!(d.avg_rssi, Some(-65.0));
    }

    #[test]
    fn average_is_rounded_to_one_decimal() {
        let store = SqliteStore::open_in_memory().expect("open");
        let batch = [obs(0, "AA", Some(-50), 1), obs(1, "AA", Some(-51), 2), obs(2, "AA", Some(-51), 3)];
        store.apply_batch(&batch, 1_000).expect("apply");
        assert_eq!(device(&store, "AA").avg_rssi, Some(-50.7));
    }

    #[test]
    fn devices_are_ordered_by_last_seen() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.apply_batch(&[obs(0, "OLD", Some(-50), 1)], 1_000).expect("old");
        store.apply_batch(&[obs(0, "NEW", Some(-50), 1)], 2_000).expect("new");
        let macs: Vec<String> = store.list_devices().expect("list").into_iter().map(|d| d.mac).collect();
        assert_eq!(macs, vec!["NEW", "OLD"]);
    }

    #[test]
    fn readings_are_newest_first_and_limited() {
        let store = SqliteStore::open_in_memory().expect("open");
        let batch: Vec<Observation> = (0..10).map(|i| obs(i, "AA", Some(-40 - i as i64), i as i64 + 1)).collect();
        store.apply_batch(&batch, 1_000).expect("apply");

        let readings = store.device_readings("AA", 3).expect("readings");
        let ts: Vec<i64> = readings.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![10, 9, 8]);
        assert_eq!(readings[0].rssi, -49);
    }

    #[test]
    fn adv_data_round_trips_as_json() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut o = obs(0, "AA", Some(-50), 5);
        o.adv_data = json!({"uuid": "f7826da6", "raw": [2, 1, 6]});
        o.tx_beacon_name = Some("lobby".into());
        store.apply_batch(&[o], 1_000).expect("apply");

        let reading = &store.device_readings("AA", READINGS_LIMIT).expect("readings")[0];
        assert_eq!(reading.adv_data, json!({"uuid": "f7826da6", "raw": [2, 1, 6]}));
        assert_eq!(reading.tx_beacon_name.as_deref(), Some("lobby"));
    }

    #[test]
    fn unknown_device_is_not_found() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(matches!(
            store.device_readings("nope", READINGS_LIMIT),
            Err(StoreError::DeviceNotFound(mac)) if mac == "nope"
        ));
    }

    #[test]
    fn failed_batch_rolls_back_every_item() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .lock()
            .expect("lock")
            .execute_batch("DROP TABLE readings;")
            .expect("drop");

        // first item only touches devices, second fails on the missing table
        let result = store.apply_batch(&[obs(0, "AA", None, 1), obs(1, "BB", Some(-50), 1)], 1_000);
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(store.device_count().expect("count"), 0);
    }

    #[test]
    fn deleting_device_cascades_to_readings() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.apply_batch(&[obs(0, "AA", Some(-50), 1)], 1_000).expect("apply");

        let conn = store.lock().expect("lock");
        conn.execute("DELETE FROM devices WHERE mac = 'AA'", []).expect("delete");
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .expect("count");
        assert_eq!(left, 0);
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("beacons.db");
        let store = SqliteStore::open(&path).expect("open");
        store.apply_batch(&[obs(0, "AA", Some(-50), 1)], 1_000).expect("apply");
        drop(store);

        let reopened = SqliteStore::open(&path).expect("reopen");
        assert_eq!(reopened.device_count().expect("count"), 1);
    }
}
