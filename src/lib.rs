//! ble-scan-hub: stores BLE/iBeacon scan batches posted by ESP32 scanner
//! nodes and streams them to dashboards in real time.

pub mod config;
pub mod domain;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod server;
pub mod store;

pub use config::HubConfig;
pub use hub::Hub;
pub use server::{build_router, run_server, AppState};
pub use store::{ScanStore, SqliteStore};
