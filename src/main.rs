//! ==============================================================================
//! main.rs - ble scan hub entry point
//! ==============================================================================
//!
//! purpose:
//!     receives periodic BLE/iBeacon scan batches from ESP32 scanner nodes,
//!     keeps device and rssi history in a local sqlite file and pushes every
//!     batch to connected dashboards as it arrives.
//!
//! responsibilities:
//!     - load configuration (config/hub.toml + DB_PATH / PORT overrides)
//!     - initialise tracing
//!     - open the database and run the idempotent migration
//!     - serve the rest api and the realtime websocket
//!
//! architecture:
//!
//! ```text
//!     ┌──────────┐  POST /api/scan   ┌─────────────────────────────────────┐
//!     │  ESP32   │ ────────────────► │              rust hub                │
//!     │ scanners │                   │  ┌────────┐  ┌───────┐  ┌─────────┐  │
//!     └──────────┘                   │  │ ingest │─►│ store │  │   hub   │  │
//!                                    │  └────────┘  └───┬───┘  └────┬────┘  │
//!     ┌──────────┐  GET /api/...     │                  │ sqlite    │ ws    │
//!     │dashboard │ ◄──────────────── │  ◄───────────────┘           │       │
//!     │          │ ◄─────────────────┼──────── scan:batch ──────────┘       │
//!     └──────────┘       /ws         └─────────────────────────────────────┘
//! ```
//!
//! ==============================================================================

use anyhow::{Context, Result};
use ble_scan_hub::{run_server, AppState, Hub, HubConfig, SqliteStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  BLE Scan Hub");
    println!("  ESP32 scanners -> sqlite -> live dashboards");
    println!("===========================================================");

    // step 1: load configuration
    let config = HubConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .init();

    // step 3: storage
    let store = SqliteStore::open(&config.storage.db_path).with_context(|| {
        format!("failed to open database at {}", config.storage.db_path.display())
    })?;

    // step 4: realtime hub + http server
    let hub = Hub::new(config.realtime.channel_capacity);
    let state = AppState::new(Arc::new(store), hub, &config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting ble scan hub");
    run_server(&config, state).await
}
