//! Credit ledger reaper daemon.
//!
//! Opens the ledger store and runs both reaper jobs until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credit_ledger_service::{CreditLedger, LedgerConfig, Reaper};
use credit_ledger_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credit_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting credit ledger reaper");

    let config = LedgerConfig::from_env();
    tracing::info!(
        data_dir = %config.data_dir,
        max_retries = config.max_retries,
        page_size = config.reaper.page_size,
        timeout_threshold_secs = config.reaper.timeout_threshold.as_secs(),
        expired_threshold_secs = config.reaper.expired_threshold.as_secs(),
        "Ledger configuration loaded"
    );

    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    let ledger = Arc::new(CreditLedger::new(store, &config));
    let reaper = Arc::new(Reaper::new(ledger, config.reaper.clone(), config.call_timeout));
    let handle = reaper.spawn_all();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    handle.shutdown().await;

    Ok(())
}
