//! Scan Runtime - one ingestion pass per invocation
//!
//! Opens (and migrates) the SQLite database, runs the configured scan plan
//! against the Polymarket APIs, logs a summary and exits. Schedule it
//! externally (cron, systemd timer) for periodic refresh.
//!
//! Usage:
//!   cargo run --release --bin scan_runtime
//!
//! Environment variables:
//!   POLYSCAN_DB_PATH - SQLite database path (default: polyscan.db)
//!   SCAN_PHASES - Comma separated phase list (default: from ENABLE_* toggles)
//!   SCAN_REPORT_PATH - Write the JSON run report here (optional)
//!   RUST_LOG - Log filter (default: info)

use dotenv::dotenv;
use log::{error, info, warn};
use polyscan::pipeline::{HttpApiClient, ScanConfig, ScanPlan, Scanner, Store};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Scan Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ScanConfig::from_env();
    config.validate()?;
    let plan = ScanPlan::from_config(&config)?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Gamma API: {}", config.gamma_api_url);
    info!("   ├─ Data API: {}", config.data_api_url);
    info!("   ├─ Page size: {} ({} workers)", config.page_size, config.fetch_workers);
    info!(
        "   ├─ Holders: {} workers, top {} per token",
        config.holder_workers, config.top_holders_per_market
    );
    info!("   ├─ Enrichment: {} workers", config.enrichment_workers);
    info!("   └─ Cleanup: {}", if config.enable_cleanup { "enabled" } else { "disabled" });

    // Initialize database (idempotent)
    info!("🔧 Initializing database...");
    let store = Store::open(&config.db_path)?.with_chunk_size(config.bulk_chunk_size);
    store.migrate(&config.schema_dir)?;
    info!("✅ Database initialized");

    let client = Arc::new(HttpApiClient::new(&config)?);
    let report_path = config.report_path.clone();
    let scanner = Scanner::new(config, store, client)?;

    let report = tokio::select! {
        report = scanner.run(&plan) => Some(report),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("⚠️  Received CTRL+C, abandoning scan"),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
            None
        }
    };

    scanner.shutdown();

    if let Some(report) = report {
        if let Some(path) = report_path {
            std::fs::write(&path, report.to_json()?)?;
            info!("📝 Run report written to {}", path);
        }
        if report.failed() > 0 {
            warn!("⚠️  {} of {} phases failed", report.failed(), report.phases.len());
        }
    }

    info!("✅ Scan runtime stopped");
    Ok(())
}
