//! # Polymarket ingestion pipeline
//!
//! Pulls collection entities (events, markets, series, tags, collections),
//! market participants and their history from the Gamma and Data APIs into
//! one SQLite database, idempotently.
//!
//! ## Run shape
//!
//! 1. Collection phases page through list endpoints concurrently and upsert
//!    each page as it arrives (`fetcher`, `descriptor`, `db`)
//! 2. Many-to-many lists are merged through a single writer thread
//!    (`associations`)
//! 3. Holders of active markets are classified; whales are enriched with
//!    trades, activity and positions (`participants`, `classifier`, `enrichment`)
//! 4. Comments, live volume, open interest and large trades are refreshed
//!    per active entity (`comments`, `market_data`)
//! 5. Closed or inactive entities are cascaded out after each phase (`cleanup`)
//!
//! `scan::Scanner` drives the phases from a `ScanPlan`.
//!
//! ## Schema Reference
//!
//! All tables are created by the migrations in `/sql/`, applied in file-name
//! order by `db::run_schema_migrations`.

pub mod associations;
pub mod classifier;
pub mod cleanup;
pub mod client;
pub mod comments;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod enrichment;
pub mod error;
pub mod fetcher;
pub mod market_data;
pub mod participants;
pub mod scan;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use client::{ApiClient, HttpApiClient};
pub use config::ScanConfig;
pub use db::Store;
pub use error::ScanError;
pub use scan::{Phase, RunReport, ScanPlan, Scanner};
