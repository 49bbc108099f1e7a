//! Scan configuration from environment variables
//!
//! Every variable is optional; unparsable values fall back to the default.

use std::env;
use std::time::Duration;

pub const DEFAULT_GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const DEFAULT_DATA_API_URL: &str = "https://data-api.polymarket.com";

/// Configuration for a scan run
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `.sql` migration files
    pub schema_dir: String,

    pub gamma_api_url: String,
    pub data_api_url: String,

    /// Per-request network timeout in seconds
    pub request_timeout_secs: u64,

    /// Fixed delay between wallet-value lookups in milliseconds
    pub rate_limit_delay_ms: u64,

    /// Records requested per page
    pub page_size: usize,

    /// Hard cap on pages per endpoint
    pub max_pages: usize,

    /// Concurrent page requests (speculative window)
    pub fetch_workers: usize,

    /// Concurrent markets inspected for holders
    pub holder_workers: usize,

    /// Concurrent participants enriched
    pub enrichment_workers: usize,

    /// Rows committed per bulk transaction
    pub bulk_chunk_size: usize,

    pub top_holders_per_market: usize,

    /// Activity rows below this notional (USDC) are dropped
    pub min_transaction_size: f64,

    /// Closed positions below this notional are dropped
    pub min_position_value: f64,

    /// Transactions at or above this notional are flagged as whale trades
    pub min_whale_trade: f64,

    pub whale: WhaleThresholdConfig,

    pub enable_tags: bool,
    pub enable_series: bool,
    pub enable_comments: bool,
    pub enable_transactions: bool,
    pub enable_live_volume: bool,
    pub enable_open_interest: bool,

    /// Run consistency cleanup between phases
    pub enable_cleanup: bool,

    /// Explicit phase list (`SCAN_PHASES=events,markets,...`), overrides toggles
    pub phases: Option<Vec<String>>,

    /// Where the binary writes the JSON run report, if anywhere
    pub report_path: Option<String>,
}

/// Thresholds for the whale predicate
#[derive(Debug, Clone, PartialEq)]
pub struct WhaleThresholdConfig {
    pub high_wallet_value: f64,
    pub position_value_floor: f64,
    pub unit_price_estimate: f64,
    pub medium_wallet_value: f64,
    pub medium_quantity: f64,
}

impl Default for WhaleThresholdConfig {
    fn default() -> Self {
        Self {
            high_wallet_value: 1_000.0,
            position_value_floor: 250.0,
            unit_price_estimate: 0.5,
            medium_wallet_value: 500.0,
            medium_quantity: 100.0,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|s| s.to_lowercase().parse().ok())
        .unwrap_or(default)
}

impl ScanConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `POLYSCAN_DB_PATH` (default: polyscan.db)
    /// - `POLYSCAN_SCHEMA_DIR` (default: sql)
    /// - `GAMMA_API_URL`, `DATA_API_URL` (default: public Polymarket endpoints)
    /// - `REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `RATE_LIMIT_DELAY_MS` (default: 100)
    /// - `PAGE_SIZE` (default: 100), `MAX_PAGES` (default: 500)
    /// - `FETCH_WORKERS` (default: 20), `HOLDER_WORKERS` (default: 10),
    ///   `ENRICHMENT_WORKERS` (default: 10)
    /// - `BULK_CHUNK_SIZE` (default: 100)
    /// - `TOP_HOLDERS_PER_MARKET` (default: 25)
    /// - `MIN_TRANSACTION_SIZE`, `MIN_POSITION_VALUE` (default: 500),
    ///   `MIN_WHALE_TRADE` (default: 10000)
    /// - `WHALE_HIGH_WALLET`, `WHALE_POSITION_FLOOR`, `WHALE_UNIT_PRICE`,
    ///   `WHALE_MEDIUM_WALLET`, `WHALE_MEDIUM_QUANTITY`
    /// - `ENABLE_TAGS`, `ENABLE_SERIES`, `ENABLE_COMMENTS`,
    ///   `ENABLE_TRANSACTIONS` (default: true), `ENABLE_LIVE_VOLUME`,
    ///   `ENABLE_OPEN_INTEREST` (default: false), `ENABLE_CLEANUP` (default: true)
    /// - `SCAN_PHASES` (comma separated, optional)
    /// - `SCAN_REPORT_PATH` (optional JSON run report)
    pub fn from_env() -> Self {
        let defaults = WhaleThresholdConfig::default();

        Self {
            db_path: env::var("POLYSCAN_DB_PATH").unwrap_or_else(|_| "polyscan.db".to_string()),
            schema_dir: env::var("POLYSCAN_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),
            gamma_api_url: env::var("GAMMA_API_URL")
                .unwrap_or_else(|_| DEFAULT_GAMMA_API_URL.to_string()),
            data_api_url: env::var("DATA_API_URL")
                .unwrap_or_else(|_| DEFAULT_DATA_API_URL.to_string()),

            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30),
            rate_limit_delay_ms: env_or("RATE_LIMIT_DELAY_MS", 100),
            page_size: env_or("PAGE_SIZE", 100),
            max_pages: env_or("MAX_PAGES", 500),
            fetch_workers: env_or("FETCH_WORKERS", 20),
            holder_workers: env_or("HOLDER_WORKERS", 10),
            enrichment_workers: env_or("ENRICHMENT_WORKERS", 10),
            bulk_chunk_size: env_or("BULK_CHUNK_SIZE", 100),
            top_holders_per_market: env_or("TOP_HOLDERS_PER_MARKET", 25),

            min_transaction_size: env_or("MIN_TRANSACTION_SIZE", 500.0),
            min_position_value: env_or("MIN_POSITION_VALUE", 500.0),
            min_whale_trade: env_or("MIN_WHALE_TRADE", 10_000.0),

            whale: WhaleThresholdConfig {
                high_wallet_value: env_or("WHALE_HIGH_WALLET", defaults.high_wallet_value),
                position_value_floor: env_or("WHALE_POSITION_FLOOR", defaults.position_value_floor),
                unit_price_estimate: env_or("WHALE_UNIT_PRICE", defaults.unit_price_estimate),
                medium_wallet_value: env_or("WHALE_MEDIUM_WALLET", defaults.medium_wallet_value),
                medium_quantity: env_or("WHALE_MEDIUM_QUANTITY", defaults.medium_quantity),
            },

            enable_tags: env_flag("ENABLE_TAGS", true),
            enable_series: env_flag("ENABLE_SERIES", true),
            enable_comments: env_flag("ENABLE_COMMENTS", true),
            enable_transactions: env_flag("ENABLE_TRANSACTIONS", true),
            enable_live_volume: env_flag("ENABLE_LIVE_VOLUME", false),
            enable_open_interest: env_flag("ENABLE_OPEN_INTEREST", false),
            enable_cleanup: env_flag("ENABLE_CLEANUP", true),

            phases: env::var("SCAN_PHASES").ok().map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect()
            }),
            report_path: env::var("SCAN_REPORT_PATH").ok().filter(|p| !p.is_empty()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    /// Reject values that would stall or spin the pipeline
    pub fn validate(&self) -> Result<(), super::error::ScanError> {
        use super::error::ScanError;

        if self.page_size == 0 {
            return Err(ScanError::Config("PAGE_SIZE must be positive".to_string()));
        }
        if self.fetch_workers == 0 || self.holder_workers == 0 || self.enrichment_workers == 0 {
            return Err(ScanError::Config("worker counts must be positive".to_string()));
        }
        if self.bulk_chunk_size == 0 {
            return Err(ScanError::Config("BULK_CHUNK_SIZE must be positive".to_string()));
        }
        for url in [&self.gamma_api_url, &self.data_api_url] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ScanError::Config(format!(
                    "API URL must start with http:// or https://, got {}",
                    url
                )));
            }
        }
        Ok(())
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            db_path: "polyscan.db".to_string(),
            schema_dir: "sql".to_string(),
            gamma_api_url: DEFAULT_GAMMA_API_URL.to_string(),
            data_api_url: DEFAULT_DATA_API_URL.to_string(),
            request_timeout_secs: 30,
            rate_limit_delay_ms: 100,
            page_size: 100,
            max_pages: 500,
            fetch_workers: 20,
            holder_workers: 10,
            enrichment_workers: 10,
            bulk_chunk_size: 100,
            top_holders_per_market: 25,
            min_transaction_size: 500.0,
            min_position_value: 500.0,
            min_whale_trade: 10_000.0,
            whale: WhaleThresholdConfig::default(),
            enable_tags: true,
            enable_series: true,
            enable_comments: true,
            enable_transactions: true,
            enable_live_volume: false,
            enable_open_interest: false,
            enable_cleanup: true,
            phases: None,
            report_path: None,
        }
    }
}
