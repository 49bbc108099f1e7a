//! Whale classification
//!
//! A participant qualifies when any one signal crosses its threshold:
//! 1. wallet value >= high threshold
//! 2. held quantity x per-unit price estimate >= position floor
//! 3. wallet value >= medium threshold AND quantity >= medium quantity
//!
//! A missing wallet value counts as zero, so classification falls through to
//! the position signal instead of failing.

use super::client::{json_f64, query, Api, ApiClient, RateLimiter};
use super::config::WhaleThresholdConfig;
use super::db::{row_from, Store};
use rusqlite::types::Value as SqlValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Inputs to one classification decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalBundle {
    /// Total wallet value in USD, if known
    pub wallet_value: Option<f64>,
    /// Shares held in the market under inspection
    pub quantity: f64,
}

/// Swappable whale predicate
pub trait Classify: Send + Sync {
    fn classify(&self, signals: &SignalBundle) -> bool;

    /// True when `quantity` qualifies on its own, so no wallet lookup is needed
    fn qualifies_without_wallet(&self, quantity: f64) -> bool {
        self.classify(&SignalBundle {
            wallet_value: None,
            quantity,
        })
    }
}

/// Threshold-driven predicate (defaults: 1000 / 250 at 0.5 per unit / 500 + 100)
#[derive(Debug, Clone, PartialEq)]
pub struct WhaleThresholds {
    pub high_wallet_value: f64,
    pub position_value_floor: f64,
    pub unit_price_estimate: f64,
    pub medium_wallet_value: f64,
    pub medium_quantity: f64,
}

impl From<&WhaleThresholdConfig> for WhaleThresholds {
    fn from(config: &WhaleThresholdConfig) -> Self {
        Self {
            high_wallet_value: config.high_wallet_value,
            position_value_floor: config.position_value_floor,
            unit_price_estimate: config.unit_price_estimate,
            medium_wallet_value: config.medium_wallet_value,
            medium_quantity: config.medium_quantity,
        }
    }
}

impl Default for WhaleThresholds {
    fn default() -> Self {
        Self::from(&WhaleThresholdConfig::default())
    }
}

impl Classify for WhaleThresholds {
    fn classify(&self, signals: &SignalBundle) -> bool {
        let wallet = signals.wallet_value.unwrap_or(0.0);
        let estimated_position = signals.quantity * self.unit_price_estimate;

        wallet >= self.high_wallet_value
            || estimated_position >= self.position_value_floor
            || (wallet >= self.medium_wallet_value && signals.quantity >= self.medium_quantity)
    }
}

/// Per-run memo of wallet values
///
/// Each wallet is fetched at most once per cache instance, even when many
/// tasks ask for it at the same moment. Lookups are spaced by the rate
/// limiter. A failed lookup is remembered as `None`. With a history store
/// attached, every resolved value is also appended to `user_values`.
pub struct WalletValueCache {
    client: Arc<dyn ApiClient>,
    history: Option<Store>,
    limiter: RateLimiter,
    cells: Mutex<HashMap<String, Arc<OnceCell<Option<f64>>>>>,
    lookups: AtomicUsize,
}

impl WalletValueCache {
    pub fn new(client: Arc<dyn ApiClient>, delay: Duration) -> Self {
        Self {
            client,
            history: None,
            limiter: RateLimiter::new(delay),
            cells: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_history(mut self, store: Store) -> Self {
        self.history = Some(store);
        self
    }

    /// Wallet value for `wallet`, fetching it on first use
    pub async fn wallet_value(&self, wallet: &str) -> Option<f64> {
        let cell = {
            let mut cells = match self.cells.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cells.entry(wallet.to_string()).or_default().clone()
        };

        *cell
            .get_or_init(|| async {
                self.limiter.wait().await;
                self.lookups.fetch_add(1, Ordering::Relaxed);
                self.fetch(wallet).await
            })
            .await
    }

    /// Value already resolved for `wallet` without triggering a lookup
    pub fn cached(&self, wallet: &str) -> Option<f64> {
        let cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.get(wallet).and_then(|cell| cell.get().copied().flatten())
    }

    /// Network lookups issued so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn fetch(&self, wallet: &str) -> Option<f64> {
        match self
            .client
            .get_list(Api::Data, "/value", &query([("user", wallet)]))
            .await
        {
            Ok(items) => {
                let value = items.first().and_then(|item| json_f64(item, "value"));
                if let Some(value) = value {
                    self.record(wallet, value);
                }
                value
            }
            Err(e) => {
                log::warn!("⚠️  Wallet value lookup failed for {}: {}", wallet, e);
                None
            }
        }
    }

    fn record(&self, wallet: &str, value: f64) {
        let Some(store) = &self.history else {
            return;
        };
        let row = row_from([
            ("proxy_wallet", SqlValue::Text(wallet.to_string())),
            ("market_condition_id", SqlValue::Null),
            ("value", SqlValue::Real(value)),
            ("timestamp", SqlValue::Integer(chrono::Utc::now().timestamp())),
        ]);
        if let Err(e) = store.insert_if_absent("user_values", &row) {
            log::warn!("⚠️  Could not record value for {}: {}", wallet, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ScanError;
    use crate::pipeline::testing::{create_test_store, param, ScriptedClient};
    use serde_json::json;

    fn bundle(wallet_value: f64, quantity: f64) -> SignalBundle {
        SignalBundle {
            wallet_value: Some(wallet_value),
            quantity,
        }
    }

    #[test]
    fn test_position_signal_alone_qualifies() {
        // 600 x 0.5 = 300 >= 250
        assert!(WhaleThresholds::default().classify(&bundle(0.0, 600.0)));
    }

    #[test]
    fn test_wallet_signal_alone_qualifies() {
        assert!(WhaleThresholds::default().classify(&bundle(1_500.0, 0.0)));
    }

    #[test]
    fn test_small_wallet_small_position_rejected() {
        assert!(!WhaleThresholds::default().classify(&bundle(100.0, 10.0)));
    }

    #[test]
    fn test_medium_wallet_with_moderate_position() {
        let t = WhaleThresholds::default();
        // 150 x 0.5 = 75 misses the floor; medium combination carries it
        assert!(t.classify(&bundle(600.0, 150.0)));
        assert!(!t.classify(&bundle(600.0, 50.0)));
        assert!(!t.classify(&bundle(400.0, 150.0)));
    }

    #[test]
    fn test_missing_wallet_value_falls_through() {
        let t = WhaleThresholds::default();
        assert!(t.classify(&SignalBundle { wallet_value: None, quantity: 500.0 }));
        assert!(!t.classify(&SignalBundle { wallet_value: None, quantity: 499.0 }));
        assert!(t.qualifies_without_wallet(500.0));
    }

    #[test]
    fn test_thresholds_from_config() {
        let config = WhaleThresholdConfig {
            high_wallet_value: 10.0,
            ..WhaleThresholdConfig::default()
        };
        let t = WhaleThresholds::from(&config);
        assert!(t.classify(&bundle(10.0, 0.0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wallet_value_memoized_under_concurrency() {
        let client = Arc::new(ScriptedClient::new().route(Api::Data, "/value", |q| {
            match param(q, "user") {
                Some("0xfail") => Err(ScanError::Status {
                    url: "/value".to_string(),
                    status: 500,
                }),
                _ => Ok(json!([{"user": "0xabc", "value": 1234.5}])),
            }
        }));
        let cache = Arc::new(WalletValueCache::new(client.clone(), Duration::from_millis(1)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.wallet_value("0xabc").await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Some(1234.5));
        }

        assert_eq!(cache.wallet_value("0xfail").await, None);
        assert_eq!(cache.wallet_value("0xfail").await, None);

        assert_eq!(cache.lookups(), 2);
        assert_eq!(client.calls_to("/value").len(), 2);
        assert_eq!(cache.cached("0xabc"), Some(1234.5));
        assert_eq!(cache.cached("0xunknown"), None);
    }

    #[tokio::test]
    async fn test_resolved_values_appended_to_history() {
        let (_tmp, store) = create_test_store();
        let client = Arc::new(ScriptedClient::new().route(Api::Data, "/value", |q| {
            match param(q, "user") {
                Some("0xempty") => Ok(json!([])),
                _ => Ok(json!([{"user": "0xabc", "value": 777.25}])),
            }
        }));
        let cache = WalletValueCache::new(client, Duration::from_millis(1)).with_history(store.clone());

        assert_eq!(cache.wallet_value("0xabc").await, Some(777.25));
        assert_eq!(cache.wallet_value("0xabc").await, Some(777.25));
        assert_eq!(cache.wallet_value("0xempty").await, None);

        assert_eq!(
            store
                .query_strings(
                    "SELECT proxy_wallet || ':' || CAST(value AS TEXT) FROM user_values",
                    &[],
                )
                .unwrap(),
            vec!["0xabc:777.25".to_string()]
        );
    }
}
