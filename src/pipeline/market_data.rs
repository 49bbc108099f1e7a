//! Per-entity market metrics and the large-transaction feed
//!
//! - live volume per open event (`/live-volume?id=`)
//! - open interest per active market (`/oi?market=`)
//! - recent trades per active market (`/trades?market=`), kept above a
//!   notional floor and flagged when they reach the whale-trade size

use super::client::{json_f64, query, Api, ApiClient, Query};
use super::db::{row_from, Row, Store};
use super::descriptor::TRANSACTIONS;
use super::enrichment::notional;
use super::error::ScanError;
use super::participants::MarketRef;
use futures::stream::{self, StreamExt};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Trades requested per market
pub const TRADES_PER_MARKET: usize = 100;

/// Aggregate for one metrics pass
#[derive(Debug, Default)]
pub struct MetricsReport {
    pub targets: usize,
    pub rows: usize,
    pub errors: Vec<String>,
}

/// Notional floors for the transaction feed
#[derive(Debug, Clone)]
pub struct TradeFilter {
    pub min_transaction_size: f64,
    pub min_whale_trade: f64,
}

impl Default for TradeFilter {
    fn default() -> Self {
        Self {
            min_transaction_size: 500.0,
            min_whale_trade: 10_000.0,
        }
    }
}

pub struct MarketData {
    client: Arc<dyn ApiClient>,
    store: Store,
    workers: usize,
    filter: TradeFilter,
}

impl MarketData {
    pub fn new(client: Arc<dyn ApiClient>, store: Store, workers: usize, filter: TradeFilter) -> Self {
        Self {
            client,
            store,
            workers: workers.max(1),
            filter,
        }
    }

    /// Refresh `event_live_volume` for each event
    pub async fn sync_live_volume(&self, event_ids: &[String]) -> MetricsReport {
        log::info!("📊 Live volume for {} events", event_ids.len());
        let report = self
            .fan_out(event_ids, |event_id| self.live_volume(event_id), |id| id.clone())
            .await;
        log_report("live volume", &report);
        report
    }

    /// Refresh `market_open_interest` for each market
    pub async fn sync_open_interest(&self, markets: &[MarketRef]) -> MetricsReport {
        log::info!("📊 Open interest for {} markets", markets.len());
        let report = self
            .fan_out(markets, |market| self.open_interest(market), |m| m.market_id.clone())
            .await;
        log_report("open interest", &report);
        report
    }

    /// Append significant trades for each market to `transactions`
    pub async fn sync_transactions(&self, markets: &[MarketRef]) -> MetricsReport {
        log::info!(
            "💸 Transactions for {} markets (>= ${:.0}, whale >= ${:.0})",
            markets.len(),
            self.filter.min_transaction_size,
            self.filter.min_whale_trade
        );
        let report = self
            .fan_out(markets, |market| self.transactions(market), |m| m.market_id.clone())
            .await;
        log_report("transactions", &report);
        report
    }

    async fn fan_out<'a, T, F, Fut, L>(&'a self, targets: &'a [T], run: F, label: L) -> MetricsReport
    where
        T: Sync,
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<usize, ScanError>> + 'a,
        L: Fn(&T) -> String,
    {
        let results: Vec<(&T, Result<usize, ScanError>)> = stream::iter(targets.iter())
            .map(|target| {
                let fut = run(target);
                async move { (target, fut.await) }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut report = MetricsReport {
            targets: targets.len(),
            ..MetricsReport::default()
        };
        for (target, result) in results {
            match result {
                Ok(rows) => report.rows += rows,
                Err(e) => report.errors.push(format!("{}: {}", label(target), e)),
            }
        }
        report
    }

    async fn live_volume(&self, event_id: &String) -> Result<usize, ScanError> {
        let response = self
            .client
            .get_json(Api::Data, "/live-volume", &query([("id", event_id.as_str())]))
            .await?;

        let Some(entry) = first_entry(&response) else {
            return Ok(0);
        };
        let markets = entry
            .get("markets")
            .map(|m| SqlValue::Text(m.to_string()))
            .unwrap_or(SqlValue::Null);

        let row = row_from([
            ("event_id", SqlValue::Text(event_id.clone())),
            ("total", real_or_null(json_f64(entry, "total"))),
            ("markets", markets),
            ("fetched_at", SqlValue::Integer(chrono::Utc::now().timestamp())),
        ]);
        self.store.upsert("event_live_volume", &["event_id"], &row)?;
        Ok(1)
    }

    async fn open_interest(&self, market: &MarketRef) -> Result<usize, ScanError> {
        let response = self
            .client
            .get_json(Api::Data, "/oi", &query([("market", market.condition_id.as_str())]))
            .await?;

        let Some(entry) = first_entry(&response) else {
            return Ok(0);
        };

        let row = row_from([
            ("market_id", SqlValue::Text(market.market_id.clone())),
            ("condition_id", SqlValue::Text(market.condition_id.clone())),
            ("value", real_or_null(json_f64(entry, "value"))),
            ("fetched_at", SqlValue::Integer(chrono::Utc::now().timestamp())),
        ]);
        self.store.upsert("market_open_interest", &["market_id"], &row)?;
        Ok(1)
    }

    async fn transactions(&self, market: &MarketRef) -> Result<usize, ScanError> {
        let mut q: Query = TRANSACTIONS
            .query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        q.extend(query([
            ("market", market.condition_id.clone()),
            ("limit", TRADES_PER_MARKET.to_string()),
        ]));

        let records = self.client.get_list(TRANSACTIONS.api, TRANSACTIONS.endpoint, &q).await?;
        let rows = self.significant_trades(&records, market);
        self.store.bulk_insert_if_absent(TRANSACTIONS.table, &rows)
    }

    fn significant_trades(&self, records: &[Value], market: &MarketRef) -> Vec<Row> {
        TRANSACTIONS
            .to_rows(records)
            .into_iter()
            .filter_map(|mut row| {
                let size = notional(&row);
                if size < self.filter.min_transaction_size {
                    return None;
                }
                row.insert("market_id".to_string(), SqlValue::Text(market.market_id.clone()));
                if matches!(row.get("condition_id"), None | Some(SqlValue::Null)) {
                    row.insert(
                        "condition_id".to_string(),
                        SqlValue::Text(market.condition_id.clone()),
                    );
                }
                row.insert("usdc_size".to_string(), SqlValue::Real(size));
                row.insert(
                    "is_whale".to_string(),
                    SqlValue::Integer((size >= self.filter.min_whale_trade) as i64),
                );
                Some(row)
            })
            .collect()
    }
}

/// Responses come as `[{...}]` or a bare object
fn first_entry(response: &Value) -> Option<&Value> {
    match response {
        Value::Array(items) => items.first(),
        Value::Object(_) => Some(response),
        _ => None,
    }
}

fn real_or_null(value: Option<f64>) -> SqlValue {
    value.map(SqlValue::Real).unwrap_or(SqlValue::Null)
}

fn log_report(name: &str, report: &MetricsReport) {
    log::info!(
        "   └─ {}: {} rows from {} targets, {} errors",
        name,
        report.rows,
        report.targets,
        report.errors.len()
    );
    for err in &report.errors {
        log::warn!("⚠️  {}: {}", name, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{create_test_store, param, ScriptedClient};
    use serde_json::json;

    fn market(id: &str, condition: &str) -> MarketRef {
        MarketRef {
            market_id: id.to_string(),
            condition_id: condition.to_string(),
        }
    }

    #[tokio::test]
    async fn test_transactions_filtered_and_flagged() {
        let (_tmp, store) = create_test_store();
        let client = Arc::new(ScriptedClient::new().route(Api::Data, "/trades", |_| {
            Ok(json!([
                {"transactionHash": "0x1", "size": 100, "price": 0.5},
                {"transactionHash": "0x2", "size": 2000, "price": 0.5},
                {"transactionHash": "0x3", "usdcSize": 25000.0, "proxyWallet": "0xw"},
                {"size": 90000, "price": 0.9}
            ]))
        }));
        let data = MarketData::new(client.clone(), store.clone(), 2, TradeFilter::default());

        let report = data.sync_transactions(&[market("m1", "0xc1")]).await;

        assert_eq!(report.rows, 2);
        assert!(report.errors.is_empty());
        assert_eq!(param(&client.calls_to("/trades")[0], "market"), Some("0xc1"));

        let flagged = store
            .query_strings(
                "SELECT transaction_hash || ':' || is_whale || ':' || market_id FROM transactions ORDER BY transaction_hash",
                &[],
            )
            .unwrap();
        assert_eq!(flagged, vec!["0x2:0:m1".to_string(), "0x3:1:m1".to_string()]);

        // Same trades again: nothing new appended
        let again = data.sync_transactions(&[market("m1", "0xc1")]).await;
        assert_eq!(again.rows, 0);
        assert_eq!(store.count("transactions").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_live_volume_and_open_interest_refresh() {
        let (_tmp, store) = create_test_store();
        let client = Arc::new(
            ScriptedClient::new()
                .route(Api::Data, "/live-volume", |q| match param(q, "id") {
                    Some("e1") => Ok(json!([{"total": 1234.5, "markets": [{"market": "0xc1", "value": 1234.5}]}])),
                    _ => Ok(json!([])),
                })
                .route(Api::Data, "/oi", |_| Ok(json!([{"market": "0xc1", "value": "88.5"}]))),
        );
        let data = MarketData::new(client, store.clone(), 4, TradeFilter::default());

        let volume = data
            .sync_live_volume(&["e1".to_string(), "e2".to_string()])
            .await;
        assert_eq!(volume.rows, 1);
        assert_eq!(volume.targets, 2);

        let oi = data.sync_open_interest(&[market("m1", "0xc1")]).await;
        assert_eq!(oi.rows, 1);
        let oi = data.sync_open_interest(&[market("m1", "0xc1")]).await;
        assert_eq!(oi.rows, 1);

        assert_eq!(store.count("event_live_volume").unwrap(), 1);
        assert_eq!(store.count("market_open_interest").unwrap(), 1);
        assert_eq!(
            store
                .query_strings("SELECT CAST(value AS TEXT) FROM market_open_interest", &[])
                .unwrap(),
            vec!["88.5".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_market_reported() {
        let (_tmp, store) = create_test_store();
        let data = MarketData::new(
            Arc::new(ScriptedClient::new()),
            store,
            1,
            TradeFilter::default(),
        );

        let report = data.sync_open_interest(&[market("m1", "0xc1")]).await;

        assert_eq!(report.rows, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("m1"));
    }
}
