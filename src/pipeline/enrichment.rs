//! Per-whale enrichment
//!
//! Each qualifying wallet gets four independent sub-fetches dispatched at once:
//! trade history, activity log, current positions and closed positions.
//! Each result is stored as soon as it arrives. One sub-fetch failing leaves
//! the other three in place; the gap is filled on the next scheduled scan.

use super::client::{json_string, query, Api, ApiClient, Query};
use super::db::{Row, Store};
use super::descriptor::{
    EntityDescriptor, CLOSED_POSITIONS, CURRENT_POSITIONS, USER_ACTIVITY, USER_TRADES,
};
use super::error::ScanError;
use futures::stream::{self, StreamExt};
use rusqlite::params;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Page sizes and significance floors for enrichment
#[derive(Debug, Clone)]
pub struct EnrichmentLimits {
    pub trades_limit: usize,
    pub activity_limit: usize,
    pub positions_limit: usize,
    pub closed_limit: usize,
    /// Activity below this notional is not stored
    pub min_transaction_size: f64,
    /// Closed positions with less bought than this are not stored
    pub min_position_value: f64,
}

impl Default for EnrichmentLimits {
    fn default() -> Self {
        Self {
            trades_limit: 100,
            activity_limit: 100,
            positions_limit: 100,
            closed_limit: 50,
            min_transaction_size: 500.0,
            min_position_value: 500.0,
        }
    }
}

/// Outcome of the four sub-fetches for one wallet
#[derive(Debug)]
pub struct ParticipantEnrichment {
    pub wallet: String,
    pub trades: Result<usize, ScanError>,
    pub activity: Result<usize, ScanError>,
    pub positions: Result<usize, ScanError>,
    pub closed_positions: Result<usize, ScanError>,
}

impl ParticipantEnrichment {
    fn parts(&self) -> [(&'static str, &Result<usize, ScanError>); 4] {
        [
            ("trades", &self.trades),
            ("activity", &self.activity),
            ("positions", &self.positions),
            ("closed positions", &self.closed_positions),
        ]
    }

    /// Rows written across all sub-fetches that succeeded
    pub fn rows(&self) -> usize {
        self.parts()
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .sum()
    }

    /// "wallet trades: error" for every failed sub-fetch
    pub fn errors(&self) -> Vec<String> {
        self.parts()
            .iter()
            .filter_map(|(name, r)| {
                r.as_ref()
                    .err()
                    .map(|e| format!("{} {}: {}", self.wallet, name, e))
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.parts().iter().all(|(_, r)| r.is_ok())
    }
}

/// Aggregate over every enriched wallet
#[derive(Debug, Default)]
pub struct EnrichmentReport {
    pub participants: usize,
    pub complete: usize,
    pub rows: usize,
    pub errors: Vec<String>,
}

impl EnrichmentReport {
    fn absorb(&mut self, result: ParticipantEnrichment) {
        self.participants += 1;
        if result.is_complete() {
            self.complete += 1;
        }
        self.rows += result.rows();
        self.errors.extend(result.errors());
    }
}

/// Fans out sub-fetches per wallet on a bounded pool
pub struct Enricher {
    client: Arc<dyn ApiClient>,
    store: Store,
    workers: usize,
    limits: EnrichmentLimits,
}

impl Enricher {
    pub fn new(client: Arc<dyn ApiClient>, store: Store, workers: usize, limits: EnrichmentLimits) -> Self {
        Self {
            client,
            store,
            workers: workers.max(1),
            limits,
        }
    }

    /// Enrich every wallet, at most `workers` at a time
    pub async fn enrich_all(&self, wallets: &BTreeSet<String>) -> EnrichmentReport {
        log::info!("🔍 Enriching {} participants ({} workers)", wallets.len(), self.workers);

        let report = stream::iter(wallets.iter())
            .map(|wallet| self.enrich(wallet))
            .buffer_unordered(self.workers)
            .fold(EnrichmentReport::default(), |mut report, result| async move {
                for err in result.errors() {
                    log::warn!("⚠️  Enrichment: {}", err);
                }
                report.absorb(result);
                report
            })
            .await;

        log::info!(
            "   └─ {} participants ({} complete), {} rows, {} errors",
            report.participants,
            report.complete,
            report.rows,
            report.errors.len()
        );

        report
    }

    /// Run the four sub-fetches for one wallet concurrently
    pub async fn enrich(&self, wallet: &str) -> ParticipantEnrichment {
        let (trades, activity, positions, closed_positions) = tokio::join!(
            self.sync_trades(wallet),
            self.sync_activity(wallet),
            self.sync_positions(wallet),
            self.sync_closed_positions(wallet),
        );

        ParticipantEnrichment {
            wallet: wallet.to_string(),
            trades,
            activity,
            positions,
            closed_positions,
        }
    }

    async fn fetch(
        &self,
        descriptor: &EntityDescriptor,
        wallet: &str,
        limit: usize,
    ) -> Result<Vec<Value>, ScanError> {
        let mut q: Query = descriptor
            .query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        q.extend(query([("user", wallet.to_string()), ("limit", limit.to_string())]));

        self.client.get_list(Api::Data, descriptor.endpoint, &q).await
    }

    async fn sync_trades(&self, wallet: &str) -> Result<usize, ScanError> {
        let records = self.fetch(&USER_TRADES, wallet, self.limits.trades_limit).await?;
        let rows = wallet_rows(&USER_TRADES, &records, wallet);
        self.store.bulk_insert_if_absent(USER_TRADES.table, &rows)
    }

    async fn sync_activity(&self, wallet: &str) -> Result<usize, ScanError> {
        let records = self
            .fetch(&USER_ACTIVITY, wallet, self.limits.activity_limit)
            .await?;
        let rows: Vec<Row> = wallet_rows(&USER_ACTIVITY, &records, wallet)
            .into_iter()
            .filter(|row| notional(row) >= self.limits.min_transaction_size)
            .collect();
        self.store.bulk_insert_if_absent(USER_ACTIVITY.table, &rows)
    }

    async fn sync_positions(&self, wallet: &str) -> Result<usize, ScanError> {
        let records = self
            .fetch(&CURRENT_POSITIONS, wallet, self.limits.positions_limit)
            .await?;
        let rows = wallet_rows(&CURRENT_POSITIONS, &records, wallet);
        let written = self
            .store
            .bulk_upsert(CURRENT_POSITIONS.table, CURRENT_POSITIONS.key_columns, &rows)?;

        if rows.is_empty() {
            return Ok(0);
        }

        let portfolio: f64 = rows.iter().filter_map(|r| real(r, "current_value")).sum();
        self.store.with_connection(|conn| {
            conn.execute(
                "UPDATE users SET total_value = ?1, last_updated = ?2 WHERE proxy_wallet = ?3",
                params![portfolio, chrono::Utc::now().timestamp(), wallet],
            )?;
            Ok(())
        })?;

        Ok(written)
    }

    async fn sync_closed_positions(&self, wallet: &str) -> Result<usize, ScanError> {
        let records = self
            .fetch(&CLOSED_POSITIONS, wallet, self.limits.closed_limit)
            .await?;

        let rows: Vec<Row> = records
            .iter()
            .map(|record| {
                let mut row = CLOSED_POSITIONS.to_row(record);
                if matches!(row.get("closed_at"), None | Some(SqlValue::Null)) {
                    // Stable fallback so re-fetches dedupe instead of appending
                    let closed_at = json_string(record, "endDate")
                        .unwrap_or_else(|| "unknown".to_string());
                    row.insert("closed_at".to_string(), SqlValue::Text(closed_at));
                }
                row
            })
            .collect();

        let rows: Vec<Row> = with_wallet(rows, wallet)
            .into_iter()
            .filter(|row| CLOSED_POSITIONS.is_keyed(row))
            .filter(|row| real(row, "total_bought").unwrap_or(0.0) >= self.limits.min_position_value)
            .collect();

        self.store.bulk_insert_if_absent(CLOSED_POSITIONS.table, &rows)
    }
}

/// Map records for `wallet`'s tables, keeping only fully keyed rows
fn wallet_rows(descriptor: &EntityDescriptor, records: &[Value], wallet: &str) -> Vec<Row> {
    let rows = records.iter().map(|r| descriptor.to_row(r)).collect();
    with_wallet(rows, wallet)
        .into_iter()
        .filter(|row| descriptor.is_keyed(row))
        .collect()
}

/// Fill `proxy_wallet` where the API left it out
fn with_wallet(rows: Vec<Row>, wallet: &str) -> Vec<Row> {
    rows.into_iter()
        .map(|mut row| {
            if matches!(row.get("proxy_wallet"), None | Some(SqlValue::Null)) {
                row.insert("proxy_wallet".to_string(), SqlValue::Text(wallet.to_string()));
            }
            row
        })
        .collect()
}

fn real(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        SqlValue::Real(v) => Some(*v),
        SqlValue::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

/// USDC notional of an activity or trade row: `usdc_size`, else size x price
pub fn notional(row: &Row) -> f64 {
    real(row, "usdc_size")
        .filter(|v| *v > 0.0)
        .unwrap_or_else(|| real(row, "size").unwrap_or(0.0) * real(row, "price").unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{create_test_store, ScriptedClient};
    use serde_json::json;

    fn healthy_client() -> ScriptedClient {
        ScriptedClient::new()
            .route(Api::Data, "/trades", |_| {
                Ok(json!([
                    {"transactionHash": "0xt1", "size": 10, "price": 0.5},
                    {"transactionHash": "0xt2", "size": 20, "price": 0.4}
                ]))
            })
            .route(Api::Data, "/activity", |_| {
                Ok(json!([
                    {"transactionHash": "0xa1", "usdcSize": 750.0},
                    {"transactionHash": "0xa2", "usdcSize": 20.0},
                    {"transactionHash": "0xa3", "size": 2000, "price": 0.5}
                ]))
            })
            .route(Api::Data, "/positions", |_| {
                Ok(json!([
                    {"asset": "tok1", "currentValue": 300.0, "cashPnl": 12.0},
                    {"asset": "tok2", "currentValue": 200.0}
                ]))
            })
            .route(Api::Data, "/closed-positions", |_| {
                Ok(json!([
                    {"asset": "tok3", "timestamp": 1700000000, "totalBought": 900.0},
                    {"asset": "tok4", "timestamp": 1700000001, "totalBought": 50.0},
                    {"asset": "tok5", "endDate": "2024-11-05", "totalBought": 5000.0}
                ]))
            })
    }

    fn enricher(client: ScriptedClient, store: Store) -> Enricher {
        Enricher::new(Arc::new(client), store, 4, EnrichmentLimits::default())
    }

    #[tokio::test]
    async fn test_enrich_persists_all_four_and_filters() {
        let (_tmp, store) = create_test_store();
        let result = enricher(healthy_client(), store.clone()).enrich("0xwhale").await;

        assert!(result.is_complete());
        assert_eq!(*result.trades.as_ref().unwrap(), 2);
        // 0xa2 is below the notional floor; 0xa3 qualifies via size x price
        assert_eq!(*result.activity.as_ref().unwrap(), 2);
        assert_eq!(*result.positions.as_ref().unwrap(), 2);
        // tok4 bought too little
        assert_eq!(*result.closed_positions.as_ref().unwrap(), 2);
        assert_eq!(result.rows(), 8);

        let wallets = store
            .query_strings("SELECT DISTINCT proxy_wallet FROM user_trades", &[])
            .unwrap();
        assert_eq!(wallets, vec!["0xwhale".to_string()]);

        let closed_at = store
            .query_strings(
                "SELECT closed_at FROM user_positions_closed WHERE asset = 'tok5'",
                &[],
            )
            .unwrap();
        assert_eq!(closed_at, vec!["2024-11-05".to_string()]);
    }

    #[tokio::test]
    async fn test_enrichment_is_idempotent() {
        let (_tmp, store) = create_test_store();
        let enricher = enricher(healthy_client(), store.clone());

        enricher.enrich("0xwhale").await;
        let second = enricher.enrich("0xwhale").await;

        // Append-only tables report nothing new; positions refresh in place
        assert_eq!(*second.trades.as_ref().unwrap(), 0);
        assert_eq!(*second.closed_positions.as_ref().unwrap(), 0);
        assert_eq!(store.count("user_trades").unwrap(), 2);
        assert_eq!(store.count("user_positions_current").unwrap(), 2);
        assert_eq!(store.count("user_positions_closed").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_activity_failure_is_partial() {
        let (_tmp, store) = create_test_store();
        let client = healthy_client().route(Api::Data, "/activity", |_| {
            Err(ScanError::Status {
                url: "/activity".to_string(),
                status: 502,
            })
        });
        let enricher = enricher(client, store.clone());

        let wallets: BTreeSet<String> = ["0xwhale".to_string()].into_iter().collect();
        let report = enricher.enrich_all(&wallets).await;

        assert_eq!(report.participants, 1);
        assert_eq!(report.complete, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("activity"));

        assert_eq!(store.count("user_trades").unwrap(), 2);
        assert_eq!(store.count("user_positions_current").unwrap(), 2);
        assert_eq!(store.count("user_activity").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_positions_refresh_user_total_value() {
        let (_tmp, store) = create_test_store();
        store
            .upsert(
                "users",
                &["proxy_wallet"],
                &crate::pipeline::db::row_from([
                    ("proxy_wallet", SqlValue::Text("0xwhale".to_string())),
                    ("is_whale", SqlValue::Integer(1)),
                ]),
            )
            .unwrap();

        enricher(healthy_client(), store.clone()).enrich("0xwhale").await;

        let total: f64 = store
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT total_value FROM users WHERE proxy_wallet = '0xwhale'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(total, 500.0);
    }

    #[test]
    fn test_notional_fallback() {
        let row = crate::pipeline::db::row_from([
            ("usdc_size", SqlValue::Null),
            ("size", SqlValue::Real(100.0)),
            ("price", SqlValue::Real(0.25)),
        ]);
        assert_eq!(notional(&row), 25.0);
    }
}
