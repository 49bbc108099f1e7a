//! Participant discovery: market holders -> whale set
//!
//! For every active market, fetch the top holders per outcome token, store
//! them in `market_holders`, classify each holder and collect the qualifying
//! wallets. The same wallet seen through several markets collapses to one
//! entry. Qualifying wallets are upserted into `users` with `is_whale`
//! only ever raised.

use super::classifier::{Classify, SignalBundle, WalletValueCache};
use super::client::{json_f64, json_string, query, Api, ApiClient};
use super::db::{row_from, Row, Store};
use super::error::ScanError;
use futures::stream::{self, StreamExt};
use rusqlite::params;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Market to inspect for holders
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRef {
    pub market_id: String,
    pub condition_id: String,
}

/// One holder entry from `/holders`
#[derive(Debug, Clone)]
pub struct Holder {
    pub proxy_wallet: String,
    pub token_id: String,
    pub outcome_index: Option<i64>,
    pub amount: f64,
    pub username: Option<String>,
    pub pseudonym: Option<String>,
    pub profile_image: Option<String>,
}

/// Result of one discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub whales: BTreeSet<String>,
    pub markets_scanned: usize,
    pub holders_seen: usize,
    pub errors: Vec<String>,
}

/// A wallet that passed classification, with whatever profile data we saw
#[derive(Debug, Clone)]
struct Qualified {
    holder: Holder,
    wallet_value: Option<f64>,
}

/// Active markets with a condition id, highest volume first
pub fn active_markets(store: &Store, limit: Option<usize>) -> Result<Vec<MarketRef>, ScanError> {
    let sql = format!(
        "SELECT id, condition_id FROM markets
         WHERE active = 1 AND closed = 0 AND condition_id IS NOT NULL AND condition_id != ''
         ORDER BY volume DESC{}",
        limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
    );

    store.with_connection(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let markets = stmt
            .query_map([], |row| {
                Ok(MarketRef {
                    market_id: row.get(0)?,
                    condition_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(markets)
    })
}

/// Wallets already flagged as whales by earlier runs
pub fn stored_whales(store: &Store) -> Result<BTreeSet<String>, ScanError> {
    Ok(store
        .query_strings("SELECT proxy_wallet FROM users WHERE is_whale = 1", &[])?
        .into_iter()
        .collect())
}

/// Flatten a `/holders` response (`[{token, holders: [...]}]`)
pub fn parse_holders(response: &[Value]) -> Vec<Holder> {
    let mut holders = Vec::new();

    for group in response {
        let token_id = json_string(group, "token").unwrap_or_default();
        let Some(entries) = group.get("holders").and_then(|h| h.as_array()) else {
            continue;
        };

        for entry in entries {
            let Some(proxy_wallet) = json_string(entry, "proxyWallet") else {
                continue;
            };
            holders.push(Holder {
                proxy_wallet,
                token_id: json_string(entry, "asset").unwrap_or_else(|| token_id.clone()),
                outcome_index: entry.get("outcomeIndex").and_then(|v| v.as_i64()),
                amount: json_f64(entry, "amount").unwrap_or(0.0),
                username: json_string(entry, "name"),
                pseudonym: json_string(entry, "pseudonym"),
                profile_image: json_string(entry, "profileImage"),
            });
        }
    }

    holders
}

/// Keep the `n` largest holders of each token
fn top_per_token(mut holders: Vec<Holder>, n: usize) -> Vec<Holder> {
    holders.sort_by(|a, b| {
        a.token_id
            .cmp(&b.token_id)
            .then(b.amount.partial_cmp(&a.amount).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut kept = Vec::with_capacity(holders.len());
    let mut current: Option<String> = None;
    let mut taken = 0;
    for holder in holders {
        if current.as_deref() != Some(holder.token_id.as_str()) {
            current = Some(holder.token_id.clone());
            taken = 0;
        }
        if taken < n {
            kept.push(holder);
            taken += 1;
        }
    }
    kept
}

fn text(value: &Option<String>) -> SqlValue {
    value
        .as_ref()
        .map(|s| SqlValue::Text(s.clone()))
        .unwrap_or(SqlValue::Null)
}

fn holder_row(market_id: &str, holder: &Holder, now: i64) -> Row {
    row_from([
        ("market_id", SqlValue::Text(market_id.to_string())),
        ("token_id", SqlValue::Text(holder.token_id.clone())),
        ("proxy_wallet", SqlValue::Text(holder.proxy_wallet.clone())),
        (
            "outcome_index",
            holder.outcome_index.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
        ),
        ("amount", SqlValue::Real(holder.amount)),
        ("username", text(&holder.username)),
        ("pseudonym", text(&holder.pseudonym)),
        ("fetched_at", SqlValue::Integer(now)),
    ])
}

/// Discovers whales from market holders
pub struct ParticipantClassifier {
    client: Arc<dyn ApiClient>,
    store: Store,
    classifier: Arc<dyn Classify>,
    wallet_values: Arc<WalletValueCache>,
    workers: usize,
    top_holders: usize,
}

impl ParticipantClassifier {
    pub fn new(
        client: Arc<dyn ApiClient>,
        store: Store,
        classifier: Arc<dyn Classify>,
        wallet_values: Arc<WalletValueCache>,
        workers: usize,
        top_holders: usize,
    ) -> Self {
        Self {
            client,
            store,
            classifier,
            wallet_values,
            workers: workers.max(1),
            top_holders: top_holders.max(1),
        }
    }

    /// Inspect every market and return the union of qualifying wallets
    pub async fn discover(&self, markets: &[MarketRef]) -> DiscoveryReport {
        log::info!("🐋 Scanning holders in {} markets ({} workers)", markets.len(), self.workers);

        let results: Vec<(String, Result<(usize, Vec<Qualified>), ScanError>)> =
            stream::iter(markets.iter().cloned())
                .map(|market| async move {
                    let result = self.scan_market(&market).await;
                    (market.market_id, result)
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        let mut report = DiscoveryReport::default();
        // Best profile and wallet value per wallet across all markets
        let mut qualified: BTreeMap<String, Qualified> = BTreeMap::new();

        for (market_id, result) in results {
            match result {
                Ok((seen, whales)) => {
                    report.markets_scanned += 1;
                    report.holders_seen += seen;
                    for q in whales {
                        qualified
                            .entry(q.holder.proxy_wallet.clone())
                            .and_modify(|existing| {
                                if existing.wallet_value.is_none() {
                                    existing.wallet_value = q.wallet_value;
                                }
                            })
                            .or_insert(q);
                    }
                }
                Err(e) => {
                    log::warn!("⚠️  Holders for market {} failed: {}", market_id, e);
                    report.errors.push(format!("market {}: {}", market_id, e));
                }
            }
        }

        if let Err(e) = self.record_whales(qualified.values()) {
            log::error!("❌ Failed to record whales: {}", e);
            report.errors.push(format!("users: {}", e));
        }

        report.whales = qualified.into_keys().collect();

        log::info!(
            "   └─ {} whales from {} holders ({} wallet lookups, {} errors)",
            report.whales.len(),
            report.holders_seen,
            self.wallet_values.lookups(),
            report.errors.len()
        );

        report
    }

    /// Fetch, store and classify one market's holders
    async fn scan_market(&self, market: &MarketRef) -> Result<(usize, Vec<Qualified>), ScanError> {
        let response = self
            .client
            .get_list(
                Api::Data,
                "/holders",
                &query([
                    ("market", market.condition_id.as_str()),
                    ("limit", "100"),
                    ("minBalance", "1"),
                ]),
            )
            .await?;

        let holders = top_per_token(parse_holders(&response), self.top_holders);
        let now = chrono::Utc::now().timestamp();

        let rows: Vec<Row> = holders
            .iter()
            .map(|h| holder_row(&market.market_id, h, now))
            .collect();
        self.store.bulk_upsert(
            "market_holders",
            &["market_id", "token_id", "proxy_wallet"],
            &rows,
        )?;

        let mut qualified = Vec::new();
        for holder in &holders {
            if let Some(q) = self.classify_holder(holder).await {
                qualified.push(q);
            }
        }

        Ok((holders.len(), qualified))
    }

    async fn classify_holder(&self, holder: &Holder) -> Option<Qualified> {
        // Position signal first: the wallet lookup is the expensive part
        if self.classifier.qualifies_without_wallet(holder.amount) {
            return Some(Qualified {
                holder: holder.clone(),
                wallet_value: self.wallet_values.cached(&holder.proxy_wallet),
            });
        }

        let wallet_value = self.wallet_values.wallet_value(&holder.proxy_wallet).await;
        let signals = SignalBundle {
            wallet_value,
            quantity: holder.amount,
        };

        self.classifier.classify(&signals).then(|| Qualified {
            holder: holder.clone(),
            wallet_value,
        })
    }

    fn record_whales<'a>(
        &self,
        whales: impl Iterator<Item = &'a Qualified>,
    ) -> Result<usize, ScanError> {
        upsert_users(&self.store, whales.map(|q| (q, true)))
    }
}

/// Insert or refresh users; `is_whale` only ever moves from 0 to 1
fn upsert_users<'a>(
    store: &Store,
    users: impl Iterator<Item = (&'a Qualified, bool)>,
) -> Result<usize, ScanError> {
    let now = chrono::Utc::now().timestamp();

    store.with_connection(|conn| {
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO users (proxy_wallet, username, pseudonym, profile_image, total_value, is_whale, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(proxy_wallet) DO UPDATE SET
                     username = COALESCE(excluded.username, users.username),
                     pseudonym = COALESCE(excluded.pseudonym, users.pseudonym),
                     profile_image = COALESCE(excluded.profile_image, users.profile_image),
                     total_value = COALESCE(excluded.total_value, users.total_value),
                     is_whale = MAX(users.is_whale, excluded.is_whale),
                     last_updated = excluded.last_updated",
            )?;
            for (q, is_whale) in users {
                written += stmt.execute(params![
                    q.holder.proxy_wallet,
                    q.holder.username,
                    q.holder.pseudonym,
                    q.holder.profile_image,
                    q.wallet_value,
                    is_whale as i64,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::WhaleThresholds;
    use crate::pipeline::testing::{create_test_store, param, ScriptedClient};
    use serde_json::json;
    use std::time::Duration;

    fn holders_response(token: &str, holders: &[(&str, f64)]) -> Value {
        json!([{
            "token": token,
            "holders": holders
                .iter()
                .map(|(wallet, amount)| json!({
                    "proxyWallet": wallet,
                    "amount": amount,
                    "name": format!("{}-name", wallet),
                    "outcomeIndex": 0
                }))
                .collect::<Vec<_>>()
        }])
    }

    fn insert_market(store: &Store, id: &str, condition: &str, volume: f64) {
        store
            .upsert(
                "markets",
                &["id"],
                &row_from([
                    ("id", SqlValue::Text(id.to_string())),
                    ("condition_id", SqlValue::Text(condition.to_string())),
                    ("volume", SqlValue::Real(volume)),
                    ("active", SqlValue::Integer(1)),
                    ("closed", SqlValue::Integer(0)),
                ]),
            )
            .unwrap();
    }

    fn scripted() -> Arc<ScriptedClient> {
        Arc::new(
            ScriptedClient::new()
                .route(Api::Data, "/holders", |q| match param(q, "market") {
                    // 0xbig holds 600 in both markets; 0xrich qualifies on wallet value
                    Some("c1") => Ok(holders_response("t1", &[
                        ("0xbig", 600.0),
                        ("0xrich", 5.0),
                        ("0xsmall", 10.0),
                    ])),
                    Some("c2") => Ok(holders_response("t2", &[("0xbig", 700.0), ("0xmid", 150.0)])),
                    _ => Err(ScanError::Status {
                        url: "/holders".to_string(),
                        status: 500,
                    }),
                })
                .route(Api::Data, "/value", |q| {
                    let value = match param(q, "user") {
                        Some("0xrich") => 1_500.0,
                        Some("0xmid") => 600.0,
                        _ => 100.0,
                    };
                    Ok(json!([{"value": value}]))
                }),
        )
    }

    fn classifier(client: Arc<ScriptedClient>, store: Store) -> ParticipantClassifier {
        ParticipantClassifier::new(
            client.clone(),
            store,
            Arc::new(WhaleThresholds::default()),
            Arc::new(WalletValueCache::new(client, Duration::from_millis(1))),
            4,
            25,
        )
    }

    #[test]
    fn test_parse_and_trim_holders() {
        let response = vec![json!({
            "token": "t1",
            "holders": [
                {"proxyWallet": "0xa", "amount": 1.0},
                {"proxyWallet": "0xb", "amount": 3.0},
                {"amount": 9.0},
                {"proxyWallet": "0xc", "amount": "2.0"}
            ]
        })];

        let holders = parse_holders(&response);
        assert_eq!(holders.len(), 3);

        let top = top_per_token(holders, 2);
        let wallets: Vec<&str> = top.iter().map(|h| h.proxy_wallet.as_str()).collect();
        assert_eq!(wallets, vec!["0xb", "0xc"]);
    }

    #[tokio::test]
    async fn test_discover_unions_across_markets() {
        let (_tmp, store) = create_test_store();
        insert_market(&store, "m1", "c1", 10.0);
        insert_market(&store, "m2", "c2", 20.0);
        let client = scripted();
        let participants = classifier(client.clone(), store.clone());

        let markets = active_markets(&store, None).unwrap();
        assert_eq!(markets[0].market_id, "m2");

        let report = participants.discover(&markets).await;

        let expected: BTreeSet<String> = ["0xbig", "0xmid", "0xrich"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(report.whales, expected);
        assert_eq!(report.markets_scanned, 2);
        assert_eq!(report.holders_seen, 5);
        assert!(report.errors.is_empty());

        // 0xbig qualifies on position alone and is never looked up
        let lookups: Vec<String> = client
            .calls_to("/value")
            .iter()
            .map(|q| param(q, "user").unwrap().to_string())
            .collect();
        assert!(!lookups.contains(&"0xbig".to_string()));
        assert_eq!(lookups.len(), 3);

        assert_eq!(store.count("market_holders").unwrap(), 5);
        assert_eq!(stored_whales(&store).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_failed_market_is_reported_not_fatal() {
        let (_tmp, store) = create_test_store();
        insert_market(&store, "m1", "c1", 10.0);
        insert_market(&store, "m3", "broken", 5.0);
        let participants = classifier(scripted(), store.clone());

        let report = participants
            .discover(&active_markets(&store, None).unwrap())
            .await;

        assert_eq!(report.markets_scanned, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.whales.contains("0xbig"));
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_whales() {
        let (_tmp, store) = create_test_store();
        insert_market(&store, "m1", "c1", 10.0);
        let participants = classifier(scripted(), store.clone());

        participants
            .discover(&active_markets(&store, None).unwrap())
            .await;
        participants
            .discover(&active_markets(&store, None).unwrap())
            .await;

        assert_eq!(store.count("users").unwrap(), 2);
        assert_eq!(stored_whales(&store).unwrap().len(), 2);
    }

    #[test]
    fn test_whale_flag_never_downgraded() {
        let (_tmp, store) = create_test_store();
        let seen = |amount: f64, wallet_value: Option<f64>, username: Option<&str>| Qualified {
            holder: Holder {
                proxy_wallet: "0xbig".to_string(),
                token_id: "t1".to_string(),
                outcome_index: Some(0),
                amount,
                username: username.map(str::to_string),
                pseudonym: None,
                profile_image: None,
            },
            wallet_value,
        };

        let whale = seen(600.0, Some(2_000.0), Some("big"));
        upsert_users(&store, std::iter::once((&whale, true))).unwrap();

        let shrunk = seen(1.0, Some(5.0), None);
        upsert_users(&store, std::iter::once((&shrunk, false))).unwrap();

        assert_eq!(
            store
                .query_strings(
                    "SELECT CAST(is_whale AS TEXT) || ':' || username || ':' || CAST(total_value AS TEXT) FROM users",
                    &[],
                )
                .unwrap(),
            vec!["1:big:5.0".to_string()]
        );
        let whales = stored_whales(&store).unwrap();
        assert_eq!(whales.len(), 1);
        assert!(whales.contains("0xbig"));
    }
}
