//! Comments on active events, with their reactions
//!
//! Comments are fetched per event (newest first, one page) and upserted so
//! edited bodies and reaction counts refresh. Reactions are fetched for each
//! comment that reports any and are stored once per (comment, wallet, type).

use super::client::{query, ApiClient, Query};
use super::db::{Row, Store};
use super::descriptor::{COMMENTS, COMMENT_REACTIONS};
use super::error::ScanError;
use futures::stream::{self, StreamExt};
use rusqlite::types::Value as SqlValue;
use std::sync::Arc;

/// Comments requested per event
pub const COMMENTS_PER_EVENT: usize = 15;

/// Events inspected per run, busiest first
pub const MAX_COMMENT_EVENTS: usize = 100;

#[derive(Debug, Default)]
pub struct CommentReport {
    pub events: usize,
    pub comments: usize,
    pub reactions: usize,
    pub errors: Vec<String>,
}

/// Ids of open events, highest volume first
pub fn active_events(store: &Store, limit: Option<usize>) -> Result<Vec<String>, ScanError> {
    let mut sql = String::from(
        "SELECT id FROM events
         WHERE COALESCE(active, 1) = 1 AND COALESCE(closed, 0) = 0
         ORDER BY COALESCE(volume, 0) DESC",
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    store.query_strings(&sql, &[])
}

pub struct CommentSync {
    client: Arc<dyn ApiClient>,
    store: Store,
    workers: usize,
}

impl CommentSync {
    pub fn new(client: Arc<dyn ApiClient>, store: Store, workers: usize) -> Self {
        Self {
            client,
            store,
            workers: workers.max(1),
        }
    }

    /// Sync comments and reactions for every event in `event_ids`
    pub async fn sync_events(&self, event_ids: &[String]) -> CommentReport {
        log::info!("💬 Syncing comments for {} events", event_ids.len());

        let report = stream::iter(event_ids.iter())
            .map(|event_id| async move { (event_id, self.sync_event(event_id).await) })
            .buffer_unordered(self.workers)
            .fold(CommentReport::default(), |mut report, (event_id, result)| async move {
                report.events += 1;
                match result {
                    Ok((comments, reactions)) => {
                        report.comments += comments;
                        report.reactions += reactions;
                    }
                    Err(e) => {
                        log::warn!("⚠️  Comments for event {} failed: {}", event_id, e);
                        report.errors.push(format!("event {}: {}", event_id, e));
                    }
                }
                report
            })
            .await;

        log::info!(
            "   └─ {} comments, {} reactions, {} errors",
            report.comments,
            report.reactions,
            report.errors.len()
        );
        report
    }

    /// Returns (comments written, reactions written)
    ///
    /// A failed reaction fetch is logged and skipped; only the comment page
    /// itself failing fails the event.
    pub async fn sync_event(&self, event_id: &str) -> Result<(usize, usize), ScanError> {
        let mut q: Query = COMMENTS
            .query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        q.extend(query([
            ("parent_entity_type", "Event".to_string()),
            ("parent_entity_id", event_id.to_string()),
            ("limit", COMMENTS_PER_EVENT.to_string()),
            ("offset", "0".to_string()),
        ]));

        let records = self.client.get_list(COMMENTS.api, COMMENTS.endpoint, &q).await?;
        let rows: Vec<Row> = COMMENTS
            .to_rows(&records)
            .into_iter()
            .map(|row| with_owner(row, event_id))
            .collect();
        let written = self.store.bulk_upsert(COMMENTS.table, COMMENTS.key_columns, &rows)?;

        let mut reactions = 0;
        for row in rows.iter().filter(|r| has_reactions(r)) {
            let Some(SqlValue::Text(comment_id)) = row.get("id") else {
                continue;
            };
            match self.sync_reactions(comment_id).await {
                Ok(n) => reactions += n,
                Err(e) => log::warn!("⚠️  Reactions for comment {} failed: {}", comment_id, e),
            }
        }

        Ok((written, reactions))
    }

    async fn sync_reactions(&self, comment_id: &str) -> Result<usize, ScanError> {
        let path = format!("{}/{}/reactions", COMMENT_REACTIONS.endpoint, comment_id);
        let records = self.client.get_list(COMMENT_REACTIONS.api, &path, &[]).await?;

        let rows: Vec<Row> = records
            .iter()
            .map(|record| {
                let mut row = COMMENT_REACTIONS.to_row(record);
                row.insert("comment_id".to_string(), SqlValue::Text(comment_id.to_string()));
                row
            })
            .filter(|row| COMMENT_REACTIONS.is_keyed(row))
            .collect();

        self.store.bulk_insert_if_absent(COMMENT_REACTIONS.table, &rows)
    }
}

/// Attach the owning event, and the market when the comment sits on one
fn with_owner(mut row: Row, event_id: &str) -> Row {
    let on_market = matches!(
        row.get("parent_entity_type"),
        Some(SqlValue::Text(t)) if t.eq_ignore_ascii_case("market")
    );
    let market_id = match row.get("parent_entity_id") {
        Some(parent) if on_market => parent.clone(),
        _ => SqlValue::Null,
    };
    row.insert("market_id".to_string(), market_id);
    row.insert("event_id".to_string(), SqlValue::Text(event_id.to_string()));
    row
}

/// Unknown counts are fetched; an explicit zero is skipped
fn has_reactions(row: &Row) -> bool {
    !matches!(row.get("reaction_count"), Some(SqlValue::Integer(0)))
}
