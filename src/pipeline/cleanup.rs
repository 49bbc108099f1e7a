//! Consistency cleanup: remove closed or inactive entities and their dependents
//!
//! Order inside the transaction is child before parent:
//! reactions -> comments -> market joins/metrics -> markets ->
//! event joins/metrics -> events, then series and collections.
//! Storage is reclaimed with VACUUM afterwards, outside the transaction.

use super::associations::{remove_member, EVENT_TAGS, SERIES_EVENTS};
use super::db::Store;
use super::error::ScanError;
use rusqlite::{Transaction, TransactionBehavior};

/// Rows removed by one cleanup pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub events: usize,
    pub markets: usize,
    pub series: usize,
    pub collections: usize,
    pub comments: usize,
    pub reactions: usize,
    /// Join rows deleted plus denormalized owner rows rewritten or dropped
    pub associations: usize,
    /// Holders, live volume and open-interest rows
    pub metrics: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.events
            + self.markets
            + self.series
            + self.collections
            + self.comments
            + self.reactions
            + self.associations
            + self.metrics
    }
}

const TERMINAL: &str = "closed = 1 OR active = 0";

/// Delete every terminal entity and everything reachable only through it
///
/// Idempotent: a second pass with no new data removes nothing.
pub fn cleanup_closed(store: &Store) -> Result<CleanupReport, ScanError> {
    let report = store.with_connection(|conn| {
        // Take the write lock before reading which rows are stale
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = sweep(&tx)?;
        tx.commit()?;
        Ok(report)
    })?;

    if report.total() > 0 {
        log::info!("🧹 Cleanup removed {} rows", report.total());
        log::info!("   ├─ events: {}, markets: {}", report.events, report.markets);
        log::info!("   ├─ series: {}, collections: {}", report.series, report.collections);
        log::info!("   ├─ comments: {}, reactions: {}", report.comments, report.reactions);
        log::info!("   └─ associations: {}, metrics: {}", report.associations, report.metrics);
        store.vacuum()?;
    } else {
        log::debug!("🧹 Cleanup: nothing to remove");
    }

    Ok(report)
}

fn sweep(tx: &Transaction<'_>) -> Result<CleanupReport, ScanError> {
    let mut report = CleanupReport::default();

    tx.execute_batch(&format!(
        "CREATE TEMP TABLE IF NOT EXISTS stale_events (id TEXT PRIMARY KEY);
         CREATE TEMP TABLE IF NOT EXISTS stale_markets (id TEXT PRIMARY KEY);
         CREATE TEMP TABLE IF NOT EXISTS stale_comments (id TEXT PRIMARY KEY);
         DELETE FROM stale_events;
         DELETE FROM stale_markets;
         DELETE FROM stale_comments;
         INSERT INTO stale_events SELECT id FROM events WHERE {terminal};
         INSERT OR IGNORE INTO stale_markets
             SELECT id FROM markets
             WHERE event_id IN (SELECT id FROM stale_events) OR {terminal};
         INSERT OR IGNORE INTO stale_comments
             SELECT id FROM comments
             WHERE event_id IN (SELECT id FROM stale_events)
                OR market_id IN (SELECT id FROM stale_markets);",
        terminal = TERMINAL
    ))?;

    report.reactions = tx.execute(
        "DELETE FROM comment_reactions WHERE comment_id IN (SELECT id FROM stale_comments)",
        [],
    )?;
    report.comments = tx.execute(
        "DELETE FROM comments WHERE id IN (SELECT id FROM stale_comments)",
        [],
    )?;

    report.associations += tx.execute(
        "DELETE FROM market_tags WHERE market_id IN (SELECT id FROM stale_markets)",
        [],
    )?;
    report.metrics += tx.execute(
        "DELETE FROM market_holders WHERE market_id IN (SELECT id FROM stale_markets)",
        [],
    )?;
    report.metrics += tx.execute(
        "DELETE FROM market_open_interest WHERE market_id IN (SELECT id FROM stale_markets)",
        [],
    )?;
    report.markets = tx.execute(
        "DELETE FROM markets WHERE id IN (SELECT id FROM stale_markets)",
        [],
    )?;

    report.metrics += tx.execute(
        "DELETE FROM event_live_volume WHERE event_id IN (SELECT id FROM stale_events)",
        [],
    )?;

    let stale_events: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM stale_events")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };
    for event_id in &stale_events {
        report.associations += remove_member(tx, EVENT_TAGS, event_id)?;
        report.associations += remove_member(tx, SERIES_EVENTS, event_id)?;
    }

    report.events = tx.execute(
        "DELETE FROM events WHERE id IN (SELECT id FROM stale_events)",
        [],
    )?;

    // Series and collections own only join rows
    report.associations += tx.execute(
        &format!(
            "DELETE FROM series_events WHERE series_id IN (SELECT id FROM series WHERE {})",
            TERMINAL
        ),
        [],
    )?;
    report.associations += tx.execute(
        &format!(
            "DELETE FROM series_tags WHERE series_id IN (SELECT id FROM series WHERE {})",
            TERMINAL
        ),
        [],
    )?;
    report.associations += tx.execute(
        &format!(
            "DELETE FROM series_collections
             WHERE series_id IN (SELECT id FROM series WHERE {terminal})
                OR collection_id IN (SELECT id FROM collections WHERE {terminal})",
            terminal = TERMINAL
        ),
        [],
    )?;
    report.associations += tx.execute(
        &format!(
            "DELETE FROM collection_tags WHERE collection_id IN (SELECT id FROM collections WHERE {})",
            TERMINAL
        ),
        [],
    )?;
    report.series = tx.execute(&format!("DELETE FROM series WHERE {}", TERMINAL), [])?;
    report.collections = tx.execute(&format!("DELETE FROM collections WHERE {}", TERMINAL), [])?;

    tx.execute_batch(
        "DROP TABLE IF EXISTS temp.stale_events;
         DROP TABLE IF EXISTS temp.stale_markets;
         DROP TABLE IF EXISTS temp.stale_comments;",
    )?;

    Ok(report)
}
