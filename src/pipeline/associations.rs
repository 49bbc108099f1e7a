//! Single-writer owner of denormalized association lists.
//!
//! Rows like `event_tags(tag_id, event_ids)` hold a JSON array of member ids
//! that must be updated read-modify-write. All such updates go through one
//! dedicated thread fed by an mpsc channel, so two merges into the same owner
//! can never interleave. Callers hold a cloneable `AssociationWriter` and may
//! await the acknowledgement of each merge.

use super::db::Store;
use super::error::ScanError;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

/// Largest number of queued messages applied in one transaction
const MAX_BATCH: usize = 100;

/// A denormalized association table: one row per owner, members as JSON text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationSpec {
    pub table: &'static str,
    pub owner_column: &'static str,
    pub list_column: &'static str,
}

/// Tag -> events carrying that tag
pub const EVENT_TAGS: AssociationSpec = AssociationSpec {
    table: "event_tags",
    owner_column: "tag_id",
    list_column: "event_ids",
};

/// Series -> events in that series
pub const SERIES_EVENTS: AssociationSpec = AssociationSpec {
    table: "series_events",
    owner_column: "series_id",
    list_column: "event_ids",
};

type MergeReply = oneshot::Sender<Result<bool, ScanError>>;

/// Messages sent to the association writer thread.
enum AssociationMessage {
    Merge {
        spec: AssociationSpec,
        owner: String,
        member: String,
        reply: Option<MergeReply>,
    },
    /// Acknowledged once every earlier message has been committed, with any
    /// detached merge failures since the previous flush
    Flush(oneshot::Sender<Result<(), ScanError>>),
    Shutdown,
}

/// Channel handle for the association writer (cheap to clone)
#[derive(Clone)]
pub struct AssociationWriter {
    tx: Sender<AssociationMessage>,
}

impl AssociationWriter {
    /// Spawn the writer thread for `store`
    pub fn spawn(store: Store) -> Result<(Self, JoinHandle<()>), ScanError> {
        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("association-writer".to_string())
            .spawn(move || association_writer_loop(rx, &store))?;

        Ok((Self { tx }, handle))
    }

    /// Merge `member` into `owner`'s list and wait for the commit
    ///
    /// Returns true when the member was new.
    pub async fn merge(
        &self,
        spec: AssociationSpec,
        owner: &str,
        member: &str,
    ) -> Result<bool, ScanError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AssociationMessage::Merge {
                spec,
                owner: owner.to_string(),
                member: member.to_string(),
                reply: Some(reply_tx),
            })
            .map_err(|_| ScanError::Actor("writer thread stopped".to_string()))?;

        reply_rx
            .await
            .map_err(|_| ScanError::Actor("writer dropped reply".to_string()))?
    }

    /// Queue a merge without waiting for it
    pub fn merge_detached(&self, spec: AssociationSpec, owner: &str, member: &str) {
        let msg = AssociationMessage::Merge {
            spec,
            owner: owner.to_string(),
            member: member.to_string(),
            reply: None,
        };
        if self.tx.send(msg).is_err() {
            log::warn!("⚠️  Association writer stopped, dropping {}:{}", spec.table, owner);
        }
    }

    /// Wait until every queued merge has been committed
    ///
    /// Fails when a detached merge queued since the last flush did not land.
    pub async fn flush(&self) -> Result<(), ScanError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(AssociationMessage::Flush(done_tx))
            .map_err(|_| ScanError::Actor("writer thread stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| ScanError::Actor("writer dropped flush".to_string()))?
    }

    /// Request graceful shutdown after pending merges
    pub fn shutdown(&self) {
        let _ = self.tx.send(AssociationMessage::Shutdown);
    }
}

/// Main loop running on the dedicated thread
fn association_writer_loop(rx: Receiver<AssociationMessage>, store: &Store) {
    log::info!("🔗 Association writer started");

    let mut batch: Vec<AssociationMessage> = Vec::with_capacity(MAX_BATCH);
    let mut failures: Vec<String> = Vec::new();

    // Block for the first message, then drain whatever else is queued
    while let Ok(first) = rx.recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        let shutdown = batch
            .iter()
            .any(|m| matches!(m, AssociationMessage::Shutdown));

        apply_batch(store, &mut batch, &mut failures);

        if shutdown {
            break;
        }
    }

    log::info!("🔗 Association writer exiting");
}

/// Report for the detached merges that failed since the last flush
fn failure_report(failures: &mut Vec<String>) -> Result<(), ScanError> {
    if failures.is_empty() {
        return Ok(());
    }
    let shown: Vec<&str> = failures.iter().take(3).map(String::as_str).collect();
    let mut msg = format!("{} merges failed: {}", failures.len(), shown.join("; "));
    if failures.len() > shown.len() {
        msg.push_str(&format!(" (+{} more)", failures.len() - shown.len()));
    }
    failures.clear();
    Err(ScanError::Actor(msg))
}

/// Apply a batch of merges in one transaction, then answer the callers
///
/// The transaction takes the write lock up front, so the read-modify-write
/// of each list never races a commit from another connection.
fn apply_batch(store: &Store, batch: &mut Vec<AssociationMessage>, failures: &mut Vec<String>) {
    let mut replies: Vec<(MergeReply, Result<bool, ScanError>)> = Vec::new();
    let mut detached: Vec<String> = Vec::new();
    let mut flushes: Vec<oneshot::Sender<Result<(), ScanError>>> = Vec::new();
    let mut merged = 0usize;

    let mut conn = match store.connect() {
        Ok(c) => Some(c),
        Err(e) => {
            log::error!("❌ Association writer could not open database: {}", e);
            None
        }
    };

    let tx = conn.as_mut().and_then(|c| {
        match c.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(t) => Some(t),
            Err(e) => {
                log::error!("❌ Failed to start association transaction: {}", e);
                None
            }
        }
    });

    for msg in batch.drain(..) {
        match msg {
            AssociationMessage::Merge {
                spec,
                owner,
                member,
                reply,
            } => {
                let result = match &tx {
                    Some(tx) => merge_member(tx, spec, &owner, &member),
                    None => Err(ScanError::Actor("no database connection".to_string())),
                };
                if let Ok(true) = result {
                    merged += 1;
                }
                if let Err(e) = &result {
                    log::warn!("⚠️  Merge {} {} <- {} failed: {}", spec.table, owner, member, e);
                }
                match reply {
                    Some(reply) => replies.push((reply, result)),
                    None => {
                        let label = format!("{} {} <- {}", spec.table, owner, member);
                        match result {
                            Ok(_) => detached.push(label),
                            Err(e) => failures.push(format!("{}: {}", label, e)),
                        }
                    }
                }
            }
            AssociationMessage::Flush(done) => flushes.push(done),
            AssociationMessage::Shutdown => {}
        }
    }

    if let Some(tx) = tx {
        if let Err(e) = tx.commit() {
            log::error!("❌ Failed to commit association batch: {}", e);
            let msg = e.to_string();
            for (_, result) in replies.iter_mut() {
                if result.is_ok() {
                    *result = Err(ScanError::Actor(format!("commit failed: {}", msg)));
                }
            }
            failures.extend(
                detached
                    .into_iter()
                    .map(|label| format!("{}: commit failed: {}", label, msg)),
            );
        } else if merged > 0 {
            log::debug!("🔗 Committed {} association merges", merged);
        }
    }

    for (reply, result) in replies {
        let _ = reply.send(result);
    }
    for done in flushes {
        let _ = done.send(failure_report(failures));
    }
}

/// Read-modify-write one owner's member list; true when `member` was appended
fn merge_member(
    conn: &Connection,
    spec: AssociationSpec,
    owner: &str,
    member: &str,
) -> Result<bool, ScanError> {
    let mut members = read_members(conn, spec, owner)?;

    if members.iter().any(|m| m == member) {
        return Ok(false);
    }
    members.push(member.to_string());

    let encoded = serde_json::to_string(&members)?;
    let sql = format!(
        "INSERT INTO {table} ({owner_col}, {list_col}, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT({owner_col}) DO UPDATE SET
             {list_col} = excluded.{list_col},
             updated_at = excluded.updated_at",
        table = spec.table,
        owner_col = spec.owner_column,
        list_col = spec.list_column,
    );
    conn.execute(&sql, params![owner, encoded, chrono::Utc::now().timestamp()])?;

    Ok(true)
}

fn read_members(
    conn: &Connection,
    spec: AssociationSpec,
    owner: &str,
) -> Result<Vec<String>, ScanError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        spec.list_column, spec.table, spec.owner_column
    );
    let encoded: Option<String> = conn
        .query_row(&sql, params![owner], |row| row.get(0))
        .optional()?;

    match encoded {
        Some(text) if !text.trim().is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(Vec::new()),
    }
}

/// Current member list for `owner` (empty when the owner has no row)
pub fn member_list(
    store: &Store,
    spec: AssociationSpec,
    owner: &str,
) -> Result<Vec<String>, ScanError> {
    store.with_connection(|conn| read_members(conn, spec, owner))
}

/// Remove `member` from every list in `spec`'s table, dropping emptied owners
///
/// Runs on the caller's connection so cleanup can include it in its own
/// transaction. Returns the number of owner rows changed or removed.
pub fn remove_member(
    conn: &Connection,
    spec: AssociationSpec,
    member: &str,
) -> Result<usize, ScanError> {
    // LIKE only narrows candidates; exact matching happens on the decoded list
    let like = format!("%\"{}\"%", member);
    let sql = format!(
        "SELECT {}, {} FROM {} WHERE {} LIKE ?1",
        spec.owner_column, spec.list_column, spec.table, spec.list_column
    );
    let candidates: Vec<(String, String)> = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![like], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut changed = 0;
    for (owner, encoded) in candidates {
        let mut members: Vec<String> = serde_json::from_str(&encoded)?;
        let before = members.len();
        members.retain(|m| m != member);
        if members.len() == before {
            continue;
        }

        if members.is_empty() {
            conn.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", spec.table, spec.owner_column),
                params![owner],
            )?;
        } else {
            conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                    spec.table, spec.list_column, spec.owner_column
                ),
                params![serde_json::to_string(&members)?, owner],
            )?;
        }
        changed += 1;
    }

    Ok(changed)
}
