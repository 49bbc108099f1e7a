//! Scan orchestration
//!
//! A scan is an ordered list of phases. Each phase runs to completion (or
//! failure) before the next starts; a failed phase is recorded and the run
//! moves on. When cleanup is enabled it runs after every phase so closed
//! entities never linger into the next one.
//!
//! Everything a run learns (whales found, whether events were fetched, rows
//! cleaned) lives in an explicit `RunContext` that becomes the `RunReport`.

use super::associations::{AssociationWriter, EVENT_TAGS, SERIES_EVENTS};
use super::classifier::{WalletValueCache, WhaleThresholds};
use super::cleanup::cleanup_closed;
use super::client::{query, Api, ApiClient};
use super::comments::{active_events, CommentSync, MAX_COMMENT_EVENTS};
use super::config::ScanConfig;
use super::db::{row_from, Row, Store};
use super::descriptor::{EntityDescriptor, COLLECTIONS, EVENTS, MARKETS, SERIES, TAGS};
use super::enrichment::{Enricher, EnrichmentLimits};
use super::error::ScanError;
use super::fetcher::{BatchFetcher, FetchOutcome, PageSink, StoreSink};
use super::market_data::{MarketData, TradeFilter};
use super::participants::{active_markets, stored_whales, ParticipantClassifier};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Active markets/events inspected by per-entity phases, busiest first
pub const MAX_ACTIVE_TARGETS: usize = 100;

/// Tags whose related tags are fetched per run
pub const MAX_RELATED_TAG_OWNERS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Tags,
    Events,
    Markets,
    Series,
    Participants,
    Enrichment,
    Transactions,
    Comments,
    LiveVolume,
    OpenInterest,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::Tags,
        Phase::Events,
        Phase::Markets,
        Phase::Series,
        Phase::Participants,
        Phase::Enrichment,
        Phase::Transactions,
        Phase::Comments,
        Phase::LiveVolume,
        Phase::OpenInterest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Tags => "tags",
            Phase::Events => "events",
            Phase::Markets => "markets",
            Phase::Series => "series",
            Phase::Participants => "participants",
            Phase::Enrichment => "enrichment",
            Phase::Transactions => "transactions",
            Phase::Comments => "comments",
            Phase::LiveVolume => "live_volume",
            Phase::OpenInterest => "open_interest",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = ScanError;

    /// Accepts `live_volume`, `live-volume`, `LiveVolume` and the like
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();

        Phase::ALL
            .into_iter()
            .find(|p| p.name().replace('_', "") == normalized)
            .ok_or_else(|| ScanError::Config(format!("unknown scan phase: {}", s)))
    }
}

/// Ordered list of phases for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    phases: Vec<Phase>,
}

impl ScanPlan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// `SCAN_PHASES` when set, otherwise the default order filtered by toggles
    pub fn from_config(config: &ScanConfig) -> Result<Self, ScanError> {
        if let Some(names) = &config.phases {
            let phases = names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<Phase>, _>>()?;
            return Ok(Self::new(phases));
        }

        let phases = Phase::ALL
            .into_iter()
            .filter(|phase| match phase {
                Phase::Tags => config.enable_tags,
                Phase::Series => config.enable_series,
                Phase::Transactions => config.enable_transactions,
                Phase::Comments => config.enable_comments,
                Phase::LiveVolume => config.enable_live_volume,
                Phase::OpenInterest => config.enable_open_interest,
                Phase::Events | Phase::Markets | Phase::Participants | Phase::Enrichment => true,
            })
            .collect();

        Ok(Self::new(phases))
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub success: bool,
    /// Rows (or entities, for participants) produced by the phase
    pub count: usize,
    pub error: Option<String>,
}

/// Per-run state threaded through the phases
#[derive(Debug, Default)]
pub struct RunContext {
    /// Whales found by the participants phase in this run
    pub whales: Option<BTreeSet<String>>,
    pub events_fetched: bool,
    pub results: Vec<PhaseResult>,
    pub cleaned: usize,
}

impl RunContext {
    fn record(&mut self, phase: Phase, work: PhaseWork) {
        let error = if work.errors.is_empty() {
            None
        } else {
            let shown: Vec<&str> = work.errors.iter().take(3).map(String::as_str).collect();
            let more = work.errors.len().saturating_sub(shown.len());
            let mut message = shown.join("; ");
            if more > 0 {
                message.push_str(&format!(" (+{} more)", more));
            }
            Some(message)
        };

        self.results.push(PhaseResult {
            phase,
            success: error.is_none(),
            count: work.count,
            error,
        });
    }

    pub fn into_report(self, started_at: DateTime<Utc>) -> RunReport {
        RunReport {
            phases: self.results,
            cleaned: self.cleaned,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phases: Vec<PhaseResult>,
    /// Rows removed by cleanup across the run
    pub cleaned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|r| r.phase == phase)
    }

    pub fn succeeded(&self) -> usize {
        self.phases.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.phases.len() - self.succeeded()
    }

    pub fn total_count(&self) -> usize {
        self.phases.iter().map(|r| r.count).sum()
    }

    pub fn to_json(&self) -> Result<String, ScanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn log_summary(&self) {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        log::info!(
            "📋 Scan finished in {:.1}s: {} phases ok, {} failed",
            elapsed,
            self.succeeded(),
            self.failed()
        );
        for result in &self.phases {
            match &result.error {
                None => log::info!("   ├─ ✅ {}: {}", result.phase, result.count),
                Some(e) => log::info!("   ├─ ❌ {}: {} ({})", result.phase, result.count, e),
            }
        }
        log::info!("   └─ 🧹 cleaned: {}", self.cleaned);
    }
}

/// What a phase body hands back to the orchestrator
#[derive(Debug, Default)]
struct PhaseWork {
    count: usize,
    errors: Vec<String>,
}

impl PhaseWork {
    fn from_fetch(count: usize, outcome: &FetchOutcome) -> Self {
        Self {
            count,
            errors: outcome
                .errors
                .iter()
                .map(|(offset, e)| format!("offset {}: {}", offset, e))
                .collect(),
        }
    }

    fn failed(error: ScanError) -> Self {
        Self {
            count: 0,
            errors: vec![error.to_string()],
        }
    }
}

/// Runs scan plans against one store
pub struct Scanner {
    config: ScanConfig,
    store: Store,
    client: Arc<dyn ApiClient>,
    fetcher: BatchFetcher,
    associations: AssociationWriter,
    writer_thread: Option<JoinHandle<()>>,
}

impl Scanner {
    /// Spawns the association writer for `store`
    pub fn new(config: ScanConfig, store: Store, client: Arc<dyn ApiClient>) -> Result<Self, ScanError> {
        let (associations, writer_thread) = AssociationWriter::spawn(store.clone())?;
        let fetcher = BatchFetcher::new(client.clone(), config.page_size, config.fetch_workers)
            .with_max_pages(config.max_pages);

        Ok(Self {
            config,
            store,
            client,
            fetcher,
            associations,
            writer_thread: Some(writer_thread),
        })
    }

    /// Run every phase of `plan` in order
    pub async fn run(&self, plan: &ScanPlan) -> RunReport {
        let started_at = Utc::now();
        let mut ctx = RunContext::default();

        let names: Vec<&str> = plan.phases().iter().map(Phase::name).collect();
        log::info!("🚀 Starting scan: {}", names.join(" → "));

        for &phase in plan.phases() {
            log::info!("▶️  Phase: {}", phase);
            let work = self.run_phase(phase, &mut ctx).await;
            if !work.errors.is_empty() {
                log::warn!("⚠️  Phase {} finished with {} errors", phase, work.errors.len());
            }
            ctx.record(phase, work);
            self.cleanup(&mut ctx).await;
        }

        let report = ctx.into_report(started_at);
        report.log_summary();
        report
    }

    /// Stop the association writer and wait for it to drain
    pub fn shutdown(mut self) {
        self.associations.shutdown();
        if let Some(handle) = self.writer_thread.take() {
            if handle.join().is_err() {
                log::error!("❌ Association writer thread panicked");
            }
        }
    }

    async fn run_phase(&self, phase: Phase, ctx: &mut RunContext) -> PhaseWork {
        match phase {
            Phase::Tags => self.sync_tags().await,
            Phase::Events => self.sync_events(ctx).await,
            Phase::Markets => self.sync_markets(ctx).await,
            Phase::Series => self.sync_series().await,
            Phase::Participants => self.discover_participants(ctx).await,
            Phase::Enrichment => self.enrich_participants(ctx).await,
            Phase::Transactions => self.sync_transactions().await,
            Phase::Comments => self.sync_comments().await,
            Phase::LiveVolume => self.sync_live_volume().await,
            Phase::OpenInterest => self.sync_open_interest().await,
        }
    }

    async fn cleanup(&self, ctx: &mut RunContext) {
        if !self.config.enable_cleanup {
            return;
        }
        // Queued merges must land before their events can be removed from lists
        if let Err(e) = self.associations.flush().await {
            log::warn!("⚠️  Association flush failed before cleanup: {}", e);
        }
        match cleanup_closed(&self.store) {
            Ok(report) => ctx.cleaned += report.total(),
            Err(e) => log::error!("❌ Cleanup failed: {}", e),
        }
    }

    async fn flush_associations(&self, work: &mut PhaseWork) {
        if let Err(e) = self.associations.flush().await {
            work.errors.push(format!("associations: {}", e));
        }
    }

    async fn sync_tags(&self) -> PhaseWork {
        let sink = StoreSink {
            store: &self.store,
            descriptor: &TAGS,
        };
        let outcome = self.fetcher.fetch_all(&TAGS, &[], &sink).await;
        let mut work = PhaseWork::from_fetch(outcome.persisted, &outcome);

        let owners: Vec<String> = outcome
            .records
            .iter()
            .filter_map(|t| TAGS.id_of(t))
            .take(MAX_RELATED_TAG_OWNERS)
            .collect();

        log::info!("🏷️  Related tags for {} tags", owners.len());
        let results: Vec<(String, Result<usize, ScanError>)> = stream::iter(owners)
            .map(|tag_id| async move {
                let result = self.sync_related_tags(&tag_id).await;
                (tag_id, result)
            })
            .buffer_unordered(self.config.fetch_workers.max(1))
            .collect()
            .await;

        for (tag_id, result) in results {
            match result {
                Ok(n) => work.count += n,
                Err(e) => work.errors.push(format!("related tags {}: {}", tag_id, e)),
            }
        }
        work
    }

    async fn sync_related_tags(&self, tag_id: &str) -> Result<usize, ScanError> {
        let path = format!("{}/related-tags/tags", TAGS.detail_path(tag_id));
        let related = self
            .client
            .get_list(Api::Gamma, &path, &query([("status", "all"), ("omit_empty", "true")]))
            .await?;

        self.store
            .bulk_insert_if_absent(TAGS.table, &TAGS.to_rows(&related))?;

        let links: Vec<Row> = related
            .iter()
            .filter_map(|t| TAGS.id_of(t))
            .filter(|related_id| related_id != tag_id)
            .enumerate()
            .map(|(rank, related_id)| {
                row_from([
                    ("tag_id", SqlValue::Text(tag_id.to_string())),
                    ("related_tag_id", SqlValue::Text(related_id)),
                    ("rank", SqlValue::Integer(rank as i64 + 1)),
                ])
            })
            .collect();

        self.store
            .bulk_upsert("tag_relationships", &["tag_id", "related_tag_id"], &links)
    }

    async fn sync_events(&self, ctx: &mut RunContext) -> PhaseWork {
        let sink = EventSink::new(&self.store, &self.associations);
        let outcome = self.fetcher.fetch_all(&EVENTS, &[], &sink).await;
        let mut work = PhaseWork::from_fetch(outcome.persisted, &outcome);
        self.flush_associations(&mut work).await;

        log::info!(
            "   └─ {} embedded markets stored",
            sink.markets.load(Ordering::Relaxed)
        );
        ctx.events_fetched = true;
        work
    }

    async fn sync_markets(&self, ctx: &mut RunContext) -> PhaseWork {
        let mut prerequisite_errors = Vec::new();
        if !ctx.events_fetched {
            match self.store.count(EVENTS.table) {
                Ok(0) => {
                    log::info!("📥 No stored events; fetching events before markets");
                    let events = self.sync_events(ctx).await;
                    if !events.errors.is_empty() {
                        log::warn!("⚠️  Event prerequisite finished with {} errors", events.errors.len());
                    }
                    prerequisite_errors = events
                        .errors
                        .into_iter()
                        .map(|e| format!("events prerequisite: {}", e))
                        .collect();
                }
                Ok(_) => {}
                Err(e) => return PhaseWork::failed(e),
            }
        }

        let sink = MarketSink { store: &self.store };
        let outcome = self.fetcher.fetch_all(&MARKETS, &[], &sink).await;
        let mut work = PhaseWork::from_fetch(outcome.persisted, &outcome);
        work.errors.splice(0..0, prerequisite_errors);

        if outcome.records.is_empty() {
            // Fall back to per-event detail, which embeds each event's markets
            let event_ids = match active_events(&self.store, Some(MAX_ACTIVE_TARGETS)) {
                Ok(ids) => ids,
                Err(e) => {
                    work.errors.push(e.to_string());
                    return work;
                }
            };
            log::info!("📥 Market listing empty; refreshing {} events in detail", event_ids.len());

            let sink = EventSink::new(&self.store, &self.associations);
            let results: Vec<(String, Result<usize, ScanError>)> = stream::iter(event_ids)
                .map(|event_id| {
                    let sink = &sink;
                    async move {
                        let result = self.refresh_event(&event_id, sink).await;
                        (event_id, result)
                    }
                })
                .buffer_unordered(self.config.fetch_workers.max(1))
                .collect()
                .await;

            for (event_id, result) in results {
                if let Err(e) = result {
                    work.errors.push(format!("event {}: {}", event_id, e));
                }
            }
            work.count += sink.markets.load(Ordering::Relaxed);
            self.flush_associations(&mut work).await;
        }

        work
    }

    async fn refresh_event(&self, event_id: &str, sink: &EventSink<'_>) -> Result<usize, ScanError> {
        let detail = self
            .client
            .get_json(EVENTS.api, &EVENTS.detail_path(event_id), &[])
            .await?;
        sink.persist(std::slice::from_ref(&detail))
    }

    async fn sync_series(&self) -> PhaseWork {
        let sink = SeriesSink {
            store: &self.store,
            associations: &self.associations,
        };
        let outcome = self.fetcher.fetch_all(&SERIES, &[], &sink).await;
        let mut work = PhaseWork::from_fetch(outcome.persisted, &outcome);
        self.flush_associations(&mut work).await;
        work
    }

    async fn discover_participants(&self, ctx: &mut RunContext) -> PhaseWork {
        let markets = match active_markets(&self.store, None) {
            Ok(markets) => markets,
            Err(e) => return PhaseWork::failed(e),
        };

        let wallet_values = Arc::new(
            WalletValueCache::new(self.client.clone(), self.config.rate_limit_delay())
                .with_history(self.store.clone()),
        );
        let classifier = ParticipantClassifier::new(
            self.client.clone(),
            self.store.clone(),
            Arc::new(WhaleThresholds::from(&self.config.whale)),
            wallet_values,
            self.config.holder_workers,
            self.config.top_holders_per_market,
        );

        let report = classifier.discover(&markets).await;
        let work = PhaseWork {
            count: report.whales.len(),
            errors: report.errors,
        };
        ctx.whales = Some(report.whales);
        work
    }

    async fn enrich_participants(&self, ctx: &mut RunContext) -> PhaseWork {
        let whales = match &ctx.whales {
            Some(whales) => whales.clone(),
            None => match stored_whales(&self.store) {
                Ok(whales) => {
                    log::info!("🐋 Using {} stored whales", whales.len());
                    whales
                }
                Err(e) => return PhaseWork::failed(e),
            },
        };

        let limits = EnrichmentLimits {
            min_transaction_size: self.config.min_transaction_size,
            min_position_value: self.config.min_position_value,
            ..EnrichmentLimits::default()
        };
        let enricher = Enricher::new(
            self.client.clone(),
            self.store.clone(),
            self.config.enrichment_workers,
            limits,
        );

        let report = enricher.enrich_all(&whales).await;
        PhaseWork {
            count: report.rows,
            errors: report.errors,
        }
    }

    fn market_data(&self) -> MarketData {
        MarketData::new(
            self.client.clone(),
            self.store.clone(),
            self.config.fetch_workers,
            TradeFilter {
                min_transaction_size: self.config.min_transaction_size,
                min_whale_trade: self.config.min_whale_trade,
            },
        )
    }

    async fn sync_transactions(&self) -> PhaseWork {
        match active_markets(&self.store, Some(MAX_ACTIVE_TARGETS)) {
            Ok(markets) => {
                let report = self.market_data().sync_transactions(&markets).await;
                PhaseWork {
                    count: report.rows,
                    errors: report.errors,
                }
            }
            Err(e) => PhaseWork::failed(e),
        }
    }

    async fn sync_comments(&self) -> PhaseWork {
        match active_events(&self.store, Some(MAX_COMMENT_EVENTS)) {
            Ok(events) => {
                let sync = CommentSync::new(self.client.clone(), self.store.clone(), self.config.fetch_workers);
                let report = sync.sync_events(&events).await;
                PhaseWork {
                    count: report.comments + report.reactions,
                    errors: report.errors,
                }
            }
            Err(e) => PhaseWork::failed(e),
        }
    }

    async fn sync_live_volume(&self) -> PhaseWork {
        match active_events(&self.store, Some(MAX_ACTIVE_TARGETS)) {
            Ok(events) => {
                let report = self.market_data().sync_live_volume(&events).await;
                PhaseWork {
                    count: report.rows,
                    errors: report.errors,
                }
            }
            Err(e) => PhaseWork::failed(e),
        }
    }

    async fn sync_open_interest(&self) -> PhaseWork {
        match active_markets(&self.store, Some(MAX_ACTIVE_TARGETS)) {
            Ok(markets) => {
                let report = self.market_data().sync_open_interest(&markets).await;
                PhaseWork {
                    count: report.rows,
                    errors: report.errors,
                }
            }
            Err(e) => PhaseWork::failed(e),
        }
    }
}

/// Array field of a record, empty when absent
fn embedded<'v>(record: &'v Value, field: &str) -> &'v [Value] {
    match record.get(field) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn ids(descriptor: &EntityDescriptor, records: &[Value]) -> Vec<String> {
    records.iter().filter_map(|r| descriptor.id_of(r)).collect()
}

fn join_rows(left: (&str, &str), right_column: &str, right_ids: &[String]) -> Vec<Row> {
    right_ids
        .iter()
        .map(|id| {
            row_from([
                (left.0, SqlValue::Text(left.1.to_string())),
                (right_column, SqlValue::Text(id.clone())),
            ])
        })
        .collect()
}

/// Persists events with their embedded markets, tags and series links
struct EventSink<'a> {
    store: &'a Store,
    associations: &'a AssociationWriter,
    markets: AtomicUsize,
}

impl<'a> EventSink<'a> {
    fn new(store: &'a Store, associations: &'a AssociationWriter) -> Self {
        Self {
            store,
            associations,
            markets: AtomicUsize::new(0),
        }
    }

    fn persist_children(&self, record: &Value, event_id: &str) -> Result<(), ScanError> {
        let markets: Vec<Row> = MARKETS
            .to_rows(embedded(record, "markets"))
            .into_iter()
            .map(|mut row| {
                row.insert("event_id".to_string(), SqlValue::Text(event_id.to_string()));
                row
            })
            .collect();
        let written = self
            .store
            .bulk_upsert(MARKETS.table, MARKETS.key_columns, &markets)?;
        self.markets.fetch_add(written, Ordering::Relaxed);

        // Embedded tags are summaries; never let them overwrite a full tag row
        let tags = embedded(record, "tags");
        self.store.bulk_insert_if_absent(TAGS.table, &TAGS.to_rows(tags))?;

        let tag_ids = ids(&TAGS, tags);
        for tag_id in &tag_ids {
            self.associations.merge_detached(EVENT_TAGS, tag_id, event_id);
        }

        let market_ids = ids(&MARKETS, embedded(record, "markets"));
        let market_tags: Vec<Row> = market_ids
            .iter()
            .flat_map(|market_id| join_rows(("market_id", market_id.as_str()), "tag_id", &tag_ids))
            .collect();
        self.store.bulk_insert_if_absent("market_tags", &market_tags)?;

        for series_id in ids(&SERIES, embedded(record, "series")) {
            self.associations.merge_detached(SERIES_EVENTS, &series_id, event_id);
        }

        Ok(())
    }
}

impl PageSink for EventSink<'_> {
    fn persist(&self, page: &[Value]) -> Result<usize, ScanError> {
        let rows = EVENTS.to_rows(page);
        let written = self.store.bulk_upsert(EVENTS.table, EVENTS.key_columns, &rows)?;

        for record in page {
            if let Some(event_id) = EVENTS.id_of(record) {
                self.persist_children(record, &event_id)?;
            }
        }
        Ok(written)
    }
}

/// Persists listed markets without clearing an owner set by the events phase
struct MarketSink<'a> {
    store: &'a Store,
}

impl PageSink for MarketSink<'_> {
    fn persist(&self, page: &[Value]) -> Result<usize, ScanError> {
        let (owned, unowned): (Vec<Row>, Vec<Row>) = MARKETS
            .to_rows(page)
            .into_iter()
            .partition(|row| !matches!(row.get("event_id"), None | Some(SqlValue::Null)));

        let unowned: Vec<Row> = unowned
            .into_iter()
            .map(|mut row| {
                row.remove("event_id");
                row
            })
            .collect();

        Ok(self.store.bulk_upsert(MARKETS.table, MARKETS.key_columns, &owned)?
            + self.store.bulk_upsert(MARKETS.table, MARKETS.key_columns, &unowned)?)
    }
}

/// Persists series with their events, collections and tags
struct SeriesSink<'a> {
    store: &'a Store,
    associations: &'a AssociationWriter,
}

impl PageSink for SeriesSink<'_> {
    fn persist(&self, page: &[Value]) -> Result<usize, ScanError> {
        let rows = SERIES.to_rows(page);
        let written = self.store.bulk_upsert(SERIES.table, SERIES.key_columns, &rows)?;

        for record in page {
            let Some(series_id) = SERIES.id_of(record) else {
                continue;
            };

            for event_id in ids(&EVENTS, embedded(record, "events")) {
                self.associations.merge_detached(SERIES_EVENTS, &series_id, &event_id);
            }

            let collections = embedded(record, "collections");
            self.store.bulk_upsert(
                COLLECTIONS.table,
                COLLECTIONS.key_columns,
                &COLLECTIONS.to_rows(collections),
            )?;
            self.store.bulk_insert_if_absent(
                "series_collections",
                &join_rows(("series_id", series_id.as_str()), "collection_id", &ids(&COLLECTIONS, collections)),
            )?;
            for collection in collections {
                let Some(collection_id) = COLLECTIONS.id_of(collection) else {
                    continue;
                };
                let tags = embedded(collection, "tags");
                self.store.bulk_insert_if_absent(TAGS.table, &TAGS.to_rows(tags))?;
                self.store.bulk_insert_if_absent(
                    "collection_tags",
                    &join_rows(("collection_id", collection_id.as_str()), "tag_id", &ids(&TAGS, tags)),
                )?;
            }

            let tags = embedded(record, "tags");
            self.store.bulk_insert_if_absent(TAGS.table, &TAGS.to_rows(tags))?;
            self.store.bulk_insert_if_absent(
                "series_tags",
                &join_rows(("series_id", series_id.as_str()), "tag_id", &ids(&TAGS, tags)),
            )?;
        }

        Ok(written)
    }
}
