//! Concurrent offset pagination over a collection endpoint
//!
//! Page 0 is fetched first. If it is full, up to `max_workers` further offsets
//! are kept in flight at once. The first page shorter than `page_size` (or
//! empty) raises a stop flag: no new offsets are issued, requests already
//! dispatched finish and their pages are still persisted.
//!
//! Every page is handed to a `PageSink` the moment it arrives. A failed page
//! is logged and left out; its siblings keep going.

use super::client::{Api, ApiClient, Query};
use super::db::Store;
use super::descriptor::EntityDescriptor;
use super::error::ScanError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Consecutive page failures tolerated before pagination gives up
const MIN_FAILURE_STREAK: usize = 3;

/// Receives each successful page as soon as it is fetched
pub trait PageSink: Send + Sync {
    /// Persist one page; returns rows written
    fn persist(&self, page: &[Value]) -> Result<usize, ScanError>;
}

/// Writes pages straight into the descriptor's table
pub struct StoreSink<'a> {
    pub store: &'a Store,
    pub descriptor: &'a EntityDescriptor,
}

impl PageSink for StoreSink<'_> {
    fn persist(&self, page: &[Value]) -> Result<usize, ScanError> {
        let rows = self.descriptor.to_rows(page);
        self.store
            .bulk_upsert(self.descriptor.table, self.descriptor.key_columns, &rows)
    }
}

/// Result of paginating one endpoint
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Records from every successful page, in offset order
    pub records: Vec<Value>,
    /// Successful pages
    pub pages: usize,
    /// Rows reported written by the sink
    pub persisted: usize,
    /// (offset, error) for every page that failed to fetch or persist
    pub errors: Vec<(usize, String)>,
}

/// Bounded-parallel paginator
#[derive(Clone)]
pub struct BatchFetcher {
    client: Arc<dyn ApiClient>,
    page_size: usize,
    max_workers: usize,
    max_pages: usize,
    /// Shared across every fetch issued through this fetcher (and its clones)
    permits: Arc<Semaphore>,
}

impl BatchFetcher {
    pub fn new(client: Arc<dyn ApiClient>, page_size: usize, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            client,
            page_size: page_size.max(1),
            max_workers,
            max_pages: 500,
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Paginate `descriptor`'s endpoint until a short or empty page
    pub async fn fetch_all(
        &self,
        descriptor: &EntityDescriptor,
        extra_query: &[(String, String)],
        sink: &dyn PageSink,
    ) -> FetchOutcome {
        let mut base_query: Query = descriptor
            .query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        base_query.extend(extra_query.iter().cloned());

        self.paginate(descriptor.name, descriptor.api, descriptor.endpoint, base_query, sink)
            .await
    }

    /// Paginate an arbitrary endpoint
    pub async fn paginate(
        &self,
        name: &str,
        api: Api,
        path: &str,
        base_query: Query,
        sink: &dyn PageSink,
    ) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let mut pages: BTreeMap<usize, Vec<Value>> = BTreeMap::new();

        log::info!("📥 Fetching {} (page size {}, {} workers)", name, self.page_size, self.max_workers);

        // Page 0 decides whether there is anything to paginate
        let first = fetch_page(
            self.client.clone(),
            self.permits.clone(),
            Arc::new(AtomicBool::new(false)),
            api,
            path.to_string(),
            base_query.clone(),
            0,
            self.page_size,
        )
        .await;

        let mut stop = match first {
            (_, Some(Ok(page))) => {
                let short = page.len() < self.page_size;
                self.accept_page(name, 0, page, sink, &mut pages, &mut outcome);
                short
            }
            (_, Some(Err(e))) => {
                log::warn!("⚠️  {}: first page failed: {}", name, e);
                outcome.errors.push((0, e.to_string()));
                true
            }
            (_, None) => true,
        };

        let stop_flag = Arc::new(AtomicBool::new(stop));
        let mut in_flight: JoinSet<(usize, Option<Result<Vec<Value>, ScanError>>)> = JoinSet::new();
        let mut next_page = 1usize;
        let mut consecutive_failures = 0usize;

        loop {
            while !stop && in_flight.len() < self.max_workers && next_page < self.max_pages {
                let offset = next_page * self.page_size;
                in_flight.spawn(fetch_page(
                    self.client.clone(),
                    self.permits.clone(),
                    stop_flag.clone(),
                    api,
                    path.to_string(),
                    base_query.clone(),
                    offset,
                    self.page_size,
                ));
                next_page += 1;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((offset, Some(Ok(page)))) => {
                    consecutive_failures = 0;
                    if page.len() < self.page_size && !stop {
                        log::debug!("   ├─ {}: end of data at offset {}", name, offset);
                        stop = true;
                        stop_flag.store(true, Ordering::SeqCst);
                    }
                    self.accept_page(name, offset, page, sink, &mut pages, &mut outcome);
                }
                Ok((offset, Some(Err(e)))) => {
                    log::warn!("⚠️  {}: page at offset {} failed: {}", name, offset, e);
                    outcome.errors.push((offset, e.to_string()));
                    consecutive_failures += 1;
                    if consecutive_failures >= self.max_workers.max(MIN_FAILURE_STREAK) && !stop {
                        log::warn!("⚠️  {}: {} consecutive failures, stopping", name, consecutive_failures);
                        stop = true;
                        stop_flag.store(true, Ordering::SeqCst);
                    }
                }
                // Cancelled before dispatch
                Ok((_, None)) => {}
                Err(e) => {
                    log::error!("❌ {}: page task panicked: {}", name, e);
                    outcome.errors.push((usize::MAX, e.to_string()));
                }
            }
        }

        if next_page >= self.max_pages && !stop {
            log::warn!("⚠️  {}: reached page cap ({})", name, self.max_pages);
        }

        outcome.records = pages.into_values().flatten().collect();

        log::info!(
            "   └─ {}: {} records in {} pages ({} errors)",
            name,
            outcome.records.len(),
            outcome.pages,
            outcome.errors.len()
        );

        outcome
    }

    fn accept_page(
        &self,
        name: &str,
        offset: usize,
        page: Vec<Value>,
        sink: &dyn PageSink,
        pages: &mut BTreeMap<usize, Vec<Value>>,
        outcome: &mut FetchOutcome,
    ) {
        if page.is_empty() {
            return;
        }
        match sink.persist(&page) {
            Ok(written) => {
                outcome.persisted += written;
                outcome.pages += 1;
                pages.insert(offset, page);
            }
            Err(e) => {
                log::error!("❌ {}: failed to persist page at offset {}: {}", name, offset, e);
                outcome.errors.push((offset, e.to_string()));
            }
        }
    }
}

/// Fetch one page; `None` when the stop flag was raised before dispatch
#[allow(clippy::too_many_arguments)]
async fn fetch_page(
    client: Arc<dyn ApiClient>,
    permits: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
    api: Api,
    path: String,
    mut query: Query,
    offset: usize,
    limit: usize,
) -> (usize, Option<Result<Vec<Value>, ScanError>>) {
    let _permit = match permits.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return (offset, None),
    };

    if stop.load(Ordering::SeqCst) {
        return (offset, None);
    }

    query.push(("limit".to_string(), limit.to_string()));
    query.push(("offset".to_string(), offset.to_string()));

    (offset, Some(client.get_list(api, &path, &query).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::EVENTS;
    use crate::pipeline::testing::{create_test_store, param, ScriptedClient};
    use serde_json::json;
    use std::sync::Mutex;

    /// Endpoint serving `total` events, honouring limit/offset
    fn paged_events(total: usize) -> ScriptedClient {
        ScriptedClient::new().route(Api::Gamma, "/events", move |q| {
            let limit: usize = param(q, "limit").unwrap().parse().unwrap();
            let offset: usize = param(q, "offset").unwrap().parse().unwrap();
            let end = total.min(offset + limit);
            let page: Vec<Value> = (offset..end.max(offset))
                .map(|i| json!({"id": format!("e{}", i), "active": true, "closed": false}))
                .collect();
            Ok(Value::Array(page))
        })
    }

    /// Sink that only counts
    #[derive(Default)]
    struct CountingSink {
        pages: Mutex<Vec<usize>>,
    }

    impl PageSink for CountingSink {
        fn persist(&self, page: &[Value]) -> Result<usize, ScanError> {
            self.pages.lock().unwrap().push(page.len());
            Ok(page.len())
        }
    }

    fn offsets(client: &ScriptedClient) -> Vec<usize> {
        let mut offsets: Vec<usize> = client
            .calls_to("/events")
            .iter()
            .map(|q| param(q, "offset").unwrap().parse().unwrap())
            .collect();
        offsets.sort();
        offsets
    }

    #[tokio::test]
    async fn test_terminates_on_short_page_sequential() {
        let client = Arc::new(paged_events(237));
        let fetcher = BatchFetcher::new(client.clone(), 100, 1);
        let sink = CountingSink::default();

        let outcome = fetcher.fetch_all(&EVENTS, &[], &sink).await;

        assert_eq!(outcome.records.len(), 237);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.errors.is_empty());
        // No request beyond the one that returned 37
        assert_eq!(offsets(&client), vec![0, 100, 200]);
        assert_eq!(*sink.pages.lock().unwrap(), vec![100, 100, 37]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_window_returns_ordered_union() {
        let client = Arc::new(paged_events(237));
        let fetcher = BatchFetcher::new(client.clone(), 100, 4);
        let sink = CountingSink::default();

        let outcome = fetcher.fetch_all(&EVENTS, &[], &sink).await;

        assert_eq!(outcome.records.len(), 237);
        let ids: Vec<String> = outcome
            .records
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..237).map(|i| format!("e{}", i)).collect();
        assert_eq!(ids, expected);

        // Speculation never reaches past the window that was open at termination
        assert!(offsets(&client).iter().all(|o| *o <= 200 + 4 * 100));
    }

    #[tokio::test]
    async fn test_empty_page_terminates() {
        let client = Arc::new(paged_events(200));
        let fetcher = BatchFetcher::new(client.clone(), 100, 1);

        let outcome = fetcher.fetch_all(&EVENTS, &[], &CountingSink::default()).await;

        assert_eq!(outcome.records.len(), 200);
        assert_eq!(offsets(&client), vec![0, 100, 200]);
    }

    #[tokio::test]
    async fn test_empty_endpoint() {
        let client = Arc::new(paged_events(0));
        let fetcher = BatchFetcher::new(client.clone(), 100, 8);

        let outcome = fetcher.fetch_all(&EVENTS, &[], &CountingSink::default()).await;

        assert!(outcome.records.is_empty());
        assert_eq!(offsets(&client), vec![0]);
    }

    #[tokio::test]
    async fn test_failed_page_is_isolated() {
        let client = Arc::new(ScriptedClient::new().route(Api::Gamma, "/events", |q| {
            let offset: usize = param(q, "offset").unwrap().parse().unwrap();
            let size = match offset {
                0 | 200 => 100,
                100 => {
                    return Err(ScanError::Status {
                        url: "/events".to_string(),
                        status: 500,
                    })
                }
                300 => 37,
                _ => 0,
            };
            Ok(Value::Array(
                (0..size).map(|i| json!({"id": format!("{}-{}", offset, i)})).collect(),
            ))
        }));
        let fetcher = BatchFetcher::new(client.clone(), 100, 1);

        let outcome = fetcher.fetch_all(&EVENTS, &[], &CountingSink::default()).await;

        assert_eq!(outcome.records.len(), 237);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].0, 100);
    }

    #[tokio::test]
    async fn test_page_cap() {
        let client = Arc::new(paged_events(usize::MAX / 2));
        let fetcher = BatchFetcher::new(client.clone(), 10, 2).with_max_pages(5);

        let outcome = fetcher.fetch_all(&EVENTS, &[], &CountingSink::default()).await;

        assert_eq!(outcome.records.len(), 50);
    }

    #[tokio::test]
    async fn test_pages_persisted_through_store_sink() {
        let (_tmp, store) = create_test_store();
        let client = Arc::new(paged_events(137));
        let fetcher = BatchFetcher::new(client.clone(), 100, 3);
        let sink = StoreSink {
            store: &store,
            descriptor: &EVENTS,
        };

        let outcome = fetcher.fetch_all(&EVENTS, &[], &sink).await;

        assert_eq!(outcome.persisted, 137);
        assert_eq!(store.count("events").unwrap(), 137);

        // Fixed descriptor query is sent with every page
        for q in client.calls_to("/events") {
            assert_eq!(param(&q, "closed"), Some("false"));
            assert_eq!(param(&q, "order"), Some("volume"));
        }
    }
}
