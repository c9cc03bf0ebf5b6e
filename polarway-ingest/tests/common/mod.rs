//! In-process page sources for engine tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use polarway_ingest::collector::{PageContext, PageFetcher};
use polarway_ingest::{
    split_at_cutoff, CollectionIdentity, CollectorConfig, CursorPageInfo, FetchError, MemoryStore,
    ParsedPage, RetryConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn record(id: u64, created: i64) -> Value {
    json!({"id": id, "created_at": created})
}

pub fn created_at(item: &Value) -> Option<DateTime<Utc>> {
    item.get("created_at").and_then(Value::as_i64).map(at)
}

pub fn identity(table: &str) -> CollectionIdentity {
    CollectionIdentity::new("mock", 1, table).with_param("repo_id", 7)
}

/// Full-sync config with fast retries and a generous rate limit.
pub fn fast_config() -> CollectorConfig {
    CollectorConfig::default()
        .with_incremental(false)
        .with_rate_limit(1000, Duration::from_secs(1))
        .with_retry(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            backoff_multiplier: 2.0,
            request_timeout_secs: 5,
        })
}

/// Ids of the records currently published for `identity`, in insertion order.
pub fn staged_ids(store: &MemoryStore, identity: &CollectionIdentity) -> Vec<u64> {
    store
        .published(identity)
        .iter()
        .map(|r| {
            let unit: Value = r.json().unwrap();
            unit["id"].as_u64().unwrap()
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub input_index: usize,
    pub page: u64,
    pub cursor: Option<String>,
    pub at: Instant,
}

/// Every request a mock source received.
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Mutex<Vec<RequestEntry>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub struct InFlight<'a>(&'a RequestLog);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestLog {
    fn enter(&self, ctx: &PageContext) -> InFlight<'_> {
        self.entries.lock().push(RequestEntry {
            input_index: ctx.input_index,
            page: ctx.request.page,
            cursor: ctx.request.cursor.clone(),
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    pub fn entries(&self) -> Vec<RequestEntry> {
        self.entries.lock().clone()
    }

    pub fn pages(&self) -> Vec<u64> {
        let mut pages: Vec<u64> = self.entries().iter().map(|e| e.page).collect();
        pages.sort_unstable();
        pages
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Offset-paginated source serving newest-first records, one record list per lane
/// (selected by the input's `repo` field).
pub struct OffsetSource {
    lanes: HashMap<String, Vec<Value>>,
    latency: Duration,
    failing_page: Option<u64>,
    flaky_pages: Mutex<HashMap<u64, u32>>,
    log: Arc<RequestLog>,
}

impl OffsetSource {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            lanes: HashMap::from([(String::new(), records)]),
            latency: Duration::ZERO,
            failing_page: None,
            flaky_pages: Mutex::new(HashMap::new()),
            log: Arc::new(RequestLog::default()),
        }
    }

    pub fn with_lane(mut self, repo: &str, records: Vec<Value>) -> Self {
        self.lanes.insert(repo.to_string(), records);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `page` is rejected permanently.
    pub fn failing_page(mut self, page: u64) -> Self {
        self.failing_page = Some(page);
        self
    }

    /// `page` fails transiently `times` times before succeeding.
    pub fn flaky_page(self, page: u64, times: u32) -> Self {
        self.flaky_pages.lock().insert(page, times);
        self
    }

    pub fn log(&self) -> Arc<RequestLog> {
        self.log.clone()
    }
}

#[async_trait]
impl PageFetcher for OffsetSource {
    async fn fetch(&self, ctx: &PageContext) -> Result<Value, FetchError> {
        let _in_flight = self.log.enter(ctx);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let page = ctx.request.page;
        if self.failing_page == Some(page) {
            return Err(FetchError::Permanent(format!("HTTP 404 on page {}", page)));
        }
        {
            let mut flaky = self.flaky_pages.lock();
            if let Some(left) = flaky.get_mut(&page) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Transient("HTTP 503".into()));
                }
            }
        }

        let lane = ctx.input.get("repo").and_then(Value::as_str).unwrap_or("");
        let items: Vec<Value> = self
            .lanes
            .get(lane)
            .map(|records| {
                records
                    .iter()
                    .skip(ctx.request.skip as usize)
                    .take(ctx.request.size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "items": items }))
    }

    fn parse(&self, ctx: &PageContext, response: Value) -> ParsedPage {
        let items = response["items"].as_array().cloned().unwrap_or_default();
        ParsedPage::offset(split_at_cutoff(items, ctx.cutoff, created_at))
    }

    fn unit_key(&self, _ctx: &PageContext, unit: &Value) -> Option<String> {
        unit.get("id").map(Value::to_string)
    }
}

/// Cursor-paginated source; cursors are `c<page index>`.
pub struct CursorSource {
    records: Vec<Value>,
    /// Page number whose response hands back the cursor it was requested with
    stuck_on_page: Option<u64>,
    log: Arc<RequestLog>,
}

impl CursorSource {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records,
            stuck_on_page: None,
            log: Arc::new(RequestLog::default()),
        }
    }

    pub fn stuck_on_page(mut self, page: u64) -> Self {
        self.stuck_on_page = Some(page);
        self
    }

    pub fn log(&self) -> Arc<RequestLog> {
        self.log.clone()
    }
}

#[async_trait]
impl PageFetcher for CursorSource {
    async fn fetch(&self, ctx: &PageContext) -> Result<Value, FetchError> {
        let _in_flight = self.log.enter(ctx);

        let index = match &ctx.request.cursor {
            None => 0,
            Some(cursor) => cursor
                .trim_start_matches('c')
                .parse::<usize>()
                .map_err(|_| FetchError::Protocol(format!("unknown cursor {}", cursor)))?,
        };
        let size = ctx.request.size;
        let items: Vec<Value> = self.records.iter().skip(index * size).take(size).cloned().collect();
        let has_next = (index + 1) * size < self.records.len();
        let end_cursor = if self.stuck_on_page == Some(ctx.request.page) {
            ctx.request.cursor.clone()
        } else {
            Some(format!("c{}", index + 1))
        };

        Ok(json!({
            "items": items,
            "pageInfo": {"endCursor": end_cursor, "hasNextPage": has_next},
        }))
    }

    fn parse(&self, ctx: &PageContext, response: Value) -> ParsedPage {
        let info = match CursorPageInfo::from_pointer(&response, "/pageInfo") {
            Ok(info) => info,
            Err(e) => return ParsedPage::fatal(e),
        };
        let items = response["items"].as_array().cloned().unwrap_or_default();
        ParsedPage::cursor(
            split_at_cutoff(items, ctx.cutoff, created_at),
            info.end_cursor,
            info.has_next_page,
        )
    }
}
