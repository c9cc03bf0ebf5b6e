//! Rate-limited collector engine
//!
//! One engine drives every collection, whatever the wire protocol. A run is split
//! into *lanes*, one per input object (a repository, a board, an issue...), each
//! with its own [`Pager`]. Lanes share a bounded pool of page workers, a single
//! rate limiter and a single staging generation:
//!
//! 1. state is loaded and the cutoff computed
//! 2. a generation is opened (appending when the run is incremental)
//! 3. free worker slots are filled round-robin from lanes that still have pages
//! 4. each worker waits for a rate-limit permit, fetches with retry, parses, and
//!    stages the page's units in order, keyed by [`PageFetcher::unit_key`]
//! 5. an early-finish page closes its lane; a fatal page aborts the run
//! 6. once every worker has joined, the generation is published and the state
//!    committed with the run's start time
//!
//! The REST and GraphQL front-ends in [`rest`] and [`graphql`] only supply a
//! [`PageFetcher`].

pub mod graphql;
pub mod rest;

pub use graphql::{CursorPageInfo, GraphqlCollector, GraphqlCollectorArgs, GraphqlQuery};
pub use rest::{render_template, ApiCollector, ApiCollectorArgs};

use crate::config::CollectorConfig;
use crate::error::{FetchError, IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::pagination::{Advance, PageInfo, PageOutcome, PageRequest, Pager, PaginationMode, ParsedPage};
use crate::progress::{ProgressEvent, ProgressObserver, RunOutcome, TracingProgress};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::staging::{GenerationMode, RunToken, StagingStore, StateStore};
use crate::state::StateTracker;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a fetcher needs to know about the page it is asked for.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub identity: Arc<CollectionIdentity>,
    /// Input object of the lane (`Value::Null` for single-lane runs)
    pub input: Value,
    pub input_index: usize,
    pub request: PageRequest,
    /// Effective incremental cutoff of the run
    pub cutoff: Option<DateTime<Utc>>,
}

/// Protocol adapter plugged into the engine.
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    /// Fetch one page. Called again on transient failure.
    async fn fetch(&self, ctx: &PageContext) -> std::result::Result<Value, FetchError>;

    /// Turn a response into staged units plus pagination info.
    fn parse(&self, ctx: &PageContext, response: Value) -> ParsedPage;

    /// Stable identity of a unit at the source (an issue id, a commit sha).
    ///
    /// Keyed units fetched again by a later incremental run replace their earlier
    /// copy on publish. Keys only need to be unique within one input.
    fn unit_key(&self, _ctx: &PageContext, _unit: &Value) -> Option<String> {
        None
    }
}

/// Reads a unit key out of a staged unit.
pub type UnitKey = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Unit key taken from the string or number at a JSON pointer, e.g. `/id`.
pub fn key_at(pointer: &str) -> UnitKey {
    let pointer = pointer.to_string();
    Arc::new(move |unit: &Value| -> Option<String> {
        match unit.pointer(&pointer)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

/// Key under which a unit is staged: lanes are told apart by their input.
fn scoped_key(ctx: &PageContext, key: String) -> String {
    match &ctx.input {
        Value::Null => key,
        input => format!("{}#{}", input, key),
    }
}

/// Parameters of one collection run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub identity: CollectionIdentity,
    pub config: CollectorConfig,
    pub mode: PaginationMode,
    /// One lane per input; none means a single lane with a null input
    pub inputs: Vec<Value>,
    /// Explicit caller cutoff
    pub created_after: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl RunSpec {
    pub fn new(identity: CollectionIdentity, mode: PaginationMode) -> Self {
        Self {
            identity,
            config: CollectorConfig::default(),
            mode,
            inputs: Vec::new(),
            created_after: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_created_after(mut self, created_after: Option<DateTime<Utc>>) -> Self {
        self.created_after = created_after;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorReport {
    pub identity: String,
    pub run_start: DateTime<Utc>,
    pub pages_fetched: u64,
    /// Records written by this run (excluding carried-over ones)
    pub records_staged: u64,
    pub finished_early: bool,
    pub incremental: bool,
    pub cutoff: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RunStats {
    pages: u64,
    records: u64,
    finished_early: bool,
}

struct Lane {
    input: Value,
    pager: Pager,
    /// No more pages will be scheduled
    closed: bool,
}

struct PageStaged {
    page_info: PageInfo,
    records: usize,
    early_finish: bool,
}

struct PageDone {
    lane: usize,
    request: PageRequest,
    result: Result<PageStaged>,
}

/// Collector engine. Cheap to clone; clones share stores and observer.
#[derive(Clone)]
pub struct Collector {
    staging: Arc<dyn StagingStore>,
    tracker: StateTracker,
    progress: Arc<dyn ProgressObserver>,
    rate_limiter: Option<RateLimiter>,
}

impl Collector {
    pub fn new(staging: Arc<dyn StagingStore>, state: Arc<dyn StateStore>) -> Self {
        Self {
            staging,
            tracker: StateTracker::new(state),
            progress: Arc::new(TracingProgress),
            rate_limiter: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Share one limiter across every run of this collector instead of building
    /// one per run from the run's config.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn staging(&self) -> &Arc<dyn StagingStore> {
        &self.staging
    }

    /// Run a collection to completion.
    pub async fn execute<F: PageFetcher>(&self, spec: RunSpec, fetcher: F) -> Result<CollectorReport> {
        spec.config.validate()?;

        let run_start = Utc::now();
        let identity = Arc::new(spec.identity);
        let key = identity.key();
        let config = spec.config;

        let state = self
            .tracker
            .load(&identity, config.incremental, spec.created_after)
            .await?;
        let cutoff = state.cutoff(spec.created_after);
        let limiter = match &self.rate_limiter {
            Some(shared) => shared.clone(),
            None => RateLimiter::new(&config.rate_limit)?,
        };

        let mut inputs = spec.inputs;
        if inputs.is_empty() {
            inputs.push(Value::Null);
        }
        let lanes: Vec<Lane> = inputs
            .into_iter()
            .map(|input| Lane {
                input,
                pager: Pager::new(spec.mode, config.page_size, config.max_pages),
                closed: false,
            })
            .collect();

        self.progress.on_event(&ProgressEvent::RunStarted {
            identity: key.clone(),
            incremental: state.is_incremental,
            cutoff,
            inputs: lanes.len(),
        });

        let generation = if state.is_incremental {
            GenerationMode::Append
        } else {
            GenerationMode::Replace
        };
        let token = self.staging.begin_run(identity.clone(), generation).await?;

        let run = Run {
            identity: identity.clone(),
            token: token.clone(),
            staging: self.staging.clone(),
            progress: self.progress.clone(),
            fetcher: Arc::new(fetcher),
            limiter,
            retry: RetryPolicy::new(config.retry.clone()),
            cutoff,
            concurrency: config.concurrency,
            deadline: config.run_timeout(),
            cancel: spec.cancel,
        };
        let mut stats = RunStats::default();
        let outcome = run.drive(lanes, &mut stats).await;

        let outcome = match outcome {
            Ok(()) => self.finish(&token, run_start, spec.created_after).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.progress.on_event(&ProgressEvent::RunFinished {
                    identity: key.clone(),
                    pages: stats.pages,
                    records: stats.records,
                    outcome: RunOutcome::Succeeded,
                });
                Ok(CollectorReport {
                    identity: key,
                    run_start,
                    pages_fetched: stats.pages,
                    records_staged: stats.records,
                    finished_early: stats.finished_early,
                    incremental: state.is_incremental,
                    cutoff,
                })
            }
            Err(e) => {
                if let Err(abort_err) = self.staging.abort(&token).await {
                    warn!(identity = %key, error = %abort_err, "failed to discard generation");
                }
                let outcome = if e.is_canceled() {
                    RunOutcome::Canceled
                } else {
                    error!(identity = %key, error = %e, "collection failed");
                    RunOutcome::Failed
                };
                self.progress.on_event(&ProgressEvent::RunFinished {
                    identity: key,
                    pages: stats.pages,
                    records: stats.records,
                    outcome,
                });
                Err(e)
            }
        }
    }

    async fn finish(
        &self,
        token: &RunToken,
        run_start: DateTime<Utc>,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let published = self.staging.publish(token).await?;
        debug!(identity = %token.identity, records = published, "generation is now current");
        self.tracker
            .commit(&token.identity, run_start, created_after)
            .await?;
        Ok(())
    }
}

/// Per-run scheduling state shared by the coordinator and its workers.
struct Run<F> {
    identity: Arc<CollectionIdentity>,
    token: RunToken,
    staging: Arc<dyn StagingStore>,
    progress: Arc<dyn ProgressObserver>,
    fetcher: Arc<F>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    cutoff: Option<DateTime<Utc>>,
    concurrency: usize,
    deadline: Option<std::time::Duration>,
    cancel: CancellationToken,
}

impl<F: PageFetcher> Run<F> {
    async fn drive(&self, mut lanes: Vec<Lane>, stats: &mut RunStats) -> Result<()> {
        let mut tasks: JoinSet<PageDone> = JoinSet::new();
        let mut cursor = 0usize;
        let mut canceled = false;
        let deadline_at = self.deadline.map(|d| Instant::now() + d);

        loop {
            if !canceled {
                while tasks.len() < self.concurrency {
                    match next_request(&mut lanes, &mut cursor) {
                        Some((lane, request)) => {
                            self.spawn_page(&mut tasks, lane, lanes[lane].input.clone(), request)
                        }
                        None => break,
                    }
                }
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !canceled => {
                    info!(identity = %self.identity, in_flight = tasks.len(), "cancellation requested, draining");
                    canceled = true;
                }

                _ = wait_until(deadline_at) => {
                    let limit = self.deadline.unwrap_or_default();
                    warn!(identity = %self.identity, ?limit, "run deadline exceeded");
                    shutdown(&mut tasks).await;
                    return Err(IngestError::DeadlineExceeded(limit));
                }

                Some(joined) = tasks.join_next() => {
                    let done = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            shutdown(&mut tasks).await;
                            return Err(self.worker_lost(e));
                        }
                    };
                    if canceled {
                        continue;
                    }
                    if let Err(e) = self.on_page(&mut lanes, done, stats) {
                        shutdown(&mut tasks).await;
                        return Err(e);
                    }
                }
            }
        }

        if canceled || self.cancel.is_cancelled() {
            return Err(IngestError::Canceled {
                identity: self.identity.key(),
            });
        }
        Ok(())
    }

    fn on_page(&self, lanes: &mut [Lane], done: PageDone, stats: &mut RunStats) -> Result<()> {
        let staged = match done.result {
            Ok(staged) => staged,
            Err(e) => return Err(self.run_failed(done.lane, &done.request, e)),
        };

        stats.pages += 1;
        stats.records += staged.records as u64;
        self.progress.on_event(&ProgressEvent::PageFetched {
            identity: self.identity.key(),
            page: done.request.page,
            records: staged.records,
            finished_early: staged.early_finish,
        });

        let lane = &mut lanes[done.lane];
        if staged.early_finish {
            debug!(identity = %self.identity, lane = done.lane, page = done.request.page, "cutoff reached, closing lane");
            lane.closed = true;
            stats.finished_early = true;
        }
        lane.pager
            .observe(&done.request, &staged.page_info)
            .map_err(|e| self.run_failed(done.lane, &done.request, e))
    }

    fn spawn_page(&self, tasks: &mut JoinSet<PageDone>, lane: usize, input: Value, request: PageRequest) {
        let ctx = PageContext {
            identity: self.identity.clone(),
            input,
            input_index: lane,
            request: request.clone(),
            cutoff: self.cutoff,
        };
        let fetcher = self.fetcher.clone();
        let limiter = self.limiter.clone();
        let retry = self.retry.clone();
        let staging = self.staging.clone();
        let token = self.token.clone();

        tasks.spawn(async move {
            let result = fetch_and_stage(ctx, fetcher, limiter, retry, staging, token).await;
            PageDone {
                lane,
                request,
                result,
            }
        });
    }

    fn run_failed(&self, lane: usize, request: &PageRequest, source: IngestError) -> IngestError {
        let mut location = format!("input #{} page {}", lane, request.page);
        if let Some(cursor) = &request.cursor {
            location.push_str(&format!(" (cursor {})", cursor));
        }
        IngestError::RunFailed {
            identity: self.identity.key(),
            location,
            source: Box::new(source),
        }
    }

    fn worker_lost(&self, err: JoinError) -> IngestError {
        IngestError::Internal(format!(
            "page worker for {} did not complete: {}",
            self.identity, err
        ))
    }
}

/// Next request in round-robin order over the open lanes.
fn next_request(lanes: &mut [Lane], cursor: &mut usize) -> Option<(usize, PageRequest)> {
    let count = lanes.len();
    for step in 0..count {
        let idx = (*cursor + step) % count;
        let lane = &mut lanes[idx];
        if lane.closed {
            continue;
        }
        match lane.pager.next_page() {
            Advance::Request(request) => {
                *cursor = (idx + 1) % count;
                return Some((idx, request));
            }
            Advance::Wait => {}
            Advance::Exhausted => lane.closed = true,
        }
    }
    None
}

async fn fetch_and_stage<F: PageFetcher>(
    ctx: PageContext,
    fetcher: Arc<F>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    staging: Arc<dyn StagingStore>,
    token: RunToken,
) -> Result<PageStaged> {
    let label = format!("{} page {}", ctx.identity, ctx.request.page);
    let response = retry
        .run_after(
            &label,
            || {
                let limiter = limiter.clone();
                async move { limiter.acquire().await }
            },
            || {
                let fetcher = fetcher.clone();
                let ctx = ctx.clone();
                async move { fetcher.fetch(&ctx).await }
            },
        )
        .await?;

    let ParsedPage { outcome, page_info } = fetcher.parse(&ctx, response);
    let (units, early_finish) = match outcome {
        PageOutcome::Continue(units) => (units, false),
        PageOutcome::EarlyFinish(units) => (units, true),
        PageOutcome::Fatal(e) => return Err(e),
    };

    let source_input = json!({
        "input": ctx.input,
        "request": ctx.request,
    });
    let records = units.len();
    for unit in units {
        let key = fetcher.unit_key(&ctx, &unit).map(|k| scoped_key(&ctx, k));
        let payload = Bytes::from(serde_json::to_vec(&unit)?);
        staging.put(&token, payload, source_input.clone(), key).await?;
    }

    Ok(PageStaged {
        page_info,
        records,
        early_finish,
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Abort in-flight pages and wait for every worker to stop.
async fn shutdown(tasks: &mut JoinSet<PageDone>) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}
