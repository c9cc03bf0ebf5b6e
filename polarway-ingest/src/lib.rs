//! Polarway Ingest
//! ===============
//!
//! Collector/extractor pipeline for pulling data out of third-party REST and
//! GraphQL APIs into a local store:
//! - Offset and cursor pagination behind one engine
//! - Bounded worker pool sharing a token-bucket rate limiter
//! - Exponential backoff on transient failures, fail-fast on protocol errors
//! - Incremental re-sync with early finish at the cutoff
//! - Raw staging published per generation, all-or-nothing extraction

pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod logging;
pub mod pagination;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod staging;
pub mod state;

pub use client::{ApiClient, ApiClientConfig};
pub use collector::{
    key_at, ApiCollector, ApiCollectorArgs, Collector, CollectorReport, CursorPageInfo,
    GraphqlCollector, GraphqlCollectorArgs, GraphqlQuery, PageContext, PageFetcher, RunSpec,
    UnitKey,
};
pub use config::{CollectorConfig, RateLimitConfig, RetryConfig};
pub use error::{FetchError, IngestError, Result};
pub use extractor::{Extractor, ExtractorReport};
pub use identity::CollectionIdentity;
pub use logging::init_tracing;
pub use pagination::{PageOutcome, PaginationMode, ParsedPage};
pub use progress::{ProgressEvent, ProgressObserver, RunOutcome, TracingProgress};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use staging::{
    FsSink, FsStore, GenerationMode, MemorySink, MemoryStore, RawRecord, RecordSink, StagingStore,
    StateStore,
};
pub use state::{split_at_cutoff, CollectorState, StateTracker};

pub use tokio_util::sync::CancellationToken;
