//! Structured progress events emitted by the collector and extractor engines

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted {
        identity: String,
        incremental: bool,
        cutoff: Option<DateTime<Utc>>,
        inputs: usize,
    },
    PageFetched {
        identity: String,
        page: u64,
        records: usize,
        finished_early: bool,
    },
    RunFinished {
        identity: String,
        pages: u64,
        records: u64,
        outcome: RunOutcome,
    },
    ExtractionFinished {
        identity: String,
        raw_records: u64,
        typed_records: u64,
        outcome: RunOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Canceled,
}

/// Sink for progress events. Implementations must be cheap; they are called
/// from the scheduling loop.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Default observer: one tracing line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                identity,
                incremental,
                cutoff,
                inputs,
            } => info!(
                identity = %identity,
                incremental,
                cutoff = ?cutoff,
                inputs,
                "collection started"
            ),
            ProgressEvent::PageFetched {
                identity,
                page,
                records,
                finished_early,
            } => debug!(
                identity = %identity,
                page,
                records,
                finished_early,
                "page staged"
            ),
            ProgressEvent::RunFinished {
                identity,
                pages,
                records,
                outcome,
            } => match outcome {
                RunOutcome::Succeeded => {
                    info!(identity = %identity, pages, records, "collection finished")
                }
                _ => warn!(
                    identity = %identity,
                    pages,
                    records,
                    outcome = ?outcome,
                    "collection did not complete"
                ),
            },
            ProgressEvent::ExtractionFinished {
                identity,
                raw_records,
                typed_records,
                outcome,
            } => match outcome {
                RunOutcome::Succeeded => info!(
                    identity = %identity,
                    raw_records,
                    typed_records,
                    "extraction finished"
                ),
                _ => warn!(
                    identity = %identity,
                    raw_records,
                    outcome = ?outcome,
                    "extraction did not complete"
                ),
            },
        }
    }
}

/// Observer that keeps every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressObserver for RecordingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}
