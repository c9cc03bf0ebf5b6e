//! Extractor engine: staged payloads to typed records
//!
//! Extraction is all-or-nothing per identity. Every raw record of the current
//! generation goes through the transform in insertion order; only when all of them
//! succeed is the identity's previous output replaced by the new set.

use crate::error::{IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::progress::{ProgressEvent, ProgressObserver, RunOutcome, TracingProgress};
use crate::staging::{RawRecord, RecordSink, StagingStore};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractorReport {
    pub identity: String,
    pub raw_records: u64,
    pub typed_records: u64,
}

pub struct Extractor<T: Send + 'static> {
    staging: Arc<dyn StagingStore>,
    sink: Arc<dyn RecordSink<T>>,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Extractor<T> {
    pub fn new(staging: Arc<dyn StagingStore>, sink: Arc<dyn RecordSink<T>>) -> Self {
        Self {
            staging,
            sink,
            progress: Arc::new(TracingProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transform every staged record of `identity` and replace its output.
    ///
    /// `transform` maps one raw record to zero or more typed records. The first
    /// error aborts the run and leaves the stored output untouched.
    pub async fn execute<I, F>(&self, identity: &CollectionIdentity, mut transform: F) -> Result<ExtractorReport>
    where
        F: FnMut(&RawRecord) -> Result<I>,
        I: IntoIterator<Item = T>,
    {
        let key = identity.key();
        let mut raw_records = 0u64;
        let mut output: Vec<T> = Vec::new();

        let collected = async {
            let mut records = self.staging.list_all(identity);
            while let Some(record) = records.next().await {
                if self.cancel.is_cancelled() {
                    return Err(IngestError::Canceled {
                        identity: key.clone(),
                    });
                }
                let record = record?;
                raw_records += 1;

                let produced = transform(&record).map_err(|e| IngestError::Transform {
                    identity: key.clone(),
                    sequence: record.sequence,
                    message: e.to_string(),
                })?;
                output.extend(produced);
            }
            Ok::<(), IngestError>(())
        }
        .await;

        let result = match collected {
            Ok(()) => {
                let typed = output.len() as u64;
                self.sink
                    .replace(identity, output)
                    .await
                    .map(|_| ExtractorReport {
                        identity: key.clone(),
                        raw_records,
                        typed_records: typed,
                    })
            }
            Err(e) => Err(e),
        };

        let (typed_records, outcome) = match &result {
            Ok(report) => {
                debug!(identity = %key, typed = report.typed_records, "typed output replaced");
                (report.typed_records, RunOutcome::Succeeded)
            }
            Err(e) if e.is_canceled() => (0, RunOutcome::Canceled),
            Err(e) => {
                error!(identity = %key, error = %e, "extraction failed, previous output kept");
                (0, RunOutcome::Failed)
            }
        };
        self.progress.on_event(&ProgressEvent::ExtractionFinished {
            identity: key,
            raw_records,
            typed_records,
            outcome,
        });
        result
    }
}
