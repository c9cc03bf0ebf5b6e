//! Incremental collection state
//!
//! A run loads the state for its identity once, before the first request, and
//! commits it once, after the generation was published. A run that fails or is
//! canceled never touches the stored state.

use crate::error::{IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::pagination::PageOutcome;
use crate::staging::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorState {
    pub identity_key: String,
    /// Start time of the last successful run
    pub latest_success_start: Option<DateTime<Utc>>,
    /// Caller cutoff that run was made with
    pub created_after: Option<DateTime<Utc>>,
    /// Whether the current run resumes from `latest_success_start`
    #[serde(skip)]
    pub is_incremental: bool,
}

impl CollectorState {
    fn first_run(identity: &CollectionIdentity) -> Self {
        Self {
            identity_key: identity.key(),
            latest_success_start: None,
            created_after: None,
            is_incremental: false,
        }
    }

    /// Cutoff for the current run given the caller's explicit bound.
    pub fn cutoff(&self, explicit: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let resumed = if self.is_incremental {
            self.latest_success_start
        } else {
            None
        };
        effective_cutoff(explicit, resumed)
    }
}

/// The later of the two bounds when both are present, else whichever is.
pub fn effective_cutoff(
    explicit: Option<DateTime<Utc>>,
    latest_success_start: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (explicit, latest_success_start) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Loads and commits [`CollectorState`] through a [`StateStore`].
#[derive(Clone)]
pub struct StateTracker {
    store: Arc<dyn StateStore>,
}

impl StateTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// State for a run about to start.
    ///
    /// The run is incremental only when the caller asks for it, a previous run
    /// succeeded, and that run used the same explicit cutoff. A changed cutoff
    /// forces a full sync.
    pub async fn load(
        &self,
        identity: &CollectionIdentity,
        incremental_requested: bool,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<CollectorState> {
        let mut state = match self.store.load_state(identity).await? {
            Some(stored) => stored,
            None => {
                debug!(identity = %identity, "no previous state, first run");
                return Ok(CollectorState::first_run(identity));
            }
        };

        let cutoff_changed = state.created_after != created_after;
        state.is_incremental =
            incremental_requested && state.latest_success_start.is_some() && !cutoff_changed;

        if incremental_requested && cutoff_changed {
            info!(
                identity = %identity,
                previous = ?state.created_after,
                requested = ?created_after,
                "cutoff changed since last run, doing a full sync"
            );
        }
        Ok(state)
    }

    /// Record a successful run that started at `run_start`.
    pub async fn commit(
        &self,
        identity: &CollectionIdentity,
        run_start: DateTime<Utc>,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<CollectorState> {
        let state = CollectorState {
            identity_key: identity.key(),
            latest_success_start: Some(run_start),
            created_after,
            is_incremental: false,
        };

        self.store
            .save_state(&state)
            .await
            .map_err(|e| IngestError::StateCommit {
                identity: identity.key(),
                message: e.to_string(),
            })?;
        debug!(identity = %identity, run_start = %run_start, "collector state committed");
        Ok(state)
    }
}

/// Cut a newest-first page at `cutoff`.
///
/// Items created at or after the cutoff are kept. The first older item ends the
/// page with [`PageOutcome::EarlyFinish`]; it and everything after it are dropped.
/// Items without a creation time are kept.
pub fn split_at_cutoff<T, F>(items: Vec<T>, cutoff: Option<DateTime<Utc>>, created_at: F) -> PageOutcome<T>
where
    F: Fn(&T) -> Option<DateTime<Utc>>,
{
    let Some(cutoff) = cutoff else {
        return PageOutcome::Continue(items);
    };

    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        match created_at(&item) {
            Some(created) if created < cutoff => return PageOutcome::EarlyFinish(kept),
            _ => kept.push(item),
        }
    }
    PageOutcome::Continue(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn identity() -> CollectionIdentity {
        CollectionIdentity::new("github", 1, "github_api_pull_requests").with_param("repo_id", 12)
    }

    #[test]
    fn test_effective_cutoff() {
        assert_eq!(effective_cutoff(None, None), None);
        assert_eq!(effective_cutoff(Some(at(5)), None), Some(at(5)));
        assert_eq!(effective_cutoff(None, Some(at(7))), Some(at(7)));
        assert_eq!(effective_cutoff(Some(at(5)), Some(at(7))), Some(at(7)));
        assert_eq!(effective_cutoff(Some(at(9)), Some(at(7))), Some(at(9)));
    }

    #[tokio::test]
    async fn test_first_run_is_not_incremental() {
        let tracker = StateTracker::new(Arc::new(MemoryStore::new()));
        let state = tracker.load(&identity(), true, None).await.unwrap();

        assert!(!state.is_incremental);
        assert_eq!(state.cutoff(Some(at(3))), Some(at(3)));
    }

    #[tokio::test]
    async fn test_commit_then_load_resumes() {
        let tracker = StateTracker::new(Arc::new(MemoryStore::new()));
        let id = identity();
        tracker.commit(&id, at(100), None).await.unwrap();

        let resumed = tracker.load(&id, true, None).await.unwrap();
        assert!(resumed.is_incremental);
        assert_eq!(resumed.cutoff(None), Some(at(100)));

        let full = tracker.load(&id, false, None).await.unwrap();
        assert!(!full.is_incremental);
        assert_eq!(full.cutoff(None), None);
    }

    #[tokio::test]
    async fn test_changed_cutoff_forces_full_sync() {
        let tracker = StateTracker::new(Arc::new(MemoryStore::new()));
        let id = identity();
        tracker.commit(&id, at(100), Some(at(10))).await.unwrap();

        let same = tracker.load(&id, true, Some(at(10))).await.unwrap();
        assert!(same.is_incremental);

        let changed = tracker.load(&id, true, Some(at(20))).await.unwrap();
        assert!(!changed.is_incremental);
        assert_eq!(changed.cutoff(Some(at(20))), Some(at(20)));
    }

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn load_state(&self, _identity: &CollectionIdentity) -> Result<Option<CollectorState>> {
            Ok(None)
        }

        async fn save_state(&self, _state: &CollectorState) -> Result<()> {
            Err(IngestError::Store("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_commit_failure_is_state_commit_error() {
        let tracker = StateTracker::new(Arc::new(BrokenStore));
        let err = tracker.commit(&identity(), at(1), None).await.unwrap_err();
        assert!(matches!(err, IngestError::StateCommit { .. }));
    }

    #[test]
    fn test_split_keeps_boundary_record() {
        let items = vec![5, 4, 3, 2, 1];
        match split_at_cutoff(items, Some(at(3)), |t| Some(at(*t))) {
            PageOutcome::EarlyFinish(kept) => assert_eq!(kept, vec![5, 4, 3]),
            other => panic!("expected early finish, got {:?}", other),
        }
    }

    #[test]
    fn test_split_without_older_items_continues() {
        let items = vec![9, 8];
        assert!(matches!(
            split_at_cutoff(items.clone(), Some(at(3)), |t| Some(at(*t))),
            PageOutcome::Continue(kept) if kept == items
        ));
        assert!(matches!(
            split_at_cutoff(vec![1, 0], None, |t| Some(at(*t))),
            PageOutcome::Continue(kept) if kept.len() == 2
        ));
    }
}
