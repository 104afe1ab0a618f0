//! Per-task replication checkpoints.
//!
//! Each task keeps a small status record in its collection's local-only
//! metadata area, keyed by the task identifier. It survives restarts of the
//! replica and lets callers see why progress stalled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use wcpos_common::{ReplicationIdentifier, Result};
use wcpos_store::LocalCollection;

/// What a single replication run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing was outstanding; no request was issued.
    Idle,
    /// A sync pass pulled a batch.
    Pulled {
        /// Ids listed in the request filter.
        requested: usize,
        /// Documents returned by the backend.
        received: usize,
        /// Documents persisted and marked synced.
        persisted: usize,
        /// Documents refused by the parser or the store; they stay unsynced.
        rejected: usize,
    },
    /// An audit pass reconciled the id spaces.
    Audited {
        /// Ids listed by the backend.
        remote: usize,
        /// Remote ids newly marked unsynced.
        discovered: usize,
        /// Local ids hard-deleted because the backend no longer lists them.
        removed: usize,
    },
    /// The task was cancelled while the run was in flight; its result was
    /// dropped without touching the collection.
    Discarded,
}

impl RunOutcome {
    /// Whether the run changed the collection.
    pub fn mutated(&self) -> bool {
        match self {
            RunOutcome::Idle | RunOutcome::Discarded => false,
            RunOutcome::Pulled { persisted, .. } => *persisted > 0,
            RunOutcome::Audited {
                discovered,
                removed,
                ..
            } => *discovered > 0 || *removed > 0,
        }
    }
}

/// Status record of one replication task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    /// Id of the latest run, as logged by the task.
    pub last_run_id: Option<Uuid>,
    /// When the latest run started.
    pub last_started: Option<DateTime<Utc>>,
    /// When the latest run finished, successfully or not.
    pub last_finished: Option<DateTime<Utc>>,
    /// When a run last succeeded.
    pub last_success: Option<DateTime<Utc>>,
    /// Total finished runs.
    pub runs: u64,
    /// Failed runs since the last success.
    pub consecutive_failures: u32,
    /// Error of the latest failed run, cleared on success.
    pub last_error: Option<String>,
    /// Outcome of the latest successful run.
    pub last_outcome: Option<RunOutcome>,
}

impl ReplicationCheckpoint {
    /// Mark a run as started and assign it an id.
    pub fn mark_started(&mut self) -> Uuid {
        let run_id = Uuid::new_v4();
        self.last_run_id = Some(run_id);
        self.last_started = Some(Utc::now());
        run_id
    }

    /// Mark a run as succeeded.
    pub fn mark_succeeded(&mut self, outcome: RunOutcome) {
        let now = Utc::now();
        self.last_finished = Some(now);
        self.last_success = Some(now);
        self.runs += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_outcome = Some(outcome);
    }

    /// Mark a run as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_finished = Some(Utc::now());
        self.runs += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
    }

    /// Load the checkpoint of a task, or a fresh one.
    ///
    /// A record that no longer deserializes is replaced rather than failing
    /// the task.
    pub async fn load(
        collection: &dyn LocalCollection,
        identifier: &ReplicationIdentifier,
    ) -> Result<Self> {
        let key = identifier.to_string();
        match collection.get_local(&key).await? {
            None => Ok(Self::default()),
            Some(value) => match serde_json::from_value(value) {
                Ok(checkpoint) => Ok(checkpoint),
                Err(e) => {
                    warn!("Discarding unreadable checkpoint {}: {}", key, e);
                    Ok(Self::default())
                }
            },
        }
    }

    /// Persist the checkpoint of a task.
    pub async fn store(
        &self,
        collection: &dyn LocalCollection,
        identifier: &ReplicationIdentifier,
    ) -> Result<()> {
        let value = serde_json::to_value(self)?;
        collection.set_local(&identifier.to_string(), value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wcpos_common::CollectionName;
    use wcpos_store::MemoryCollection;

    #[test]
    fn test_success_resets_failures() {
        let mut checkpoint = ReplicationCheckpoint::default();
        let run_id = checkpoint.mark_started();
        assert_eq!(checkpoint.last_run_id, Some(run_id));
        checkpoint.mark_failed("HTTP 503: Service Unavailable");
        checkpoint.mark_failed("HTTP 503: Service Unavailable");
        assert_eq!(checkpoint.consecutive_failures, 2);
        assert!(checkpoint.last_success.is_none());

        checkpoint.mark_succeeded(RunOutcome::Idle);
        assert_eq!(checkpoint.consecutive_failures, 0);
        assert_eq!(checkpoint.runs, 3);
        assert!(checkpoint.last_error.is_none());
        assert_eq!(checkpoint.last_outcome, Some(RunOutcome::Idle));
    }

    #[test]
    fn test_outcome_mutated() {
        assert!(!RunOutcome::Idle.mutated());
        assert!(!RunOutcome::Discarded.mutated());
        assert!(RunOutcome::Audited {
            remote: 3,
            discovered: 0,
            removed: 1
        }
        .mutated());
        assert!(!RunOutcome::Pulled {
            requested: 2,
            received: 2,
            persisted: 0,
            rejected: 2
        }
        .mutated());
    }

    #[test]
    fn test_outcome_json_shape() {
        let value = serde_json::to_value(RunOutcome::Audited {
            remote: 10,
            discovered: 2,
            removed: 1,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "kind": "audited", "remote": 10, "discovered": 2, "removed": 1 })
        );
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let name = CollectionName::new("taxes").unwrap();
        let collection = MemoryCollection::new(name.clone());
        let identifier = ReplicationIdentifier::sync(&name);

        let fresh = ReplicationCheckpoint::load(&collection, &identifier).await.unwrap();
        assert_eq!(fresh, ReplicationCheckpoint::default());

        let mut checkpoint = fresh;
        checkpoint.mark_failed("offline");
        checkpoint.store(&collection, &identifier).await.unwrap();

        let loaded = ReplicationCheckpoint::load(&collection, &identifier).await.unwrap();
        assert_eq!(loaded.consecutive_failures, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_replaced() {
        let name = CollectionName::new("taxes").unwrap();
        let collection = MemoryCollection::new(name.clone());
        let identifier = ReplicationIdentifier::audit(&name);
        collection
            .set_local("taxes-audit", json!("garbage"))
            .await
            .unwrap();

        let loaded = ReplicationCheckpoint::load(&collection, &identifier).await.unwrap();
        assert_eq!(loaded, ReplicationCheckpoint::default());
    }
}
