//! Id audit: reconcile the remote id space with the local one.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wcpos_common::{Error, RemoteId, ReplicationIdentifier, Result};
use wcpos_remote::RemoteResourceClient;
use wcpos_store::LocalCollection;

use crate::checkpoint::RunOutcome;
use crate::config::ReplicationConfig;
use crate::retry::RetryExecutor;
use crate::task::{Replicator, TaskTrigger};

/// Finds documents created or deleted remotely.
///
/// Each pass lists every remote id. Ids unknown locally are marked unsynced
/// for the sync task to pull; local ids the backend no longer lists are
/// hard-deleted. A failed listing changes nothing.
pub struct IdAuditReplicator {
    identifier: ReplicationIdentifier,
    collection: Arc<dyn LocalCollection>,
    remote: Arc<dyn RemoteResourceClient>,
    retry: RetryExecutor,
    follow_up: Option<TaskTrigger>,
}

impl IdAuditReplicator {
    /// Create an audit replicator comparing `collection` with `remote`.
    pub fn new(
        collection: Arc<dyn LocalCollection>,
        remote: Arc<dyn RemoteResourceClient>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            identifier: ReplicationIdentifier::audit(collection.name()),
            collection,
            remote,
            retry: RetryExecutor::new(config.request_retry()),
            follow_up: None,
        }
    }

    /// Trigger `sync` whenever a pass discovers new ids.
    pub fn with_follow_up(mut self, sync: TaskTrigger) -> Self {
        self.follow_up = Some(sync);
        self
    }

    /// Run one audit pass.
    ///
    /// Stale documents are deleted before new ids are marked. Each step is
    /// valid on its own, so a failure after the deletion leaves a consistent
    /// replica and the next pass marks whatever is still missing.
    pub async fn audit(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let resource = self.collection.name().as_str();

        let remote_ids = match self
            .retry
            .execute(cancel, || self.remote.all_ids(resource))
            .await
        {
            Err(Error::Cancelled(_)) => return Ok(RunOutcome::Discarded),
            result => result?,
        };
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Discarded);
        }

        let synced = self.collection.synced_ids().await?;
        let unsynced = self.collection.unsynced_ids().await?;

        let remote: HashSet<&RemoteId> = remote_ids.iter().collect();
        let local: HashSet<&RemoteId> = synced.iter().chain(unsynced.iter()).collect();

        let mut seen = HashSet::new();
        let discovered: Vec<RemoteId> = remote_ids
            .iter()
            .filter(|id| !local.contains(id) && seen.insert(*id))
            .cloned()
            .collect();
        let stale: Vec<RemoteId> = local
            .iter()
            .filter(|id| !remote.contains(*id))
            .map(|id| (*id).clone())
            .collect();

        debug!(
            replication = %self.identifier,
            remote = remote.len(),
            local = local.len(),
            discovered = discovered.len(),
            stale = stale.len(),
            "Audit diff computed"
        );

        let mut removed = 0;
        if !stale.is_empty() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Discarded);
            }
            removed = self.collection.bulk_remove(&stale).await?;
            info!(replication = %self.identifier, "Removed {} documents deleted remotely", removed);
        }

        if !discovered.is_empty() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Discarded);
            }
            let added = match self.collection.add_unsynced(&discovered).await {
                Ok(added) => added,
                Err(e) => {
                    warn!(
                        replication = %self.identifier,
                        removed,
                        "Failed to mark {} new ids after removals: {}",
                        discovered.len(),
                        e
                    );
                    return Err(e);
                }
            };
            info!(replication = %self.identifier, "Discovered {} new remote ids", added);

            if let Some(sync) = &self.follow_up {
                if !sync.run() {
                    debug!(replication = %self.identifier, "Sync task is gone; not triggering");
                }
            }
        }

        Ok(RunOutcome::Audited {
            remote: remote.len(),
            discovered: discovered.len(),
            removed,
        })
    }
}

#[async_trait]
impl Replicator for IdAuditReplicator {
    fn identifier(&self) -> &ReplicationIdentifier {
        &self.identifier
    }

    fn collection(&self) -> &Arc<dyn LocalCollection> {
        &self.collection
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.audit(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wcpos_common::CollectionName;
    use wcpos_remote::{MemoryRemote, RequestKind};
    use wcpos_store::{parse_rest_document, BulkUpsertReport, LocalDocument, MemoryCollection};
    use crate::config::MIN_RETRY_DELAY;

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
            .with_retry_delay(MIN_RETRY_DELAY)
            .with_jitter(false)
    }

    fn setup() -> (Arc<MemoryCollection>, Arc<MemoryRemote>, IdAuditReplicator) {
        let collection = Arc::new(MemoryCollection::new(CollectionName::new("customers").unwrap()));
        let remote = Arc::new(MemoryRemote::new());
        let audit = IdAuditReplicator::new(collection.clone(), remote.clone(), &config());
        (collection, remote, audit)
    }

    /// Delegates to a memory collection but refuses new unsynced markers.
    struct MarkerFailure(MemoryCollection);

    #[async_trait]
    impl LocalCollection for MarkerFailure {
        fn name(&self) -> &CollectionName {
            self.0.name()
        }
        async fn synced_ids(&self) -> Result<Vec<RemoteId>> {
            self.0.synced_ids().await
        }
        async fn unsynced_ids(&self) -> Result<Vec<RemoteId>> {
            self.0.unsynced_ids().await
        }
        async fn add_unsynced(&self, _ids: &[RemoteId]) -> Result<usize> {
            Err(Error::InvalidInput("marker index is read-only".to_string()))
        }
        async fn remove_unsynced(&self, ids: &[RemoteId]) -> Result<usize> {
            self.0.remove_unsynced(ids).await
        }
        fn parse_rest_response(&self, raw: serde_json::Value) -> Result<LocalDocument> {
            self.0.parse_rest_response(raw)
        }
        async fn bulk_upsert(&self, documents: Vec<LocalDocument>) -> Result<BulkUpsertReport> {
            self.0.bulk_upsert(documents).await
        }
        async fn insert(&self, document: LocalDocument) -> Result<()> {
            self.0.insert(document).await
        }
        async fn get(&self, id: &RemoteId) -> Result<Option<LocalDocument>> {
            self.0.get(id).await
        }
        async fn remove(&self, id: &RemoteId) -> Result<bool> {
            self.0.remove(id).await
        }
        async fn get_local(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.0.get_local(key).await
        }
        async fn set_local(&self, key: &str, value: serde_json::Value) -> Result<()> {
            self.0.set_local(key, value).await
        }
    }

    async fn add_local(collection: &MemoryCollection, id: u64) {
        collection
            .insert(parse_rest_document(json!({ "id": id })).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_discovers_new_remote_ids() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 5);
        add_local(&collection, 1).await;
        add_local(&collection, 2).await;

        let outcome = audit.audit(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Audited {
                remote: 5,
                discovered: 3,
                removed: 0
            }
        );
        assert_eq!(
            collection.unsynced_ids().await.unwrap(),
            vec![RemoteId::from(3), RemoteId::from(4), RemoteId::from(5)]
        );
    }

    #[tokio::test]
    async fn test_removes_ids_deleted_remotely() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 2);
        add_local(&collection, 1).await;
        add_local(&collection, 2).await;
        add_local(&collection, 7).await;
        collection.add_unsynced(&[RemoteId::from(9)]).await.unwrap();

        let outcome = audit.audit(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Audited {
                remote: 2,
                discovered: 0,
                removed: 2
            }
        );
        assert!(collection.get(&RemoteId::from(7)).await.unwrap().is_none());
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
        assert_eq!(collection.synced_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_listing_changes_nothing() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 3);
        add_local(&collection, 42).await;
        remote.set_offline(true);

        assert!(audit.audit(&CancellationToken::new()).await.is_err());
        assert_eq!(collection.synced_ids().await.unwrap(), vec![RemoteId::from(42)]);
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
        // Initial attempt plus the configured retries.
        assert_eq!(remote.request_count(RequestKind::AllIds), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_run() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 2);
        remote.fail_next(1);

        audit.audit(&CancellationToken::new()).await.unwrap();
        assert_eq!(collection.unsynced_ids().await.unwrap().len(), 2);
        assert_eq!(remote.request_count(RequestKind::AllIds), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_issues_no_request() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(audit.audit(&cancel).await.unwrap(), RunOutcome::Discarded);
        assert!(remote.requests().is_empty());
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_listing_discards_result() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 3);
        add_local(&collection, 99).await;
        let gate = remote.hold_requests();
        let cancel = CancellationToken::new();

        let audit = Arc::new(audit);
        let running = {
            let audit = audit.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { audit.audit(&cancel).await })
        };

        gate.entered().await;
        cancel.cancel();
        gate.release(1);

        assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Discarded);
        assert_eq!(collection.synced_ids().await.unwrap(), vec![RemoteId::from(99)]);
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let (collection, remote, audit) = setup();
        remote.seed("customers", 1, 4);

        audit.audit(&CancellationToken::new()).await.unwrap();
        let outcome = audit.audit(&CancellationToken::new()).await.unwrap();
        assert!(!outcome.mutated());
        assert_eq!(collection.unsynced_ids().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_marking_failure_after_removal_is_reported() {
        let inner = MemoryCollection::new(CollectionName::new("customers").unwrap());
        add_local(&inner, 1).await;
        add_local(&inner, 8).await;
        let collection = Arc::new(MarkerFailure(inner));
        let remote = Arc::new(MemoryRemote::new());
        remote.seed("customers", 1, 3);
        let audit = IdAuditReplicator::new(collection.clone(), remote, &config());

        let result = audit.audit(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        // The removal stands; only the stale id is gone.
        assert_eq!(collection.synced_ids().await.unwrap(), vec![RemoteId::from(1)]);
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }
}
