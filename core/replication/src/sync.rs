//! Document sync: pull outstanding documents in bounded batches.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wcpos_common::{Error, ReplicationIdentifier, Result};
use wcpos_remote::RemoteResourceClient;
use wcpos_store::LocalCollection;

use crate::batch::PullBatch;
use crate::checkpoint::RunOutcome;
use crate::config::ReplicationConfig;
use crate::normalize::normalize_document;
use crate::retry::RetryExecutor;
use crate::task::Replicator;

/// Pulls the full documents of ids the audit marked unsynced.
///
/// Each pass issues at most one request. Ids leave the unsynced set only
/// once the store reports their document as persisted.
pub struct SyncReplicator {
    identifier: ReplicationIdentifier,
    collection: Arc<dyn LocalCollection>,
    remote: Arc<dyn RemoteResourceClient>,
    retry: RetryExecutor,
    batch_limit: usize,
}

impl SyncReplicator {
    /// Create a sync replicator pulling `collection` from `remote`.
    pub fn new(
        collection: Arc<dyn LocalCollection>,
        remote: Arc<dyn RemoteResourceClient>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            identifier: ReplicationIdentifier::sync(collection.name()),
            collection,
            remote,
            retry: RetryExecutor::new(config.request_retry()),
            batch_limit: config.effective_batch_limit(),
        }
    }

    /// Run one pull pass.
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Discarded);
        }

        let synced = self.collection.synced_ids().await?;
        let unsynced = self.collection.unsynced_ids().await?;

        let Some(batch) = PullBatch::plan(&synced, &unsynced, self.batch_limit) else {
            debug!(replication = %self.identifier, "Nothing to pull");
            return Ok(RunOutcome::Idle);
        };
        debug!(
            replication = %self.identifier,
            filter = batch.filter().param(),
            ids = batch.len(),
            unsynced = unsynced.len(),
            "Pulling batch"
        );

        let resource = self.collection.name().as_str();
        let query = batch.to_query();
        let documents = match self
            .retry
            .execute(cancel, || self.remote.get(resource, &query))
            .await
        {
            Err(Error::Cancelled(_)) => return Ok(RunOutcome::Discarded),
            result => result?,
        };
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Discarded);
        }

        let received = documents.len();
        if received == 0 {
            debug!(replication = %self.identifier, "Backend returned no documents");
            return Ok(RunOutcome::Pulled {
                requested: batch.len(),
                received: 0,
                persisted: 0,
                rejected: 0,
            });
        }

        let pulled_at = Utc::now();
        let mut parsed = Vec::with_capacity(received);
        let mut rejected = 0;
        for raw in documents {
            match self
                .collection
                .parse_rest_response(normalize_document(raw, pulled_at))
            {
                Ok(doc) => parsed.push(doc),
                Err(e) => {
                    warn!(replication = %self.identifier, "Skipping unparseable document: {}", e);
                    rejected += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Discarded);
        }
        let report = self.collection.bulk_upsert(parsed).await?;
        for doc in &report.rejected {
            warn!(
                replication = %self.identifier,
                "Document {} not persisted: {}", doc.id, doc.reason
            );
        }
        self.collection.remove_unsynced(&report.persisted).await?;

        let persisted = report.applied();
        rejected += report.rejected.len();
        info!(
            replication = %self.identifier,
            "Pulled {} documents ({} persisted, {} rejected)", received, persisted, rejected
        );

        Ok(RunOutcome::Pulled {
            requested: batch.len(),
            received,
            persisted,
            rejected,
        })
    }
}

#[async_trait]
impl Replicator for SyncReplicator {
    fn identifier(&self) -> &ReplicationIdentifier {
        &self.identifier
    }

    fn collection(&self) -> &Arc<dyn LocalCollection> {
        &self.collection
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.pull(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wcpos_common::{CollectionName, RemoteId};
    use wcpos_remote::{IdFilter, MemoryRemote, RequestKind};
    use wcpos_store::{parse_rest_document, LocalDocument, MemoryCollection};

    use crate::audit::IdAuditReplicator;
    use crate::config::MIN_RETRY_DELAY;

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
            .with_retry_delay(MIN_RETRY_DELAY)
            .with_jitter(false)
    }

    fn ids(range: std::ops::Range<u64>) -> Vec<RemoteId> {
        range.map(RemoteId::from).collect()
    }

    fn setup(collection: MemoryCollection) -> (Arc<MemoryCollection>, Arc<MemoryRemote>, SyncReplicator) {
        let collection = Arc::new(collection);
        let remote = Arc::new(MemoryRemote::new());
        let sync = SyncReplicator::new(collection.clone(), remote.clone(), &config());
        (collection, remote, sync)
    }

    fn products() -> MemoryCollection {
        MemoryCollection::new(CollectionName::new("products").unwrap())
    }

    async fn add_local(collection: &MemoryCollection, range: std::ops::Range<u64>) {
        let docs = range
            .map(|id| parse_rest_document(json!({ "id": id })).unwrap())
            .collect();
        collection.bulk_upsert(docs).await.unwrap();
    }

    fn pulled_filter(remote: &MemoryRemote) -> IdFilter {
        remote
            .requests()
            .into_iter()
            .rev()
            .find(|r| r.kind == RequestKind::Get)
            .and_then(|r| r.query.filter)
            .unwrap()
    }

    #[tokio::test]
    async fn test_idle_when_nothing_outstanding() {
        let (collection, remote, sync) = setup(products());
        add_local(&collection, 0..20).await;

        assert_eq!(sync.pull(&CancellationToken::new()).await.unwrap(), RunOutcome::Idle);
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pulls_outstanding_documents() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 1, 3);
        collection.add_unsynced(&ids(1..4)).await.unwrap();

        let outcome = sync.pull(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Pulled {
                requested: 3,
                received: 3,
                persisted: 3,
                rejected: 0
            }
        );
        assert_eq!(collection.synced_ids().await.unwrap(), ids(1..4));
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_small_synced_set_uses_include() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 0, 1003);
        add_local(&collection, 0..3).await;
        collection.add_unsynced(&ids(3..1003)).await.unwrap();

        sync.pull(&CancellationToken::new()).await.unwrap();
        assert_eq!(pulled_filter(&remote), IdFilter::Include(ids(3..1003)));
    }

    #[tokio::test]
    async fn test_small_unsynced_set_uses_exclude() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 0, 1003);
        add_local(&collection, 0..1000).await;
        collection.add_unsynced(&ids(1000..1003)).await.unwrap();

        let outcome = sync.pull(&CancellationToken::new()).await.unwrap();
        assert_eq!(pulled_filter(&remote), IdFilter::Exclude(ids(0..1000)));
        assert!(matches!(outcome, RunOutcome::Pulled { persisted: 3, .. }));
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_response_is_not_an_error() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 1, 1);
        remote.delete("products", &RemoteId::from(1));
        collection.add_unsynced(&ids(1..2)).await.unwrap();

        let outcome = sync.pull(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Pulled { received: 0, .. }));
        assert_eq!(collection.unsynced_ids().await.unwrap(), ids(1..2));
    }

    #[tokio::test]
    async fn test_request_failure_applies_nothing() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 1, 2);
        collection.add_unsynced(&ids(1..3)).await.unwrap();
        remote.set_offline(true);

        assert!(sync.pull(&CancellationToken::new()).await.is_err());
        assert!(collection.synced_ids().await.unwrap().is_empty());
        assert_eq!(collection.unsynced_ids().await.unwrap(), ids(1..3));
    }

    #[tokio::test]
    async fn test_rejected_documents_stay_unsynced() {
        let (collection, remote, sync) =
            setup(products().with_rejector(Arc::new(|doc: &LocalDocument| {
                (doc.id == RemoteId::from(2)).then(|| "constraint violation".to_string())
            })));
        remote.seed("products", 1, 3);
        collection.add_unsynced(&ids(1..4)).await.unwrap();

        let outcome = sync.pull(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Pulled {
                requested: 3,
                received: 3,
                persisted: 2,
                rejected: 1
            }
        );
        assert_eq!(
            collection.synced_ids().await.unwrap(),
            vec![RemoteId::from(1), RemoteId::from(3)]
        );
        assert_eq!(collection.unsynced_ids().await.unwrap(), ids(2..3));
    }

    #[tokio::test]
    async fn test_unparseable_document_counted_as_rejected() {
        let (collection, remote, sync) =
            setup(products().with_parser(Arc::new(|raw: Value| {
                if raw["name"] == "products 2" {
                    return Err(Error::Serialization("bad price".to_string()));
                }
                parse_rest_document(raw)
            })));
        remote.seed("products", 1, 2);
        collection.add_unsynced(&ids(1..3)).await.unwrap();

        let outcome = sync.pull(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Pulled { persisted: 1, rejected: 1, .. }));
        assert_eq!(collection.unsynced_ids().await.unwrap(), ids(2..3));
    }

    #[tokio::test]
    async fn test_missing_timestamp_backfilled_before_parse() {
        let (collection, remote, sync) =
            setup(products().with_parser(Arc::new(|raw: Value| {
                let stamp = raw["date_modified_gmt"].as_str().unwrap_or_default();
                if stamp.len() != 19 || stamp.contains('.') {
                    return Err(Error::Serialization(format!("unexpected timestamp {:?}", stamp)));
                }
                parse_rest_document(raw)
            })));
        remote.put("products", json!({ "id": 5, "name": "Mug" })).unwrap();
        remote
            .put("products", json!({ "id": 6, "date_modified_gmt": "2021-02-03T04:05:06" }))
            .unwrap();
        collection.add_unsynced(&ids(5..7)).await.unwrap();

        sync.pull(&CancellationToken::new()).await.unwrap();

        let backfilled = collection.get(&RemoteId::from(5)).await.unwrap().unwrap();
        assert!(backfilled.date_modified_gmt.is_some());
        let kept = collection.get(&RemoteId::from(6)).await.unwrap().unwrap();
        assert_eq!(kept.date_modified_gmt.as_deref(), Some("2021-02-03T04:05:06"));
    }

    #[tokio::test]
    async fn test_cancel_during_request_discards_documents() {
        let (collection, remote, sync) = setup(products());
        remote.seed("products", 1, 3);
        collection.add_unsynced(&ids(1..4)).await.unwrap();
        let gate = remote.hold_requests();
        let cancel = CancellationToken::new();

        let sync = Arc::new(sync);
        let running = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.pull(&cancel).await })
        };

        gate.entered().await;
        cancel.cancel();
        gate.release(1);

        assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Discarded);
        assert!(collection.synced_ids().await.unwrap().is_empty());
        assert_eq!(collection.unsynced_ids().await.unwrap(), ids(1..4));
        assert_eq!(remote.request_count(RequestKind::Get), 1);
    }

    #[tokio::test]
    async fn test_converges_within_batch_bound() {
        let collection = Arc::new(products());
        let remote = Arc::new(MemoryRemote::new());
        remote.seed("products", 1, 2500);
        let audit = IdAuditReplicator::new(collection.clone(), remote.clone(), &config());
        let sync = SyncReplicator::new(collection.clone(), remote.clone(), &config());
        let cancel = CancellationToken::new();

        audit.audit(&cancel).await.unwrap();
        // ceil(2500 / 1000) passes.
        for _ in 0..3 {
            sync.pull(&cancel).await.unwrap();
        }

        assert_eq!(collection.synced_ids().await.unwrap().len(), 2500);
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
        assert_eq!(sync.pull(&cancel).await.unwrap(), RunOutcome::Idle);
        assert_eq!(remote.request_count(RequestKind::Get), 3);
    }
}
