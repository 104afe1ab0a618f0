//! In-memory local collection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use wcpos_common::{CollectionName, Error, RemoteId, Result};

use crate::collection::{
    parse_rest_document, BulkUpsertReport, LocalCollection, LocalDocument, RejectedDocument,
};

/// Maps a raw REST document into the local schema.
pub type DocumentParser = Arc<dyn Fn(Value) -> Result<LocalDocument> + Send + Sync>;

/// Decides whether the store refuses a document; returns the reason if so.
pub type DocumentRejector = Arc<dyn Fn(&LocalDocument) -> Option<String> + Send + Sync>;

/// Counts published after every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub synced: usize,
    pub unsynced: usize,
}

/// Serializable image of a collection, used to keep a replica across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub name: CollectionName,
    pub documents: Vec<LocalDocument>,
    pub unsynced: Vec<RemoteId>,
    #[serde(default)]
    pub local: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: BTreeMap<RemoteId, LocalDocument>,
    unsynced: BTreeSet<RemoteId>,
    local: BTreeMap<String, Value>,
}

impl Inner {
    fn stats(&self) -> CollectionStats {
        CollectionStats {
            synced: self.documents.len(),
            unsynced: self.unsynced.len(),
        }
    }
}

/// In-memory collection.
///
/// Useful for tests and for the command line replica. Contents can be saved
/// to and restored from a JSON snapshot.
pub struct MemoryCollection {
    name: CollectionName,
    inner: RwLock<Inner>,
    parser: DocumentParser,
    rejector: Option<DocumentRejector>,
    stats_tx: watch::Sender<CollectionStats>,
}

impl MemoryCollection {
    /// Create an empty collection using the default REST parser.
    pub fn new(name: CollectionName) -> Self {
        let (stats_tx, _) = watch::channel(CollectionStats::default());
        Self {
            name,
            inner: RwLock::new(Inner::default()),
            parser: Arc::new(parse_rest_document),
            rejector: None,
            stats_tx,
        }
    }

    /// Use a collection-specific parser.
    pub fn with_parser(mut self, parser: DocumentParser) -> Self {
        self.parser = parser;
        self
    }

    /// Refuse documents for which `rejector` returns a reason.
    pub fn with_rejector(mut self, rejector: DocumentRejector) -> Self {
        self.rejector = Some(rejector);
        self
    }

    /// Subscribe to synced/unsynced counts.
    pub fn subscribe(&self) -> watch::Receiver<CollectionStats> {
        self.stats_tx.subscribe()
    }

    /// Current synced/unsynced counts.
    pub async fn stats(&self) -> CollectionStats {
        self.inner.read().await.stats()
    }

    fn publish(&self, inner: &Inner) {
        self.stats_tx.send_replace(inner.stats());
    }

    /// Capture the full contents.
    pub async fn snapshot(&self) -> CollectionSnapshot {
        let inner = self.inner.read().await;
        CollectionSnapshot {
            name: self.name.clone(),
            documents: inner.documents.values().cloned().collect(),
            unsynced: inner.unsynced.iter().cloned().collect(),
            local: inner.local.clone(),
        }
    }

    /// Replace the contents with a snapshot.
    ///
    /// # Errors
    /// - Snapshot belongs to a different collection
    pub async fn restore(&self, snapshot: CollectionSnapshot) -> Result<()> {
        if snapshot.name != self.name {
            return Err(Error::InvalidInput(format!(
                "Snapshot of '{}' cannot be restored into '{}'",
                snapshot.name, self.name
            )));
        }

        let mut inner = self.inner.write().await;
        inner.documents = snapshot
            .documents
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();
        inner.unsynced = snapshot.unsynced.into_iter().collect();
        inner.local = snapshot.local;
        self.publish(&inner);
        Ok(())
    }

    /// Serialize to JSON.
    pub async fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot().await)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub async fn from_json(json: &str) -> Result<Self> {
        let snapshot: CollectionSnapshot =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let collection = Self::new(snapshot.name.clone());
        collection.restore(snapshot).await?;
        Ok(collection)
    }

    /// Write a snapshot file, replacing any previous one atomically.
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json().await?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;

        debug!("Saved {} snapshot to {}", self.name, path.display());
        Ok(())
    }

    /// Load a snapshot file into this collection, if the file exists.
    ///
    /// # Returns
    /// Whether a snapshot was found.
    pub async fn load_from(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let json = match fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        };
        let snapshot: CollectionSnapshot =
            serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        self.restore(snapshot).await?;
        Ok(true)
    }
}

#[async_trait]
impl LocalCollection for MemoryCollection {
    fn name(&self) -> &CollectionName {
        &self.name
    }

    async fn synced_ids(&self) -> Result<Vec<RemoteId>> {
        Ok(self.inner.read().await.documents.keys().cloned().collect())
    }

    async fn unsynced_ids(&self) -> Result<Vec<RemoteId>> {
        Ok(self.inner.read().await.unsynced.iter().cloned().collect())
    }

    async fn add_unsynced(&self, ids: &[RemoteId]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let added = ids
            .iter()
            .filter(|id| inner.unsynced.insert((*id).clone()))
            .count();
        self.publish(&inner);
        Ok(added)
    }

    async fn remove_unsynced(&self, ids: &[RemoteId]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let removed = ids.iter().filter(|id| inner.unsynced.remove(*id)).count();
        self.publish(&inner);
        Ok(removed)
    }

    fn parse_rest_response(&self, raw: Value) -> Result<LocalDocument> {
        (self.parser)(raw)
    }

    async fn bulk_upsert(&self, documents: Vec<LocalDocument>) -> Result<BulkUpsertReport> {
        let mut report = BulkUpsertReport::default();
        let mut inner = self.inner.write().await;

        for doc in documents {
            if let Some(reason) = self.rejector.as_ref().and_then(|reject| reject(&doc)) {
                report.rejected.push(RejectedDocument { id: doc.id, reason });
                continue;
            }
            report.persisted.push(doc.id.clone());
            inner.documents.insert(doc.id.clone(), doc);
        }

        self.publish(&inner);
        Ok(report)
    }

    async fn insert(&self, document: LocalDocument) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.documents.contains_key(&document.id) {
            return Err(Error::AlreadyExists(format!(
                "Document {} already exists in {}",
                document.id, self.name
            )));
        }
        inner.documents.insert(document.id.clone(), document);
        self.publish(&inner);
        Ok(())
    }

    async fn get(&self, id: &RemoteId) -> Result<Option<LocalDocument>> {
        Ok(self.inner.read().await.documents.get(id).cloned())
    }

    async fn remove(&self, id: &RemoteId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let had_doc = inner.documents.remove(id).is_some();
        let had_marker = inner.unsynced.remove(id);
        self.publish(&inner);
        Ok(had_doc || had_marker)
    }

    async fn bulk_remove(&self, ids: &[RemoteId]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        for id in ids {
            let had_doc = inner.documents.remove(id).is_some();
            let had_marker = inner.unsynced.remove(id);
            if had_doc || had_marker {
                removed += 1;
            }
        }
        self.publish(&inner);
        Ok(removed)
    }

    async fn get_local(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().await.local.get(key).cloned())
    }

    async fn set_local(&self, key: &str, value: Value) -> Result<()> {
        self.inner.write().await.local.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products() -> MemoryCollection {
        MemoryCollection::new(CollectionName::new("products").unwrap())
    }

    fn doc(id: u64) -> LocalDocument {
        parse_rest_document(json!({ "id": id, "name": format!("Product {}", id) })).unwrap()
    }

    #[tokio::test]
    async fn test_bulk_upsert_and_ids() {
        let collection = products();
        collection.add_unsynced(&[1.into(), 2.into()]).await.unwrap();

        let report = collection.bulk_upsert(vec![doc(1), doc(2)]).await.unwrap();
        assert_eq!(report.applied(), 2);
        assert!(report.is_complete());

        assert_eq!(
            collection.synced_ids().await.unwrap(),
            vec![RemoteId::from(1), RemoteId::from(2)]
        );
        // Upsert alone does not clear markers; the replicator does.
        assert_eq!(collection.unsynced_ids().await.unwrap().len(), 2);
        assert_eq!(collection.remove_unsynced(&[1.into(), 2.into()]).await.unwrap(), 2);
        assert!(collection.unsynced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_document() {
        let collection = products();
        collection.bulk_upsert(vec![doc(1)]).await.unwrap();

        let updated = parse_rest_document(json!({ "id": 1, "name": "Renamed" })).unwrap();
        collection.bulk_upsert(vec![updated]).await.unwrap();

        let stored = collection.get(&1.into()).await.unwrap().unwrap();
        assert_eq!(stored.data["name"], "Renamed");
        assert_eq!(collection.stats().await.synced, 1);
    }

    #[tokio::test]
    async fn test_rejector_partial_failure() {
        let collection = products().with_rejector(Arc::new(|doc: &LocalDocument| {
            (doc.id == RemoteId::from(2)).then(|| "invalid price".to_string())
        }));

        let report = collection.bulk_upsert(vec![doc(1), doc(2), doc(3)]).await.unwrap();
        assert_eq!(report.persisted, vec![RemoteId::from(1), RemoteId::from(3)]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].id, RemoteId::from(2));
        assert!(collection.get(&2.into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails() {
        let collection = products();
        collection.insert(doc(1)).await.unwrap();
        assert!(matches!(
            collection.insert(doc(1)).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_clears_document_and_marker() {
        let collection = products();
        collection.bulk_upsert(vec![doc(1)]).await.unwrap();
        collection.add_unsynced(&[2.into()]).await.unwrap();

        assert_eq!(
            collection.bulk_remove(&[1.into(), 2.into(), 3.into()]).await.unwrap(),
            2
        );
        assert_eq!(collection.stats().await, CollectionStats::default());
        assert!(!collection.remove(&1.into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_area_is_not_a_document() {
        let collection = products();
        collection
            .set_local("products-audit", json!({ "runs": 1 }))
            .await
            .unwrap();

        assert_eq!(
            collection.get_local("products-audit").await.unwrap(),
            Some(json!({ "runs": 1 }))
        );
        assert!(collection.synced_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_subscription() {
        let collection = products();
        let rx = collection.subscribe();

        collection.add_unsynced(&[1.into(), 2.into()]).await.unwrap();
        assert_eq!(*rx.borrow(), CollectionStats { synced: 0, unsynced: 2 });

        collection.bulk_upsert(vec![doc(1)]).await.unwrap();
        assert_eq!(*rx.borrow(), CollectionStats { synced: 1, unsynced: 2 });
    }

    #[tokio::test]
    async fn test_snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");

        let collection = products();
        collection.bulk_upsert(vec![doc(1)]).await.unwrap();
        collection.add_unsynced(&[2.into()]).await.unwrap();
        collection.set_local("k", json!("v")).await.unwrap();
        collection.save_to(&path).await.unwrap();

        let restored = products();
        assert!(restored.load_from(&path).await.unwrap());
        assert_eq!(restored.stats().await, CollectionStats { synced: 1, unsynced: 1 });
        assert_eq!(restored.get_local("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let collection = products();
        assert!(!collection.load_from(dir.path().join("none.json")).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_rejects_other_collection() {
        let customers = MemoryCollection::new(CollectionName::new("customers").unwrap());
        let snapshot = customers.snapshot().await;
        assert!(products().restore(snapshot).await.is_err());
    }
}
