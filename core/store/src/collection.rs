//! Local collection trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use wcpos_common::{CollectionName, RemoteId, Result};

/// Field holding the remote modification time, `YYYY-MM-DDTHH:MM:SS` in UTC.
pub const DATE_MODIFIED_FIELD: &str = "date_modified_gmt";

/// A document as stored in the local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    /// Remote identifier, also the local primary key.
    pub id: RemoteId,
    /// Remote modification time, if the backend reported one.
    pub date_modified_gmt: Option<String>,
    /// Full payload in the local schema.
    pub data: Value,
}

/// A document the store refused during a bulk upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedDocument {
    pub id: RemoteId,
    pub reason: String,
}

/// Outcome of a bulk upsert.
///
/// Only ids listed in `persisted` may be treated as synced by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkUpsertReport {
    pub persisted: Vec<RemoteId>,
    pub rejected: Vec<RejectedDocument>,
}

impl BulkUpsertReport {
    /// Number of documents persisted.
    pub fn applied(&self) -> usize {
        self.persisted.len()
    }

    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Parse a raw REST document into the local schema.
///
/// Requires an `id` field; keeps the whole payload as document data.
pub fn parse_rest_document(raw: Value) -> Result<LocalDocument> {
    let id = RemoteId::of_document(&raw)?;
    let date_modified_gmt = raw
        .get(DATE_MODIFIED_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(LocalDocument {
        id,
        date_modified_gmt,
        data: raw,
    })
}

/// Local replica of one remote resource collection.
///
/// The replication engine only needs point-in-time snapshots of the id sets;
/// how the store derives or indexes them is up to the implementation.
/// Implementations must be safe to call from several tasks at once.
#[async_trait]
pub trait LocalCollection: Send + Sync {
    /// Collection name, also the remote resource path.
    fn name(&self) -> &CollectionName;

    /// Ids of documents currently present locally.
    async fn synced_ids(&self) -> Result<Vec<RemoteId>>;

    /// Ids known to exist remotely that have not been pulled yet.
    async fn unsynced_ids(&self) -> Result<Vec<RemoteId>>;

    /// Mark ids as known-but-not-pulled.
    ///
    /// # Returns
    /// Number of ids that were not already marked.
    async fn add_unsynced(&self, ids: &[RemoteId]) -> Result<usize>;

    /// Clear the unsynced marker of ids that have been persisted.
    ///
    /// # Returns
    /// Number of markers removed.
    async fn remove_unsynced(&self, ids: &[RemoteId]) -> Result<usize>;

    /// Map a raw (already normalized) REST document into the local schema.
    fn parse_rest_response(&self, raw: Value) -> Result<LocalDocument>;

    /// Insert or replace a batch of documents.
    ///
    /// # Postconditions
    /// - Every id in `persisted` is present locally
    /// - Rejected documents leave the store untouched
    ///
    /// # Errors
    /// - The whole batch failed; nothing was persisted
    async fn bulk_upsert(&self, documents: Vec<LocalDocument>) -> Result<BulkUpsertReport>;

    /// Insert a single new document.
    ///
    /// # Errors
    /// - A document with the same id already exists
    async fn insert(&self, document: LocalDocument) -> Result<()>;

    /// Fetch a single document.
    async fn get(&self, id: &RemoteId) -> Result<Option<LocalDocument>>;

    /// Hard-delete a document and its unsynced marker.
    ///
    /// # Returns
    /// Whether anything was removed.
    async fn remove(&self, id: &RemoteId) -> Result<bool>;

    /// Hard-delete many documents.
    async fn bulk_remove(&self, ids: &[RemoteId]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.remove(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Read a value from the local-only metadata area.
    async fn get_local(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value to the local-only metadata area.
    ///
    /// Local values are never replicated and never show up as documents.
    async fn set_local(&self, key: &str, value: Value) -> Result<()>;
}
