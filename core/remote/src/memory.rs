//! In-memory remote backend for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

use wcpos_common::{Error, RemoteId, Result};

use crate::client::{RemoteResourceClient, ResourceQuery};

/// Page size when a query does not set one.
pub const DEFAULT_PER_PAGE: u32 = 10;

/// Which client method a recorded request went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    AllIds,
    Ping,
}

/// A request seen by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub kind: RequestKind,
    pub resource: String,
    pub query: ResourceQuery,
}

/// Holds requests until released, so tests can act while one is in flight.
pub struct RequestGate {
    entered: Notify,
    release: Semaphore,
}

impl RequestGate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a request is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` parked (or future) requests through.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

/// In-memory backend.
///
/// Serves documents per resource, honours `include`/`exclude`/`page`/`per_page`
/// and records every request. Failures can be injected.
#[derive(Default)]
pub struct MemoryRemote {
    resources: Mutex<HashMap<String, BTreeMap<RemoteId, Value>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    offline: AtomicBool,
    failures: AtomicUsize,
    gate: Mutex<Option<Arc<RequestGate>>>,
}

impl MemoryRemote {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a document. The document must carry an `id`.
    pub fn put(&self, resource: &str, document: Value) -> Result<RemoteId> {
        let id = RemoteId::of_document(&document)?;
        Self::lock(&self.resources)
            .entry(resource.to_string())
            .or_default()
            .insert(id.clone(), document);
        Ok(id)
    }

    /// Insert `count` generated documents with ids `start..start + count`.
    pub fn seed(&self, resource: &str, start: u64, count: u64) {
        let mut resources = Self::lock(&self.resources);
        let docs = resources.entry(resource.to_string()).or_default();
        for id in start..start + count {
            docs.insert(
                RemoteId::from(id),
                serde_json::json!({ "id": id, "name": format!("{} {}", resource, id) }),
            );
        }
    }

    /// Delete a document. Returns whether it existed.
    pub fn delete(&self, resource: &str, id: &RemoteId) -> bool {
        Self::lock(&self.resources)
            .get_mut(resource)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Ids currently served for a resource.
    pub fn ids(&self, resource: &str) -> Vec<RemoteId> {
        Self::lock(&self.resources)
            .get(resource)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every request fail with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` requests with HTTP 503.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Park every subsequent request at a gate until released.
    pub fn hold_requests(&self) -> Arc<RequestGate> {
        let gate = Arc::new(RequestGate::new());
        *Self::lock(&self.gate) = Some(gate.clone());
        gate
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        Self::lock(&self.requests).clone()
    }

    /// Number of requests of one kind seen so far.
    pub fn request_count(&self, kind: RequestKind) -> usize {
        Self::lock(&self.requests)
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    async fn enter(&self, kind: RequestKind, resource: &str, query: ResourceQuery) -> Result<()> {
        Self::lock(&self.requests).push(RecordedRequest {
            kind,
            resource: resource.to_string(),
            query,
        });

        let gate = Self::lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("memory remote is offline".to_string()));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Http {
                status: 503,
                message: "Service Unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteResourceClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, resource: &str, query: &ResourceQuery) -> Result<Vec<Value>> {
        self.enter(RequestKind::Get, resource, query.clone()).await?;

        let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1) as usize;
        let page = query.page.unwrap_or(1).max(1) as usize;

        let resources = Self::lock(&self.resources);
        let Some(docs) = resources.get(resource) else {
            return Err(Error::Http {
                status: 404,
                message: format!("No route was found matching {}", resource),
            });
        };

        Ok(docs
            .iter()
            .filter(|(id, _)| query.filter.as_ref().map_or(true, |f| f.admits(id)))
            .skip((page - 1) * per_page)
            .take(per_page)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn all_ids(&self, resource: &str) -> Result<Vec<RemoteId>> {
        self.enter(RequestKind::AllIds, resource, ResourceQuery::new().with_fields(&["id"]))
            .await?;
        Ok(self.ids(resource))
    }

    async fn ping(&self) -> Result<()> {
        self.enter(RequestKind::Ping, "", ResourceQuery::new()).await
    }
}
