//! Pull batch planning.
//!
//! A pull request names the documents it wants through a single id filter.
//! The filter is built from whichever id set keeps the request small, and it
//! never lists more than [`MAX_BATCH_SIZE`] ids.

use wcpos_common::RemoteId;
use wcpos_remote::{IdFilter, ResourceQuery};

/// Hard upper bound on ids listed in one request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// One bounded pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullBatch {
    filter: IdFilter,
    per_page: usize,
}

impl PullBatch {
    /// Plan the next batch from point-in-time snapshots of both id sets.
    ///
    /// # Returns
    /// `None` when nothing is outstanding. Otherwise:
    /// - `include` with the first `limit` unsynced ids when the synced set is
    ///   not larger than the unsynced set
    /// - `exclude` with the synced ids otherwise, as long as the whole synced
    ///   set fits in one filter; a truncated exclude list would let the
    ///   backend keep returning already-synced documents, so larger synced
    ///   sets fall back to `include`
    pub fn plan(synced: &[RemoteId], unsynced: &[RemoteId], limit: usize) -> Option<Self> {
        if unsynced.is_empty() {
            return None;
        }
        let limit = limit.clamp(1, MAX_BATCH_SIZE);

        let filter = if synced.len() <= unsynced.len() || synced.len() > limit {
            IdFilter::Include(unsynced.iter().take(limit).cloned().collect())
        } else {
            IdFilter::Exclude(synced.to_vec())
        };

        let per_page = match &filter {
            IdFilter::Include(ids) => ids.len(),
            IdFilter::Exclude(_) => limit,
        };

        Some(Self { filter, per_page })
    }

    /// Id filter sent with the request.
    pub fn filter(&self) -> &IdFilter {
        &self.filter
    }

    /// Number of ids listed in the filter.
    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    /// Most documents the request can return.
    pub fn per_page(&self) -> usize {
        self.per_page
    }

    /// Request parameters for this batch.
    pub fn to_query(&self) -> ResourceQuery {
        ResourceQuery::new()
            .with_filter(self.filter.clone())
            .with_per_page(self.per_page as u32)
    }
}
