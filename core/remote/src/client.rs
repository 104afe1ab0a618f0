//! Remote resource client trait definition.

use async_trait::async_trait;
use serde_json::Value;

use wcpos_common::{RemoteId, Result};

/// Restricts a request to, or away from, a list of ids.
///
/// A request carries at most one filter, so `include` and `exclude` can never
/// be sent together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdFilter {
    /// Only return documents with these ids.
    Include(Vec<RemoteId>),
    /// Return documents except those with these ids.
    Exclude(Vec<RemoteId>),
}

impl IdFilter {
    /// Query parameter name.
    pub fn param(&self) -> &'static str {
        match self {
            IdFilter::Include(_) => "include",
            IdFilter::Exclude(_) => "exclude",
        }
    }

    /// Ids listed in the filter.
    pub fn ids(&self) -> &[RemoteId] {
        match self {
            IdFilter::Include(ids) | IdFilter::Exclude(ids) => ids,
        }
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }

    /// Comma-joined id list, as sent on the wire.
    pub fn joined(&self) -> String {
        self.ids()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether a document with `id` passes this filter.
    pub fn admits(&self, id: &RemoteId) -> bool {
        match self {
            IdFilter::Include(ids) => ids.contains(id),
            IdFilter::Exclude(ids) => !ids.contains(id),
        }
    }
}

/// Parameters of a collection GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceQuery {
    pub filter: Option<IdFilter>,
    /// Restrict the returned fields (e.g. just `id`).
    pub fields: Vec<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ResourceQuery {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the query to an id filter.
    pub fn with_filter(mut self, filter: IdFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Ask for a subset of document fields (`_fields`).
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Set the 1-based page.
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Set the page size.
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = Some(per_page);
        self
    }

    /// Render as query string pairs.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push((filter.param().to_string(), filter.joined()));
        }
        if !self.fields.is_empty() {
            params.push(("_fields".to_string(), self.fields.join(",")));
        }
        if let Some(page) = self.page {
            params.push(("page".to_string(), page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            params.push(("per_page".to_string(), per_page.to_string()));
        }
        params
    }
}

/// Client for a paginated REST backend.
///
/// Implementations handle authentication, timeouts and pagination of the id
/// listing themselves.
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Client name for logs (e.g. "rest", "memory").
    fn name(&self) -> &str;

    /// GET a collection resource.
    ///
    /// # Returns
    /// The documents of the requested page. An empty vector is a valid answer.
    ///
    /// # Errors
    /// - Network/timeout errors
    /// - Non-success HTTP status
    /// - Body is not a JSON array
    async fn get(&self, resource: &str, query: &ResourceQuery) -> Result<Vec<Value>>;

    /// Fetch every id of a collection resource.
    ///
    /// # Postconditions
    /// - Returns the complete id list, or fails; never a partial list
    async fn all_ids(&self, resource: &str) -> Result<Vec<RemoteId>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;
}
