//! REST backend client.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use wcpos_common::{Error, RemoteId, Result, SecretString};

use crate::client::{RemoteResourceClient, ResourceQuery};

/// Header carrying the number of pages of a collection listing.
const TOTAL_PAGES_HEADER: &str = "x-wp-totalpages";

/// Upper bound on pages walked by [`RestClient::all_ids`].
const MAX_ID_PAGES: u32 = 10_000;

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("wcpos-sync/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_id_page_size() -> u32 {
    100
}

fn default_max_per_page() -> u32 {
    100
}

/// How to serve a request for `requested` documents when the backend caps
/// `per_page` at `max`.
///
/// # Returns
/// `None` when one request suffices, otherwise `(per_page, pages)`.
fn split_pages(requested: u32, max: u32) -> Option<(u32, u32)> {
    let max = max.max(1);
    if requested <= max {
        return None;
    }
    Some((max, requested.div_ceil(max)))
}

/// Configuration for [`RestClient`].
#[derive(Debug, Clone, Deserialize)]
pub struct RestClientConfig {
    /// API root, e.g. `https://shop.example.com/wp-json/wc/v3/`.
    pub base_url: String,
    /// Consumer key for HTTP Basic auth.
    #[serde(default)]
    pub consumer_key: Option<SecretString>,
    /// Consumer secret for HTTP Basic auth.
    #[serde(default)]
    pub consumer_secret: Option<SecretString>,
    /// Per-request timeout. Batches can be large, so this is generous.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Page size used when listing ids.
    #[serde(default = "default_id_page_size")]
    pub id_page_size: u32,
    /// Largest `per_page` the backend accepts. Bigger batches are fetched
    /// over several pages.
    #[serde(default = "default_max_per_page")]
    pub max_per_page: u32,
}

impl RestClientConfig {
    /// Create a configuration with default settings for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            consumer_key: None,
            consumer_secret: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            id_page_size: default_id_page_size(),
            max_per_page: default_max_per_page(),
        }
    }

    /// Set the consumer key and secret.
    pub fn with_credentials(mut self, key: SecretString, secret: SecretString) -> Self {
        self.consumer_key = Some(key);
        self.consumer_secret = Some(secret);
        self
    }

    /// Set the per-request timeout (whole seconds, at least one).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the page size of the id listing.
    pub fn with_id_page_size(mut self, size: u32) -> Self {
        self.id_page_size = size;
        self
    }

    /// Set the largest page the backend accepts.
    pub fn with_max_per_page(mut self, size: u32) -> Self {
        self.max_per_page = size;
        self
    }
}

/// Error body returned by the backend.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Build the structured error for a non-success response.
fn error_from_body(status: StatusCode, body: &str) -> Error {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            code: Some(code),
            message,
        }) => format!("{} ({})", message, code),
        Ok(ErrorBody { code: None, message }) => message,
        Err(_) if !body.trim().is_empty() => body.chars().take(200).collect(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    };

    Error::Http {
        status: status.as_u16(),
        message,
    }
}

fn request_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

fn total_pages(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(TOTAL_PAGES_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Client for a WooCommerce-style REST API.
pub struct RestClient {
    http: Client,
    base_url: Url,
    config: RestClientConfig,
}

impl RestClient {
    /// Create a new REST client.
    ///
    /// # Errors
    /// - Base URL is not a valid absolute URL
    /// - HTTP client could not be built
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {:?}: {}", raw, e)))?;

        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    /// API root, always ending in `/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of a collection resource.
    pub fn resource_url(&self, resource: &str) -> Result<Url> {
        self.base_url
            .join(resource.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid resource {:?}: {}", resource, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.config.consumer_key, &self.config.consumer_secret) {
            (Some(key), Some(secret)) => request.basic_auth(key.expose(), Some(secret.expose())),
            _ => request,
        }
    }

    /// Send a GET and return the successful response.
    async fn fetch(&self, resource: &str, query: &ResourceQuery) -> Result<Response> {
        let url = self.resource_url(resource)?;
        let params = query.to_params();
        debug!("GET {} {:?}", url, params);

        let response = self
            .authorize(self.http.get(url).query(&params))
            .send()
            .await
            .map_err(|e| request_error(&format!("GET {}", resource), e))?;

        self.check_status(response).await
    }

    async fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = error_from_body(status, &body);
        warn!("Backend rejected request: {}", err);
        Err(err)
    }

    async fn documents(response: Response) -> Result<Vec<Value>> {
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid JSON response: {}", e)))?;

        match body {
            Value::Array(documents) => Ok(documents),
            other => Err(Error::Serialization(format!(
                "Expected a JSON array, got {}",
                match other {
                    Value::Object(_) => "an object",
                    Value::Null => "null",
                    _ => "a scalar",
                }
            ))),
        }
    }
}

#[async_trait]
impl RemoteResourceClient for RestClient {
    fn name(&self) -> &str {
        "rest"
    }

    async fn get(&self, resource: &str, query: &ResourceQuery) -> Result<Vec<Value>> {
        let split = match (query.page, query.per_page) {
            (None, Some(requested)) => split_pages(requested, self.config.max_per_page),
            _ => None,
        };
        let Some((per_page, pages)) = split else {
            let response = self.fetch(resource, query).await?;
            return Self::documents(response).await;
        };

        // Any page failing fails the whole batch.
        let mut documents = Vec::new();
        for page in 1..=pages {
            let paged = query.clone().with_page(page).with_per_page(per_page);
            let response = self.fetch(resource, &paged).await?;
            let total = total_pages(response.headers());
            let batch = Self::documents(response).await?;
            let short = batch.len() < per_page as usize;
            documents.extend(batch);

            if short || total.is_some_and(|total| page >= total) {
                break;
            }
        }

        debug!("Fetched {} documents of {} in pages of {}", documents.len(), resource, per_page);
        Ok(documents)
    }

    async fn all_ids(&self, resource: &str) -> Result<Vec<RemoteId>> {
        let per_page = self.config.id_page_size.max(1);
        let mut ids = Vec::new();
        let mut page = 1;

        loop {
            let query = ResourceQuery::new()
                .with_fields(&["id"])
                .with_page(page)
                .with_per_page(per_page);

            let response = self.fetch(resource, &query).await?;
            let pages = total_pages(response.headers());
            let documents = Self::documents(response).await?;
            let received = documents.len();

            for doc in &documents {
                ids.push(RemoteId::of_document(doc)?);
            }

            let done = match pages {
                Some(total) => page >= total,
                None => received < per_page as usize,
            };
            if done || received == 0 {
                break;
            }

            page += 1;
            if page > MAX_ID_PAGES {
                return Err(Error::InvalidInput(format!(
                    "Id listing of {} exceeded {} pages",
                    resource, MAX_ID_PAGES
                )));
            }
        }

        debug!("Listed {} ids of {} over {} page(s)", ids.len(), resource, page);
        Ok(ids)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorize(self.http.get(self.base_url.clone()))
            .send()
            .await
            .map_err(|e| request_error("GET /", e))?;
        self.check_status(response).await?;
        Ok(())
    }
}
