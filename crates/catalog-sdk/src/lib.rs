//! Asynchronous client for the catalog query and download APIs.
//!
//! The view kernel only talks to the backend through [`CatalogApi`]. This crate
//! provides the wire model, an HTTP implementation and an in-memory adapter used
//! by tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub mod catalog_api;
pub mod model;

pub use catalog_api::{CatalogApi, InMemoryCatalog};
pub use model::{
    DownloadState, DownloadStatus, EnqueueRequest, EnqueueResponse, Item, ItemId, PageRequest,
    PageResponse, SortDirection,
};

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Whether calling again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(_) | ApiError::Timeout(_) => true,
            ApiError::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::InvalidRequest(_) => false,
        }
    }
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn decode<T>(res: reqwest::Response) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
        let url = format!("{}/items", self.base_url);
        debug!(
            target = "catalog_sdk::http",
            page = request.page,
            page_size = request.page_size,
            "fetching catalog page"
        );
        let res = self
            .authorize(self.http.get(url).query(&request.query_pairs()))
            .send()
            .await?;
        Self::decode(res).await
    }

    async fn enqueue_download(
        &self,
        item_ids: Vec<ItemId>,
        concurrency: u32,
    ) -> Result<EnqueueResponse, ApiError> {
        let url = format!("{}/downloads", self.base_url);
        let body = EnqueueRequest {
            item_ids,
            concurrency,
        };
        debug!(
            target = "catalog_sdk::http",
            items = body.item_ids.len(),
            concurrency,
            "enqueueing downloads"
        );
        let res = self.authorize(self.http.post(url).json(&body)).send().await?;
        Self::decode(res).await
    }
}
