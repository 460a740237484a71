use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{
    EnqueueRequest, EnqueueResponse, Item, ItemId, PageRequest, PageResponse, SortDirection,
};
use crate::ApiError;

/// The two request/response endpoints the view kernel consumes.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError>;

    async fn enqueue_download(
        &self,
        item_ids: Vec<ItemId>,
        concurrency: u32,
    ) -> Result<EnqueueResponse, ApiError>;
}

/// In-memory adapter for tests and early wiring.
///
/// Pages are computed from the current contents on every call, so inserts and
/// removals between calls shift page boundaries the way a live backend does.
#[derive(Default)]
pub struct InMemoryCatalog {
    items: Mutex<Vec<Item>>,
    enqueued: Mutex<Vec<EnqueueRequest>>,
}

impl InMemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_items(items: Vec<Item>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            enqueued: Mutex::new(Vec::new()),
        })
    }

    pub async fn upsert(&self, item: Item) {
        let mut guard = self.items.lock().await;
        if let Some(existing) = guard.iter_mut().find(|i| i.id == item.id) {
            *existing = item;
        } else {
            guard.push(item);
        }
    }

    pub async fn remove(&self, id: &ItemId) -> bool {
        let mut guard = self.items.lock().await;
        let before = guard.len();
        guard.retain(|i| &i.id != id);
        guard.len() != before
    }

    pub async fn item_count(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn enqueued(&self) -> Vec<EnqueueRequest> {
        self.enqueued.lock().await.clone()
    }
}

fn item_matches(item: &Item, request: &PageRequest) -> bool {
    if let Some(needle) = request.search.as_deref().filter(|s| !s.is_empty()) {
        if !item
            .title
            .to_lowercase()
            .contains(&needle.to_lowercase())
        {
            return false;
        }
    }
    request.filters.iter().all(|(name, value)| match name.as_str() {
        "status" => item.download.status.as_str() == value,
        "kind" => item.kind.as_deref() == Some(value.as_str()),
        other => item
            .extra
            .get(other)
            .and_then(|v| v.as_str())
            .map(|v| v == value)
            .unwrap_or(false),
    })
}

#[async_trait]
impl CatalogApi for InMemoryCatalog {
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
        if request.page == 0 || request.page_size == 0 {
            return Err(ApiError::InvalidRequest(
                "page and pageSize must be positive".into(),
            ));
        }
        let mut selected: Vec<Item> = {
            let guard = self.items.lock().await;
            guard.iter().filter(|i| item_matches(i, &request)).cloned().collect()
        };
        match request.sort_by.as_deref() {
            Some("title") => selected.sort_by(|a, b| a.title.cmp(&b.title)),
            Some("size") => selected.sort_by_key(|i| i.size_bytes.unwrap_or(0)),
            _ => {}
        }
        if request.sort_direction == SortDirection::Desc && request.sort_by.is_some() {
            selected.reverse();
        }

        let size = request.page_size as usize;
        let start = (request.page as usize - 1).saturating_mul(size);
        let items: Vec<Item> = selected.iter().skip(start).take(size).cloned().collect();
        let has_more = start + items.len() < selected.len();
        Ok(PageResponse {
            items,
            has_more,
            next_cursor: has_more.then(|| format!("page-{}", request.page + 1)),
        })
    }

    async fn enqueue_download(
        &self,
        item_ids: Vec<ItemId>,
        concurrency: u32,
    ) -> Result<EnqueueResponse, ApiError> {
        self.enqueued.lock().await.push(EnqueueRequest {
            item_ids,
            concurrency,
        });
        Ok(EnqueueResponse {
            session_id: Uuid::new_v4(),
        })
    }
}
