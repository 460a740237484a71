use std::collections::HashSet;
use std::sync::Arc;

use catalog_sdk::{CatalogApi, EnqueueResponse, Item, ItemId};
use live_channel::{ConnectionState, LiveChannel};
use tracing::{debug, info};

use crate::aggregator::{Aggregator, LoadOutcome};
use crate::bridge::{self, BridgeAttachment};
use crate::cache::QueryCache;
use crate::config::ViewConfig;
use crate::grid::GridLayout;
use crate::query::QueryParams;
use crate::selection::SelectionRegistry;
use crate::window::{Viewport, Window};
use crate::{ViewError, ViewResult};

/// One materialized row handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleRow {
    pub index: usize,
    /// Leading edge of the row within the scrollable extent.
    pub offset: f64,
    pub items: Vec<Item>,
}

/// Snapshot of everything the UI shows around the rows themselves.
#[derive(Debug, Clone)]
pub struct ViewStatus {
    /// First page not yet arrived.
    pub loading: bool,
    pub fetching_more: bool,
    pub item_count: usize,
    pub has_more: bool,
    /// Last fetch failure; loaded rows stay visible while it is set.
    pub error: Option<ViewError>,
    /// A refetch is pending and the rows may be out of date.
    pub stale: bool,
    pub connection: Option<ConnectionState>,
}

/// Rendering surface over one active query.
pub struct CatalogView {
    config: ViewConfig,
    api: Arc<dyn CatalogApi>,
    cache: QueryCache,
    params: QueryParams,
    aggregator: Aggregator,
    grid: GridLayout,
    viewport: Viewport,
    selection: SelectionRegistry,
    channel: Option<LiveChannel>,
}

impl CatalogView {
    pub fn new(api: Arc<dyn CatalogApi>, config: ViewConfig) -> ViewResult<Self> {
        config.validate()?;
        let cache = QueryCache::new(api.clone(), config.fetch_limits(), config.max_cached_queries);
        let params = QueryParams::new(config.page_size);
        let aggregator = cache.get_or_create(&params)?;
        Ok(Self {
            grid: config.grid(),
            viewport: Viewport::new(0.0, 0.0, config.overscan),
            config,
            api,
            cache,
            params,
            aggregator,
            selection: SelectionRegistry::new(),
            channel: None,
        })
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn query(&self) -> &QueryParams {
        &self.params
    }

    /// Wires live events into this view's cache. The returned attachment
    /// must be kept alive for as long as updates should apply.
    pub fn attach_live(&mut self, channel: &LiveChannel) -> BridgeAttachment {
        self.channel = Some(channel.clone());
        bridge::attach(channel, self.cache.clone())
    }

    /// Switches to another query. Previously visited queries keep their
    /// pages in the cache; scroll returns to the top. Oversized pages are
    /// rejected and leave the current query in place.
    pub fn set_query(&mut self, params: QueryParams) -> ViewResult<()> {
        let aggregator = self.cache.get_or_create(&params)?;
        debug!(
            target = "catalog_view::view",
            key = params.key().as_str(),
            "switched query"
        );
        self.aggregator = aggregator;
        self.params = params;
        self.viewport.scroll_offset = 0.0;
        Ok(())
    }

    pub fn set_viewport(&mut self, scroll_offset: f64, container_extent: f64) {
        self.viewport.scroll_offset = scroll_offset;
        self.viewport.container_extent = container_extent;
    }

    pub fn set_columns(&mut self, columns: usize) -> ViewResult<()> {
        if columns == 0 {
            return Err(ViewError::Config("column count must be at least 1".into()));
        }
        self.grid = GridLayout::new(columns, self.grid.row_extent());
        Ok(())
    }

    pub fn grid(&self) -> GridLayout {
        self.grid
    }

    pub fn window(&self) -> Window {
        self.grid.window(self.aggregator.len(), &self.viewport)
    }

    pub fn visible_rows(&self) -> Vec<VisibleRow> {
        let items = self.aggregator.current_items();
        let window = self.grid.window(items.len(), &self.viewport);
        let rows = self.grid.rows(&items);
        window
            .indices()
            .filter_map(|index| {
                rows.row_at(index).map(|row| VisibleRow {
                    index,
                    offset: index as f64 * self.grid.row_extent(),
                    items: row.to_vec(),
                })
            })
            .collect()
    }

    pub fn total_extent(&self) -> f64 {
        self.window().total_extent()
    }

    pub fn top_offset(&self) -> f64 {
        self.window().top_offset()
    }

    pub fn is_selected(&self, id: &ItemId) -> bool {
        self.selection.has(id)
    }

    pub fn toggle_select(&mut self, id: &ItemId) -> bool {
        self.selection.toggle(id)
    }

    /// Adds every item in the materialized rows to the selection.
    pub fn select_visible(&mut self) -> usize {
        let rows = self.visible_rows();
        self.selection
            .select_visible(rows.iter().flat_map(|row| row.items.iter().map(|item| &item.id)));
        self.selection.size()
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selection(&self) -> &SelectionRegistry {
        &self.selection
    }

    /// Explicit "load more" or retry after a failed fetch.
    pub async fn load_more(&self) -> ViewResult<LoadOutcome> {
        self.aggregator.load_next().await
    }

    /// Requests the next page when the viewport is within the prefetch
    /// threshold of the loaded end, and performs a pending refetch for a
    /// stale query. Returns `None` when nothing was requested. After a failed
    /// fetch nothing is requested until `load_more` succeeds.
    pub async fn maybe_prefetch(&self) -> ViewResult<Option<LoadOutcome>> {
        if self.aggregator.is_stale() {
            return self.aggregator.load_next().await.map(Some);
        }
        if self.aggregator.last_error().is_some()
            || !self.aggregator.has_more()
            || self.aggregator.is_fetching_more()
        {
            return Ok(None);
        }
        let row_count = self.grid.row_count(self.aggregator.len());
        let near_end = match self.window().range() {
            Some(range) => range.end() + self.config.prefetch_rows >= row_count.saturating_sub(1),
            None => true,
        };
        if !near_end {
            return Ok(None);
        }
        self.aggregator.load_next().await.map(Some)
    }

    pub fn status(&self) -> ViewStatus {
        let item_count = self.aggregator.len();
        let fetching_more = self.aggregator.is_fetching_more();
        ViewStatus {
            loading: item_count == 0 && fetching_more,
            fetching_more,
            item_count,
            has_more: self.aggregator.has_more(),
            error: self.aggregator.last_error(),
            stale: self.aggregator.is_stale(),
            connection: self.channel.as_ref().map(LiveChannel::state),
        }
    }

    /// Queues downloads for the selection, loaded items first in display
    /// order. An empty selection sends nothing.
    pub async fn enqueue_selected(&self, concurrency: u32) -> ViewResult<Option<EnqueueResponse>> {
        let limit = self.config.max_download_concurrency;
        if concurrency == 0 || concurrency > limit {
            return Err(ViewError::Capacity {
                what: "download concurrency",
                requested: concurrency as u64,
                limit: limit as u64,
            });
        }
        if self.selection.is_empty() {
            return Ok(None);
        }

        let items = self.aggregator.current_items();
        let mut ids: Vec<ItemId> = self
            .selection
            .ordered_in(&items)
            .into_iter()
            .map(|item| item.id.clone())
            .collect();
        let loaded: HashSet<&ItemId> = ids.iter().collect();
        let mut unloaded: Vec<ItemId> = self
            .selection
            .ids()
            .filter(|id| !loaded.contains(id))
            .cloned()
            .collect();
        unloaded.sort();
        ids.extend(unloaded);

        let count = ids.len();
        let response = self.api.enqueue_download(ids, concurrency).await?;
        info!(
            target = "catalog_view::view",
            count,
            concurrency,
            session = %response.session_id,
            "enqueued downloads"
        );
        Ok(Some(response))
    }
}
