//! Incremental page fetching flattened into one deduplicated sequence.
//!
//! State lives behind a `parking_lot` mutex that is only held between
//! suspension points. Every fetch carries the generation it was issued under;
//! `reset` bumps the generation so responses to superseded requests are dropped
//! on arrival instead of being merged into the new query.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use catalog_sdk::{CatalogApi, DownloadState, DownloadStatus, Item, ItemId, PageRequest, PageResponse};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::query::QueryParams;
use crate::{ViewError, ViewResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_page_size: u32,
    pub timeout: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_page_size: 500,
            timeout: Duration::from_secs(15),
        }
    }
}

/// What a `load_next`/`reset` call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was merged; `added` counts items new to the sequence.
    Loaded { added: usize },
    /// A fetch for the current generation is already running.
    InFlight,
    /// The source reported no further pages.
    Exhausted,
    /// The response belonged to a superseded generation and was dropped.
    Discarded,
}

/// Fields updated in place on a retained item. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub status: Option<DownloadStatus>,
    pub percent: Option<f32>,
    pub speed: Option<f64>,
    pub error: Option<String>,
}

impl ItemPatch {
    pub fn apply(&self, state: &mut DownloadState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(percent) = self.percent {
            state.percent = percent;
        }
        if let Some(speed) = self.speed {
            state.speed = Some(speed);
        }
        if let Some(error) = &self.error {
            state.error = Some(error.clone());
        }
    }
}

#[derive(Debug, Clone)]
struct Page {
    number: u32,
    items: Vec<Item>,
}

#[derive(Debug)]
struct State {
    params: QueryParams,
    pages: Vec<Page>,
    generation: u64,
    next_page: u32,
    cursor: Option<String>,
    has_more: bool,
    /// Generation of the fetch currently running, if any.
    in_flight: Option<u64>,
    stale: bool,
    /// Retained pages belong to an earlier generation and stay readable until
    /// the first page of the current one lands.
    superseded: bool,
    last_error: Option<ViewError>,
    snapshot: Option<Arc<Vec<Item>>>,
}

impl State {
    fn new(params: QueryParams) -> Self {
        Self {
            params,
            pages: Vec::new(),
            generation: 0,
            next_page: 1,
            cursor: None,
            has_more: true,
            in_flight: None,
            stale: false,
            superseded: false,
            last_error: None,
            snapshot: None,
        }
    }

    fn ensure_current(&self, generation: u64) -> ViewResult<()> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(ViewError::StaleResponse {
                received: generation,
                current: self.generation,
            })
        }
    }

    /// Starts a new generation at page 1 and claims its first fetch.
    fn restart(&mut self, params: QueryParams, retain: Retain) -> Ticket {
        self.generation += 1;
        self.params = params;
        match retain {
            Retain::Nothing => {
                self.pages.clear();
                self.snapshot = None;
                self.superseded = false;
            }
            Retain::UntilReplaced => self.superseded = !self.pages.is_empty(),
        }
        self.next_page = 1;
        self.cursor = None;
        self.has_more = true;
        self.stale = false;
        self.last_error = None;
        debug!(
            target = "catalog_view::aggregator",
            generation = self.generation,
            kept = self.superseded,
            "aggregation reset"
        );
        self.begin_fetch()
    }

    fn begin_fetch(&mut self) -> Ticket {
        self.in_flight = Some(self.generation);
        Ticket {
            generation: self.generation,
            request: self.params.page_request(self.next_page, self.cursor.clone()),
        }
    }

    /// Merges a page, removing earlier copies of any id it carries.
    fn merge(&mut self, number: u32, response: PageResponse) -> usize {
        if self.superseded {
            self.pages.clear();
            self.superseded = false;
        }
        let mut seen = HashSet::with_capacity(response.items.len());
        let mut incoming: Vec<Item> = response
            .items
            .into_iter()
            .rev()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        incoming.reverse();

        let mut replaced = 0;
        for page in &mut self.pages {
            let before = page.items.len();
            page.items.retain(|item| !seen.contains(&item.id));
            replaced += before - page.items.len();
        }
        let added = incoming.len() - replaced;

        self.pages.push(Page {
            number,
            items: incoming,
        });
        self.next_page = number.saturating_add(1);
        self.cursor = response.next_cursor;
        self.has_more = response.has_more;
        self.last_error = None;
        self.snapshot = None;
        added
    }

    fn items(&mut self) -> Arc<Vec<Item>> {
        if let Some(snapshot) = &self.snapshot {
            return snapshot.clone();
        }
        let flat: Arc<Vec<Item>> = Arc::new(
            self.pages
                .iter()
                .flat_map(|page| page.items.iter().cloned())
                .collect(),
        );
        self.snapshot = Some(flat.clone());
        flat
    }
}

struct Ticket {
    generation: u64,
    request: PageRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retain {
    Nothing,
    UntilReplaced,
}

/// Releases the in-flight claim of a fetch whose future is dropped before
/// its response is settled.
struct FetchClaim<'a> {
    state: &'a Mutex<State>,
    generation: u64,
    armed: bool,
}

impl<'a> FetchClaim<'a> {
    fn new(state: &'a Mutex<State>, generation: u64) -> Self {
        Self {
            state,
            generation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FetchClaim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        if state.in_flight == Some(self.generation) {
            state.in_flight = None;
            debug!(
                target = "catalog_view::aggregator",
                generation = self.generation,
                "page fetch cancelled"
            );
        }
    }
}

/// Aggregation state for one query. Clones share state.
#[derive(Clone)]
pub struct Aggregator {
    state: Arc<Mutex<State>>,
    api: Arc<dyn CatalogApi>,
    limits: FetchLimits,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Aggregator")
            .field("generation", &state.generation)
            .field("pages", &state.pages.len())
            .field("has_more", &state.has_more)
            .field("stale", &state.stale)
            .finish()
    }
}

impl Aggregator {
    /// Creates an empty aggregation. Nothing is fetched until `load_next`.
    pub fn new(
        api: Arc<dyn CatalogApi>,
        params: QueryParams,
        limits: FetchLimits,
    ) -> ViewResult<Self> {
        check_params(&params, &limits)?;
        Ok(Self {
            state: Arc::new(Mutex::new(State::new(params))),
            api,
            limits,
        })
    }

    /// Fetches and merges the next page.
    ///
    /// No-op while a fetch for the current generation is running or once the
    /// source is exhausted. A stale aggregation performs its pending reset
    /// instead, keeping the old pages visible until the new first page
    /// arrives. On failure retained pages and `has_more` are left as they were
    /// and the error is recorded; calling again retries the same page.
    pub async fn load_next(&self) -> ViewResult<LoadOutcome> {
        let ticket = {
            let mut state = self.state.lock();
            if state.in_flight == Some(state.generation) {
                return Ok(LoadOutcome::InFlight);
            }
            if state.stale {
                let params = state.params.clone();
                state.restart(params, Retain::UntilReplaced)
            } else if !state.has_more {
                return Ok(LoadOutcome::Exhausted);
            } else {
                state.begin_fetch()
            }
        };
        self.run(ticket).await
    }

    /// Discards all pages and starts over from page 1 under `params`.
    /// Oversized pages are rejected before anything changes.
    pub async fn reset(&self, params: QueryParams) -> ViewResult<LoadOutcome> {
        check_params(&params, &self.limits)?;
        let ticket = self.state.lock().restart(params, Retain::Nothing);
        self.run(ticket).await
    }

    async fn run(&self, ticket: Ticket) -> ViewResult<LoadOutcome> {
        let page = ticket.request.page;
        let limit = self.limits.timeout;
        let claim = FetchClaim::new(&self.state, ticket.generation);
        let result = match timeout(limit, self.api.fetch_page(ticket.request)).await {
            Ok(result) => result.map_err(ViewError::from),
            Err(_) => Err(ViewError::Timeout(limit)),
        };
        claim.disarm();

        match self.settle(ticket.generation, page, result) {
            Err(ViewError::StaleResponse { received, current }) => {
                metrics::STALE_DISCARDED.inc();
                debug!(
                    target = "catalog_view::aggregator",
                    received,
                    current,
                    page,
                    "discarding response from superseded generation"
                );
                Ok(LoadOutcome::Discarded)
            }
            other => other,
        }
    }

    fn settle(
        &self,
        generation: u64,
        page: u32,
        result: ViewResult<PageResponse>,
    ) -> ViewResult<LoadOutcome> {
        let mut state = self.state.lock();
        state.ensure_current(generation)?;
        state.in_flight = None;
        match result {
            Ok(response) => {
                let received = response.items.len();
                let added = state.merge(page, response);
                metrics::PAGES_FETCHED.inc();
                trace!(
                    target = "catalog_view::aggregator",
                    page,
                    received,
                    added,
                    has_more = state.has_more,
                    "merged page"
                );
                Ok(LoadOutcome::Loaded { added })
            }
            Err(err) => {
                let reason = match &err {
                    ViewError::Timeout(_) => "timeout",
                    _ => "network",
                };
                metrics::FETCH_FAILURES.with_label_values(&[reason]).inc();
                warn!(
                    target = "catalog_view::aggregator",
                    page,
                    error = %err,
                    "page fetch failed; keeping loaded pages"
                );
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Flattened items of all retained pages, in fetch order.
    pub fn current_items(&self) -> Arc<Vec<Item>> {
        self.state.lock().items()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pages.iter().map(|page| page.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    pub fn is_fetching_more(&self) -> bool {
        let state = self.state.lock();
        state.in_flight == Some(state.generation)
    }

    /// Retained page numbers and lengths, in fetch order.
    pub fn page_shape(&self) -> Vec<(u32, usize)> {
        self.state
            .lock()
            .pages
            .iter()
            .map(|page| (page.number, page.items.len()))
            .collect()
    }

    /// Updates a retained item in place. Returns `false` when no retained
    /// page holds `id`.
    pub fn patch(&self, id: &ItemId, patch: &ItemPatch) -> bool {
        let mut state = self.state.lock();
        let target = state
            .pages
            .iter_mut()
            .flat_map(|page| page.items.iter_mut())
            .find(|item| &item.id == id);
        match target {
            Some(item) => {
                patch.apply(&mut item.download);
                state.snapshot = None;
                true
            }
            None => false,
        }
    }

    /// Marks the aggregation stale; the next `load_next` resets it once.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if !state.stale {
            debug!(
                target = "catalog_view::aggregator",
                generation = state.generation,
                "aggregation invalidated"
            );
        }
        state.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    pub fn last_error(&self) -> Option<ViewError> {
        self.state.lock().last_error.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn params(&self) -> QueryParams {
        self.state.lock().params.clone()
    }

    pub fn limits(&self) -> FetchLimits {
        self.limits
    }
}

fn check_params(params: &QueryParams, limits: &FetchLimits) -> ViewResult<()> {
    if params.page_size == 0 {
        return Err(ViewError::Config("page size must be non-zero".into()));
    }
    if params.page_size > limits.max_page_size {
        return Err(ViewError::Capacity {
            what: "page size",
            requested: params.page_size as u64,
            limit: limits.max_page_size as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalog_sdk::{ApiError, EnqueueResponse, InMemoryCatalog};
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use tokio::sync::oneshot;

    enum Step {
        Respond(PageResponse),
        Fail(&'static str),
        Gated(oneshot::Receiver<()>, PageResponse),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedApi {
        steps: parking_lot::Mutex<VecDeque<Step>>,
        requests: parking_lot::Mutex<Vec<PageRequest>>,
    }

    impl ScriptedApi {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: parking_lot::Mutex::new(steps.into()),
                requests: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<PageRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl CatalogApi for ScriptedApi {
        async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
            self.requests.lock().push(request);
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Respond(response)) => Ok(response),
                Some(Step::Fail(reason)) => Err(ApiError::InvalidRequest(reason.into())),
                Some(Step::Gated(gate, response)) => {
                    let _ = gate.await;
                    Ok(response)
                }
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(PageResponse {
                    items: Vec::new(),
                    has_more: false,
                    next_cursor: None,
                }),
            }
        }

        async fn enqueue_download(
            &self,
            _item_ids: Vec<ItemId>,
            _concurrency: u32,
        ) -> Result<EnqueueResponse, ApiError> {
            Err(ApiError::InvalidRequest("not scripted".into()))
        }
    }

    fn page(ids: &[&str], has_more: bool) -> PageResponse {
        PageResponse {
            items: ids.iter().map(|id| Item::new(*id, format!("title {id}"))).collect(),
            has_more,
            next_cursor: None,
        }
    }

    fn ids(aggregator: &Aggregator) -> Vec<String> {
        aggregator
            .current_items()
            .iter()
            .map(|item| item.id.as_str().to_string())
            .collect()
    }

    fn catalog(count: usize) -> Arc<InMemoryCatalog> {
        InMemoryCatalog::with_items(
            (0..count)
                .map(|i| Item::new(format!("item-{i:03}"), format!("Item {i}")))
                .collect(),
        )
    }

    #[tokio::test]
    async fn grows_by_one_page_per_load() {
        let aggregator =
            Aggregator::new(catalog(100), QueryParams::new(20), FetchLimits::default()).unwrap();
        assert!(aggregator.is_empty());

        assert_eq!(
            aggregator.load_next().await.unwrap(),
            LoadOutcome::Loaded { added: 20 }
        );
        assert_eq!(aggregator.len(), 20);
        assert!(aggregator.has_more());

        aggregator.load_next().await.unwrap();
        let items = aggregator.current_items();
        assert_eq!(items.len(), 40);
        assert_eq!(items[0].id.as_str(), "item-000");
        assert_eq!(items[39].id.as_str(), "item-039");
        assert_eq!(aggregator.page_shape(), vec![(1, 20), (2, 20)]);
    }

    #[tokio::test]
    async fn stops_when_source_is_exhausted() {
        let aggregator =
            Aggregator::new(catalog(30), QueryParams::new(20), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();
        aggregator.load_next().await.unwrap();
        assert_eq!(aggregator.len(), 30);
        assert!(!aggregator.has_more());
        assert_eq!(aggregator.load_next().await.unwrap(), LoadOutcome::Exhausted);
    }

    #[tokio::test]
    async fn later_copy_of_an_id_wins() {
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["a", "b", "c"], true)),
            Step::Respond(page(&["c", "d", "d"], false)),
        ]);
        let aggregator = Aggregator::new(api, QueryParams::new(3), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();
        assert_eq!(
            aggregator.load_next().await.unwrap(),
            LoadOutcome::Loaded { added: 1 }
        );
        assert_eq!(ids(&aggregator), ["a", "b", "c", "d"]);
        assert_eq!(aggregator.page_shape(), vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn concurrent_load_is_a_noop() {
        let (release, gate) = oneshot::channel();
        let api = ScriptedApi::new(vec![Step::Gated(gate, page(&["a"], true))]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(1), FetchLimits::default()).unwrap();

        let first = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.load_next().await }
        });
        while !aggregator.is_fetching_more() {
            tokio::task::yield_now().await;
        }
        assert_eq!(aggregator.load_next().await.unwrap(), LoadOutcome::InFlight);

        release.send(()).unwrap();
        assert_eq!(
            first.await.unwrap().unwrap(),
            LoadOutcome::Loaded { added: 1 }
        );
        assert_eq!(api.requests().len(), 1);
        assert!(!aggregator.is_fetching_more());
    }

    #[tokio::test]
    async fn reset_discards_in_flight_response() {
        let (release, gate) = oneshot::channel();
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["p1-a", "p1-b"], true)),
            Step::Gated(gate, page(&["p2-a", "p2-b"], true)),
            Step::Respond(page(&["air-1", "air-2"], false)),
        ]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(2), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();

        let pending = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.load_next().await }
        });
        while !aggregator.is_fetching_more() {
            tokio::task::yield_now().await;
        }

        let airport = QueryParams::new(2).with_search("airport");
        assert_eq!(
            aggregator.reset(airport).await.unwrap(),
            LoadOutcome::Loaded { added: 2 }
        );
        release.send(()).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), LoadOutcome::Discarded);

        assert_eq!(ids(&aggregator), ["air-1", "air-2"]);
        assert_eq!(aggregator.generation(), 1);
        assert!(!aggregator.has_more());
        let requests = api.requests();
        assert_eq!(requests[2].search.as_deref(), Some("airport"));
        assert_eq!(requests[2].page, 1);
    }

    #[tokio::test]
    async fn failure_keeps_pages_and_retry_fetches_same_page() {
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["a", "b"], true)),
            Step::Fail("backend unavailable"),
            Step::Respond(page(&["c", "d"], false)),
        ]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(2), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();

        let err = aggregator.load_next().await.unwrap_err();
        assert!(matches!(err, ViewError::Network { .. }));
        assert_eq!(ids(&aggregator), ["a", "b"]);
        assert!(aggregator.has_more());
        assert!(aggregator.last_error().is_some());
        assert!(!aggregator.is_fetching_more());

        aggregator.load_next().await.unwrap();
        assert_eq!(ids(&aggregator), ["a", "b", "c", "d"]);
        assert!(aggregator.last_error().is_none());
        let pages: Vec<u32> = api.requests().iter().map(|r| r.page).collect();
        assert_eq!(pages, [1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_is_a_retryable_error() {
        let api = ScriptedApi::new(vec![Step::Hang]);
        let limits = FetchLimits {
            max_page_size: 100,
            timeout: Duration::from_secs(3),
        };
        let aggregator = Aggregator::new(api, QueryParams::new(10), limits).unwrap();
        let err = aggregator.load_next().await.unwrap_err();
        assert!(matches!(err, ViewError::Timeout(limit) if limit == Duration::from_secs(3)));
        assert!(err.is_retryable());
        assert!(!aggregator.is_fetching_more());
    }

    #[tokio::test]
    async fn oversized_page_is_rejected_without_mutation() {
        let aggregator =
            Aggregator::new(catalog(10), QueryParams::new(5), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();
        let before = aggregator.generation();

        let err = aggregator.reset(QueryParams::new(10_000)).await.unwrap_err();
        assert!(matches!(
            err,
            ViewError::Capacity {
                what: "page size",
                requested: 10_000,
                ..
            }
        ));
        assert_eq!(aggregator.generation(), before);
        assert_eq!(aggregator.len(), 5);
        assert_eq!(aggregator.params().page_size, 5);
    }

    #[tokio::test]
    async fn invalidate_resets_exactly_once() {
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["a", "b"], true)),
            Step::Respond(page(&["a2", "b2"], true)),
            Step::Respond(page(&["c2"], false)),
        ]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(2), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();

        aggregator.invalidate();
        aggregator.invalidate();
        assert!(aggregator.is_stale());
        assert_eq!(ids(&aggregator), ["a", "b"]);

        aggregator.load_next().await.unwrap();
        assert!(!aggregator.is_stale());
        assert_eq!(aggregator.generation(), 1);
        assert_eq!(ids(&aggregator), ["a2", "b2"]);

        aggregator.load_next().await.unwrap();
        assert_eq!(aggregator.generation(), 1);
        let pages: Vec<u32> = api.requests().iter().map(|r| r.page).collect();
        assert_eq!(pages, [1, 1, 2]);
    }

    #[tokio::test]
    async fn failed_refetch_keeps_stale_rows_visible() {
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["a", "b"], true)),
            Step::Fail("backend unavailable"),
            Step::Respond(page(&["a2"], false)),
        ]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(2), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();

        aggregator.invalidate();
        assert!(aggregator.load_next().await.is_err());
        assert_eq!(aggregator.len(), 2);
        assert_eq!(ids(&aggregator), ["a", "b"]);
        assert!(aggregator.last_error().is_some());
        assert!(!aggregator.is_stale());
        assert_eq!(aggregator.generation(), 1);

        assert_eq!(
            aggregator.load_next().await.unwrap(),
            LoadOutcome::Loaded { added: 1 }
        );
        assert_eq!(ids(&aggregator), ["a2"]);
        let pages: Vec<u32> = api.requests().iter().map(|r| r.page).collect();
        assert_eq!(pages, [1, 1, 1]);
    }

    #[tokio::test]
    async fn cancelled_load_releases_in_flight_claim() {
        let api = ScriptedApi::new(vec![Step::Hang, Step::Respond(page(&["a"], false))]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(1), FetchLimits::default()).unwrap();

        let pending = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.load_next().await }
        });
        while !aggregator.is_fetching_more() {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(!aggregator.is_fetching_more());

        assert_eq!(
            aggregator.load_next().await.unwrap(),
            LoadOutcome::Loaded { added: 1 }
        );
        assert_eq!(api.requests().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_after_invalidate_reset_once() {
        let (release, gate) = oneshot::channel();
        let api = ScriptedApi::new(vec![
            Step::Respond(page(&["a", "b"], true)),
            Step::Gated(gate, page(&["a2", "b2"], true)),
        ]);
        let aggregator =
            Aggregator::new(api.clone(), QueryParams::new(2), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();
        aggregator.invalidate();

        let loads: Vec<_> = (0..8)
            .map(|_| {
                let aggregator = aggregator.clone();
                tokio::spawn(async move { aggregator.load_next().await })
            })
            .collect();
        while loads.iter().filter(|load| load.is_finished()).count() < 7 {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        let mut outcomes = Vec::new();
        for load in loads {
            outcomes.push(load.await.unwrap().unwrap());
        }
        let loaded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, LoadOutcome::Loaded { .. }))
            .count();
        assert_eq!(loaded, 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == LoadOutcome::InFlight).count(),
            7
        );
        assert_eq!(aggregator.generation(), 1);
        assert_eq!(api.requests().len(), 2);
        assert_eq!(ids(&aggregator), ["a2", "b2"]);
    }

    #[tokio::test]
    async fn patch_updates_in_place() {
        let aggregator =
            Aggregator::new(catalog(6), QueryParams::new(3), FetchLimits::default()).unwrap();
        aggregator.load_next().await.unwrap();
        aggregator.load_next().await.unwrap();
        let shape = aggregator.page_shape();

        let patch = ItemPatch {
            status: Some(DownloadStatus::Downloading),
            percent: Some(40.0),
            speed: Some(1024.0),
            error: None,
        };
        assert!(aggregator.patch(&ItemId::from("item-004"), &patch));
        assert!(!aggregator.patch(&ItemId::from("missing"), &patch));

        let items = aggregator.current_items();
        assert_eq!(items[4].download.percent, 40.0);
        assert_eq!(items[4].download.status, DownloadStatus::Downloading);
        assert_eq!(items[4].download.speed, Some(1024.0));
        assert_eq!(aggregator.page_shape(), shape);
    }

    fn arb_pages() -> impl Strategy<Value = Vec<Vec<u8>>> {
        proptest::collection::vec(proptest::collection::vec(0u8..24, 0..8), 1..8)
    }

    proptest! {
        #[test]
        fn ids_stay_unique_across_loads(pages in arb_pages()) {
            let last = pages.len() - 1;
            let steps = pages
                .iter()
                .enumerate()
                .map(|(index, ids)| {
                    let ids: Vec<String> = ids.iter().map(|id| format!("id-{id}")).collect();
                    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    Step::Respond(page(&refs, index != last))
                })
                .collect();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let aggregator = Aggregator::new(
                ScriptedApi::new(steps),
                QueryParams::new(8),
                FetchLimits::default(),
            )
            .unwrap();

            runtime.block_on(async {
                for _ in 0..pages.len() + 2 {
                    aggregator.load_next().await.unwrap();
                }
            });

            let items = aggregator.current_items();
            let unique: HashSet<&ItemId> = items.iter().map(|item| &item.id).collect();
            prop_assert_eq!(unique.len(), items.len());
            let shape_total: usize = aggregator.page_shape().iter().map(|(_, len)| len).sum();
            prop_assert_eq!(shape_total, items.len());

            let expected: HashSet<String> = pages
                .iter()
                .flatten()
                .map(|id| format!("id-{id}"))
                .collect();
            prop_assert_eq!(unique.len(), expected.len());
        }
    }
}
