//! Translates live events into cache mutations.
//!
//! Each event kind maps to exactly one [`Rule`]. A rule either patches the
//! affected item in place or marks whole queries stale so their next access
//! refetches from page 1. When the scope of a change is unclear the bridge
//! falls back to invalidating.

use catalog_sdk::{DownloadStatus, ItemId};
use live_channel::{listener, ConnectionState, EventKind, Listener, LiveChannel, LiveEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::aggregator::ItemPatch;
use crate::cache::QueryCache;
use crate::metrics;
use crate::query::QueryKey;

const STATUS_FIELD: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Update the item in place wherever it is retained.
    Patch,
    /// Patch, except in queries that filter on the named field; those refetch
    /// because the item may enter or leave their result set.
    PatchUnlessFiltered(&'static str),
    /// Refetch every retained query.
    InvalidateAll,
}

pub fn rule_for(kind: EventKind) -> Rule {
    match kind {
        EventKind::Progress => Rule::Patch,
        EventKind::Completed | EventKind::Failed => Rule::PatchUnlessFiltered(STATUS_FIELD),
        EventKind::CatalogChanged => Rule::InvalidateAll,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveMode {
    Patch { item_id: ItemId, patch: ItemPatch },
    Refetch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationDirective {
    pub target: QueryKey,
    pub mode: DirectiveMode,
}

/// Counts from applying one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub patched: usize,
    pub invalidated: usize,
}

fn patch_for(event: &LiveEvent) -> Option<(ItemId, ItemPatch)> {
    match event {
        LiveEvent::Progress {
            item_id,
            percent,
            speed,
        } => Some((
            item_id.clone(),
            ItemPatch {
                status: Some(DownloadStatus::Downloading),
                percent: Some(*percent),
                speed: *speed,
                error: None,
            },
        )),
        LiveEvent::Completed { item_id } => Some((
            item_id.clone(),
            ItemPatch {
                status: Some(DownloadStatus::Completed),
                percent: Some(100.0),
                ..ItemPatch::default()
            },
        )),
        LiveEvent::Failed { item_id, error } => Some((
            item_id.clone(),
            ItemPatch {
                status: Some(DownloadStatus::Failed),
                error: Some(error.clone()),
                ..ItemPatch::default()
            },
        )),
        LiveEvent::CatalogChanged => None,
    }
}

/// Directives for `event` against every query retained in `cache`.
pub fn directives(event: &LiveEvent, cache: &QueryCache) -> Vec<InvalidationDirective> {
    let rule = rule_for(event.kind());
    let patch = patch_for(event);
    cache
        .aggregators()
        .into_iter()
        .map(|(target, aggregator)| {
            let refetch = match rule {
                Rule::InvalidateAll => true,
                Rule::Patch => false,
                Rule::PatchUnlessFiltered(field) => aggregator.params().filters_on(field),
            };
            let mode = match (&patch, refetch) {
                (Some((item_id, patch)), false) => DirectiveMode::Patch {
                    item_id: item_id.clone(),
                    patch: patch.clone(),
                },
                _ => DirectiveMode::Refetch,
            };
            InvalidationDirective { target, mode }
        })
        .collect()
}

/// Applies one directive. Returns whether anything changed; a patch for an
/// item the query does not hold is a no-op.
pub fn apply(directive: &InvalidationDirective, cache: &QueryCache) -> bool {
    let Some(aggregator) = cache.peek(&directive.target) else {
        return false;
    };
    match &directive.mode {
        DirectiveMode::Patch { item_id, patch } => aggregator.patch(item_id, patch),
        DirectiveMode::Refetch => {
            aggregator.invalidate();
            true
        }
    }
}

/// Computes and applies all directives for `event`.
pub fn handle(event: &LiveEvent, cache: &QueryCache) -> BridgeReport {
    let kind = event.kind();
    let mut report = BridgeReport::default();
    for directive in directives(event, cache) {
        let changed = apply(&directive, cache);
        match directive.mode {
            DirectiveMode::Patch { .. } if changed => report.patched += 1,
            DirectiveMode::Patch { .. } => {}
            DirectiveMode::Refetch => report.invalidated += 1,
        }
    }
    if report.patched > 0 {
        metrics::PATCHES_APPLIED
            .with_label_values(&[kind.wire_name()])
            .inc_by(report.patched as u64);
    }
    if report.invalidated > 0 {
        metrics::INVALIDATIONS
            .with_label_values(&[kind.wire_name()])
            .inc_by(report.invalidated as u64);
    }
    trace!(
        target = "catalog_view::bridge",
        event = kind.wire_name(),
        patched = report.patched,
        invalidated = report.invalidated,
        "applied live event"
    );
    report
}

/// Registration of the bridge on a channel. Dropping it unregisters every
/// listener and stops the reconnect watcher.
pub struct BridgeAttachment {
    channel: LiveChannel,
    listeners: Vec<(EventKind, Listener)>,
    resync: Option<JoinHandle<()>>,
}

impl BridgeAttachment {
    /// Same as dropping the attachment.
    pub fn detach(self) {
        drop(self);
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.listeners.iter().map(|(kind, _)| *kind)
    }
}

impl Drop for BridgeAttachment {
    fn drop(&mut self) {
        for (kind, listener) in self.listeners.drain(..) {
            self.channel.off(kind, &listener);
        }
        if let Some(handle) = self.resync.take() {
            handle.abort();
        }
        debug!(target = "catalog_view::bridge", "bridge detached");
    }
}

/// Registers one listener per event kind on `channel` and, when a tokio
/// runtime is available, a watcher that invalidates every query after a
/// reconnect, since events sent during the gap were missed.
pub fn attach(channel: &LiveChannel, cache: QueryCache) -> BridgeAttachment {
    let listeners = EventKind::ALL
        .into_iter()
        .map(|kind| {
            let cache = cache.clone();
            let cb = listener(move |event| {
                handle(event, &cache);
            });
            channel.on(kind, &cb);
            (kind, cb)
        })
        .collect();

    let resync = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Some(runtime.spawn(watch_reconnects(channel.watch_state(), cache))),
        Err(_) => {
            warn!(
                target = "catalog_view::bridge",
                "no tokio runtime; queries will not resync after reconnects"
            );
            None
        }
    };

    BridgeAttachment {
        channel: channel.clone(),
        listeners,
        resync,
    }
}

async fn watch_reconnects(mut states: watch::Receiver<ConnectionState>, cache: QueryCache) {
    let mut previous = *states.borrow_and_update();
    while states.changed().await.is_ok() {
        let current = *states.borrow_and_update();
        if current == ConnectionState::Reconnecting && previous != ConnectionState::Reconnecting {
            metrics::CHANNEL_RECONNECTS.inc();
        }
        if previous == ConnectionState::Reconnecting && current == ConnectionState::Connected {
            let invalidated = cache.invalidate_all();
            metrics::INVALIDATIONS
                .with_label_values(&["resync"])
                .inc_by(invalidated as u64);
            info!(
                target = "catalog_view::bridge",
                invalidated,
                "channel reconnected; invalidated retained queries"
            );
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::FetchLimits;
    use crate::query::QueryParams;
    use catalog_sdk::{InMemoryCatalog, Item};
    use std::sync::Arc;

    fn seeded() -> Arc<InMemoryCatalog> {
        InMemoryCatalog::with_items(
            (0..12)
                .map(|i| {
                    let status = if i % 3 == 0 {
                        DownloadStatus::Queued
                    } else {
                        DownloadStatus::Idle
                    };
                    Item::new(format!("item-{i:02}"), format!("Item {i}")).with_status(status)
                })
                .collect(),
        )
    }

    fn cache(api: Arc<InMemoryCatalog>) -> QueryCache {
        QueryCache::new(api, FetchLimits::default(), 8)
    }

    #[test]
    fn every_kind_has_a_rule() {
        assert_eq!(rule_for(EventKind::Progress), Rule::Patch);
        assert_eq!(
            rule_for(EventKind::Completed),
            Rule::PatchUnlessFiltered("status")
        );
        assert_eq!(rule_for(EventKind::Failed), Rule::PatchUnlessFiltered("status"));
        assert_eq!(rule_for(EventKind::CatalogChanged), Rule::InvalidateAll);
    }

    #[tokio::test]
    async fn progress_for_absent_item_is_a_noop() {
        let cache = cache(seeded());
        let aggregator = cache.get_or_create(&QueryParams::new(5)).unwrap();
        aggregator.load_next().await.unwrap();
        aggregator.load_next().await.unwrap();
        let before = aggregator.current_items();
        let shape = aggregator.page_shape();

        let report = handle(
            &LiveEvent::Progress {
                item_id: "not-loaded".into(),
                percent: 50.0,
                speed: None,
            },
            &cache,
        );
        assert_eq!(report, BridgeReport::default());
        assert_eq!(aggregator.current_items(), before);
        assert_eq!(aggregator.page_shape(), shape);
        assert!(!aggregator.is_stale());
    }

    #[tokio::test]
    async fn progress_patches_without_changing_shape() {
        let cache = cache(seeded());
        let aggregator = cache.get_or_create(&QueryParams::new(5)).unwrap();
        aggregator.load_next().await.unwrap();
        aggregator.load_next().await.unwrap();
        let shape = aggregator.page_shape();

        let report = handle(
            &LiveEvent::Progress {
                item_id: "item-07".into(),
                percent: 12.5,
                speed: Some(2048.0),
            },
            &cache,
        );
        assert_eq!(report.patched, 1);
        assert_eq!(aggregator.page_shape(), shape);
        let items = aggregator.current_items();
        let item = items.iter().find(|i| i.id.as_str() == "item-07").unwrap();
        assert_eq!(item.download.status, DownloadStatus::Downloading);
        assert_eq!(item.download.percent, 12.5);
        assert_eq!(item.download.speed, Some(2048.0));
        assert_eq!(items.len(), 10);
    }

    #[tokio::test]
    async fn completion_refetches_status_filtered_queries() {
        let cache = cache(seeded());
        let all = cache.get_or_create(&QueryParams::new(20)).unwrap();
        let queued = cache
            .get_or_create(&QueryParams::new(20).with_filter("status", "queued"))
            .unwrap();
        all.load_next().await.unwrap();
        queued.load_next().await.unwrap();

        let event = LiveEvent::Completed {
            item_id: "item-03".into(),
        };
        let planned = directives(&event, &cache);
        assert_eq!(planned.len(), 2);
        let refetches = planned
            .iter()
            .filter(|d| d.mode == DirectiveMode::Refetch)
            .count();
        assert_eq!(refetches, 1);

        let report = handle(&event, &cache);
        assert_eq!(report, BridgeReport { patched: 1, invalidated: 1 });
        assert!(queued.is_stale());
        assert!(!all.is_stale());
        let items = all.current_items();
        let item = items.iter().find(|i| i.id.as_str() == "item-03").unwrap();
        assert_eq!(item.download.status, DownloadStatus::Completed);
        assert_eq!(item.download.percent, 100.0);
    }

    #[tokio::test]
    async fn failure_records_error_text() {
        let cache = cache(seeded());
        let aggregator = cache.get_or_create(&QueryParams::new(20)).unwrap();
        aggregator.load_next().await.unwrap();
        handle(
            &LiveEvent::Failed {
                item_id: "item-01".into(),
                error: "disk full".into(),
            },
            &cache,
        );
        let items = aggregator.current_items();
        assert_eq!(items[1].download.status, DownloadStatus::Failed);
        assert_eq!(items[1].download.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn catalog_change_resets_each_query_once() {
        let api = seeded();
        let cache = cache(api.clone());
        let first = cache.get_or_create(&QueryParams::new(4)).unwrap();
        let second = cache
            .get_or_create(&QueryParams::new(4).with_search("item 1"))
            .unwrap();
        first.load_next().await.unwrap();
        first.load_next().await.unwrap();
        second.load_next().await.unwrap();

        api.upsert(Item::new("item-00", "Renamed")).await;
        let report = handle(&LiveEvent::CatalogChanged, &cache);
        assert_eq!(report.invalidated, 2);
        assert!(first.is_stale() && second.is_stale());

        let generation = first.generation();
        first.load_next().await.unwrap();
        assert_eq!(first.generation(), generation + 1);
        assert_eq!(first.len(), 4);
        assert_eq!(first.current_items()[0].title, "Renamed");

        first.load_next().await.unwrap();
        assert_eq!(first.generation(), generation + 1);
        assert_eq!(first.len(), 8);
    }
}
