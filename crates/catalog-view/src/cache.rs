use std::collections::HashMap;
use std::sync::Arc;

use catalog_sdk::CatalogApi;
use parking_lot::Mutex;
use tracing::debug;

use crate::aggregator::{Aggregator, FetchLimits};
use crate::query::{QueryKey, QueryParams};
use crate::ViewResult;

struct Entry {
    aggregator: Aggregator,
    last_used: u64,
}

#[derive(Default)]
struct Entries {
    by_key: HashMap<QueryKey, Entry>,
    tick: u64,
}

/// Aggregation state per query identity, bounded by least-recent use.
/// Clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<Mutex<Entries>>,
    api: Arc<dyn CatalogApi>,
    limits: FetchLimits,
    capacity: usize,
}

impl QueryCache {
    pub fn new(api: Arc<dyn CatalogApi>, limits: FetchLimits, capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            api,
            limits,
            capacity: capacity.max(1),
        }
    }

    /// Returns the aggregation for `params`, creating an empty one if needed.
    /// Creating past capacity evicts the least recently used entry.
    pub fn get_or_create(&self, params: &QueryParams) -> ViewResult<Aggregator> {
        let key = params.key();
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;
        if let Some(entry) = entries.by_key.get_mut(&key) {
            entry.last_used = tick;
            return Ok(entry.aggregator.clone());
        }

        let aggregator = Aggregator::new(self.api.clone(), params.clone(), self.limits)?;
        while entries.by_key.len() >= self.capacity {
            let oldest = entries
                .by_key
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else { break };
            entries.by_key.remove(&oldest);
            debug!(
                target = "catalog_view::cache",
                key = oldest.as_str(),
                "evicted least recently used query"
            );
        }
        entries.by_key.insert(
            key,
            Entry {
                aggregator: aggregator.clone(),
                last_used: tick,
            },
        );
        Ok(aggregator)
    }

    pub fn get(&self, key: &QueryKey) -> Option<Aggregator> {
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;
        entries.by_key.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.aggregator.clone()
        })
    }

    /// Like `get` but does not count as use.
    pub fn peek(&self, key: &QueryKey) -> Option<Aggregator> {
        self.entries
            .lock()
            .by_key
            .get(key)
            .map(|entry| entry.aggregator.clone())
    }

    pub fn remove(&self, key: &QueryKey) -> Option<Aggregator> {
        self.entries
            .lock()
            .by_key
            .remove(key)
            .map(|entry| entry.aggregator)
    }

    /// Snapshot of every retained aggregation. Does not count as use.
    pub fn aggregators(&self) -> Vec<(QueryKey, Aggregator)> {
        self.entries
            .lock()
            .by_key
            .iter()
            .map(|(key, entry)| (key.clone(), entry.aggregator.clone()))
            .collect()
    }

    pub fn invalidate_all(&self) -> usize {
        let aggregators = self.aggregators();
        for (_, aggregator) in &aggregators {
            aggregator.invalidate();
        }
        aggregators.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
