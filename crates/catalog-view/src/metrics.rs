use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static PAGES_FETCHED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("catalog_pages_fetched_total", "Pages merged into a query").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FETCH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("catalog_fetch_failures_total", "Failed page fetches"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STALE_DISCARDED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "catalog_stale_responses_total",
        "Responses discarded because a reset superseded them",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PATCHES_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("catalog_patches_total", "Targeted patches by event kind"),
        &["event"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INVALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("catalog_invalidations_total", "Queries marked stale"),
        &["cause"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHANNEL_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "catalog_channel_reconnects_total",
        "Live channel drops that entered a reconnect cycle",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
