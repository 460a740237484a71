use std::str::FromStr;
use std::time::Duration;

use live_channel::{BackoffPolicy, ChannelOptions};
use url::Url;

use crate::aggregator::FetchLimits;
use crate::grid::GridLayout;
use crate::{ViewError, ViewResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewConfig {
    pub row_extent: f64,
    pub overscan: usize,
    pub page_size: u32,
    pub max_page_size: u32,
    /// 1 renders a list, anything larger a grid.
    pub columns: usize,
    /// Rows from the end of the loaded sequence at which the next page is requested.
    pub prefetch_rows: usize,
    pub fetch_timeout: Duration,
    pub max_cached_queries: usize,
    pub max_download_concurrency: u32,
    pub api_base: String,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            row_extent: 72.0,
            overscan: 3,
            page_size: 50,
            max_page_size: 500,
            columns: 1,
            prefetch_rows: 5,
            fetch_timeout: Duration::from_secs(15),
            max_cached_queries: 8,
            max_download_concurrency: 8,
            api_base: "http://127.0.0.1:8080/api".into(),
        }
    }
}

impl ViewConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            row_extent: env_or("CATALOG_ROW_EXTENT", defaults.row_extent),
            overscan: env_or("CATALOG_OVERSCAN", defaults.overscan),
            page_size: env_or("CATALOG_PAGE_SIZE", defaults.page_size),
            max_page_size: env_or("CATALOG_MAX_PAGE_SIZE", defaults.max_page_size),
            columns: env_or("CATALOG_COLUMNS", defaults.columns),
            prefetch_rows: env_or("CATALOG_PREFETCH_ROWS", defaults.prefetch_rows),
            fetch_timeout: Duration::from_millis(env_or(
                "CATALOG_FETCH_TIMEOUT_MS",
                defaults.fetch_timeout.as_millis() as u64,
            )),
            max_cached_queries: env_or("CATALOG_MAX_CACHED_QUERIES", defaults.max_cached_queries),
            max_download_concurrency: env_or(
                "CATALOG_MAX_DOWNLOAD_CONCURRENCY",
                defaults.max_download_concurrency,
            ),
            api_base: std::env::var("CATALOG_API_BASE").unwrap_or(defaults.api_base),
        }
    }

    pub fn validate(&self) -> ViewResult<()> {
        if !self.row_extent.is_finite() || self.row_extent <= 0.0 {
            return Err(ViewError::Config(format!(
                "row extent must be positive, got {}",
                self.row_extent
            )));
        }
        if self.columns == 0 {
            return Err(ViewError::Config("column count must be at least 1".into()));
        }
        if self.page_size == 0 || self.max_page_size == 0 {
            return Err(ViewError::Config("page sizes must be non-zero".into()));
        }
        if self.page_size > self.max_page_size {
            return Err(ViewError::Config(format!(
                "page size {} exceeds max page size {}",
                self.page_size, self.max_page_size
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ViewError::Config("fetch timeout must be non-zero".into()));
        }
        if self.max_cached_queries == 0 {
            return Err(ViewError::Config("must retain at least one query".into()));
        }
        if self.max_download_concurrency == 0 {
            return Err(ViewError::Config(
                "download concurrency bound must be non-zero".into(),
            ));
        }
        self.api_url()?;
        Ok(())
    }

    pub fn api_url(&self) -> ViewResult<Url> {
        Url::parse(&self.api_base)
            .map_err(|err| ViewError::Config(format!("invalid api base {:?}: {err}", self.api_base)))
    }

    pub fn grid(&self) -> GridLayout {
        GridLayout::new(self.columns, self.row_extent)
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            max_page_size: self.max_page_size,
            timeout: self.fetch_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Overrides `{api_base}/events` when set.
    pub events_url: Option<String>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: u32,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            events_url: None,
            backoff_initial: backoff.initial,
            backoff_max: backoff.max,
            backoff_multiplier: backoff.multiplier,
            max_attempts: backoff.max_attempts,
            connect_timeout: ChannelOptions::default().connect_timeout,
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            events_url: std::env::var("CATALOG_EVENTS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            backoff_initial: Duration::from_millis(env_or(
                "CATALOG_BACKOFF_INITIAL_MS",
                defaults.backoff_initial.as_millis() as u64,
            )),
            backoff_max: Duration::from_millis(env_or(
                "CATALOG_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )),
            backoff_multiplier: env_or("CATALOG_BACKOFF_MULTIPLIER", defaults.backoff_multiplier),
            max_attempts: env_or("CATALOG_RECONNECT_ATTEMPTS", defaults.max_attempts),
            connect_timeout: Duration::from_millis(env_or(
                "CATALOG_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn validate(&self) -> ViewResult<()> {
        if self.max_attempts == 0 {
            return Err(ViewError::Config("reconnect attempts must be non-zero".into()));
        }
        if self.backoff_multiplier == 0 {
            return Err(ViewError::Config("backoff multiplier must be non-zero".into()));
        }
        if self.backoff_initial.is_zero() || self.backoff_initial > self.backoff_max {
            return Err(ViewError::Config(format!(
                "backoff initial {:?} must be non-zero and at most max {:?}",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }

    pub fn events_url(&self, view: &ViewConfig) -> ViewResult<Url> {
        match &self.events_url {
            Some(raw) => Url::parse(raw)
                .map_err(|err| ViewError::Config(format!("invalid events url {raw:?}: {err}"))),
            None => {
                let base = view.api_base.trim_end_matches('/');
                Url::parse(&format!("{base}/events"))
                    .map_err(|err| ViewError::Config(format!("invalid api base {base:?}: {err}")))
            }
        }
    }

    pub fn to_options(&self) -> ChannelOptions {
        ChannelOptions {
            backoff: BackoffPolicy {
                initial: self.backoff_initial,
                max: self.backoff_max,
                multiplier: self.backoff_multiplier,
                max_attempts: self.max_attempts,
            },
            connect_timeout: self.connect_timeout,
        }
    }
}
