//! Virtualized view over large, growing catalogs.
//!
//! The crate keeps a scrollable catalog consistent with two inputs: pages
//! fetched on demand from the query API, and push events from the live
//! channel. Only the rows inside the viewport (plus overscan) are
//! materialized.
//!
//! - [`window`] maps scroll state to the index range to render.
//! - [`aggregator`] fetches pages and flattens them into one deduplicated
//!   sequence per query; [`cache`] keeps one aggregation per query identity.
//! - [`grid`] packs items into rows for list or grid presentation.
//! - [`selection`] tracks selected items by identity.
//! - [`bridge`] turns live events into in-place patches or refetches.
//! - [`view`] composes the pieces into the surface a renderer talks to.

pub mod aggregator;
pub mod bridge;
pub mod cache;
pub mod config;
mod error;
pub mod grid;
pub mod metrics;
pub mod query;
pub mod selection;
pub mod telemetry;
pub mod view;
pub mod window;

pub use aggregator::{Aggregator, FetchLimits, ItemPatch, LoadOutcome};
pub use bridge::{attach, BridgeAttachment, DirectiveMode, InvalidationDirective, Rule};
pub use cache::QueryCache;
pub use config::{ChannelConfig, ViewConfig};
pub use error::{ViewError, ViewResult};
pub use grid::GridLayout;
pub use query::{QueryKey, QueryParams};
pub use selection::SelectionRegistry;
pub use view::{CatalogView, ViewStatus, VisibleRow};
pub use window::{VariableExtents, Viewport, Window};
