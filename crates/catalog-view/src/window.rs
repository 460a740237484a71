//! Viewport windowing.
//!
//! Maps a scroll position to the contiguous range of units (items or grid
//! rows) that must be materialized, plus the total scrollable extent and the
//! offset at which the materialized block starts. Everything here is pure and
//! cheap enough to run on every scroll or resize.

use std::ops::{Range, RangeInclusive};

/// Scroll state supplied by the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_offset: f64,
    pub container_extent: f64,
    pub overscan: usize,
}

impl Viewport {
    pub fn new(scroll_offset: f64, container_extent: f64, overscan: usize) -> Self {
        Self {
            scroll_offset,
            container_extent,
            overscan,
        }
    }
}

/// Prefix sums over per-unit extents, for variable-size units.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariableExtents {
    /// `offsets[i]` is the leading edge of unit `i`; the last entry is the total.
    offsets: Vec<f64>,
}

impl VariableExtents {
    /// Negative or non-finite sizes count as zero.
    pub fn from_sizes<I>(sizes: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut offsets = vec![0.0];
        let mut running = 0.0;
        for size in sizes {
            if size.is_finite() && size > 0.0 {
                running += size;
            }
            offsets.push(running);
        }
        Self { offsets }
    }

    pub fn from_fn<F>(count: usize, extent_of: F) -> Self
    where
        F: Fn(usize) -> f64,
    {
        Self::from_sizes((0..count).map(extent_of))
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total(&self) -> f64 {
        self.offsets.last().copied().unwrap_or(0.0)
    }

    /// Leading edge of unit `index`; clamps to the total past the end.
    pub fn offset_of(&self, index: usize) -> f64 {
        self.offsets
            .get(index)
            .copied()
            .unwrap_or_else(|| self.total())
    }

    /// Unit whose span contains `offset`, clamped to the valid index range.
    /// Returns `None` only when there are no units.
    pub fn index_at(&self, offset: f64) -> Option<usize> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let after = self.offsets.partition_point(|&edge| edge <= offset);
        Some(after.saturating_sub(1).min(len - 1))
    }
}

/// Result of a window computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    bounds: Option<(usize, usize)>,
    total_extent: f64,
    top_offset: f64,
}

impl Window {
    pub fn empty() -> Self {
        Self {
            bounds: None,
            total_extent: 0.0,
            top_offset: 0.0,
        }
    }

    /// Window over `count` units of identical `extent`.
    pub fn fixed(count: usize, extent: f64, viewport: &Viewport) -> Self {
        if count == 0 || !extent.is_finite() || extent <= 0.0 {
            return Self::empty();
        }
        let total = count as f64 * extent;
        let container = sanitize(viewport.container_extent);
        let scroll = clamp_scroll(viewport.scroll_offset, total, container);

        let first = (scroll / extent).floor() as usize;
        let last = ((scroll + container) / extent).ceil() as usize;
        let end = last.saturating_add(viewport.overscan).min(count - 1);
        let start = first.saturating_sub(viewport.overscan).min(end);
        Self {
            bounds: Some((start, end)),
            total_extent: total,
            top_offset: start as f64 * extent,
        }
    }

    /// Window over units with individually measured extents.
    pub fn variable(extents: &VariableExtents, viewport: &Viewport) -> Self {
        let count = extents.len();
        if count == 0 {
            return Self::empty();
        }
        let total = extents.total();
        let container = sanitize(viewport.container_extent);
        let scroll = clamp_scroll(viewport.scroll_offset, total, container);

        let first = extents.index_at(scroll).unwrap_or(0);
        let last = extents.index_at(scroll + container).unwrap_or(0);
        let end = last.saturating_add(viewport.overscan).min(count - 1);
        let start = first.saturating_sub(viewport.overscan).min(end);
        Self {
            bounds: Some((start, end)),
            total_extent: total,
            top_offset: extents.offset_of(start),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    /// Inclusive index range, `None` when there is nothing to render.
    pub fn range(&self) -> Option<RangeInclusive<usize>> {
        self.bounds.map(|(start, end)| start..=end)
    }

    /// Half-open index range; empty when there is nothing to render.
    pub fn indices(&self) -> Range<usize> {
        match self.bounds {
            Some((start, end)) => start..end + 1,
            None => 0..0,
        }
    }

    pub fn len(&self) -> usize {
        self.indices().len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices().contains(&index)
    }

    pub fn total_extent(&self) -> f64 {
        self.total_extent
    }

    pub fn top_offset(&self) -> f64 {
        self.top_offset
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

fn clamp_scroll(scroll: f64, total: f64, container: f64) -> f64 {
    let max_scroll = (total - container).max(0.0);
    if scroll.is_nan() {
        return 0.0;
    }
    scroll.clamp(0.0, max_scroll)
}
