//! Row packing for list and grid presentations.

use catalog_sdk::Item;

use crate::window::{Viewport, Window};

/// Column count and per-row extent. One column is a plain list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    columns: usize,
    row_extent: f64,
}

impl GridLayout {
    /// A zero column count is treated as a list; configuration validation
    /// rejects it before it gets here.
    pub fn new(columns: usize, row_extent: f64) -> Self {
        Self {
            columns: columns.max(1),
            row_extent,
        }
    }

    pub fn list(row_extent: f64) -> Self {
        Self::new(1, row_extent)
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn row_extent(&self) -> f64 {
        self.row_extent
    }

    pub fn row_count(&self, item_count: usize) -> usize {
        item_count.div_ceil(self.columns)
    }

    /// Row containing the item at `index`.
    pub fn row_of(&self, index: usize) -> usize {
        index / self.columns
    }

    pub fn rows<'a>(&self, items: &'a [Item]) -> GridRows<'a> {
        GridRows {
            items,
            columns: self.columns,
        }
    }

    /// Visible rows for `viewport`, in row units.
    pub fn window(&self, item_count: usize, viewport: &Viewport) -> Window {
        Window::fixed(self.row_count(item_count), self.row_extent, viewport)
    }
}

/// Row view over a flattened item sequence.
#[derive(Debug, Clone, Copy)]
pub struct GridRows<'a> {
    items: &'a [Item],
    columns: usize,
}

impl<'a> GridRows<'a> {
    pub fn row_count(&self) -> usize {
        self.items.len().div_ceil(self.columns)
    }

    /// Items in row `index`; the final row may be short.
    pub fn row_at(&self, index: usize) -> Option<&'a [Item]> {
        self.items.chunks(self.columns).nth(index)
    }

    pub fn iter(&self) -> std::slice::Chunks<'a, Item> {
        self.items.chunks(self.columns)
    }
}
