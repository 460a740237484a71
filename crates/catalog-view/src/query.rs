use std::collections::BTreeMap;
use std::fmt;

use catalog_sdk::{PageRequest, SortDirection};
use serde::{Deserialize, Serialize};

/// Parameters that identify one aggregation. Two equal params share cached
/// pages; any difference yields a fresh aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub page_size: u32,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_direction: SortDirection,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub search: Option<String>,
}

impl QueryParams {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            sort_by: None,
            sort_direction: SortDirection::Asc,
            filters: BTreeMap::new(),
            search: None,
        }
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_by = Some(field.into());
        self.sort_direction = direction;
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Empty or whitespace-only search means no search.
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        let search = search.into();
        self.search = (!search.trim().is_empty()).then_some(search);
        self
    }

    pub fn filters_on(&self, field: &str) -> bool {
        self.filters.contains_key(field)
    }

    pub fn key(&self) -> QueryKey {
        // Struct fields serialize in declaration order and filters are a
        // BTreeMap, so equal params always produce the same key.
        QueryKey(serde_json::to_string(self).unwrap_or_default())
    }

    pub fn page_request(&self, page: u32, cursor: Option<String>) -> PageRequest {
        PageRequest {
            page,
            page_size: self.page_size,
            sort_by: self.sort_by.clone(),
            sort_direction: self.sort_direction,
            filters: self.filters.clone(),
            search: self.search.clone(),
            cursor,
        }
    }
}

/// Canonical serialized form of [`QueryParams`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
