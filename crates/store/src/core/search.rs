//! Search provider trait.
//!
//! [`SearchProvider`] covers `GET [base]/[type]?[parameters]`, either from an
//! already parsed [`SearchQuery`] or straight from a query string.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{Page, SearchQuery, StoredResource};

use super::storage::ResourceStorage;

/// Result of a search operation.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matching resources, windowed by `_count` and `_offset`.
    pub resources: Page<StoredResource>,

    /// Included resources (from _include/_revinclude).
    pub included: Vec<StoredResource>,

    /// Exact number of matches across all pages.
    pub total: u64,
}

impl SearchResult {
    /// Creates a new search result; the total is taken from the page.
    pub fn new(resources: Page<StoredResource>) -> Self {
        let total = resources.page_info.total;
        Self {
            resources,
            included: Vec::new(),
            total,
        }
    }

    /// Adds included resources.
    pub fn with_included(mut self, included: Vec<StoredResource>) -> Self {
        self.included = included;
        self
    }

    /// Logical ids of the matches on this page, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.resources.items.iter().map(|r| r.id()).collect()
    }
}

/// Search provider for single resource type queries.
///
/// ```ignore
/// let result = storage
///     .search_str("Observation", "code=http://loinc.org|8867-4&_sort=-date&_count=10")
///     .await?;
/// for resource in &result.resources.items {
///     println!("Found: {}", resource.url());
/// }
/// println!("{} in total", result.total);
/// ```
#[async_trait]
pub trait SearchProvider: ResourceStorage {
    /// Searches for resources matching the query.
    ///
    /// # Errors
    ///
    /// * `StorageError::Search` - If a parameter cannot be evaluated
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult>;

    /// Counts resources matching the query without returning them.
    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64>;

    /// Parses a form-urlencoded query string and runs it.
    ///
    /// # Errors
    ///
    /// * `StorageError::Search(UnknownParameter)` - If a parameter is not defined for the type
    /// * `StorageError::Search(UnsupportedModifier)` - If a modifier does not fit the parameter
    async fn search_str(&self, resource_type: &str, query: &str) -> StorageResult<SearchResult>;
}
