//! Pagination types for search and history results.
//!
//! Paging is offset based: the full matching set is computed and ordered
//! first, then a window of `count` items starting at `offset` is returned.

use serde::{Deserialize, Serialize};

/// Offset pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of results to return.
    pub count: u32,
    /// Number of results to skip.
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            count: 20,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Creates a first-page request of the given size.
    pub fn new(count: u32) -> Self {
        Self { count, offset: 0 }
    }

    /// Sets the offset.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Caps the page size.
    pub fn clamp(mut self, max_count: u32) -> Self {
        self.count = self.count.min(max_count);
        self
    }

    /// Applies the window to an already-ordered list.
    pub fn window<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset as usize)
            .take(self.count as usize)
            .cloned()
            .collect()
    }
}

/// Information about a page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Offset of the first item of this page.
    pub offset: u32,
    /// Requested page size.
    pub count: u32,
    /// Exact number of matching items across all pages.
    pub total: u64,
    /// Whether there are more results after this page.
    pub has_next: bool,
    /// Whether there are results before this page.
    pub has_previous: bool,
}

impl PageInfo {
    /// Describes the window `pagination` takes out of `total` items.
    pub fn for_window(pagination: Pagination, total: u64) -> Self {
        Self {
            offset: pagination.offset,
            count: pagination.count,
            total,
            has_next: u64::from(pagination.offset) + u64::from(pagination.count) < total,
            has_previous: pagination.offset > 0,
        }
    }

    /// Page info for an empty result.
    pub fn end() -> Self {
        Self {
            offset: 0,
            count: 0,
            total: 0,
            has_next: false,
            has_previous: false,
        }
    }

    /// The pagination request for the following page, if any.
    pub fn next(&self) -> Option<Pagination> {
        self.has_next.then(|| Pagination {
            count: self.count,
            offset: self.offset + self.count,
        })
    }
}

/// A page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items in this page.
    pub items: Vec<T>,

    /// Pagination information.
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    /// Creates a new page with the given items and page info.
    pub fn new(items: Vec<T>, page_info: PageInfo) -> Self {
        Self { items, page_info }
    }

    /// Creates an empty page.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            page_info: PageInfo::end(),
        }
    }

    /// Returns true if this page has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Maps the items to a different type.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page_info: self.page_info,
        }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::empty()
    }
}
