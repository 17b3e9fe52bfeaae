//! Instance history.
//!
//! Every mutation appends one [`HistoryEntry`]; the log is never rewritten.
//! [`InstanceHistoryProvider`] exposes it per resource, newest first.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::types::{Page, Pagination, StoredResource};

use super::versioned::VersionedStorage;

/// Parameters for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    /// Only include versions written at or after this time.
    pub since: Option<DateTime<Utc>>,

    /// Only include versions written strictly before this time.
    pub before: Option<DateTime<Utc>>,

    /// Pagination settings.
    pub pagination: Pagination,
}

impl HistoryParams {
    /// Creates new history parameters with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the since filter.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the before filter.
    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    /// Sets the page size.
    pub fn count(mut self, count: u32) -> Self {
        self.pagination.count = count;
        self
    }

    /// Sets the number of entries to skip.
    pub fn offset(mut self, offset: u32) -> Self {
        self.pagination.offset = offset;
        self
    }
}

/// The mutation that produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOperation {
    /// First version of the resource.
    Create,
    /// Replacement of the content.
    Update,
    /// Tombstone.
    Delete,
}

impl HistoryOperation {
    /// Name stored in the `operation` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Create => "create",
            HistoryOperation::Update => "update",
            HistoryOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(HistoryOperation::Create),
            "update" => Ok(HistoryOperation::Update),
            "delete" => Ok(HistoryOperation::Delete),
            _ => Err(format!("unknown history operation: {}", s)),
        }
    }
}

/// A single entry of the version log.
///
/// For a delete entry the resource carries the last live content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The resource at this version.
    pub resource: StoredResource,

    /// The mutation that created this version.
    pub operation: HistoryOperation,

    /// When this version was written.
    pub timestamp: DateTime<Utc>,
}

/// A page of history entries.
pub type HistoryPage = Page<HistoryEntry>;

/// Provider for instance-level history.
///
/// Corresponds to `GET [base]/[type]/[id]/_history`.
///
/// ```ignore
/// let params = HistoryParams::new()
///     .since(Utc::now() - Duration::days(30))
///     .count(10);
/// let history = storage.history_instance("Patient", "123", &params).await?;
/// for entry in history.items {
///     println!("v{} {}", entry.resource.version_id(), entry.operation);
/// }
/// ```
#[async_trait]
pub trait InstanceHistoryProvider: VersionedStorage {
    /// Returns a page of history entries, newest first.
    ///
    /// `page_info.total` counts every entry matching the time filters.
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage>;

    /// Gets the total number of versions for a resource.
    async fn history_instance_count(&self, resource_type: &str, id: &str) -> StorageResult<u64>;
}
