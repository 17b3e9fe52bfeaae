//! Stored resource types.
//!
//! This module defines the [`StoredResource`] type, which wraps a FHIR resource
//! with its persistence metadata: identity, version and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExtractionWarning;

/// A FHIR resource with persistence metadata.
///
/// - **Identity**: resource type and logical id
/// - **Versioning**: a version id that starts at 1 and grows by one per mutation
/// - **Timestamps**: creation, last update, and deletion
///
/// # Examples
///
/// ```
/// use helios_store::types::StoredResource;
/// use serde_json::json;
///
/// let resource = StoredResource::new(
///     "Patient",
///     "123",
///     json!({
///         "resourceType": "Patient",
///         "id": "123",
///         "name": [{"family": "Smith"}]
///     }),
/// );
///
/// assert_eq!(resource.url(), "Patient/123");
/// assert_eq!(resource.version_id(), 1);
/// assert_eq!(resource.etag(), "W/\"1\"");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    resource_type: String,
    id: String,
    version_id: u64,
    content: Value,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl StoredResource {
    /// Creates a first version of a resource, timestamped now.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>, content: Value) -> Self {
        let now = Utc::now();
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: 1,
            content,
            created_at: now,
            last_updated: now,
            deleted_at: None,
        }
    }

    /// Rebuilds a stored resource from persisted columns.
    pub fn from_storage(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: u64,
        content: Value,
        created_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id,
            content,
            created_at,
            last_updated,
            deleted_at,
        }
    }

    /// Returns the FHIR resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the resource's logical ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the version ID.
    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    /// Returns the resource content as JSON.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes self and returns the content.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns when the first version was written.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when this version was written.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Returns when the resource was deleted, if this version is a tombstone.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Returns `true` if this version is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the weak ETag for this version, e.g. `W/"3"`.
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }

    /// Returns the relative URL (e.g., "Patient/123").
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the versioned URL (e.g., "Patient/123/_history/1").
    pub fn versioned_url(&self) -> String {
        format!(
            "{}/{}/_history/{}",
            self.resource_type, self.id, self.version_id
        )
    }
}

/// Outcome of a successful mutation.
///
/// The write is durable; `warnings` lists index rules that could not be
/// applied to the new content.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// The version that was written.
    pub resource: StoredResource,
    /// Non-fatal indexing problems.
    pub warnings: Vec<ExtractionWarning>,
}

impl WriteResult {
    /// Wraps a written version with no warnings.
    pub fn new(resource: StoredResource) -> Self {
        Self {
            resource,
            warnings: Vec::new(),
        }
    }

    /// Returns `true` if every rule indexed the content cleanly.
    pub fn fully_indexed(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Consumes self and returns the written version.
    pub fn into_resource(self) -> StoredResource {
        self.resource
    }
}
