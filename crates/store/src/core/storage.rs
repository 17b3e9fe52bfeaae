//! Core resource storage trait.
//!
//! This module defines the [`ResourceStorage`] trait, which provides the
//! fundamental CRUD operations for FHIR resources.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;
use crate::types::{StoredResource, WriteResult};

/// Core storage trait for FHIR resources.
///
/// # Versioning
///
/// All mutating operations create new versions. The version id starts at 1
/// and grows by exactly one per mutation; `update` and `soft_delete` take the
/// version the caller last saw and fail with a version conflict otherwise.
///
/// # Soft Deletes
///
/// `soft_delete` tombstones the resource. Its history is kept and its id can
/// never be reused by `create`.
///
/// # Example
///
/// ```ignore
/// use helios_store::core::ResourceStorage;
///
/// async fn example<S: ResourceStorage>(storage: &S) -> Result<(), StorageError> {
///     let patient = serde_json::json!({
///         "resourceType": "Patient",
///         "name": [{"family": "Smith"}]
///     });
///     let created = storage.create("Patient", patient).await?.into_resource();
///
///     let mut content = created.content().clone();
///     content["active"] = serde_json::json!(true);
///     let updated = storage
///         .update("Patient", created.id(), content, created.version_id())
///         .await?;
///     assert_eq!(updated.resource.version_id(), 2);
///
///     storage.soft_delete("Patient", created.id(), 2).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Creates a new resource.
    ///
    /// An id is generated when the content has none.
    ///
    /// # Errors
    ///
    /// * `StorageError::Validation` - If the resource is invalid
    /// * `StorageError::Resource(AlreadyExists)` - If the id is taken, even by a tombstone
    /// * `StorageError::Integrity` - If a required reference target is missing
    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<WriteResult>;

    /// Reads the current version of a resource.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If the id is unknown or tombstoned
    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource>;

    /// Replaces a resource, expecting `expected_version` to be current.
    ///
    /// Updating a tombstone with its own version revives the resource.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If the id is unknown
    /// * `StorageError::Concurrency(VersionConflict)` - If another version is current
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: u64,
    ) -> StorageResult<WriteResult>;

    /// Tombstones a resource, expecting `expected_version` to be current.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If the id is unknown or already deleted
    /// * `StorageError::Concurrency(VersionConflict)` - If another version is current
    async fn soft_delete(
        &self,
        resource_type: &str,
        id: &str,
        expected_version: u64,
    ) -> StorageResult<WriteResult>;

    /// Checks if a live resource exists.
    async fn exists(&self, resource_type: &str, id: &str) -> StorageResult<bool>;

    /// Reads several live resources; unknown or deleted ids are skipped.
    async fn read_batch(
        &self,
        resource_type: &str,
        ids: &[&str],
    ) -> StorageResult<Vec<StoredResource>>;

    /// Counts live resources of a type.
    async fn count(&self, resource_type: &str) -> StorageResult<u64>;
}
