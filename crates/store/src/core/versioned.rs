//! Versioned storage trait.
//!
//! This module extends [`ResourceStorage`] with version-aware operations:
//! version reads (vread) and optimistic locking with HTTP `If-Match`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConcurrencyError, ResourceError, StorageError, StorageResult, ValidationError};
use crate::types::{StoredResource, WriteResult};

use super::storage::ResourceStorage;

/// Storage trait with version-aware operations.
///
/// # Optimistic Locking
///
/// `update_with_match` and `delete_with_match` implement HTTP `If-Match`
/// semantics. A write without an `If-Match` value is rejected with a version
/// conflict, so a client can never overwrite a version it has not seen.
#[async_trait]
pub trait VersionedStorage: ResourceStorage {
    /// Reads a specific version of a resource (vread).
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(VersionNotFound)` - If the version does not exist
    /// * `StorageError::Resource(Gone)` - If the version records a deletion
    async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<StoredResource>;

    /// Returns the current version id, including for tombstones.
    ///
    /// `None` if the id was never written.
    async fn current_version(&self, resource_type: &str, id: &str) -> StorageResult<Option<u64>>;

    /// Lists all version ids of a resource, oldest first.
    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<u64>>;

    /// Updates a resource guarded by an `If-Match` header value.
    ///
    /// # Errors
    ///
    /// * `StorageError::Concurrency(VersionConflict)` - If the header is missing or stale
    /// * `StorageError::Validation(InvalidIfMatch)` - If the header is not a version
    async fn update_with_match(
        &self,
        resource_type: &str,
        id: &str,
        if_match: Option<&str>,
        resource: Value,
    ) -> StorageResult<WriteResult> {
        let expected = self.required_match(resource_type, id, if_match).await?;
        self.update(resource_type, id, resource, expected).await
    }

    /// Deletes a resource guarded by an `If-Match` header value.
    async fn delete_with_match(
        &self,
        resource_type: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> StorageResult<WriteResult> {
        let expected = self.required_match(resource_type, id, if_match).await?;
        self.soft_delete(resource_type, id, expected).await
    }

    /// Turns an `If-Match` value into the expected version.
    async fn required_match(
        &self,
        resource_type: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> StorageResult<u64> {
        match if_match {
            Some(value) => parse_if_match(value),
            None => {
                let actual = self.current_version(resource_type, id).await?.ok_or_else(|| {
                    ResourceError::NotFound {
                        resource_type: resource_type.to_string(),
                        id: id.to_string(),
                    }
                })?;
                Err(ConcurrencyError::VersionConflict {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    expected_version: None,
                    actual_version: actual,
                }
                .into())
            }
        }
    }
}

/// Checks that `expected` is the current version.
pub fn check_version_match(
    resource_type: &str,
    id: &str,
    expected: u64,
    actual: u64,
) -> StorageResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StorageError::Concurrency(
            ConcurrencyError::VersionConflict {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                expected_version: Some(expected),
                actual_version: actual,
            },
        ))
    }
}

/// Strips weak-validator and quote decoration from an ETag.
///
/// ETags may be formatted as `W/"1"`, `"1"`, or just `1`.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim()
        .trim_start_matches("W/")
        .trim_start_matches('"')
        .trim_end_matches('"')
}

/// Parses an `If-Match` value into a version id.
pub fn parse_if_match(value: &str) -> StorageResult<u64> {
    normalize_etag(value).parse::<u64>().map_err(|_| {
        StorageError::Validation(ValidationError::InvalidIfMatch {
            value: value.to_string(),
        })
    })
}
