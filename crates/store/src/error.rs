//! Error types for the store.
//!
//! This module defines all error types used throughout the store, following a
//! hierarchy that separates resource state errors, concurrency errors,
//! validation and integrity errors, search errors and backend errors.
//!
//! Extraction problems are not errors: they are reported as
//! [`ExtractionWarning`]s attached to an otherwise successful write.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Concurrency and versioning errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Referential integrity errors
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Search operation errors
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StorageError {
    /// Returns `true` if the caller may retry the operation with fresh state.
    ///
    /// Only version conflicts are retryable: the caller re-reads the resource
    /// and resubmits against the new version.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Concurrency(_))
    }

    /// Returns `true` for the not-found family (unknown id, unknown version, tombstone).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::Resource(
                ResourceError::NotFound { .. }
                    | ResourceError::VersionNotFound { .. }
                    | ResourceError::Gone { .. }
            )
        )
    }
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found (or is deleted).
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// A resource with the given ID already exists.
    #[error("resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// The requested version records a deletion.
    #[error("resource deleted: {resource_type}/{id}/_history/{version_id}")]
    Gone {
        resource_type: String,
        id: String,
        version_id: u64,
    },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: u64,
    },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// Version conflict detected during optimistic locking.
    ///
    /// `expected_version` is `None` when the caller supplied no `If-Match`.
    #[error("version conflict on {resource_type}/{id}: expected {}, found {actual_version}", display_expected(.expected_version))]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: Option<u64>,
        actual_version: u64,
    },
}

fn display_expected(expected: &Option<u64>) -> String {
    match expected {
        Some(v) => v.to_string(),
        None => "<missing If-Match>".to_string(),
    }
}

/// Errors related to resource validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The resource failed validation.
    #[error("invalid resource: {message}")]
    InvalidResource {
        message: String,
        details: Vec<ValidationDetail>,
    },

    /// The `resourceType` in the content does not match the target type.
    #[error("resource type mismatch: expected {expected}, found {found}")]
    ResourceTypeMismatch { expected: String, found: String },

    /// The resource id is not a valid FHIR id.
    #[error("invalid resource id: {id}")]
    InvalidId { id: String },

    /// Missing required field.
    #[error("missing required field: {resource_type}.{field}")]
    MissingRequiredField { resource_type: String, field: String },

    /// Invalid reference format.
    #[error("invalid reference: {reference}")]
    InvalidReference { reference: String, message: String },

    /// The search parameter definition is invalid.
    #[error("invalid search parameter: {parameter}: {message}")]
    InvalidSearchParameter { parameter: String, message: String },

    /// An If-Match value could not be read as a version.
    #[error("invalid If-Match value: {value}")]
    InvalidIfMatch { value: String },
}

/// Detailed validation error information.
#[derive(Debug, Clone)]
pub struct ValidationDetail {
    /// The path to the offending element.
    pub path: String,
    /// A human-readable error message.
    pub message: String,
}

impl ValidationDetail {
    /// Creates a new validation detail.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors related to referential integrity.
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// A required reference points at a resource that does not exist.
    #[error("required reference {path} of {source_type}/{source_id} points to missing {target}")]
    MissingReferenceTarget {
        source_type: String,
        source_id: String,
        path: String,
        target: String,
    },
}

/// Errors related to search operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The parameter is not defined for the resource type.
    #[error("unknown search parameter '{name}' for {resource_type}")]
    UnknownParameter { resource_type: String, name: String },

    /// The search modifier is not supported for this parameter type.
    #[error("unsupported modifier '{modifier}' for parameter type '{param_type}'")]
    UnsupportedModifier {
        modifier: String,
        param_type: String,
    },

    /// The prefix is not valid for this parameter type.
    #[error("unsupported prefix '{prefix}' for parameter '{param}'")]
    UnsupportedPrefix { prefix: String, param: String },

    /// A value could not be interpreted for the parameter's type.
    #[error("invalid value '{value}' for parameter '{param}': {message}")]
    InvalidValue {
        param: String,
        value: String,
        message: String,
    },

    /// Search query parsing failed.
    #[error("failed to parse search query: {message}")]
    QueryParseError { message: String },

    /// Composite search parameter error.
    #[error("invalid composite search parameter: {message}")]
    InvalidComposite { message: String },

    /// A chain exceeded the configured depth.
    #[error("chain '{chain}' exceeds maximum depth {max_depth}")]
    ChainTooDeep { chain: String, max_depth: usize },
}

/// Errors originating from the database backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// A non-fatal indexing problem attached to a successful write.
///
/// The resource was persisted, but the named rule produced no (or only
/// partial) index rows, so searches on it may miss the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionWarning {
    /// Resource type of the written resource.
    pub resource_type: String,
    /// Logical id of the written resource.
    pub resource_id: String,
    /// The rule that failed: a search parameter code or a reference path.
    pub rule: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: rule '{}' not fully indexed: {}",
            self.resource_type, self.resource_id, self.rule, self.message
        )
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for search operations.
pub type SearchResult<T> = Result<T, SearchError>;

// Implement conversions from common error types

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}
