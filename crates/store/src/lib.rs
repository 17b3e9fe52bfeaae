//! Helios clinical data store
//!
//! This crate stores FHIR R4 resources as versioned JSON documents and keeps
//! the indexes needed to search them: extracted search values, the reference
//! graph and Patient compartment membership.
//!
//! # Features
//!
//! - **Versioning**: full resource history with optimistic locking (`If-Match`)
//! - **Soft deletes**: tombstones keep their history and their id
//! - **FHIR Search**: all parameter types, modifiers, prefixes, chaining,
//!   `_has`, composites, `_sort`, `_include`/`_revinclude`
//! - **Compartments**: Patient membership and `$everything`
//! - **Referential integrity**: required references must resolve; dangling
//!   optional references are listed
//!
//! Available backend features:
//! - `sqlite` (default) - SQLite with in-memory and file modes
//!
//! # Architecture
//!
//! - [`types`] - Stored resources, search queries, pagination, temporal values
//! - [`error`] - Error types for all operations
//! - [`core`] - Storage traits
//! - [`search`] - Search parameter registry, extraction, references, compartments
//! - [`validation`] - Structural checks applied before every write
//! - [`metrics`] - Counters and histograms recorded by the backends
//! - [`backends`] - Backend implementations
//!
//! # Quick Start
//!
//! ```no_run
//! use helios_store::backends::sqlite::SqliteBackend;
//! use helios_store::core::{ResourceStorage, SearchProvider, VersionedStorage};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::in_memory()?;
//! backend.init_schema()?;
//!
//! let created = backend
//!     .create("Patient", json!({
//!         "resourceType": "Patient",
//!         "id": "patient-123",
//!         "name": [{"family": "Smith", "given": ["John"]}]
//!     }))
//!     .await?
//!     .into_resource();
//! assert_eq!(created.version_id(), 1);
//!
//! let mut content = created.content().clone();
//! content["active"] = json!(true);
//! backend
//!     .update_with_match("Patient", "patient-123", Some("W/\"1\""), content)
//!     .await?;
//!
//! let result = backend.search_str("Patient", "family=smi&_count=10").await?;
//! assert_eq!(result.total, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Search
//!
//! Queries can also be built directly:
//!
//! ```
//! use helios_store::types::{
//!     IncludeDirective, IncludeType, SearchModifier, SearchParamType, SearchParameter,
//!     SearchQuery, SearchValue, SortDirective,
//! };
//!
//! let query = SearchQuery::new("Observation")
//!     .with_parameter(SearchParameter {
//!         name: "code".to_string(),
//!         param_type: SearchParamType::Token,
//!         modifier: Some(SearchModifier::Not),
//!         values: vec![SearchValue::eq("http://loinc.org|8867-4")],
//!         chain: vec![],
//!         components: vec![],
//!     })
//!     .with_include(IncludeDirective {
//!         include_type: IncludeType::Include,
//!         source_type: "Observation".to_string(),
//!         search_param: "subject".to_string(),
//!         target_type: Some("Patient".to_string()),
//!     })
//!     .with_sort(SortDirective::parse("-date"))
//!     .with_count(20);
//! assert_eq!(query.includes.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod core;
pub mod error;
pub mod metrics;
pub mod search;
pub mod types;
pub mod validation;

// Re-export commonly used types at crate root
pub use error::{ExtractionWarning, StorageError, StorageResult};
pub use types::{Pagination, SearchQuery, StoredResource, WriteResult};

// Re-export core traits
pub use core::{
    CompartmentProvider, InstanceHistoryProvider, ReferenceProvider, ResourceStorage,
    SearchProvider, VersionedStorage,
};

#[cfg(feature = "sqlite")]
pub use backends::sqlite::{SqliteBackend, SqliteBackendConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
