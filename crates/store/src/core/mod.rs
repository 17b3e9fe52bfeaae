//! Core storage traits.
//!
//! - [`ResourceStorage`] - CRUD with optimistic versioning
//! - [`VersionedStorage`] - version reads and `If-Match` writes
//! - [`InstanceHistoryProvider`] - the per-resource version log
//! - [`SearchProvider`] - FHIR search
//! - [`CompartmentProvider`], [`ReferenceProvider`] - graph queries
//!
//! # Trait Hierarchy
//!
//! ```text
//! ResourceStorage
//!     ├── VersionedStorage
//!     │       └── InstanceHistoryProvider
//!     ├── SearchProvider
//!     ├── CompartmentProvider
//!     └── ReferenceProvider
//! ```

pub mod compartment;
pub mod history;
pub mod search;
pub mod storage;
pub mod versioned;

pub use compartment::{CompartmentProvider, ReferenceProvider, ReferenceRecord};
pub use history::{
    HistoryEntry, HistoryOperation, HistoryPage, HistoryParams, InstanceHistoryProvider,
};
pub use search::{SearchProvider, SearchResult};
pub use storage::ResourceStorage;
pub use versioned::{VersionedStorage, check_version_match, normalize_etag, parse_if_match};
