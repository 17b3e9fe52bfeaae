//! SQLite backend implementation.
//!
//! Implements every storage trait on a single SQLite database, either
//! in-memory (tests) or file based with WAL (small deployments).
//!
//! # Example
//!
//! ```no_run
//! use helios_store::backends::sqlite::SqliteBackend;
//! use helios_store::core::ResourceStorage;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::open("./data/clinical.db")?;
//! backend.init_schema()?;
//!
//! let written = backend
//!     .create("Patient", json!({"resourceType": "Patient", "name": [{"family": "Smith"}]}))
//!     .await?;
//! assert!(written.fully_indexed());
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! | Table | Key | Content |
//! |-------|-----|---------|
//! | `resources` | `(resource_type, id)` | current version, tombstones included |
//! | `resource_history` | `(resource_type, id, version_id)` | every version ever written |
//! | `search_index` | `(resource_type, resource_id)` | one row per extracted value |
//! | `resource_references` | `(source_type, source_id)` | reference edges |
//! | `compartments` | `(compartment_type, compartment_id, ...)` | Patient membership |
//!
//! The three derived tables always describe the current version and are
//! rewritten in the same transaction as the resource row.

mod backend;
mod history;
mod schema;
pub(crate) mod search;
mod search_impl;
mod storage;

pub use backend::{SqliteBackend, SqliteBackendConfig};
pub use schema::SCHEMA_VERSION;
