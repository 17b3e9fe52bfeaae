//! Search parameter management, extraction and query parsing.
//!
//! - [`registry`] - Compiled SearchParameter rules per resource type
//! - [`loader`] - Embedded R4 definitions and custom SearchParameter JSON
//! - [`path`] - The element path subset used by search expressions
//! - [`converters`] - Per-type conversion of elements into index values
//! - [`extractor`] - Applies rules to a resource, collecting failures
//! - [`references`] - Reference normalization and the reference graph
//! - [`compartment`] - Patient compartment membership
//! - [`parser`] - Query strings into [`SearchQuery`](crate::types::SearchQuery)
//! - [`errors`] - Search-specific error types
//!
//! # Write path
//!
//! ```text
//! resource ──► SearchParameterExtractor ──► ExtractionOutcome { values, failures }
//!          ──► ReferenceIndexer          ──► Vec<ReferenceEdge>
//!                                               │
//!                                               ▼
//!                                      CompartmentIndexer::plan
//! ```
//!
//! All three run before the write transaction opens; only `urn:uuid:` type
//! lookups and compartment hops need the database.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::RwLock;
//! use helios_store::search::{SearchParameterExtractor, SearchParameterRegistry};
//! use serde_json::json;
//!
//! let registry = SearchParameterRegistry::with_embedded().unwrap();
//! let extractor = SearchParameterExtractor::new(Arc::new(RwLock::new(registry)));
//!
//! let patient = json!({
//!     "resourceType": "Patient",
//!     "id": "p1",
//!     "name": [{"family": "Müller", "given": ["Anna"]}]
//! });
//! let outcome = extractor.extract("Patient", &patient).unwrap();
//! assert!(outcome.is_complete());
//! assert_eq!(outcome.values_for("family").count(), 1);
//! ```

pub mod compartment;
pub mod converters;
pub mod errors;
pub mod escape;
pub mod extractor;
pub mod loader;
pub mod parser;
pub mod path;
pub mod references;
pub mod registry;
pub mod units;

pub use compartment::{CompartmentIndexer, CompartmentPlan, HopTarget, PATIENT_COMPARTMENT};
pub use converters::{IndexValue, ValueConverter, normalize_string};
pub use errors::{ExtractionError, LoaderError, RegistryError};
pub use extractor::{
    ExtractedValue, ExtractionFailure, ExtractionOutcome, SearchParameterExtractor,
};
pub use loader::SearchParameterLoader;
pub use parser::{QueryParser, parse_query};
pub use path::ElementPath;
pub use references::{ReferenceEdge, ReferenceIndexer, ReferenceKind, ReferenceTarget};
pub use registry::{
    CompositeComponentDef, DefinitionLoadError, ExtractionRule, SearchParameterDefinition,
    SearchParameterRegistry, SearchParameterSource, SearchParameterStatus,
};
