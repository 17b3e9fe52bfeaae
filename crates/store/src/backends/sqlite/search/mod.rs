//! SQLite Search Implementation.
//!
//! - Query builder for translating FHIR search queries to SQL
//! - Parameter handlers for each search parameter type
//! - Search index writer

pub mod parameter_handlers;
pub mod query_builder;
pub mod writer;
