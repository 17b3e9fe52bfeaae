//! Core types for the store.
//!
//! - [`StoredResource`], [`WriteResult`] - A resource with persistence metadata
//! - [`SearchParameter`], [`SearchQuery`] - Parsed search queries
//! - [`Pagination`], [`Page`] - Offset pagination
//! - [`TemporalValue`], [`DateRange`] - Date values reduced to intervals
//!
//! # Examples
//!
//! ```
//! use helios_store::types::{
//!     SearchParamType, SearchParameter, SearchQuery, SearchValue, SortDirective,
//! };
//!
//! let query = SearchQuery::new("Patient")
//!     .with_parameter(SearchParameter::new(
//!         "name",
//!         SearchParamType::String,
//!         vec![SearchValue::eq("Smith")],
//!     ))
//!     .with_sort(SortDirective::parse("-_lastUpdated"))
//!     .with_count(20);
//! assert_eq!(query.parameters.len(), 1);
//! ```

mod pagination;
mod search_params;
mod stored_resource;
mod temporal;

pub use pagination::{Page, PageInfo, Pagination};

pub use search_params::{
    ChainLink, IncludeDirective, IncludeType, ReverseChainedParameter, SearchModifier,
    SearchParamType, SearchParameter, SearchPrefix, SearchQuery, SearchValue, SortDirection,
    SortDirective, TotalMode,
};

pub use stored_resource::{StoredResource, WriteResult};

pub use temporal::{
    DatePrecision, DateRange, PrecisePoint, RANGE_MAX, RANGE_MIN, TemporalError, TemporalValue,
    format_key,
};
