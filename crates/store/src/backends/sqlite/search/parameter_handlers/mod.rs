//! Parameter-specific SQL handlers.
//!
//! Each handler turns one search value into a condition on a `search_index`
//! row bound to an alias. Values arrive with their escapes intact; handlers
//! split on their own separator before unescaping.

mod composite;
mod date;
mod number;
mod quantity;
mod reference;
mod string;
mod token;
mod uri;

pub use composite::CompositeHandler;
pub use date::{DateColumns, DateHandler};
pub use number::NumberHandler;
pub use quantity::QuantityHandler;
pub use reference::ReferenceHandler;
pub use string::StringHandler;
pub use token::TokenHandler;
pub use uri::UriHandler;

use crate::error::SearchError;
use crate::search::escape::unescape;
use crate::types::{SearchModifier, SearchParamType, SearchValue};

use super::query_builder::SqlFragment;

/// Condition for one value of a parameter of `param_type` against the index
/// row aliased `si`. `:not` and `:missing` are handled by the caller.
pub fn value_condition(
    param_type: SearchParamType,
    value: &SearchValue,
    modifier: Option<&SearchModifier>,
    si: &str,
    unit_aware: bool,
    param_name: &str,
) -> Result<SqlFragment, SearchError> {
    match param_type {
        SearchParamType::String => StringHandler::build_sql(value, modifier, si, param_name),
        SearchParamType::Token => TokenHandler::build_sql(value, modifier, si, param_name),
        SearchParamType::Date => DateHandler::build_sql(value, &DateColumns::index(si), param_name),
        SearchParamType::Number => NumberHandler::build_sql(value, si, param_name),
        SearchParamType::Quantity => QuantityHandler::build_sql(value, si, unit_aware, param_name),
        SearchParamType::Reference => ReferenceHandler::build_sql(value, modifier, si, param_name),
        SearchParamType::Uri => UriHandler::build_sql(value, modifier, si, param_name),
        SearchParamType::Composite => Err(SearchError::InvalidComposite {
            message: format!("'{}' cannot be nested in a composite", param_name),
        }),
    }
}

pub(crate) fn invalid_value(param: &str, value: &str, message: impl Into<String>) -> SearchError {
    SearchError::InvalidValue {
        param: param.to_string(),
        value: value.to_string(),
        message: message.into(),
    }
}

/// Unescapes one structural part of a value.
pub(crate) fn unescaped(param: &str, part: &str) -> Result<String, SearchError> {
    unescape(part).ok_or_else(|| invalid_value(param, part, "invalid escape sequence"))
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
