//! String parameter SQL handler.

use crate::error::SearchError;
use crate::search::normalize_string;
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::{like_escape, unescaped};

/// Handles string parameter SQL generation.
pub struct StringHandler;

impl StringHandler {
    /// Builds SQL for a string parameter value.
    ///
    /// Default matching is starts-with on the folded value. `:contains`
    /// matches anywhere, `:exact` compares the text as written.
    pub fn build_sql(
        value: &SearchValue,
        modifier: Option<&SearchModifier>,
        si: &str,
        param: &str,
    ) -> Result<SqlFragment, SearchError> {
        let text = unescaped(param, &value.value)?;

        if matches!(modifier, Some(SearchModifier::Exact)) {
            return Ok(SqlFragment::with_params(
                format!("{}.value_string_raw = ?", si),
                vec![SqlParam::string(text)],
            ));
        }

        let folded = like_escape(&normalize_string(&text));
        let pattern = match modifier {
            Some(SearchModifier::Contains) => format!("%{}%", folded),
            _ => format!("{}%", folded),
        };
        Ok(SqlFragment::with_params(
            format!("{}.value_string LIKE ? ESCAPE '\\'", si),
            vec![SqlParam::string(pattern)],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_starts_with_folded() {
        let frag = StringHandler::build_sql(&SearchValue::eq("Müller"), None, "si", "family").unwrap();
        assert_eq!(frag.sql, "si.value_string LIKE ? ESCAPE '\\'");
        assert_eq!(frag.params, vec![SqlParam::string("muller%")]);
    }

    #[test]
    fn test_contains() {
        let frag = StringHandler::build_sql(
            &SearchValue::eq("ill"),
            Some(&SearchModifier::Contains),
            "si",
            "family",
        )
        .unwrap();
        assert_eq!(frag.params, vec![SqlParam::string("%ill%")]);
    }

    #[test]
    fn test_exact_uses_raw_text() {
        let frag = StringHandler::build_sql(
            &SearchValue::eq("Smith\\,Jr"),
            Some(&SearchModifier::Exact),
            "si",
            "family",
        )
        .unwrap();
        assert_eq!(frag.sql, "si.value_string_raw = ?");
        assert_eq!(frag.params, vec![SqlParam::string("Smith,Jr")]);
    }
}
