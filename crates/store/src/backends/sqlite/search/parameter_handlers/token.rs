//! Token parameter SQL handler.

use crate::error::SearchError;
use crate::search::escape::split_unescaped;
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::{invalid_value, like_escape, unescaped};

/// Handles token parameter SQL generation.
pub struct TokenHandler;

impl TokenHandler {
    /// Builds SQL for a token parameter value.
    ///
    /// Token values can be:
    /// - `code` - matches any system
    /// - `system|code` - matches specific system and code
    /// - `|code` - matches code with no system (empty or null)
    /// - `system|` - matches any code in system
    ///
    /// `:text` searches the display, `:above` and `:below` compare codes by
    /// prefix.
    pub fn build_sql(
        value: &SearchValue,
        modifier: Option<&SearchModifier>,
        si: &str,
        param: &str,
    ) -> Result<SqlFragment, SearchError> {
        if matches!(modifier, Some(SearchModifier::Text)) {
            let text = unescaped(param, &value.value)?;
            return Ok(SqlFragment::with_params(
                format!("{}.value_token_display LIKE ? ESCAPE '\\'", si),
                vec![SqlParam::string(format!("%{}%", like_escape(&text)))],
            ));
        }

        let parts = split_unescaped(&value.value, '|');
        let (system, code) = match parts.as_slice() {
            [code] => (None, unescaped(param, code)?),
            [system, code] => (Some(unescaped(param, system)?), unescaped(param, code)?),
            _ => return Err(invalid_value(param, &value.value, "too many '|' separators")),
        };

        let code_condition = |code: String| -> SqlFragment {
            match modifier {
                Some(SearchModifier::Below) => SqlFragment::with_params(
                    format!("substr({si}.value_token_code, 1, length(?)) = ?", si = si),
                    vec![SqlParam::string(code.clone()), SqlParam::string(code)],
                ),
                Some(SearchModifier::Above) => SqlFragment::with_params(
                    format!(
                        "{si}.value_token_code <> '' AND substr(?, 1, length({si}.value_token_code)) = {si}.value_token_code",
                        si = si
                    ),
                    vec![SqlParam::string(code)],
                ),
                _ => SqlFragment::with_params(
                    format!("{}.value_token_code = ?", si),
                    vec![SqlParam::string(code)],
                ),
            }
        };

        Ok(match system {
            None => code_condition(code),
            Some(system) if system.is_empty() => SqlFragment::new(format!(
                "{si}.value_token_system IS NULL OR {si}.value_token_system = ''",
                si = si
            ))
            .and(code_condition(code)),
            Some(system) if code.is_empty() => SqlFragment::with_params(
                format!("{}.value_token_system = ?", si),
                vec![SqlParam::string(system)],
            ),
            Some(system) => SqlFragment::with_params(
                format!("{}.value_token_system = ?", si),
                vec![SqlParam::string(system)],
            )
            .and(code_condition(code)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(value: &str, modifier: Option<SearchModifier>) -> SqlFragment {
        TokenHandler::build_sql(&SearchValue::eq(value), modifier.as_ref(), "si", "code").unwrap()
    }

    #[test]
    fn test_code_only() {
        let frag = sql("final", None);
        assert_eq!(frag.sql, "si.value_token_code = ?");
        assert_eq!(frag.params, vec![SqlParam::string("final")]);
    }

    #[test]
    fn test_system_and_code() {
        let frag = sql("http://loinc.org|8867-4", None);
        assert!(frag.sql.contains("value_token_system = ?"));
        assert_eq!(
            frag.params,
            vec![SqlParam::string("http://loinc.org"), SqlParam::string("8867-4")]
        );
    }

    #[test]
    fn test_empty_system() {
        let frag = sql("|abc", None);
        assert!(frag.sql.contains("value_token_system IS NULL"));
        assert_eq!(frag.params, vec![SqlParam::string("abc")]);
    }

    #[test]
    fn test_system_only() {
        let frag = sql("http://loinc.org|", None);
        assert_eq!(frag.sql, "si.value_token_system = ?");
    }

    #[test]
    fn test_escaped_pipe_is_part_of_code() {
        let frag = sql("a\\|b", None);
        assert_eq!(frag.params, vec![SqlParam::string("a|b")]);
    }

    #[test]
    fn test_text_searches_display() {
        let frag = sql("heart_rate", Some(SearchModifier::Text));
        assert!(frag.sql.contains("value_token_display LIKE"));
        assert_eq!(frag.params, vec![SqlParam::string("%heart\\_rate%")]);
    }

    #[test]
    fn test_below_and_above() {
        let below = sql("A01", Some(SearchModifier::Below));
        assert!(below.sql.contains("substr(si.value_token_code, 1, length(?))"));
        let above = sql("A01.1", Some(SearchModifier::Above));
        assert!(above.sql.contains("substr(?, 1, length(si.value_token_code))"));
    }

    #[test]
    fn test_too_many_separators() {
        let err = TokenHandler::build_sql(&SearchValue::eq("a|b|c"), None, "si", "code");
        assert!(matches!(err, Err(SearchError::InvalidValue { .. })));
    }
}
