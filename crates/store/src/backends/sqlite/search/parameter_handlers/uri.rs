//! URI parameter SQL handler.

use crate::error::SearchError;
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::unescaped;

/// Handles URI parameter SQL generation.
pub struct UriHandler;

impl UriHandler {
    /// Builds SQL for a URI parameter value.
    ///
    /// URIs match exactly. `:below` matches URIs the value is a prefix of,
    /// `:above` matches URIs that are a prefix of the value.
    pub fn build_sql(
        value: &SearchValue,
        modifier: Option<&SearchModifier>,
        si: &str,
        param: &str,
    ) -> Result<SqlFragment, SearchError> {
        let uri = unescaped(param, &value.value)?;

        Ok(match modifier {
            Some(SearchModifier::Below) => SqlFragment::with_params(
                format!("substr({}.value_uri, 1, length(?)) = ?", si),
                vec![SqlParam::string(uri.clone()), SqlParam::string(uri)],
            ),
            Some(SearchModifier::Above) => SqlFragment::with_params(
                format!(
                    "{si}.value_uri <> '' AND substr(?, 1, length({si}.value_uri)) = {si}.value_uri",
                    si = si
                ),
                vec![SqlParam::string(uri)],
            ),
            _ => SqlFragment::with_params(format!("{}.value_uri = ?", si), vec![SqlParam::string(uri)]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let frag = UriHandler::build_sql(&SearchValue::eq("http://acme.org/fhir/vs"), None, "si", "url").unwrap();
        assert_eq!(frag.sql, "si.value_uri = ?");
    }

    #[test]
    fn test_below() {
        let frag = UriHandler::build_sql(
            &SearchValue::eq("http://acme.org/fhir/"),
            Some(&SearchModifier::Below),
            "si",
            "url",
        )
        .unwrap();
        assert_eq!(frag.params.len(), 2);
        assert!(frag.sql.starts_with("substr(si.value_uri"));
    }

    #[test]
    fn test_above() {
        let frag = UriHandler::build_sql(
            &SearchValue::eq("http://acme.org/fhir/ValueSet/123"),
            Some(&SearchModifier::Above),
            "si",
            "url",
        )
        .unwrap();
        assert_eq!(frag.params.len(), 1);
    }
}
