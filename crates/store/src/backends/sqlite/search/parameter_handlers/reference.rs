//! Reference parameter SQL handler.

use crate::error::SearchError;
use crate::search::{ReferenceKind, ReferenceTarget};
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::unescaped;

/// Handles reference parameter SQL generation.
pub struct ReferenceHandler;

impl ReferenceHandler {
    /// Builds SQL for a reference parameter value.
    ///
    /// Reference values can be:
    /// - `Type/id` - matches the resolved target
    /// - `id` - matches any target type, or the one named by `:Type`
    /// - an absolute URL - matches the reference text as stored
    pub fn build_sql(
        value: &SearchValue,
        modifier: Option<&SearchModifier>,
        si: &str,
        param: &str,
    ) -> Result<SqlFragment, SearchError> {
        let text = unescaped(param, &value.value)?;
        let type_filter = match modifier {
            Some(SearchModifier::Type(t)) => Some(t.as_str()),
            _ => None,
        };

        let target = ReferenceTarget::parse(&text, type_filter);
        let condition = match (&target.kind, &target.target_type, &target.target_id) {
            (ReferenceKind::Relative, Some(ty), Some(id)) => SqlFragment::with_params(
                format!(
                    "{si}.value_reference_type = ? AND {si}.value_reference_id = ?",
                    si = si
                ),
                vec![SqlParam::string(ty), SqlParam::string(id)],
            ),
            (ReferenceKind::UrnUuid, _, Some(id)) => Self::by_id(si, id),
            (ReferenceKind::Absolute, ..) | (ReferenceKind::Contained, ..) => SqlFragment::with_params(
                format!("{}.value_reference = ?", si),
                vec![SqlParam::string(&text)],
            ),
            _ if !text.contains('/') && !text.contains(':') => Self::by_id(si, &text),
            _ => SqlFragment::with_params(
                format!("{}.value_reference = ?", si),
                vec![SqlParam::string(&text)],
            ),
        };

        Ok(match type_filter {
            Some(ty) => condition.and(SqlFragment::with_params(
                format!("{}.value_reference_type = ?", si),
                vec![SqlParam::string(ty)],
            )),
            None => condition,
        })
    }

    fn by_id(si: &str, id: &str) -> SqlFragment {
        SqlFragment::with_params(
            format!("{}.value_reference_id = ?", si),
            vec![SqlParam::string(id)],
        )
    }
}
