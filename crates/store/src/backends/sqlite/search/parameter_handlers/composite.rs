//! Composite parameter SQL handler.

use crate::error::SearchError;
use crate::search::escape::split_unescaped;
use crate::types::{SearchParamType, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::value_condition;

/// Handles composite parameter SQL generation.
///
/// Composite parameters combine multiple sub-parameters with a `$` separator.
/// For example, `component-code-value-quantity=http://loinc.org|8480-6$lt60`
/// combines a token search on code with a quantity search on value. Each
/// component is an index row; rows from the same tuple share a
/// `composite_group` and differ by `component_index`.
pub struct CompositeHandler;

impl CompositeHandler {
    /// Builds the tuple condition for one composite value. Component `i` is
    /// matched against the index row aliased `aliases[i]`.
    pub fn build_sql(
        value: &SearchValue,
        param: &str,
        components: &[SearchParamType],
        unit_aware: &[bool],
        aliases: &[String],
    ) -> Result<SqlFragment, SearchError> {
        let parts = split_unescaped(&value.value, '$');
        if components.is_empty() || parts.len() != components.len() {
            return Err(SearchError::InvalidComposite {
                message: format!(
                    "'{}' expects {} components separated by '$', got {}",
                    param,
                    components.len(),
                    parts.len()
                ),
            });
        }

        let mut condition = SqlFragment::default();
        for (i, (part, param_type)) in parts.iter().zip(components).enumerate() {
            let component_value = if param_type.is_ordered() {
                SearchValue::parse(part)
            } else {
                SearchValue::eq(*part)
            };
            if !component_value.prefix.is_valid_for(*param_type) {
                return Err(SearchError::UnsupportedPrefix {
                    prefix: component_value.prefix.to_string(),
                    param: param.to_string(),
                });
            }
            let units = unit_aware.get(i).copied().unwrap_or(false);
            condition = condition.and(value_condition(
                *param_type,
                &component_value,
                None,
                &aliases[i],
                units,
                param,
            )?);
        }
        Ok(condition)
    }

    /// `EXISTS` a complete tuple of `param` on the resource aliased `alias`
    /// satisfying `condition`.
    pub fn exists(alias: &str, param: &str, aliases: &[String], condition: SqlFragment) -> SqlFragment {
        let Some(first) = aliases.first() else {
            return SqlFragment::never();
        };

        let mut from = format!("search_index {}", first);
        for (i, other) in aliases.iter().enumerate().skip(1) {
            from.push_str(&format!(
                " JOIN search_index {o} ON {o}.resource_type = {f}.resource_type \
                 AND {o}.resource_id = {f}.resource_id AND {o}.param_name = {f}.param_name \
                 AND {o}.composite_group = {f}.composite_group AND {o}.component_index = {i}",
                o = other,
                f = first,
                i = i
            ));
        }

        let head = SqlFragment::with_params(
            format!(
                "{f}.resource_type = {a}.resource_type AND {f}.resource_id = {a}.id \
                 AND {f}.param_name = ? AND {f}.composite_group IS NOT NULL AND {f}.component_index = 0",
                f = first,
                a = alias
            ),
            vec![SqlParam::string(param)],
        );
        let body = head.and(condition);
        SqlFragment::with_params(
            format!("EXISTS (SELECT 1 FROM {} WHERE {})", from, body.sql),
            body.params,
        )
    }
}
