//! Quantity parameter SQL handler.

use crate::error::SearchError;
use crate::search::escape::split_unescaped;
use crate::search::units::{canonicalize, is_ucum_system};
use crate::types::SearchValue;

use super::super::query_builder::{SqlFragment, SqlParam};
use super::number::{half_unit, parse_decimal, range_condition, range_condition_within};
use super::{invalid_value, unescaped};

/// Handles quantity parameter SQL generation.
pub struct QuantityHandler;

impl QuantityHandler {
    /// Builds SQL for a quantity parameter value.
    ///
    /// Quantity values have the format: `[prefix]number|system|code`.
    /// System and code are optional. When the parameter is unit-aware and the
    /// unit is a known UCUM code, the comparison runs on canonical values so
    /// `1.2|http://unitsofmeasure.org|kg` finds `1200 g`.
    pub fn build_sql(
        value: &SearchValue,
        si: &str,
        unit_aware: bool,
        param: &str,
    ) -> Result<SqlFragment, SearchError> {
        let parts = split_unescaped(&value.value, '|');
        let (number, system, code) = match parts.as_slice() {
            [number] => (*number, None, None),
            [number, system, code] => (*number, non_empty(param, system)?, non_empty(param, code)?),
            _ => {
                return Err(invalid_value(param, &value.value, "expected number|system|code"));
            }
        };
        let number = parse_decimal(param, number)?;

        if unit_aware
            && let Some(code) = code.as_deref()
            && is_ucum_system(system.as_deref())
            && let Some(canonical) = canonicalize(number, code)
        {
            // The written precision scales with the unit.
            let tolerance = canonicalize(half_unit(number), code)
                .map(|c| c.value)
                .unwrap_or_else(|| half_unit(canonical.value));
            let condition = range_condition_within(
                &format!("{}.value_quantity_canonical", si),
                value.prefix,
                canonical.value,
                tolerance,
                param,
            )?;
            return Ok(condition.and(SqlFragment::with_params(
                format!("{}.value_quantity_canonical_unit = ?", si),
                vec![SqlParam::string(canonical.unit)],
            )));
        }

        let mut condition = range_condition(&format!("{}.value_quantity_value", si), value.prefix, number, param)?;
        if let Some(code) = code {
            condition = condition.and(SqlFragment::with_params(
                format!("{si}.value_quantity_code = ? OR {si}.value_quantity_unit = ?", si = si),
                vec![SqlParam::string(code.clone()), SqlParam::string(code)],
            ));
        }
        if let Some(system) = system {
            condition = condition.and(SqlFragment::with_params(
                format!("{}.value_quantity_system = ?", si),
                vec![SqlParam::string(system)],
            ));
        }
        Ok(condition)
    }
}

fn non_empty(param: &str, part: &str) -> Result<Option<String>, SearchError> {
    let text = unescaped(param, part)?;
    Ok(if text.is_empty() { None } else { Some(text) })
}
