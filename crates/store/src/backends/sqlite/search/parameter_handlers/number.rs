//! Number parameter SQL handler.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::SearchError;
use crate::types::{SearchPrefix, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::{invalid_value, unescaped};

/// Handles number parameter SQL generation.
pub struct NumberHandler;

impl NumberHandler {
    /// Builds SQL for a number parameter value.
    ///
    /// Equality honors the precision written: `100` matches `[99.5, 100.5)`,
    /// `100.0` matches `[99.95, 100.05)`.
    pub fn build_sql(value: &SearchValue, si: &str, param: &str) -> Result<SqlFragment, SearchError> {
        let number = parse_decimal(param, &value.value)?;
        range_condition(&format!("{}.value_number", si), value.prefix, number, param)
    }
}

pub(crate) fn parse_decimal(param: &str, raw: &str) -> Result<Decimal, SearchError> {
    let text = unescaped(param, raw)?;
    Decimal::from_str(text.trim()).map_err(|e| invalid_value(param, raw, e.to_string()))
}

/// Half a unit in the last written decimal place.
pub(crate) fn half_unit(number: Decimal) -> Decimal {
    Decimal::new(5, number.scale() + 1)
}

/// Compares `column` with `number` under `prefix`.
pub(crate) fn range_condition(
    column: &str,
    prefix: SearchPrefix,
    number: Decimal,
    param: &str,
) -> Result<SqlFragment, SearchError> {
    range_condition_within(column, prefix, number, half_unit(number), param)
}

/// As [`range_condition`], with the equality tolerance given explicitly.
pub(crate) fn range_condition_within(
    column: &str,
    prefix: SearchPrefix,
    number: Decimal,
    half_unit: Decimal,
    param: &str,
) -> Result<SqlFragment, SearchError> {
    let float = |d: Decimal| -> Result<SqlParam, SearchError> {
        d.to_f64()
            .map(SqlParam::float)
            .ok_or_else(|| invalid_value(param, &number.to_string(), "number out of range"))
    };
    let compare = |op: &str, d: Decimal| -> Result<SqlFragment, SearchError> {
        Ok(SqlFragment::with_params(format!("{} {} ?", column, op), vec![float(d)?]))
    };
    let between = |lo: Decimal, lo_op: &str, hi: Decimal, hi_op: &str| -> Result<SqlFragment, SearchError> {
        Ok(SqlFragment::with_params(
            format!("{c} {} ? AND {c} {} ?", lo_op, hi_op, c = column),
            vec![float(lo)?, float(hi)?],
        ))
    };

    match prefix {
        SearchPrefix::Eq => between(number - half_unit, ">=", number + half_unit, "<"),
        SearchPrefix::Ne => Ok(between(number - half_unit, ">=", number + half_unit, "<")?.not()),
        SearchPrefix::Gt => compare(">", number),
        SearchPrefix::Ge => compare(">=", number),
        SearchPrefix::Lt => compare("<", number),
        SearchPrefix::Le => compare("<=", number),
        SearchPrefix::Ap => {
            let delta = (number * Decimal::new(1, 1)).abs().max(half_unit);
            between(number - delta, ">=", number + delta, "<=")
        }
        SearchPrefix::Sa | SearchPrefix::Eb => Err(SearchError::UnsupportedPrefix {
            prefix: prefix.to_string(),
            param: param.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(value: &str) -> SqlFragment {
        NumberHandler::build_sql(&SearchValue::parse(value), "si", "probability").unwrap()
    }

    #[test]
    fn test_eq_uses_precision() {
        let frag = sql("100");
        assert_eq!(frag.sql, "si.value_number >= ? AND si.value_number < ?");
        assert_eq!(frag.params, vec![SqlParam::float(99.5), SqlParam::float(100.5)]);

        let precise = sql("100.0");
        let [SqlParam::Float(lo), SqlParam::Float(hi)] = precise.params.as_slice() else {
            panic!("expected two floats");
        };
        assert!((lo - 99.95).abs() < 1e-9);
        assert!((hi - 100.05).abs() < 1e-9);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(sql("gt5").sql, "si.value_number > ?");
        assert_eq!(sql("le5").sql, "si.value_number <= ?");
        assert!(sql("ne5").sql.starts_with("NOT ("));
    }

    #[test]
    fn test_ap_is_ten_percent() {
        let frag = sql("ap100");
        assert_eq!(frag.params, vec![SqlParam::float(90.0), SqlParam::float(110.0)]);
    }

    #[test]
    fn test_invalid_number() {
        let err = NumberHandler::build_sql(&SearchValue::eq("abc"), "si", "probability");
        assert!(matches!(err, Err(SearchError::InvalidValue { .. })));
    }

    #[test]
    fn test_sa_rejected() {
        let err = NumberHandler::build_sql(&SearchValue::parse("sa5"), "si", "probability");
        assert!(matches!(err, Err(SearchError::UnsupportedPrefix { .. })));
    }
}
