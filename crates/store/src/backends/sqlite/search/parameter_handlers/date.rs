//! Date parameter SQL handler.
//!
//! Both sides are half-open ranges: the query literal `[qs, qe)` from its
//! precision, the indexed value `[rs, re)` from its own. Bounds are stored as
//! fixed-width UTC keys, so comparisons are lexical.

use chrono::{DateTime, Duration, Utc};

use crate::error::SearchError;
use crate::types::{PrecisePoint, RANGE_MAX, RANGE_MIN, SearchPrefix, SearchValue, format_key};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::{invalid_value, unescaped};

/// Where the resource side of a date comparison lives.
#[derive(Debug, Clone)]
pub enum DateColumns {
    /// An index row with start and end keys.
    Range {
        /// Inclusive lower bound column.
        start: String,
        /// Exclusive upper bound column.
        end: String,
    },
    /// A single millisecond-precision instant, such as `last_updated`.
    Point(String),
}

impl DateColumns {
    /// The date columns of the `search_index` row aliased `si`.
    pub fn index(si: &str) -> Self {
        DateColumns::Range {
            start: format!("{}.value_date_start", si),
            end: format!("{}.value_date_end", si),
        }
    }

    /// `rs >= key`
    fn starts_at_or_after(&self, key: String) -> SqlFragment {
        let col = match self {
            DateColumns::Range { start, .. } => start,
            DateColumns::Point(col) => col,
        };
        SqlFragment::with_params(format!("{} >= ?", col), vec![SqlParam::string(key)])
    }

    /// `rs < key`
    fn starts_before(&self, key: String) -> SqlFragment {
        let col = match self {
            DateColumns::Range { start, .. } => start,
            DateColumns::Point(col) => col,
        };
        SqlFragment::with_params(format!("{} < ?", col), vec![SqlParam::string(key)])
    }

    /// `re > key`; a point's end is one millisecond after it.
    fn ends_after(&self, key: String) -> SqlFragment {
        let sql = match self {
            DateColumns::Range { end, .. } => format!("{} > ?", end),
            DateColumns::Point(col) => format!("{} >= ?", col),
        };
        SqlFragment::with_params(sql, vec![SqlParam::string(key)])
    }

    /// `re <= key`
    fn ends_at_or_before(&self, key: String) -> SqlFragment {
        let sql = match self {
            DateColumns::Range { end, .. } => format!("{} <= ?", end),
            DateColumns::Point(col) => format!("{} < ?", col),
        };
        SqlFragment::with_params(sql, vec![SqlParam::string(key)])
    }
}

/// Handles date parameter SQL generation.
pub struct DateHandler;

impl DateHandler {
    /// Builds SQL for a date parameter value.
    ///
    /// Date comparisons respect the precision of the input:
    /// - "2024" matches the entire year
    /// - "2024-01" matches the entire month
    /// - "2024-01-15" matches the entire day
    pub fn build_sql(value: &SearchValue, columns: &DateColumns, param: &str) -> Result<SqlFragment, SearchError> {
        Self::build_sql_at(value, columns, param, Utc::now())
    }

    /// As [`build_sql`](Self::build_sql), with `ap` windows measured from `now`.
    pub fn build_sql_at(
        value: &SearchValue,
        columns: &DateColumns,
        param: &str,
        now: DateTime<Utc>,
    ) -> Result<SqlFragment, SearchError> {
        let literal = unescaped(param, &value.value)?;
        let point = PrecisePoint::parse(&literal).map_err(|e| invalid_value(param, &value.value, e.reason))?;
        let (qs, qe) = (point.value, point.upper_bound());

        Ok(match value.prefix {
            SearchPrefix::Eq => Self::within(columns, qs, qe),
            SearchPrefix::Ne => Self::within(columns, qs, qe).not(),
            SearchPrefix::Gt => columns.ends_after(format_key(qe)),
            SearchPrefix::Ge => columns.ends_after(format_key(qs)),
            SearchPrefix::Lt => columns.starts_before(format_key(qs)),
            SearchPrefix::Le => columns.starts_before(format_key(qe)),
            SearchPrefix::Sa => columns.starts_at_or_after(format_key(qe)),
            SearchPrefix::Eb => columns.ends_at_or_before(format_key(qs)),
            SearchPrefix::Ap => {
                let window = ((qs - now).abs() / 10).max(qe - qs);
                let low = shifted(qs, -window).unwrap_or_else(|| RANGE_MIN.to_string());
                let high = shifted(qe, window).unwrap_or_else(|| RANGE_MAX.to_string());
                columns.starts_before(high).and(columns.ends_after(low))
            }
        })
    }

    fn within(columns: &DateColumns, qs: DateTime<Utc>, qe: DateTime<Utc>) -> SqlFragment {
        columns
            .starts_at_or_after(format_key(qs))
            .and(columns.ends_at_or_before(format_key(qe)))
    }
}

fn shifted(at: DateTime<Utc>, by: Duration) -> Option<String> {
    at.checked_add_signed(by).map(format_key)
}
