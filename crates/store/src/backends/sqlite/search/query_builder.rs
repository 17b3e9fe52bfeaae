//! SQL Query Builder for FHIR Search.
//!
//! Translates a [`SearchQuery`] into a `WHERE` clause over the `resources`
//! table. Every parameter becomes an `EXISTS` over `search_index` correlated
//! with the resource alias; chains and `_has` nest further `EXISTS` through
//! reference rows. Placeholders are anonymous (`?`) and bound in textual
//! order, so fragments compose by concatenation.

use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

use crate::error::SearchError;
use crate::search::SearchParameterRegistry;
use crate::search::escape::unescape;
use crate::types::{
    ChainLink, ReverseChainedParameter, SearchModifier, SearchParamType, SearchParameter,
    SearchQuery, SortDirection, SortDirective,
};

use super::parameter_handlers::{CompositeHandler, DateColumns, DateHandler, value_condition};

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    /// The SQL clause.
    pub sql: String,
    /// Bound parameter values, in placeholder order.
    pub params: Vec<SqlParam>,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// String parameter.
    String(String),
    /// Integer parameter.
    Integer(i64),
    /// Float parameter.
    Float(f64),
}

impl SqlParam {
    /// Creates a string parameter.
    pub fn string(s: impl Into<String>) -> Self {
        SqlParam::String(s.into())
    }

    /// Creates an integer parameter.
    pub fn integer(i: i64) -> Self {
        SqlParam::Integer(i)
    }

    /// Creates a float parameter.
    pub fn float(f: f64) -> Self {
        SqlParam::Float(f)
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::String(s) => s.to_sql(),
            SqlParam::Integer(i) => i.to_sql(),
            SqlParam::Float(f) => f.to_sql(),
        }
    }
}

impl SqlFragment {
    /// Creates a new SQL fragment.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A condition that matches nothing.
    pub fn never() -> Self {
        Self::new("0")
    }

    /// Combines with another fragment using AND.
    pub fn and(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) AND ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Combines with another fragment using OR.
    pub fn or(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) OR ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Negates the fragment.
    pub fn not(self) -> Self {
        Self {
            sql: format!("NOT ({})", self.sql),
            params: self.params,
        }
    }

    /// ORs all fragments; an empty list matches nothing.
    pub fn any(fragments: impl IntoIterator<Item = SqlFragment>) -> Self {
        fragments
            .into_iter()
            .reduce(SqlFragment::or)
            .unwrap_or_else(SqlFragment::never)
    }

    /// Parameters as trait objects for rusqlite.
    pub fn bind(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p as &dyn ToSql).collect()
    }
}

/// `?, ?, ?` for `n` values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Builds SQL from FHIR search parameters.
pub struct QueryBuilder<'a> {
    registry: &'a SearchParameterRegistry,
    next_alias: usize,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a new query builder.
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self {
            registry,
            next_alias: 0,
        }
    }

    fn alias(&mut self, prefix: &str) -> String {
        self.next_alias += 1;
        format!("{}{}", prefix, self.next_alias)
    }

    /// Conditions selecting the live resources that match `query`, with the
    /// `resources` table bound to `alias`.
    pub fn build_filter(&mut self, query: &SearchQuery, alias: &str) -> Result<SqlFragment, SearchError> {
        let mut filter = SqlFragment::with_params(
            format!("{a}.resource_type = ? AND {a}.is_deleted = 0", a = alias),
            vec![SqlParam::string(&query.resource_type)],
        );
        let types = [query.resource_type.clone()];
        for param in &query.parameters {
            filter = filter.and(self.parameter_condition(&types, alias, param)?);
        }
        for has in &query.reverse_chains {
            filter = filter.and(self.reverse_chain_condition(alias, has)?);
        }
        Ok(filter)
    }

    /// Condition for one parameter on the resource bound to `alias`, whose
    /// type is one of `types`.
    pub fn parameter_condition(
        &mut self,
        types: &[String],
        alias: &str,
        param: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        if let Some((link, rest)) = param.chain.split_first() {
            return self.chain_condition(alias, link, rest, param);
        }

        match param.name.as_str() {
            "_id" => return id_condition(alias, param),
            "_lastUpdated" => return last_updated_condition(alias, param),
            _ => {}
        }

        if param.is_missing_test() {
            let present = self.rows_exist(alias, &param.name, SqlFragment::default());
            let missing = param.values.first().is_some_and(|v| v.value == "true");
            return Ok(if missing { present.not() } else { present });
        }

        if param.param_type == SearchParamType::Composite {
            return self.composite_condition(types, alias, param);
        }

        let unit_aware = types
            .iter()
            .find_map(|t| self.registry.get_param(t, &param.name))
            .is_some_and(|def| def.unit_aware);

        let si = self.alias("si");
        let positive_modifier = match &param.modifier {
            Some(SearchModifier::Not) => None,
            other => other.as_ref(),
        };
        let values = param
            .values
            .iter()
            .map(|v| value_condition(param.param_type, v, positive_modifier, &si, unit_aware, &param.name))
            .collect::<Result<Vec<_>, _>>()?;
        let matches = self.rows_exist_as(&si, alias, &param.name, SqlFragment::any(values));

        Ok(if param.modifier == Some(SearchModifier::Not) {
            matches.not()
        } else {
            matches
        })
    }

    /// `EXISTS` an index row of `param_name` for the resource that satisfies `condition`.
    fn rows_exist(&mut self, alias: &str, param_name: &str, condition: SqlFragment) -> SqlFragment {
        let si = self.alias("si");
        self.rows_exist_as(&si, alias, param_name, condition)
    }

    fn rows_exist_as(&self, si: &str, alias: &str, param_name: &str, condition: SqlFragment) -> SqlFragment {
        let head = SqlFragment::with_params(
            format!(
                "{si}.resource_type = {a}.resource_type AND {si}.resource_id = {a}.id AND {si}.param_name = ?",
                si = si,
                a = alias
            ),
            vec![SqlParam::string(param_name)],
        );
        let body = head.and(condition);
        SqlFragment::with_params(
            format!("EXISTS (SELECT 1 FROM search_index {} WHERE {})", si, body.sql),
            body.params,
        )
    }

    fn composite_condition(
        &mut self,
        types: &[String],
        alias: &str,
        param: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        let rule = types
            .iter()
            .find_map(|t| self.registry.get_rule(t, &param.name).map(|r| (t, r)));
        let component_units: Vec<bool> = match &rule {
            Some((ty, rule)) => rule
                .components
                .iter()
                .map(|c| {
                    self.registry
                        .get_param(ty, &c.code)
                        .is_some_and(|def| def.unit_aware)
                })
                .collect(),
            None => vec![false; param.components.len()],
        };

        let aliases: Vec<String> = (0..param.components.len()).map(|_| self.alias("c")).collect();
        let tuples = param
            .values
            .iter()
            .map(|v| CompositeHandler::build_sql(v, &param.name, &param.components, &component_units, &aliases))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompositeHandler::exists(alias, &param.name, &aliases, SqlFragment::any(tuples)))
    }

    fn chain_condition(
        &mut self,
        alias: &str,
        link: &ChainLink,
        rest: &[ChainLink],
        param: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        let si = self.alias("si");
        let target = self.alias("t");

        let inner = SearchParameter {
            chain: rest.to_vec(),
            ..param.clone()
        };
        let inner_types = &link.target_types;
        let inner_condition = self.parameter_condition(inner_types, &target, &inner)?;

        let mut params = vec![SqlParam::string(&link.reference_param)];
        params.extend(link.target_types.iter().map(SqlParam::string));
        let head = SqlFragment::with_params(
            format!(
                "{si}.resource_type = {a}.resource_type AND {si}.resource_id = {a}.id \
                 AND {si}.param_name = ? AND {si}.value_reference_type IN ({types})",
                si = si,
                a = alias,
                types = placeholders(link.target_types.len())
            ),
            params,
        );
        let body = head.and(inner_condition);
        Ok(SqlFragment::with_params(
            format!(
                "EXISTS (SELECT 1 FROM search_index {si} JOIN resources {t} \
                 ON {t}.resource_type = {si}.value_reference_type AND {t}.id = {si}.value_reference_id \
                 AND {t}.is_deleted = 0 WHERE {body})",
                si = si,
                t = target,
                body = body.sql
            ),
            body.params,
        ))
    }

    fn reverse_chain_condition(
        &mut self,
        alias: &str,
        has: &ReverseChainedParameter,
    ) -> Result<SqlFragment, SearchError> {
        let si = self.alias("si");
        let source = self.alias("s");

        let source_types = [has.source_type.clone()];
        let inner_condition = self.parameter_condition(&source_types, &source, &has.parameter)?;

        let head = SqlFragment::with_params(
            format!(
                "{si}.resource_type = ? AND {si}.param_name = ? \
                 AND {si}.value_reference_type = {a}.resource_type AND {si}.value_reference_id = {a}.id",
                si = si,
                a = alias
            ),
            vec![
                SqlParam::string(&has.source_type),
                SqlParam::string(&has.reference_param),
            ],
        );
        let body = head.and(inner_condition);
        Ok(SqlFragment::with_params(
            format!(
                "EXISTS (SELECT 1 FROM search_index {si} JOIN resources {s} \
                 ON {s}.resource_type = {si}.resource_type AND {s}.id = {si}.resource_id \
                 AND {s}.is_deleted = 0 WHERE {body})",
                si = si,
                s = source,
                body = body.sql
            ),
            body.params,
        ))
    }

    /// `ORDER BY` terms for `sort`; ties (and an empty sort) fall back to
    /// `last_updated` then `id`.
    pub fn order_by(&mut self, sort: &[SortDirective], resource_type: &str, alias: &str) -> SqlFragment {
        let mut terms = Vec::new();
        let mut params = Vec::new();

        for directive in sort {
            let dir = match directive.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            match directive.parameter.as_str() {
                "_id" => terms.push(format!("{}.id {}", alias, dir)),
                "_lastUpdated" => terms.push(format!("{}.last_updated {}", alias, dir)),
                name => {
                    let Some(rule) = self.registry.get_rule(resource_type, name) else {
                        continue;
                    };
                    let Some(column) = sort_column(rule.param_type(), directive.direction) else {
                        continue;
                    };
                    let aggregate = match directive.direction {
                        SortDirection::Ascending => "MIN",
                        SortDirection::Descending => "MAX",
                    };
                    let si = self.alias("o");
                    let key = format!(
                        "(SELECT {agg}({si}.{col}) FROM search_index {si} \
                         WHERE {si}.resource_type = {a}.resource_type AND {si}.resource_id = {a}.id \
                         AND {si}.param_name = ?)",
                        agg = aggregate,
                        si = si,
                        col = column,
                        a = alias
                    );
                    // Resources without a value sort last in both directions.
                    terms.push(format!("{} IS NULL", key));
                    terms.push(format!("{} {}", key, dir));
                    params.push(SqlParam::string(name));
                    params.push(SqlParam::string(name));
                }
            }
        }

        terms.push(format!("{}.last_updated ASC", alias));
        terms.push(format!("{}.id ASC", alias));
        SqlFragment::with_params(terms.join(", "), params)
    }
}

fn sort_column(param_type: SearchParamType, direction: SortDirection) -> Option<&'static str> {
    Some(match param_type {
        SearchParamType::String => "value_string",
        SearchParamType::Token => "value_token_code",
        SearchParamType::Date => match direction {
            SortDirection::Ascending => "value_date_start",
            SortDirection::Descending => "value_date_end",
        },
        SearchParamType::Number => "value_number",
        SearchParamType::Quantity => "value_quantity_value",
        SearchParamType::Reference => "value_reference",
        SearchParamType::Uri => "value_uri",
        SearchParamType::Composite => return None,
    })
}

/// `_id` matches the resource id column.
fn id_condition(alias: &str, param: &SearchParameter) -> Result<SqlFragment, SearchError> {
    if param.is_missing_test() {
        let missing = param.values.first().is_some_and(|v| v.value == "true");
        return Ok(SqlFragment::new(if missing { "0" } else { "1" }));
    }
    let ids = param
        .values
        .iter()
        .map(|v| {
            unescape(&v.value).ok_or_else(|| SearchError::InvalidValue {
                param: param.name.clone(),
                value: v.value.clone(),
                message: "invalid escape sequence".to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let fragment = SqlFragment::with_params(
        format!("{}.id IN ({})", alias, placeholders(ids.len())),
        ids.into_iter().map(SqlParam::String).collect(),
    );
    Ok(if param.modifier == Some(SearchModifier::Not) {
        fragment.not()
    } else {
        fragment
    })
}

/// `_lastUpdated` matches the resource's own timestamp.
fn last_updated_condition(alias: &str, param: &SearchParameter) -> Result<SqlFragment, SearchError> {
    if param.is_missing_test() {
        let missing = param.values.first().is_some_and(|v| v.value == "true");
        return Ok(SqlFragment::new(if missing { "0" } else { "1" }));
    }
    let column = DateColumns::Point(format!("{}.last_updated", alias));
    let values = param
        .values
        .iter()
        .map(|v| DateHandler::build_sql(v, &column, &param.name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SqlFragment::any(values))
}
