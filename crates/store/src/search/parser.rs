//! Query-string parsing.
//!
//! Turns `name[:modifier][.chain...]=v1,v2&...` into a [`SearchQuery`],
//! resolving every parameter against the registry so that unknown names and
//! misplaced modifiers are rejected before any SQL is built.

use std::str::FromStr;

use crate::error::SearchError;
use crate::types::{
    ChainLink, IncludeDirective, IncludeType, ReverseChainedParameter, SearchModifier,
    SearchParamType, SearchParameter, SearchPrefix, SearchQuery, SearchValue, SortDirective,
    TotalMode,
};

use super::escape::split_unescaped;
use super::registry::{ExtractionRule, SearchParameterRegistry};

/// Parameters that select on resource metadata rather than content.
pub const METADATA_SORT_KEYS: &[&str] = &["_id", "_lastUpdated"];

/// Transport parameters a REST layer may pass through; they select nothing.
const IGNORED: &[&str] = &["_format", "_pretty", "_summary", "_elements"];

/// Parses search query strings against a registry.
#[derive(Debug)]
pub struct QueryParser<'a> {
    registry: &'a SearchParameterRegistry,
    max_chain_depth: usize,
}

impl<'a> QueryParser<'a> {
    /// Creates a parser allowing chains of up to `max_chain_depth` hops.
    pub fn new(registry: &'a SearchParameterRegistry, max_chain_depth: usize) -> Self {
        Self {
            registry,
            max_chain_depth,
        }
    }

    /// Parses a form-urlencoded query (without the leading `?`).
    pub fn parse(&self, resource_type: &str, query: &str) -> Result<SearchQuery, SearchError> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut out = SearchQuery::new(resource_type);

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || IGNORED.contains(&key) {
                continue;
            }
            match key {
                "_count" => out.count = Some(parse_u32(key, value)?),
                "_offset" => out.offset = Some(parse_u32(key, value)?),
                "_total" => {
                    out.total = Some(TotalMode::from_str(value).map_err(|message| {
                        SearchError::InvalidValue {
                            param: key.to_string(),
                            value: value.to_string(),
                            message,
                        }
                    })?)
                }
                "_sort" => {
                    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        let directive = SortDirective::parse(item);
                        self.check_sort_key(resource_type, &directive.parameter)?;
                        out.sort.push(directive);
                    }
                }
                "_include" => out
                    .includes
                    .push(self.parse_include(resource_type, value, IncludeType::Include)?),
                "_revinclude" => out
                    .includes
                    .push(self.parse_include(resource_type, value, IncludeType::Revinclude)?),
                _ if key.starts_with("_has:") => {
                    out.reverse_chains
                        .push(self.parse_has(resource_type, key, value)?);
                }
                _ if key.starts_with("_include:") || key.starts_with("_revinclude:") => {
                    return Err(SearchError::QueryParseError {
                        message: format!("'{}' is not supported", key),
                    });
                }
                _ => {
                    if value.is_empty() {
                        continue;
                    }
                    out.parameters
                        .push(self.parse_parameter(resource_type, key, value)?);
                }
            }
        }

        tracing::debug!(
            resource_type,
            parameters = out.parameters.len(),
            reverse_chains = out.reverse_chains.len(),
            includes = out.includes.len(),
            "parsed search query"
        );
        Ok(out)
    }

    fn check_sort_key(&self, resource_type: &str, name: &str) -> Result<(), SearchError> {
        if METADATA_SORT_KEYS.contains(&name) {
            return Ok(());
        }
        match self.registry.get_rule(resource_type, name) {
            Some(rule) if rule.param_type() != SearchParamType::Composite => Ok(()),
            Some(_) => Err(SearchError::InvalidValue {
                param: "_sort".to_string(),
                value: name.to_string(),
                message: "cannot sort on a composite parameter".to_string(),
            }),
            None => Err(unknown(resource_type, name)),
        }
    }

    fn parse_include(
        &self,
        resource_type: &str,
        value: &str,
        include_type: IncludeType,
    ) -> Result<IncludeDirective, SearchError> {
        let param = match include_type {
            IncludeType::Include => "_include",
            IncludeType::Revinclude => "_revinclude",
        };
        let invalid = |message: &str| SearchError::InvalidValue {
            param: param.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        };

        let parts: Vec<&str> = value.split(':').collect();
        let (source_type, search_param, target_type) = match parts.as_slice() {
            [source, search_param] => (*source, *search_param, None),
            [source, search_param, target] => (*source, *search_param, Some(target.to_string())),
            _ => return Err(invalid("expected Type:param[:Target]")),
        };

        if include_type == IncludeType::Include && source_type != resource_type {
            return Err(invalid("_include must start from the searched type"));
        }
        if search_param != "*" {
            let rule = self
                .registry
                .get_rule(source_type, search_param)
                .ok_or_else(|| unknown(source_type, search_param))?;
            if rule.param_type() != SearchParamType::Reference {
                return Err(invalid("not a reference parameter"));
            }
            if include_type == IncludeType::Revinclude
                && !targets_include(&rule, resource_type)
            {
                return Err(invalid("the parameter cannot point at the searched type"));
            }
        }

        Ok(IncludeDirective {
            include_type,
            source_type: source_type.to_string(),
            search_param: search_param.to_string(),
            target_type,
        })
    }

    fn parse_has(
        &self,
        resource_type: &str,
        key: &str,
        value: &str,
    ) -> Result<ReverseChainedParameter, SearchError> {
        // _has:Type:reference:param[:modifier]
        let mut parts = key.splitn(4, ':').skip(1);
        let (Some(source_type), Some(reference_param), Some(rest)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SearchError::QueryParseError {
                message: format!("'{}' must be _has:Type:reference:parameter", key),
            });
        };
        if rest.starts_with("_has") {
            return Err(SearchError::QueryParseError {
                message: "nested _has is not supported".to_string(),
            });
        }

        let rule = self
            .registry
            .get_rule(source_type, reference_param)
            .ok_or_else(|| unknown(source_type, reference_param))?;
        if rule.param_type() != SearchParamType::Reference || !targets_include(&rule, resource_type) {
            return Err(SearchError::InvalidValue {
                param: key.to_string(),
                value: value.to_string(),
                message: format!(
                    "{}.{} does not reference {}",
                    source_type, reference_param, resource_type
                ),
            });
        }

        Ok(ReverseChainedParameter {
            source_type: source_type.to_string(),
            reference_param: reference_param.to_string(),
            parameter: self.parse_parameter(source_type, rest, value)?,
        })
    }

    /// Parses one `name[:modifier][.chain]` parameter with its value list.
    pub fn parse_parameter(
        &self,
        resource_type: &str,
        key: &str,
        value: &str,
    ) -> Result<SearchParameter, SearchError> {
        let segments: Vec<&str> = key.split('.').collect();
        let hops = segments.len() - 1;
        if hops > self.max_chain_depth {
            return Err(SearchError::ChainTooDeep {
                chain: key.to_string(),
                max_depth: self.max_chain_depth,
            });
        }

        let mut types = vec![resource_type.to_string()];
        let mut chain = Vec::with_capacity(hops);
        for segment in &segments[..hops] {
            let (name, modifier) = split_modifier(segment);
            let (_, rule) = self.resolve(&types, name)?;
            if rule.param_type() != SearchParamType::Reference {
                return Err(SearchError::QueryParseError {
                    message: format!("cannot chain through non-reference parameter '{}'", name),
                });
            }
            let target_types = match modifier {
                None => rule.definition.target.clone(),
                Some(m) => match SearchModifier::parse(m) {
                    Some(SearchModifier::Type(t)) => vec![t],
                    _ => {
                        return Err(SearchError::UnsupportedModifier {
                            modifier: m.to_string(),
                            param_type: "chained reference".to_string(),
                        });
                    }
                },
            };
            if target_types.is_empty() {
                return Err(SearchError::QueryParseError {
                    message: format!("'{}' needs a :Type modifier to chain", name),
                });
            }
            chain.push(ChainLink {
                reference_param: name.to_string(),
                target_types: target_types.clone(),
            });
            types = target_types;
        }

        let (name, modifier_text) = split_modifier(segments[hops]);
        let (_, rule) = self.resolve(&types, name)?;
        let param_type = rule.param_type();

        let modifier = match modifier_text {
            None => None,
            Some(text) => {
                let modifier =
                    SearchModifier::parse(text).ok_or_else(|| SearchError::UnsupportedModifier {
                        modifier: text.to_string(),
                        param_type: param_type.to_string(),
                    })?;
                if !modifier.is_valid_for(param_type) {
                    return Err(SearchError::UnsupportedModifier {
                        modifier: text.to_string(),
                        param_type: param_type.to_string(),
                    });
                }
                Some(modifier)
            }
        };

        let values = if modifier == Some(SearchModifier::Missing) {
            if value != "true" && value != "false" {
                return Err(SearchError::InvalidValue {
                    param: key.to_string(),
                    value: value.to_string(),
                    message: ":missing takes true or false".to_string(),
                });
            }
            vec![SearchValue::eq(value)]
        } else {
            parse_values(key, value, param_type)?
        };
        if values.is_empty() {
            return Err(SearchError::InvalidValue {
                param: key.to_string(),
                value: value.to_string(),
                message: "no value".to_string(),
            });
        }

        Ok(SearchParameter {
            name: name.to_string(),
            param_type,
            modifier,
            values,
            chain,
            components: rule.components.iter().map(|c| c.param_type).collect(),
        })
    }

    /// Finds `name` on the first of `types` that defines it.
    fn resolve<'t>(
        &self,
        types: &'t [String],
        name: &str,
    ) -> Result<(&'t str, std::sync::Arc<ExtractionRule>), SearchError> {
        types
            .iter()
            .find_map(|t| self.registry.get_rule(t, name).map(|r| (t.as_str(), r)))
            .ok_or_else(|| unknown(&types.join(","), name))
    }
}

fn unknown(resource_type: &str, name: &str) -> SearchError {
    SearchError::UnknownParameter {
        resource_type: resource_type.to_string(),
        name: name.to_string(),
    }
}

fn targets_include(rule: &ExtractionRule, resource_type: &str) -> bool {
    rule.definition.target.is_empty() || rule.definition.target.iter().any(|t| t == resource_type)
}

fn split_modifier(segment: &str) -> (&str, Option<&str>) {
    match segment.split_once(':') {
        Some((name, modifier)) => (name, Some(modifier)),
        None => (segment, None),
    }
}

fn parse_u32(param: &str, value: &str) -> Result<u32, SearchError> {
    value.parse().map_err(|_| SearchError::InvalidValue {
        param: param.to_string(),
        value: value.to_string(),
        message: "expected a non-negative integer".to_string(),
    })
}

fn parse_values(
    key: &str,
    value: &str,
    param_type: SearchParamType,
) -> Result<Vec<SearchValue>, SearchError> {
    let mut values = Vec::new();
    for item in split_unescaped(value, ',') {
        if item.is_empty() {
            continue;
        }
        let parsed = if param_type.is_ordered() {
            SearchValue::parse(item)
        } else {
            SearchValue::eq(item)
        };
        if !parsed.prefix.is_valid_for(param_type) {
            return Err(SearchError::UnsupportedPrefix {
                prefix: parsed.prefix.to_string(),
                param: key.to_string(),
            });
        }
        if parsed.prefix != SearchPrefix::Eq && parsed.value.is_empty() {
            return Err(SearchError::InvalidValue {
                param: key.to_string(),
                value: item.to_string(),
                message: "prefix without a value".to_string(),
            });
        }
        values.push(parsed);
    }
    Ok(values)
}

/// Parses `query` for `resource_type` with the given registry.
pub fn parse_query(
    registry: &SearchParameterRegistry,
    resource_type: &str,
    query: &str,
    max_chain_depth: usize,
) -> Result<SearchQuery, SearchError> {
    QueryParser::new(registry, max_chain_depth).parse(resource_type, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SortDirection;

    fn registry() -> SearchParameterRegistry {
        SearchParameterRegistry::with_embedded().unwrap()
    }

    fn parse(resource_type: &str, query: &str) -> Result<SearchQuery, SearchError> {
        parse_query(&registry(), resource_type, query, 3)
    }

    #[test]
    fn test_or_values_and_repeats() {
        let q = parse("Patient", "gender=male,female&family=smith&family=jones").unwrap();
        assert_eq!(q.parameters.len(), 3);
        assert_eq!(q.parameters[0].values.len(), 2);
        assert_eq!(q.parameters[0].param_type, SearchParamType::Token);
    }

    #[test]
    fn test_escaped_comma_stays_in_value() {
        let q = parse("Patient", r"family=smith\,jones").unwrap();
        assert_eq!(q.parameters[0].values.len(), 1);
        assert_eq!(q.parameters[0].values[0].value, r"smith\,jones");
    }

    #[test]
    fn test_prefixes_only_for_ordered_types() {
        let q = parse("Patient", "birthdate=ge2000-01-01&family=gerald").unwrap();
        assert_eq!(q.parameters[0].values[0].prefix, SearchPrefix::Ge);
        assert_eq!(q.parameters[0].values[0].value, "2000-01-01");
        assert_eq!(q.parameters[1].values[0].prefix, SearchPrefix::Eq);
        assert_eq!(q.parameters[1].values[0].value, "gerald");
    }

    #[test]
    fn test_sa_prefix_rejected_for_numbers() {
        assert!(matches!(
            parse("RiskAssessment", "probability=sa0.5"),
            Err(SearchError::UnsupportedPrefix { .. })
        ));
    }

    #[test]
    fn test_unknown_parameter() {
        assert!(matches!(
            parse("Patient", "shoe-size=42"),
            Err(SearchError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_modifier_validity() {
        assert!(parse("Patient", "family:exact=Smith").is_ok());
        assert!(parse("Observation", "code:text=pressure").is_ok());
        assert!(parse("Patient", "_profile:below=http://example.org").is_ok());
        assert!(matches!(
            parse("Patient", "gender:exact=male"),
            Err(SearchError::UnsupportedModifier { .. })
        ));
        assert!(matches!(
            parse("Patient", "family:fuzzy=smith"),
            Err(SearchError::UnsupportedModifier { .. })
        ));
        let q = parse("Observation", "subject:Patient=p1").unwrap();
        assert_eq!(
            q.parameters[0].modifier,
            Some(SearchModifier::Type("Patient".to_string()))
        );
    }

    #[test]
    fn test_missing_modifier() {
        let q = parse("Observation", "value-quantity:missing=true").unwrap();
        assert!(q.parameters[0].is_missing_test());
        assert!(parse("Observation", "value-quantity:missing=maybe").is_err());
    }

    #[test]
    fn test_chain() {
        let q = parse("Observation", "subject:Patient.name=peter").unwrap();
        let p = &q.parameters[0];
        assert_eq!(p.name, "name");
        assert_eq!(p.param_type, SearchParamType::String);
        assert_eq!(p.chain.len(), 1);
        assert_eq!(p.chain[0].reference_param, "subject");
        assert_eq!(p.chain[0].target_types, vec!["Patient".to_string()]);

        let untyped = parse("Observation", "patient.organization.name=acme").unwrap();
        assert_eq!(untyped.parameters[0].chain.len(), 2);
    }

    #[test]
    fn test_chain_depth_limit() {
        let result = parse_query(
            &registry(),
            "Observation",
            "patient.organization.partof.name=x",
            2,
        );
        assert!(matches!(result, Err(SearchError::ChainTooDeep { max_depth: 2, .. })));
    }

    #[test]
    fn test_chain_through_non_reference() {
        assert!(parse("Observation", "code.name=x").is_err());
    }

    #[test]
    fn test_reverse_chain() {
        let q = parse("Patient", "_has:Observation:patient:code=http://loinc.org|1234-5").unwrap();
        let has = &q.reverse_chains[0];
        assert_eq!(has.source_type, "Observation");
        assert_eq!(has.reference_param, "patient");
        assert_eq!(has.parameter.name, "code");
        assert!(parse("Patient", "_has:Observation:code:status=final").is_err());
    }

    #[test]
    fn test_result_parameters() {
        let q = parse("Observation", "_count=10&_offset=20&_sort=-date,_id&_total=accurate").unwrap();
        assert_eq!(q.count, Some(10));
        assert_eq!(q.offset, Some(20));
        assert_eq!(q.sort.len(), 2);
        assert_eq!(q.sort[0].direction, SortDirection::Descending);
        assert_eq!(q.total, Some(TotalMode::Accurate));
        assert!(parse("Observation", "_count=-1").is_err());
        assert!(parse("Observation", "_sort=bogus").is_err());
    }

    #[test]
    fn test_includes() {
        let q = parse(
            "Observation",
            "_include=Observation:subject:Patient&_revinclude=DiagnosticReport:result&_include=Observation:*",
        )
        .unwrap();
        assert_eq!(q.includes.len(), 3);
        assert_eq!(q.includes[0].target_type.as_deref(), Some("Patient"));
        assert_eq!(q.includes[1].include_type, IncludeType::Revinclude);
        assert!(q.includes[2].is_wildcard());
        assert!(parse("Observation", "_include=Patient:organization").is_err());
        assert!(parse("Observation", "_include=Observation:code").is_err());
    }

    #[test]
    fn test_url_decoding_and_ignored_params() {
        let q = parse("Observation", "code=http%3A%2F%2Floinc.org%7C8480-6&_format=json").unwrap();
        assert_eq!(q.parameters[0].values[0].value, "http://loinc.org|8480-6");
    }

    #[test]
    fn test_composite_components_recorded() {
        let q = parse("Observation", "component-code-value-quantity=http://loinc.org|8480-6$gt100").unwrap();
        assert_eq!(
            q.parameters[0].components,
            vec![SearchParamType::Token, SearchParamType::Quantity]
        );
    }
}
