//! SearchParameter value extractor.
//!
//! Evaluates every active rule of a resource type against a resource and
//! converts the selected elements into index values. A failing element or
//! rule never stops the others: each failure is reported in
//! [`ExtractionOutcome::failures`] next to the values that did convert.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::types::SearchParamType;

use super::converters::IndexValue;
use super::errors::ExtractionError;
use super::registry::{ExtractionRule, SearchParameterRegistry};

/// A value extracted from a resource for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedValue {
    /// Parameter code (for composite rows, the composite's code).
    pub param_name: String,
    /// Parameter URL.
    pub param_url: String,
    /// Type of `value`; for composite rows, the component's type.
    pub param_type: SearchParamType,
    /// The converted value.
    pub value: IndexValue,
    /// Tuple id shared by the component rows of one composite match.
    pub composite_group: Option<u32>,
    /// Position of the component inside its tuple.
    pub component_index: Option<u8>,
    /// Type an untyped `urn:uuid:` reference must resolve to before the
    /// value counts; see [`ExtractedValue::settle`].
    pub resolves_to: Option<String>,
}

impl ExtractedValue {
    fn simple(rule: &ExtractionRule, value: IndexValue) -> Self {
        Self {
            param_name: rule.definition.code.clone(),
            param_url: rule.definition.url.clone(),
            param_type: value.param_type(),
            value,
            composite_group: None,
            component_index: None,
            resolves_to: None,
        }
    }

    /// Decides a value held back by `resolve() is X` once its reference has
    /// been looked up. `Ok(true)` keeps it, `Ok(false)` means the target has
    /// another type, and an error means the type is still unknown.
    pub fn settle(&mut self) -> Result<bool, ExtractionError> {
        let Some(expected) = self.resolves_to.take() else {
            return Ok(true);
        };
        let IndexValue::Reference(target) = &self.value else {
            return Ok(true);
        };
        match &target.target_type {
            Some(found) => Ok(*found == expected),
            None => Err(ExtractionError::UnresolvedReference {
                reference: target.raw.clone(),
                expected_type: expected,
            }),
        }
    }
}

/// A rule (or one element of it) that could not be indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    /// Parameter code.
    pub param_name: String,
    /// The rule's expression.
    pub expression: String,
    /// What went wrong.
    pub error: ExtractionError,
}

/// Everything extracted from one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    /// Values that converted.
    pub values: Vec<ExtractedValue>,
    /// Elements or rules that did not.
    pub failures: Vec<ExtractionFailure>,
}

impl ExtractionOutcome {
    /// Returns true if nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Values for one parameter code.
    pub fn values_for<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a ExtractedValue> + 'a {
        self.values.iter().filter(move |v| v.param_name == code)
    }
}

/// Extracts searchable values using the rules of a shared registry.
#[derive(Clone)]
pub struct SearchParameterExtractor {
    registry: Arc<RwLock<SearchParameterRegistry>>,
}

impl SearchParameterExtractor {
    /// Creates an extractor over `registry`.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self { registry }
    }

    /// A snapshot of the active rules for a type.
    pub fn rules_for(&self, resource_type: &str) -> Vec<Arc<ExtractionRule>> {
        self.registry.read().rules_for(resource_type)
    }

    /// Extracts values for every active rule of `resource_type`.
    pub fn extract(
        &self,
        resource_type: &str,
        resource: &Value,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let rules = self.rules_for(resource_type);
        Self::extract_with(&rules, resource)
    }

    /// Extracts values for an explicit rule set.
    pub fn extract_with(
        rules: &[Arc<ExtractionRule>],
        resource: &Value,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        if !resource.is_object() {
            return Err(ExtractionError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
            });
        }

        let mut outcome = ExtractionOutcome::default();
        let mut next_group = 0u32;
        for rule in rules {
            if rule.components.is_empty() {
                extract_simple(rule, resource, &mut outcome);
            } else {
                extract_composite(rule, resource, &mut next_group, &mut outcome);
            }
        }

        tracing::trace!(
            values = outcome.values.len(),
            failures = outcome.failures.len(),
            "extracted search values"
        );
        Ok(outcome)
    }
}

fn failure(rule: &ExtractionRule, error: ExtractionError) -> ExtractionFailure {
    ExtractionFailure {
        param_name: rule.definition.code.clone(),
        expression: rule.definition.expression.clone(),
        error,
    }
}

fn extract_simple(rule: &ExtractionRule, resource: &Value, outcome: &mut ExtractionOutcome) {
    let Some(converter) = &rule.converter else {
        return;
    };
    let mut seen: Vec<IndexValue> = Vec::new();
    for node in rule.path.evaluate(resource) {
        match converter(node.value) {
            Ok(values) => {
                for mut value in values {
                    if node.resolves_to.is_some()
                        && let IndexValue::Reference(target) = &mut value
                    {
                        // Only storage can say what an untyped urn:uuid points at.
                        target.target_type = None;
                    }
                    if !seen.contains(&value) {
                        seen.push(value.clone());
                        let mut extracted = ExtractedValue::simple(rule, value);
                        extracted.resolves_to = node.resolves_to.clone();
                        outcome.values.push(extracted);
                    }
                }
            }
            Err(error) => outcome.failures.push(failure(rule, error)),
        }
    }
}

fn extract_composite(
    rule: &ExtractionRule,
    resource: &Value,
    next_group: &mut u32,
    outcome: &mut ExtractionOutcome,
) {
    for base in rule.path.evaluate(resource) {
        // One candidate list per component, evaluated against the same base element
        let mut per_component: Vec<Vec<IndexValue>> = Vec::with_capacity(rule.components.len());
        for component in &rule.components {
            let mut values = Vec::new();
            for node in component.path.evaluate(base.value) {
                if let Some(expected) = &node.resolves_to {
                    outcome.failures.push(failure(
                        rule,
                        ExtractionError::UnresolvedReference {
                            reference: reference_text(node.value),
                            expected_type: expected.clone(),
                        },
                    ));
                    continue;
                }
                match (component.converter)(node.value) {
                    Ok(converted) => values.extend(converted),
                    Err(error) => outcome.failures.push(failure(rule, error)),
                }
            }
            per_component.push(values);
        }
        if per_component.iter().any(Vec::is_empty) {
            continue;
        }

        for tuple in cartesian(&per_component) {
            let group = *next_group;
            *next_group += 1;
            for (index, value) in tuple.into_iter().enumerate() {
                outcome.values.push(ExtractedValue {
                    param_name: rule.definition.code.clone(),
                    param_url: rule.definition.url.clone(),
                    param_type: rule.components[index].param_type,
                    value: value.clone(),
                    composite_group: Some(group),
                    component_index: Some(index as u8),
                    resolves_to: None,
                });
            }
        }
    }
}

fn reference_text(value: &Value) -> String {
    value
        .get("reference")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn cartesian<T>(lists: &[Vec<T>]) -> Vec<Vec<&T>> {
    lists.iter().fold(vec![Vec::new()], |acc, list| {
        acc.iter()
            .flat_map(|prefix| {
                list.iter().map(move |item| {
                    let mut next = prefix.clone();
                    next.push(item);
                    next
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> SearchParameterExtractor {
        let registry = SearchParameterRegistry::with_embedded().unwrap();
        SearchParameterExtractor::new(Arc::new(RwLock::new(registry)))
    }

    fn bp_observation() -> Value {
        json!({
            "resourceType": "Observation",
            "id": "bp",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
            "subject": {"reference": "Patient/p1"},
            "effectiveDateTime": "2024-05-01T10:00:00Z",
            "component": [
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                    "valueQuantity": {"value": 120, "unit": "mmHg", "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}
                },
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8462-4"}]},
                    "valueQuantity": {"value": 80, "unit": "mmHg", "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}
                }
            ]
        })
    }

    #[test]
    fn test_extracts_simple_values() {
        let outcome = extractor().extract("Observation", &bp_observation()).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.values_for("status").count(), 1);
        assert_eq!(outcome.values_for("_id").count(), 1);
        assert_eq!(outcome.values_for("subject").count(), 1);
        assert_eq!(outcome.values_for("patient").count(), 1);
        assert_eq!(outcome.values_for("component-value-quantity").count(), 2);
    }

    #[test]
    fn test_composite_tuples_keep_components_together() {
        let outcome = extractor().extract("Observation", &bp_observation()).unwrap();
        let rows: Vec<&ExtractedValue> = outcome.values_for("component-code-value-quantity").collect();
        // two components, each one (code, value) tuple
        assert_eq!(rows.len(), 4);
        let groups: std::collections::BTreeSet<_> =
            rows.iter().map(|r| r.composite_group.unwrap()).collect();
        assert_eq!(groups.len(), 2);

        for group in groups {
            let tuple: Vec<_> = rows
                .iter()
                .filter(|r| r.composite_group == Some(group))
                .collect();
            let code = tuple.iter().find(|r| r.component_index == Some(0)).unwrap();
            let value = tuple.iter().find(|r| r.component_index == Some(1)).unwrap();
            let (IndexValue::Token { code: Some(code), .. }, IndexValue::Quantity { value, .. }) =
                (&code.value, &value.value)
            else {
                panic!("unexpected component values");
            };
            match code.as_str() {
                "8480-6" => assert_eq!(value.to_string(), "120"),
                "8462-4" => assert_eq!(value.to_string(), "80"),
                other => panic!("unexpected code {other}"),
            }
        }
    }

    #[test]
    fn test_failures_do_not_stop_other_rules() {
        let mut obs = bp_observation();
        obs["effectiveDateTime"] = json!("not-a-date");
        let outcome = extractor().extract("Observation", &obs).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].param_name, "date");
        assert_eq!(outcome.values_for("date").count(), 0);
        assert_eq!(outcome.values_for("code").count(), 1);
    }

    #[test]
    fn test_untyped_urn_uuid_waits_for_lookup() {
        let mut obs = bp_observation();
        obs["subject"] = json!({"reference": "urn:uuid:p9"});
        let outcome = extractor().extract("Observation", &obs).unwrap();
        assert!(outcome.is_complete());

        let mut patient = outcome.values_for("patient").next().unwrap().clone();
        assert_eq!(patient.resolves_to.as_deref(), Some("Patient"));
        let IndexValue::Reference(target) = &patient.value else {
            panic!("expected a reference value");
        };
        assert_eq!(target.target_type, None);

        // Still unknown after the lookup.
        assert!(matches!(
            patient.clone().settle(),
            Err(ExtractionError::UnresolvedReference { .. })
        ));

        if let IndexValue::Reference(target) = &mut patient.value {
            target.resolve_as("Group");
        }
        assert_eq!(patient.clone().settle(), Ok(false));

        if let IndexValue::Reference(target) = &mut patient.value {
            target.target_type = Some("Patient".to_string());
        }
        assert_eq!(patient.settle(), Ok(true));
    }

    #[test]
    fn test_non_object_resource_rejected() {
        assert!(extractor().extract("Observation", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_duplicate_values_collapse() {
        let patient = json!({
            "resourceType": "Patient",
            "id": "p1",
            "name": [{"family": "Smith"}, {"family": "Smith"}]
        });
        let outcome = extractor().extract("Patient", &patient).unwrap();
        assert_eq!(outcome.values_for("family").count(), 1);
    }

    #[test]
    fn test_cartesian() {
        let lists = vec![vec![1, 2], vec![3], vec![4, 5]];
        assert_eq!(cartesian(&lists).len(), 4);
    }
}
