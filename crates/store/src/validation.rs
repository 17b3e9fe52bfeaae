//! Minimal structural validation applied before every write.
//!
//! Checks only what the store itself depends on: the content is an object,
//! its `resourceType` matches the target, ids are FHIR ids, and the handful
//! of elements each supported type cannot do without are present. Full
//! profile validation belongs to a layer above the store.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ValidationDetail, ValidationError};

/// Required top-level elements per resource type. `name[x]` accepts any choice variant.
const REQUIRED_ELEMENTS: &[(&str, &[&str])] = &[
    ("AllergyIntolerance", &["patient"]),
    ("Condition", &["subject"]),
    ("DiagnosticReport", &["status", "code"]),
    ("Encounter", &["status", "class"]),
    ("Immunization", &["status", "vaccineCode", "patient", "occurrence[x]"]),
    ("MedicationDispense", &["status", "medication[x]"]),
    ("MedicationRequest", &["status", "intent", "subject", "medication[x]"]),
    ("Observation", &["status", "code"]),
    ("Procedure", &["status", "subject"]),
    ("RiskAssessment", &["status", "subject"]),
];

/// Validates resource identity and shape.
#[derive(Debug, Clone)]
pub struct ResourceValidator {
    id_pattern: Regex,
    type_pattern: Regex,
}

impl ResourceValidator {
    /// Compiles the id and type patterns.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            id_pattern: Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$")?,
            type_pattern: Regex::new(r"^[A-Z][A-Za-z]{1,63}$")?,
        })
    }

    /// Returns true if `id` is a valid FHIR logical id.
    pub fn is_valid_id(&self, id: &str) -> bool {
        self.id_pattern.is_match(id)
    }

    /// Checks a resource type name.
    pub fn validate_type(&self, resource_type: &str) -> Result<(), ValidationError> {
        if self.type_pattern.is_match(resource_type) {
            Ok(())
        } else {
            Err(ValidationError::InvalidResource {
                message: format!("'{}' is not a resource type name", resource_type),
                details: Vec::new(),
            })
        }
    }

    /// Checks a logical id.
    pub fn validate_id(&self, id: &str) -> Result<(), ValidationError> {
        if self.is_valid_id(id) {
            Ok(())
        } else {
            Err(ValidationError::InvalidId { id: id.to_string() })
        }
    }

    /// Validates content written to `resource_type`.
    ///
    /// Returns the content's `id`, if it has one.
    pub fn validate<'a>(
        &self,
        resource_type: &str,
        content: &'a Value,
    ) -> Result<Option<&'a str>, ValidationError> {
        self.validate_type(resource_type)?;

        let Value::Object(obj) = content else {
            return Err(ValidationError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
                details: Vec::new(),
            });
        };

        match obj.get("resourceType") {
            Some(Value::String(found)) if found == resource_type => {}
            Some(Value::String(found)) => {
                return Err(ValidationError::ResourceTypeMismatch {
                    expected: resource_type.to_string(),
                    found: found.clone(),
                });
            }
            _ => {
                return Err(ValidationError::MissingRequiredField {
                    resource_type: resource_type.to_string(),
                    field: "resourceType".to_string(),
                });
            }
        }

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => {
                self.validate_id(id)?;
                Some(id.as_str())
            }
            Some(other) => {
                return Err(ValidationError::InvalidId {
                    id: other.to_string(),
                });
            }
        };

        let missing = missing_elements(resource_type, obj);
        match missing.as_slice() {
            [] => Ok(id),
            [field] => Err(ValidationError::MissingRequiredField {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
            }),
            fields => Err(ValidationError::InvalidResource {
                message: format!("{} is missing required elements", resource_type),
                details: fields
                    .iter()
                    .map(|f| ValidationDetail::new(format!("{}.{}", resource_type, f), "required"))
                    .collect(),
            }),
        }
    }
}

fn missing_elements(resource_type: &str, obj: &Map<String, Value>) -> Vec<&'static str> {
    let Some((_, required)) = REQUIRED_ELEMENTS.iter().find(|(t, _)| *t == resource_type) else {
        return Vec::new();
    };
    required
        .iter()
        .copied()
        .filter(|element| !has_element(obj, element))
        .collect()
}

fn has_element(obj: &Map<String, Value>, element: &str) -> bool {
    let present = |v: &Value| !matches!(v, Value::Null) && v.as_array().is_none_or(|a| !a.is_empty());
    match element.strip_suffix("[x]") {
        Some(prefix) => obj.iter().any(|(key, value)| {
            key.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_uppercase()))
                && present(value)
        }),
        None => obj.get(element).is_some_and(present),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ResourceValidator {
        ResourceValidator::new().unwrap()
    }

    #[test]
    fn test_ids() {
        let v = validator();
        assert!(v.is_valid_id("abc-123.x"));
        assert!(!v.is_valid_id("has space"));
        assert!(!v.is_valid_id(""));
        assert!(!v.is_valid_id(&"a".repeat(65)));
    }

    #[test]
    fn test_type_mismatch() {
        let err = validator()
            .validate("Patient", &json!({"resourceType": "Observation"}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ResourceTypeMismatch { .. }));
    }

    #[test]
    fn test_not_an_object() {
        assert!(validator().validate("Patient", &json!("Patient")).is_err());
    }

    #[test]
    fn test_returns_content_id() {
        let content = json!({"resourceType": "Patient", "id": "p1"});
        assert_eq!(validator().validate("Patient", &content).unwrap(), Some("p1"));
        let bad = json!({"resourceType": "Patient", "id": "p 1"});
        assert!(matches!(
            validator().validate("Patient", &bad),
            Err(ValidationError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_required_elements() {
        let v = validator();
        let obs = json!({"resourceType": "Observation", "status": "final"});
        assert!(matches!(
            v.validate("Observation", &obs),
            Err(ValidationError::MissingRequiredField { field, .. }) if field == "code"
        ));

        let mr = json!({
            "resourceType": "MedicationRequest",
            "status": "active",
            "intent": "order",
            "subject": {"reference": "Patient/p1"},
            "medicationCodeableConcept": {"text": "aspirin"}
        });
        assert!(v.validate("MedicationRequest", &mr).is_ok());

        let mr_missing = json!({"resourceType": "MedicationRequest", "status": "active"});
        let err = v.validate("MedicationRequest", &mr_missing).unwrap_err();
        let ValidationError::InvalidResource { details, .. } = err else {
            panic!("expected detail list");
        };
        assert_eq!(details.len(), 3);
    }

    #[test]
    fn test_choice_prefix_must_be_followed_by_type() {
        let imm = json!({
            "resourceType": "Immunization",
            "status": "completed",
            "vaccineCode": {"text": "flu"},
            "patient": {"reference": "Patient/p1"},
            "occurrenceString": "last fall"
        });
        assert!(validator().validate("Immunization", &imm).is_ok());
        let mut no_occurrence = imm.clone();
        no_occurrence.as_object_mut().unwrap().remove("occurrenceString");
        no_occurrence["occurrences"] = json!("x");
        assert!(validator().validate("Immunization", &no_occurrence).is_err());
    }

    #[test]
    fn test_unknown_types_only_need_identity() {
        let org = json!({"resourceType": "Organization"});
        assert_eq!(validator().validate("Organization", &org).unwrap(), None);
        assert!(validator().validate("lowercase", &json!({"resourceType": "lowercase"})).is_err());
    }
}
