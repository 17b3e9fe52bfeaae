//! SearchParameter loader.
//!
//! Produces [`SearchParameterDefinition`]s from two sources:
//! - the embedded R4 parameters for the clinical resource types the store serves
//! - SearchParameter resources supplied as JSON (single resource, array or Bundle)

use serde_json::Value;

use crate::types::SearchParamType;
use crate::types::SearchParamType::{
    Date, Number, Quantity, Reference, String as Str, Token, Uri,
};

use super::errors::LoaderError;
use super::registry::{
    CompositeComponentDef, SearchParameterDefinition, SearchParameterSource, SearchParameterStatus,
};

const HL7_BASE: &str = "http://hl7.org/fhir/SearchParameter";

/// `(base, code, type, expression, targets)`
type Embedded = (
    &'static str,
    &'static str,
    SearchParamType,
    &'static str,
    &'static [&'static str],
);

const PRACTITIONERS: &[&str] = &["Practitioner", "PractitionerRole"];
const SUBJECTS: &[&str] = &["Patient", "Group"];
const PATIENT: &[&str] = &["Patient"];
const ENCOUNTER: &[&str] = &["Encounter"];
const NONE: &[&str] = &[];

const EMBEDDED: &[Embedded] = &[
    // Resource
    ("Resource", "_id", Token, "Resource.id", NONE),
    ("Resource", "_lastUpdated", Date, "Resource.meta.lastUpdated", NONE),
    ("Resource", "_profile", Uri, "Resource.meta.profile", NONE),
    ("Resource", "_tag", Token, "Resource.meta.tag", NONE),
    ("Resource", "_security", Token, "Resource.meta.security", NONE),
    // Patient
    ("Patient", "identifier", Token, "Patient.identifier", NONE),
    ("Patient", "active", Token, "Patient.active", NONE),
    ("Patient", "name", Str, "Patient.name", NONE),
    ("Patient", "family", Str, "Patient.name.family", NONE),
    ("Patient", "given", Str, "Patient.name.given", NONE),
    ("Patient", "address", Str, "Patient.address", NONE),
    ("Patient", "address-city", Str, "Patient.address.city", NONE),
    ("Patient", "telecom", Token, "Patient.telecom", NONE),
    ("Patient", "gender", Token, "Patient.gender", NONE),
    ("Patient", "birthdate", Date, "Patient.birthDate", NONE),
    ("Patient", "death-date", Date, "(Patient.deceased as dateTime)", NONE),
    ("Patient", "organization", Reference, "Patient.managingOrganization", &["Organization"]),
    (
        "Patient",
        "general-practitioner",
        Reference,
        "Patient.generalPractitioner",
        &["Organization", "Practitioner", "PractitionerRole"],
    ),
    ("Patient", "link", Reference, "Patient.link.other", &["Patient", "RelatedPerson"]),
    // Practitioner
    ("Practitioner", "identifier", Token, "Practitioner.identifier", NONE),
    ("Practitioner", "active", Token, "Practitioner.active", NONE),
    ("Practitioner", "name", Str, "Practitioner.name", NONE),
    ("Practitioner", "family", Str, "Practitioner.name.family", NONE),
    ("Practitioner", "given", Str, "Practitioner.name.given", NONE),
    // Organization
    ("Organization", "identifier", Token, "Organization.identifier", NONE),
    ("Organization", "active", Token, "Organization.active", NONE),
    ("Organization", "name", Str, "Organization.name | Organization.alias", NONE),
    ("Organization", "type", Token, "Organization.type", NONE),
    ("Organization", "partof", Reference, "Organization.partOf", &["Organization"]),
    // Observation
    ("Observation", "identifier", Token, "Observation.identifier", NONE),
    ("Observation", "status", Token, "Observation.status", NONE),
    ("Observation", "category", Token, "Observation.category", NONE),
    ("Observation", "code", Token, "Observation.code", NONE),
    (
        "Observation",
        "subject",
        Reference,
        "Observation.subject",
        &["Group", "Device", "Patient", "Location"],
    ),
    ("Observation", "patient", Reference, "Observation.subject.where(resolve() is Patient)", PATIENT),
    ("Observation", "encounter", Reference, "Observation.encounter", ENCOUNTER),
    ("Observation", "date", Date, "Observation.effective", NONE),
    (
        "Observation",
        "performer",
        Reference,
        "Observation.performer",
        &["Practitioner", "Organization", "CareTeam", "Patient", "PractitionerRole", "RelatedPerson"],
    ),
    ("Observation", "has-member", Reference, "Observation.hasMember", &["Observation"]),
    ("Observation", "derived-from", Reference, "Observation.derivedFrom", &["Observation"]),
    ("Observation", "value-quantity", Quantity, "(Observation.value as Quantity)", NONE),
    ("Observation", "value-concept", Token, "(Observation.value as CodeableConcept)", NONE),
    (
        "Observation",
        "value-date",
        Date,
        "(Observation.value as dateTime) | (Observation.value as Period)",
        NONE,
    ),
    ("Observation", "value-string", Str, "(Observation.value as string)", NONE),
    ("Observation", "component-code", Token, "Observation.component.code", NONE),
    (
        "Observation",
        "component-value-quantity",
        Quantity,
        "(Observation.component.value as Quantity)",
        NONE,
    ),
    (
        "Observation",
        "component-value-concept",
        Token,
        "(Observation.component.value as CodeableConcept)",
        NONE,
    ),
    // Encounter
    ("Encounter", "identifier", Token, "Encounter.identifier", NONE),
    ("Encounter", "status", Token, "Encounter.status", NONE),
    ("Encounter", "class", Token, "Encounter.class", NONE),
    ("Encounter", "type", Token, "Encounter.type", NONE),
    ("Encounter", "subject", Reference, "Encounter.subject", SUBJECTS),
    ("Encounter", "patient", Reference, "Encounter.subject.where(resolve() is Patient)", PATIENT),
    ("Encounter", "date", Date, "Encounter.period", NONE),
    ("Encounter", "length", Quantity, "Encounter.length", NONE),
    (
        "Encounter",
        "participant",
        Reference,
        "Encounter.participant.individual",
        &["Practitioner", "PractitionerRole", "RelatedPerson"],
    ),
    (
        "Encounter",
        "practitioner",
        Reference,
        "Encounter.participant.individual.where(resolve() is Practitioner)",
        &["Practitioner"],
    ),
    ("Encounter", "service-provider", Reference, "Encounter.serviceProvider", &["Organization"]),
    // Condition
    ("Condition", "identifier", Token, "Condition.identifier", NONE),
    ("Condition", "code", Token, "Condition.code", NONE),
    ("Condition", "clinical-status", Token, "Condition.clinicalStatus", NONE),
    ("Condition", "verification-status", Token, "Condition.verificationStatus", NONE),
    ("Condition", "category", Token, "Condition.category", NONE),
    ("Condition", "subject", Reference, "Condition.subject", SUBJECTS),
    ("Condition", "patient", Reference, "Condition.subject.where(resolve() is Patient)", PATIENT),
    ("Condition", "encounter", Reference, "Condition.encounter", ENCOUNTER),
    (
        "Condition",
        "onset-date",
        Date,
        "(Condition.onset as dateTime) | (Condition.onset as Period)",
        NONE,
    ),
    (
        "Condition",
        "abatement-date",
        Date,
        "(Condition.abatement as dateTime) | (Condition.abatement as Period)",
        NONE,
    ),
    ("Condition", "recorded-date", Date, "Condition.recordedDate", NONE),
    (
        "Condition",
        "asserter",
        Reference,
        "Condition.asserter",
        &["Practitioner", "Patient", "PractitionerRole", "RelatedPerson"],
    ),
    // MedicationRequest
    ("MedicationRequest", "identifier", Token, "MedicationRequest.identifier", NONE),
    ("MedicationRequest", "status", Token, "MedicationRequest.status", NONE),
    ("MedicationRequest", "intent", Token, "MedicationRequest.intent", NONE),
    ("MedicationRequest", "priority", Token, "MedicationRequest.priority", NONE),
    (
        "MedicationRequest",
        "code",
        Token,
        "(MedicationRequest.medication as CodeableConcept)",
        NONE,
    ),
    (
        "MedicationRequest",
        "medication",
        Reference,
        "(MedicationRequest.medication as Reference)",
        &["Medication"],
    ),
    ("MedicationRequest", "subject", Reference, "MedicationRequest.subject", SUBJECTS),
    (
        "MedicationRequest",
        "patient",
        Reference,
        "MedicationRequest.subject.where(resolve() is Patient)",
        PATIENT,
    ),
    ("MedicationRequest", "encounter", Reference, "MedicationRequest.encounter", ENCOUNTER),
    ("MedicationRequest", "authoredon", Date, "MedicationRequest.authoredOn", NONE),
    (
        "MedicationRequest",
        "requester",
        Reference,
        "MedicationRequest.requester",
        &["Practitioner", "Organization", "Patient", "PractitionerRole", "RelatedPerson", "Device"],
    ),
    // MedicationDispense
    ("MedicationDispense", "identifier", Token, "MedicationDispense.identifier", NONE),
    ("MedicationDispense", "status", Token, "MedicationDispense.status", NONE),
    (
        "MedicationDispense",
        "code",
        Token,
        "(MedicationDispense.medication as CodeableConcept)",
        NONE,
    ),
    (
        "MedicationDispense",
        "medication",
        Reference,
        "(MedicationDispense.medication as Reference)",
        &["Medication"],
    ),
    ("MedicationDispense", "subject", Reference, "MedicationDispense.subject", SUBJECTS),
    (
        "MedicationDispense",
        "patient",
        Reference,
        "MedicationDispense.subject.where(resolve() is Patient)",
        PATIENT,
    ),
    (
        "MedicationDispense",
        "prescription",
        Reference,
        "MedicationDispense.authorizingPrescription",
        &["MedicationRequest"],
    ),
    ("MedicationDispense", "performer", Reference, "MedicationDispense.performer.actor", PRACTITIONERS),
    (
        "MedicationDispense",
        "receiver",
        Reference,
        "MedicationDispense.receiver",
        &["Patient", "Practitioner"],
    ),
    ("MedicationDispense", "whenhandedover", Date, "MedicationDispense.whenHandedOver", NONE),
    ("MedicationDispense", "whenprepared", Date, "MedicationDispense.whenPrepared", NONE),
    // Procedure
    ("Procedure", "identifier", Token, "Procedure.identifier", NONE),
    ("Procedure", "status", Token, "Procedure.status", NONE),
    ("Procedure", "code", Token, "Procedure.code", NONE),
    ("Procedure", "category", Token, "Procedure.category", NONE),
    ("Procedure", "subject", Reference, "Procedure.subject", SUBJECTS),
    ("Procedure", "patient", Reference, "Procedure.subject.where(resolve() is Patient)", PATIENT),
    ("Procedure", "encounter", Reference, "Procedure.encounter", ENCOUNTER),
    ("Procedure", "date", Date, "Procedure.performed", NONE),
    (
        "Procedure",
        "performer",
        Reference,
        "Procedure.performer.actor",
        &["Practitioner", "Organization", "Patient", "PractitionerRole", "RelatedPerson", "Device"],
    ),
    // AllergyIntolerance
    ("AllergyIntolerance", "identifier", Token, "AllergyIntolerance.identifier", NONE),
    (
        "AllergyIntolerance",
        "code",
        Token,
        "AllergyIntolerance.code | AllergyIntolerance.reaction.substance",
        NONE,
    ),
    ("AllergyIntolerance", "clinical-status", Token, "AllergyIntolerance.clinicalStatus", NONE),
    (
        "AllergyIntolerance",
        "verification-status",
        Token,
        "AllergyIntolerance.verificationStatus",
        NONE,
    ),
    ("AllergyIntolerance", "type", Token, "AllergyIntolerance.type", NONE),
    ("AllergyIntolerance", "category", Token, "AllergyIntolerance.category", NONE),
    ("AllergyIntolerance", "criticality", Token, "AllergyIntolerance.criticality", NONE),
    ("AllergyIntolerance", "patient", Reference, "AllergyIntolerance.patient", PATIENT),
    (
        "AllergyIntolerance",
        "recorder",
        Reference,
        "AllergyIntolerance.recorder",
        &["Practitioner", "Patient", "PractitionerRole", "RelatedPerson"],
    ),
    (
        "AllergyIntolerance",
        "asserter",
        Reference,
        "AllergyIntolerance.asserter",
        &["Practitioner", "Patient", "PractitionerRole", "RelatedPerson"],
    ),
    ("AllergyIntolerance", "date", Date, "AllergyIntolerance.recordedDate", NONE),
    ("AllergyIntolerance", "onset", Date, "AllergyIntolerance.reaction.onset", NONE),
    // DiagnosticReport
    ("DiagnosticReport", "identifier", Token, "DiagnosticReport.identifier", NONE),
    ("DiagnosticReport", "status", Token, "DiagnosticReport.status", NONE),
    ("DiagnosticReport", "code", Token, "DiagnosticReport.code", NONE),
    ("DiagnosticReport", "category", Token, "DiagnosticReport.category", NONE),
    (
        "DiagnosticReport",
        "subject",
        Reference,
        "DiagnosticReport.subject",
        &["Group", "Device", "Patient", "Location"],
    ),
    (
        "DiagnosticReport",
        "patient",
        Reference,
        "DiagnosticReport.subject.where(resolve() is Patient)",
        PATIENT,
    ),
    ("DiagnosticReport", "encounter", Reference, "DiagnosticReport.encounter", ENCOUNTER),
    ("DiagnosticReport", "date", Date, "DiagnosticReport.effective", NONE),
    ("DiagnosticReport", "issued", Date, "DiagnosticReport.issued", NONE),
    ("DiagnosticReport", "result", Reference, "DiagnosticReport.result", &["Observation"]),
    (
        "DiagnosticReport",
        "performer",
        Reference,
        "DiagnosticReport.performer",
        &["Practitioner", "Organization", "CareTeam", "PractitionerRole"],
    ),
    ("DiagnosticReport", "conclusion", Token, "DiagnosticReport.conclusionCode", NONE),
    // Immunization
    ("Immunization", "identifier", Token, "Immunization.identifier", NONE),
    ("Immunization", "status", Token, "Immunization.status", NONE),
    ("Immunization", "vaccine-code", Token, "Immunization.vaccineCode", NONE),
    ("Immunization", "patient", Reference, "Immunization.patient", PATIENT),
    ("Immunization", "date", Date, "Immunization.occurrence", NONE),
    ("Immunization", "lot-number", Str, "Immunization.lotNumber", NONE),
    ("Immunization", "performer", Reference, "Immunization.performer.actor", PRACTITIONERS),
    ("Immunization", "manufacturer", Reference, "Immunization.manufacturer", &["Organization"]),
    ("Immunization", "location", Reference, "Immunization.location", &["Location"]),
    // RiskAssessment
    ("RiskAssessment", "identifier", Token, "RiskAssessment.identifier", NONE),
    ("RiskAssessment", "method", Token, "RiskAssessment.method", NONE),
    ("RiskAssessment", "subject", Reference, "RiskAssessment.subject", SUBJECTS),
    (
        "RiskAssessment",
        "patient",
        Reference,
        "RiskAssessment.subject.where(resolve() is Patient)",
        PATIENT,
    ),
    ("RiskAssessment", "encounter", Reference, "RiskAssessment.encounter", ENCOUNTER),
    ("RiskAssessment", "date", Date, "(RiskAssessment.occurrence as dateTime)", NONE),
    (
        "RiskAssessment",
        "probability",
        Number,
        "(RiskAssessment.prediction.probability as decimal)",
        NONE,
    ),
    ("RiskAssessment", "risk", Token, "RiskAssessment.prediction.qualitativeRisk", NONE),
    ("RiskAssessment", "condition", Reference, "RiskAssessment.condition", &["Condition"]),
    (
        "RiskAssessment",
        "performer",
        Reference,
        "RiskAssessment.performer",
        &["Practitioner", "PractitionerRole", "Device"],
    ),
];

/// `(base, code, expression, [(component code, component expression)])`
type EmbeddedComposite = (
    &'static str,
    &'static str,
    &'static str,
    [(&'static str, &'static str); 2],
);

const EMBEDDED_COMPOSITES: &[EmbeddedComposite] = &[
    (
        "Observation",
        "code-value-quantity",
        "Observation",
        [("code", "code"), ("value-quantity", "value.ofType(Quantity)")],
    ),
    (
        "Observation",
        "code-value-concept",
        "Observation",
        [("code", "code"), ("value-concept", "value.ofType(CodeableConcept)")],
    ),
    (
        "Observation",
        "code-value-date",
        "Observation",
        [("code", "code"), ("value-date", "value.ofType(dateTime) | value.ofType(Period)")],
    ),
    (
        "Observation",
        "component-code-value-quantity",
        "Observation.component",
        [
            ("component-code", "code"),
            ("component-value-quantity", "value.ofType(Quantity)"),
        ],
    ),
    (
        "Observation",
        "component-code-value-concept",
        "Observation.component",
        [
            ("component-code", "code"),
            ("component-value-concept", "value.ofType(CodeableConcept)"),
        ],
    ),
];

fn hl7_url(base: &str, code: &str) -> String {
    format!("{}/{}-{}", HL7_BASE, base, code.trim_start_matches('_'))
}

/// Loader for SearchParameter definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchParameterLoader;

impl SearchParameterLoader {
    /// Creates a loader.
    pub fn new() -> Self {
        Self
    }

    /// The embedded R4 definitions, composites last.
    pub fn load_embedded(&self) -> Vec<SearchParameterDefinition> {
        let simple = EMBEDDED.iter().map(|(base, code, param_type, expression, targets)| {
            SearchParameterDefinition::new(hl7_url(base, code), *code, *param_type, *expression)
                .with_base([*base])
                .with_targets(targets.iter().copied())
        });
        let composites = EMBEDDED_COMPOSITES
            .iter()
            .map(|(base, code, expression, components)| {
                components.iter().fold(
                    SearchParameterDefinition::new(
                        hl7_url(base, code),
                        *code,
                        SearchParamType::Composite,
                        *expression,
                    )
                    .with_base([*base]),
                    |def, (component, expr)| def.with_component(hl7_url(base, component), *expr),
                )
            });
        simple.chain(composites).collect()
    }

    /// Reads SearchParameter resources from a single resource, an array or a Bundle.
    ///
    /// Entries that are not SearchParameters are ignored.
    pub fn load_from_json(&self, json: &Value) -> Result<Vec<SearchParameterDefinition>, LoaderError> {
        let is_search_parameter =
            |v: &Value| v.get("resourceType").and_then(Value::as_str) == Some("SearchParameter");

        let candidates: Vec<&Value> = if let Some(entries) = json.get("entry").and_then(Value::as_array) {
            entries.iter().filter_map(|e| e.get("resource")).collect()
        } else if let Some(items) = json.as_array() {
            items.iter().collect()
        } else {
            vec![json]
        };

        candidates
            .into_iter()
            .filter(|v| is_search_parameter(v))
            .map(|v| self.parse_resource(v))
            .collect()
    }

    /// Parses one SearchParameter resource.
    pub fn parse_resource(&self, resource: &Value) -> Result<SearchParameterDefinition, LoaderError> {
        let url = resource
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| LoaderError::MissingField {
                field: "url".to_string(),
                url: None,
            })?
            .to_string();

        let required = |field: &str| -> Result<&str, LoaderError> {
            resource
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| LoaderError::MissingField {
                    field: field.to_string(),
                    url: Some(url.clone()),
                })
        };

        let code = required("code")?.to_string();
        let type_str = required("type")?;
        let param_type = type_str
            .parse::<SearchParamType>()
            .map_err(|_| LoaderError::InvalidResource {
                message: format!("unsupported search parameter type '{}'", type_str),
                url: Some(url.clone()),
            })?;
        let expression = required("expression")?.to_string();

        let base = string_list(resource, "base");
        if base.is_empty() {
            return Err(LoaderError::MissingField {
                field: "base".to_string(),
                url: Some(url),
            });
        }

        let status = match resource.get("status").and_then(Value::as_str) {
            None => SearchParameterStatus::Active,
            Some(s) => SearchParameterStatus::from_fhir_status(s).ok_or_else(|| {
                LoaderError::InvalidResource {
                    message: format!("unknown status '{}'", s),
                    url: Some(url.clone()),
                }
            })?,
        };

        let component = self.parse_components(resource, &url)?;

        let mut definition = SearchParameterDefinition::new(url, code, param_type, expression)
            .with_base(base)
            .with_targets(string_list(resource, "target"))
            .with_status(status)
            .with_source(SearchParameterSource::Custom);
        definition.description = resource
            .get("description")
            .and_then(Value::as_str)
            .map(String::from);
        definition.component = component;
        Ok(definition)
    }

    fn parse_components(
        &self,
        resource: &Value,
        url: &str,
    ) -> Result<Vec<CompositeComponentDef>, LoaderError> {
        let Some(components) = resource.get("component").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        components
            .iter()
            .map(|comp| {
                let field = |name: &str| {
                    comp.get(name)
                        .and_then(Value::as_str)
                        .map(String::from)
                        .ok_or_else(|| LoaderError::MissingField {
                            field: format!("component.{}", name),
                            url: Some(url.to_string()),
                        })
                };
                Ok(CompositeComponentDef {
                    definition: field("definition")?,
                    expression: field("expression")?,
                })
            })
            .collect()
    }
}

fn string_list(resource: &Value, field: &str) -> Vec<String> {
    resource
        .get(field)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}
