//! Reference normalization and the reference graph.
//!
//! [`ReferenceTarget::parse`] reduces the literal forms of a FHIR reference
//! (relative, absolute URL, `urn:uuid:`) to a canonical `Type/id`.
//! [`ReferenceIndexer`] walks a resource and emits one [`ReferenceEdge`] per
//! reference element, which backs integrity checks, compartments and
//! includes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SearchParamType;

use super::registry::ExtractionRule;

/// How a reference was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    /// `Patient/123`
    Relative,
    /// `http://server/fhir/Patient/123`
    Absolute,
    /// `urn:uuid:...`
    UrnUuid,
    /// `#contained-id`
    Contained,
    /// Anything else (`urn:oid:`, malformed text).
    Other,
}

impl ReferenceKind {
    /// Name stored in the `kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Relative => "relative",
            ReferenceKind::Absolute => "absolute",
            ReferenceKind::UrnUuid => "urnuuid",
            ReferenceKind::Contained => "contained",
            ReferenceKind::Other => "other",
        }
    }

    /// Inverse of [`as_str`](Self::as_str); unknown names map to `Other`.
    pub fn from_column(s: &str) -> Self {
        match s {
            "relative" => ReferenceKind::Relative,
            "absolute" => ReferenceKind::Absolute,
            "urnuuid" => ReferenceKind::UrnUuid,
            "contained" => ReferenceKind::Contained,
            _ => ReferenceKind::Other,
        }
    }
}

/// A reference normalized as far as the text allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTarget {
    /// The reference text as written.
    pub raw: String,
    /// How it was written.
    pub kind: ReferenceKind,
    /// Target type, when known.
    pub target_type: Option<String>,
    /// Target id, when known.
    pub target_id: Option<String>,
}

impl ReferenceTarget {
    /// Parses reference text. `declared_type` is `Reference.type`, if present.
    pub fn parse(raw: &str, declared_type: Option<&str>) -> Self {
        let raw = raw.trim();
        let mut target = Self {
            raw: raw.to_string(),
            kind: ReferenceKind::Other,
            target_type: None,
            target_id: None,
        };

        if raw.starts_with('#') {
            target.kind = ReferenceKind::Contained;
            return target;
        }

        if let Some(uuid) = raw.strip_prefix("urn:uuid:") {
            target.kind = ReferenceKind::UrnUuid;
            if looks_like_id(uuid) {
                target.target_id = Some(uuid.to_string());
                target.target_type = declared_type.map(str::to_string);
            }
            return target;
        }

        let (kind, path) = if raw.contains("://") {
            let without_query = raw.split(['?', '#']).next().unwrap_or(raw);
            (ReferenceKind::Absolute, without_query)
        } else if raw.starts_with("urn:") {
            return target;
        } else {
            (ReferenceKind::Relative, raw)
        };

        let path = match path.find("/_history/") {
            Some(pos) => &path[..pos],
            None => path,
        };
        let mut segments = path.trim_end_matches('/').rsplit('/');
        let id = segments.next();
        let ty = segments.next();
        // A relative reference is exactly `Type/id`
        let extra = kind == ReferenceKind::Relative && segments.next().is_some();

        if let (Some(ty), Some(id)) = (ty, id)
            && !extra
            && looks_like_type(ty)
            && looks_like_id(id)
        {
            target.kind = kind;
            target.target_type = Some(ty.to_string());
            target.target_id = Some(id.to_string());
        }
        target
    }

    /// `Type/id`, when both parts are known.
    pub fn canonical(&self) -> Option<String> {
        match (&self.target_type, &self.target_id) {
            (Some(t), Some(id)) => Some(format!("{}/{}", t, id)),
            _ => None,
        }
    }

    /// Returns true if the target is known as `Type/id`.
    pub fn is_resolved(&self) -> bool {
        self.canonical().is_some()
    }

    /// Returns true for `urn:uuid:` references still lacking a type.
    pub fn needs_type_lookup(&self) -> bool {
        self.kind == ReferenceKind::UrnUuid && self.target_type.is_none() && self.target_id.is_some()
    }

    /// Fills in the type of an untyped `urn:uuid:` reference when the element
    /// allows exactly one target type.
    pub fn infer_from_targets(&mut self, targets: &[String]) {
        if self.needs_type_lookup()
            && let [only] = targets
        {
            self.target_type = Some(only.clone());
        }
    }

    /// Sets the type found by looking the id up in storage.
    pub fn resolve_as(&mut self, resource_type: impl Into<String>) {
        if self.needs_type_lookup() {
            self.target_type = Some(resource_type.into());
        }
    }

    /// Returns true if the target is expected to live in this store.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, ReferenceKind::Relative | ReferenceKind::UrnUuid)
    }
}

fn looks_like_type(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_uppercase()) && s.chars().all(|c| c.is_ascii_alphanumeric())
}

fn looks_like_id(s: &str) -> bool {
    (1..=64).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// A reference element found in a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEdge {
    /// Element path without array indices, e.g. `Encounter.participant.individual`.
    pub path: String,
    /// The normalized target.
    pub target: ReferenceTarget,
    /// Whether the element is mandatory for the resource type.
    pub required: bool,
}

/// Mandatory (`1..1`) reference elements per resource type.
const REQUIRED_REFERENCE_PATHS: &[(&str, &[&str])] = &[
    ("AllergyIntolerance", &["patient"]),
    ("Condition", &["subject"]),
    ("Immunization", &["patient"]),
    ("MedicationRequest", &["subject"]),
    ("Procedure", &["subject"]),
    ("RiskAssessment", &["subject"]),
];

/// Extracts the reference graph of a resource.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndexer {
    required: HashMap<String, HashSet<String>>,
}

impl ReferenceIndexer {
    /// Creates an indexer with the built-in mandatory paths.
    pub fn new() -> Self {
        let required = REQUIRED_REFERENCE_PATHS
            .iter()
            .map(|(ty, paths)| {
                let full = paths.iter().map(|p| format!("{}.{}", ty, p)).collect();
                (ty.to_string(), full)
            })
            .collect();
        Self { required }
    }

    /// Returns true if `path` is a mandatory reference element.
    pub fn is_required(&self, resource_type: &str, path: &str) -> bool {
        self.required
            .get(resource_type)
            .is_some_and(|paths| paths.contains(path))
    }

    /// Mandatory paths for a type, sorted.
    pub fn required_paths(&self, resource_type: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .required
            .get(resource_type)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Emits one edge per distinct `(path, reference)` in the resource.
    ///
    /// Every `reference` element is visited, so the edges are a superset of
    /// what the reference search parameters in `rules` select. The rules only
    /// contribute declared target types, used to type `urn:uuid:` references.
    /// Contained references and the `contained` resources themselves are skipped.
    pub fn index(
        &self,
        resource_type: &str,
        resource: &Value,
        rules: &[Arc<ExtractionRule>],
    ) -> Vec<ReferenceEdge> {
        let mut declared: HashMap<*const Value, Vec<String>> = HashMap::new();
        for rule in rules
            .iter()
            .filter(|r| r.definition.param_type == SearchParamType::Reference)
        {
            for node in rule.path.evaluate(resource) {
                // `resolve() is X` narrows a search, it does not declare a target.
                if node.resolves_to.is_some() {
                    continue;
                }
                let entry = declared.entry(node.value as *const Value).or_default();
                for target in &rule.definition.target {
                    if !entry.contains(target) {
                        entry.push(target.clone());
                    }
                }
            }
        }

        let mut edges = Vec::new();
        let mut seen = HashSet::new();
        let mut path = vec![resource_type.to_string()];
        self.walk(resource_type, resource, &mut path, &declared, &mut seen, &mut edges);
        edges
    }

    fn walk(
        &self,
        resource_type: &str,
        value: &Value,
        path: &mut Vec<String>,
        declared: &HashMap<*const Value, Vec<String>>,
        seen: &mut HashSet<(String, String)>,
        edges: &mut Vec<ReferenceEdge>,
    ) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(resource_type, item, path, declared, seen, edges);
                }
            }
            Value::Object(map) => {
                if let Some(raw) = map.get("reference").and_then(Value::as_str) {
                    let declared_type = map.get("type").and_then(Value::as_str);
                    let mut target = ReferenceTarget::parse(raw, declared_type);
                    if target.kind != ReferenceKind::Contained {
                        if let Some(targets) = declared.get(&(value as *const Value)) {
                            target.infer_from_targets(targets);
                        }
                        let joined = path.join(".");
                        if seen.insert((joined.clone(), target.raw.clone())) {
                            edges.push(ReferenceEdge {
                                required: self.is_required(resource_type, &joined),
                                path: joined,
                                target,
                            });
                        }
                    }
                }
                for (key, child) in map {
                    if key == "contained" || key.starts_with('_') {
                        continue;
                    }
                    if matches!(child, Value::Object(_) | Value::Array(_)) {
                        path.push(key.clone());
                        self.walk(resource_type, child, path, declared, seen, edges);
                        path.pop();
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_relative() {
        let t = ReferenceTarget::parse("Patient/123", None);
        assert_eq!(t.kind, ReferenceKind::Relative);
        assert_eq!(t.canonical().as_deref(), Some("Patient/123"));
    }

    #[test]
    fn test_parse_versioned_relative() {
        let t = ReferenceTarget::parse("Patient/123/_history/4", None);
        assert_eq!(t.canonical().as_deref(), Some("Patient/123"));
    }

    #[test]
    fn test_parse_absolute_strips_history() {
        let t = ReferenceTarget::parse("https://ehr.example.org/fhir/Patient/p-9/_history/2", None);
        assert_eq!(t.kind, ReferenceKind::Absolute);
        assert_eq!(t.canonical().as_deref(), Some("Patient/p-9"));
        assert!(!t.is_local());
    }

    #[test]
    fn test_parse_urn_uuid() {
        let raw = "urn:uuid:2d5b7a3c-0d2f-4a4e-9f51-4a1c1d8c2b11";
        let typed = ReferenceTarget::parse(raw, Some("Patient"));
        assert_eq!(
            typed.canonical().as_deref(),
            Some("Patient/2d5b7a3c-0d2f-4a4e-9f51-4a1c1d8c2b11")
        );

        let mut untyped = ReferenceTarget::parse(raw, None);
        assert!(untyped.needs_type_lookup());
        untyped.infer_from_targets(&["Patient".to_string(), "Group".to_string()]);
        assert!(!untyped.is_resolved());
        untyped.infer_from_targets(&["Patient".to_string()]);
        assert!(untyped.is_resolved());
    }

    #[test]
    fn test_parse_unresolvable() {
        assert!(!ReferenceTarget::parse("urn:oid:1.2.3", None).is_resolved());
        assert!(!ReferenceTarget::parse("just-an-id", None).is_resolved());
        assert!(!ReferenceTarget::parse("a/b/c", None).is_resolved());
        assert_eq!(
            ReferenceTarget::parse("#med1", None).kind,
            ReferenceKind::Contained
        );
    }

    #[test]
    fn test_index_walks_every_reference() {
        let encounter = json!({
            "resourceType": "Encounter",
            "subject": {"reference": "Patient/p1"},
            "participant": [
                {"individual": {"reference": "Practitioner/d1"}},
                {"individual": {"reference": "Practitioner/d2"}}
            ],
            "extension": [{"url": "x", "valueReference": {"reference": "Organization/o1"}}],
            "contained": [{"resourceType": "Location", "managingOrganization": {"reference": "Organization/o2"}}],
            "location": [{"location": {"reference": "#loc"}}]
        });
        let edges = ReferenceIndexer::new().index("Encounter", &encounter, &[]);
        let mut paths: Vec<(String, String)> = edges
            .iter()
            .map(|e| (e.path.clone(), e.target.raw.clone()))
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                ("Encounter.extension.valueReference".to_string(), "Organization/o1".to_string()),
                ("Encounter.participant.individual".to_string(), "Practitioner/d1".to_string()),
                ("Encounter.participant.individual".to_string(), "Practitioner/d2".to_string()),
                ("Encounter.subject".to_string(), "Patient/p1".to_string()),
            ]
        );
    }

    #[test]
    fn test_required_flag() {
        let condition = json!({
            "resourceType": "Condition",
            "subject": {"reference": "Patient/p1"},
            "recorder": {"reference": "Practitioner/d1"}
        });
        let indexer = ReferenceIndexer::new();
        let edges = indexer.index("Condition", &condition, &[]);
        let subject = edges.iter().find(|e| e.path == "Condition.subject").unwrap();
        let recorder = edges.iter().find(|e| e.path == "Condition.recorder").unwrap();
        assert!(subject.required);
        assert!(!recorder.required);
        assert_eq!(indexer.required_paths("Condition"), vec!["Condition.subject"]);
    }
}
