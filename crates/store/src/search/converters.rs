//! Value converters for the search index.
//!
//! Each search parameter type has a pure converter from one selected element
//! to zero or more [`IndexValue`]s. Converters are chosen once per rule by
//! [`ValueConverter::for_rule`], so the write path never dispatches on the
//! parameter type again.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::types::{PrecisePoint, SearchParamType, TemporalValue};

use super::errors::ExtractionError;
use super::references::{ReferenceKind, ReferenceTarget};
use super::units::{self, CanonicalQuantity};

/// A value extracted and converted for the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// String value; `normalized` is the folded form used for matching.
    String {
        /// Case- and diacritic-folded alphanumerics.
        normalized: String,
        /// The text as written.
        raw: String,
    },

    /// Token (system, code, display).
    Token {
        /// Code system URI.
        system: Option<String>,
        /// Code value; `None` for a text-only CodeableConcept.
        code: Option<String>,
        /// Display text used by `:text`.
        display: Option<String>,
    },

    /// Date or period reduced to an interval.
    Date(TemporalValue),

    /// Decimal number.
    Number(Decimal),

    /// Quantity with its canonical form when available.
    Quantity {
        /// Numeric value as written.
        value: Decimal,
        /// Human-readable unit.
        unit: Option<String>,
        /// Unit system URI.
        system: Option<String>,
        /// Coded unit.
        code: Option<String>,
        /// The value in the canonical unit of its dimension.
        canonical: Option<CanonicalQuantity>,
    },

    /// Reference to another resource.
    Reference(ReferenceTarget),

    /// URI value.
    Uri(String),
}

impl IndexValue {
    /// Creates a string value, folding it for matching.
    pub fn string(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        IndexValue::String {
            normalized: normalize_string(&raw),
            raw,
        }
    }

    /// Creates a token value.
    pub fn token(system: Option<&str>, code: Option<&str>, display: Option<&str>) -> Self {
        IndexValue::Token {
            system: system.map(str::to_string),
            code: code.map(str::to_string),
            display: display.map(str::to_string),
        }
    }

    /// The parameter type this value indexes.
    pub fn param_type(&self) -> SearchParamType {
        match self {
            IndexValue::String { .. } => SearchParamType::String,
            IndexValue::Token { .. } => SearchParamType::Token,
            IndexValue::Date(_) => SearchParamType::Date,
            IndexValue::Number(_) => SearchParamType::Number,
            IndexValue::Quantity { .. } => SearchParamType::Quantity,
            IndexValue::Reference(_) => SearchParamType::Reference,
            IndexValue::Uri(_) => SearchParamType::Uri,
        }
    }
}

/// Folds text for string search: NFKD, combining marks removed, lowercase,
/// alphanumerics only.
pub fn normalize_string(input: &str) -> String {
    input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// A compiled converter: one element in, index values out.
pub type Converter =
    Arc<dyn Fn(&Value) -> Result<Vec<IndexValue>, ExtractionError> + Send + Sync>;

/// The per-type conversion functions.
pub struct ValueConverter;

impl ValueConverter {
    /// Builds the converter for a rule.
    ///
    /// `unit_aware` enables canonical quantities; `targets` are the declared
    /// reference target types, used to type `urn:uuid:` references.
    /// Composite rules convert through their components and get `None`.
    pub fn for_rule(
        param_type: SearchParamType,
        unit_aware: bool,
        targets: &[String],
    ) -> Option<Converter> {
        let converter: Converter = match param_type {
            SearchParamType::String => Arc::new(Self::to_string_values),
            SearchParamType::Token => Arc::new(Self::to_tokens),
            SearchParamType::Date => Arc::new(Self::to_date),
            SearchParamType::Number => Arc::new(Self::to_number),
            SearchParamType::Uri => Arc::new(Self::to_uri),
            SearchParamType::Quantity => {
                Arc::new(move |value: &Value| Self::to_quantity(value, unit_aware))
            }
            SearchParamType::Reference => {
                let targets = targets.to_vec();
                Arc::new(move |value: &Value| Self::to_reference(value, &targets))
            }
            SearchParamType::Composite => return None,
        };
        Some(converter)
    }

    /// String, HumanName or Address.
    pub fn to_string_values(value: &Value) -> Result<Vec<IndexValue>, ExtractionError> {
        match value {
            Value::String(s) => Ok(vec![IndexValue::string(s.as_str())]),
            Value::Object(obj) => {
                const NAME_PARTS: &[&str] = &["family", "given", "prefix", "suffix", "text"];
                const ADDRESS_PARTS: &[&str] = &[
                    "line",
                    "city",
                    "district",
                    "state",
                    "postalCode",
                    "country",
                    "text",
                ];
                let parts = if NAME_PARTS[..4].iter().any(|k| obj.contains_key(*k)) {
                    NAME_PARTS
                } else if ADDRESS_PARTS[..6].iter().any(|k| obj.contains_key(*k)) {
                    ADDRESS_PARTS
                } else if obj.contains_key("text") {
                    &["text"][..]
                } else {
                    return Err(ExtractionError::shape("string, HumanName or Address", value));
                };
                Ok(string_parts(obj, parts))
            }
            _ => Err(ExtractionError::shape("string, HumanName or Address", value)),
        }
    }

    /// Coding, CodeableConcept, Identifier, ContactPoint, code or boolean.
    pub fn to_tokens(value: &Value) -> Result<Vec<IndexValue>, ExtractionError> {
        let obj = match value {
            Value::String(code) => return Ok(vec![IndexValue::token(None, Some(code), None)]),
            Value::Bool(b) => {
                let code = if *b { "true" } else { "false" };
                return Ok(vec![IndexValue::token(None, Some(code), None)]);
            }
            Value::Object(obj) => obj,
            _ => return Err(ExtractionError::shape("token", value)),
        };

        if let Some(codings) = obj.get("coding") {
            let codings = codings
                .as_array()
                .ok_or_else(|| ExtractionError::shape("CodeableConcept.coding array", codings))?;
            let text = str_field(obj, "text");
            let mut out = Vec::with_capacity(codings.len() + 1);
            for coding in codings {
                let Some(c) = coding.as_object() else {
                    return Err(ExtractionError::shape("Coding", coding));
                };
                out.push(coding_token(c, text));
            }
            if let Some(text) = text {
                out.push(IndexValue::token(None, None, Some(text)));
            }
            return Ok(out);
        }

        if obj.contains_key("code") || (obj.contains_key("system") && !obj.contains_key("value")) {
            return Ok(vec![coding_token(obj, None)]);
        }

        // Identifier and ContactPoint both index as (system, value)
        if let Some(v) = obj.get("value") {
            let Some(v) = v.as_str() else {
                return Err(ExtractionError::shape("Identifier.value string", v));
            };
            return Ok(vec![IndexValue::token(str_field(obj, "system"), Some(v), None)]);
        }

        if let Some(text) = str_field(obj, "text") {
            return Ok(vec![IndexValue::token(None, None, Some(text))]);
        }

        Err(ExtractionError::shape("token", value))
    }

    /// date, dateTime, instant or Period.
    pub fn to_date(value: &Value) -> Result<Vec<IndexValue>, ExtractionError> {
        let parse = |s: &str| {
            PrecisePoint::parse(s)
                .map_err(|e| ExtractionError::conversion("date", s, e.reason))
        };
        match value {
            Value::String(s) => Ok(vec![IndexValue::Date(TemporalValue::Instant(parse(s)?))]),
            Value::Object(obj) if obj.contains_key("start") || obj.contains_key("end") => {
                let bound = |key: &str| -> Result<Option<PrecisePoint>, ExtractionError> {
                    match obj.get(key) {
                        None | Some(Value::Null) => Ok(None),
                        Some(Value::String(s)) => parse(s).map(Some),
                        Some(other) => Err(ExtractionError::shape("dateTime", other)),
                    }
                };
                let start = bound("start")?;
                let end = bound("end")?;
                if let (Some(s), Some(e)) = (start, end)
                    && e.upper_bound() <= s.value
                {
                    return Err(ExtractionError::conversion(
                        "date",
                        value.to_string(),
                        "period ends before it starts",
                    ));
                }
                Ok(vec![IndexValue::Date(TemporalValue::Interval { start, end })])
            }
            _ => Err(ExtractionError::shape("date or Period", value)),
        }
    }

    /// integer or decimal.
    pub fn to_number(value: &Value) -> Result<Vec<IndexValue>, ExtractionError> {
        match value {
            Value::Number(n) => Ok(vec![IndexValue::Number(parse_decimal(&n.to_string())?)]),
            _ => Err(ExtractionError::shape("number", value)),
        }
    }

    /// Quantity (and its profiles Age, Duration, Money...).
    pub fn to_quantity(value: &Value, unit_aware: bool) -> Result<Vec<IndexValue>, ExtractionError> {
        let Value::Object(obj) = value else {
            return Err(ExtractionError::shape("Quantity", value));
        };
        let number = match obj.get("value") {
            Some(Value::Number(n)) => parse_decimal(&n.to_string())?,
            Some(other) => return Err(ExtractionError::shape("Quantity.value number", other)),
            None => {
                return Err(ExtractionError::conversion(
                    "quantity",
                    value.to_string(),
                    "Quantity has no value",
                ));
            }
        };
        let unit = str_field(obj, "unit");
        let system = str_field(obj, "system");
        let code = str_field(obj, "code");

        let canonical = if unit_aware && units::is_ucum_system(system) {
            code.or(unit)
                .and_then(|c| units::canonicalize(number, c))
        } else {
            None
        };

        Ok(vec![IndexValue::Quantity {
            value: number,
            unit: unit.map(str::to_string),
            system: system.map(str::to_string),
            code: code.map(str::to_string),
            canonical,
        }])
    }

    /// Reference or a canonical/uri string naming a resource.
    pub fn to_reference(value: &Value, targets: &[String]) -> Result<Vec<IndexValue>, ExtractionError> {
        let (raw, declared) = match value {
            Value::String(s) => (s.as_str(), None),
            Value::Object(obj) => match obj.get("reference") {
                Some(Value::String(s)) => (s.as_str(), str_field(obj, "type")),
                Some(other) => return Err(ExtractionError::shape("Reference.reference string", other)),
                // identifier-only references carry nothing to index
                None => return Ok(Vec::new()),
            },
            _ => return Err(ExtractionError::shape("Reference", value)),
        };
        let mut target = ReferenceTarget::parse(raw, declared);
        if target.kind == ReferenceKind::Contained {
            return Ok(Vec::new());
        }
        target.infer_from_targets(targets);
        Ok(vec![IndexValue::Reference(target)])
    }

    /// uri, url, canonical.
    pub fn to_uri(value: &Value) -> Result<Vec<IndexValue>, ExtractionError> {
        match value {
            Value::String(s) => Ok(vec![IndexValue::Uri(s.clone())]),
            _ => Err(ExtractionError::shape("uri", value)),
        }
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn coding_token(coding: &Map<String, Value>, fallback_display: Option<&str>) -> IndexValue {
    IndexValue::token(
        str_field(coding, "system"),
        str_field(coding, "code"),
        str_field(coding, "display").or(fallback_display),
    )
}

fn string_parts(obj: &Map<String, Value>, keys: &[&str]) -> Vec<IndexValue> {
    let mut out = Vec::new();
    for key in keys {
        match obj.get(*key) {
            Some(Value::String(s)) => out.push(IndexValue::string(s.as_str())),
            Some(Value::Array(items)) => {
                out.extend(items.iter().filter_map(Value::as_str).map(IndexValue::string));
            }
            _ => {}
        }
    }
    out
}

fn parse_decimal(text: &str) -> Result<Decimal, ExtractionError> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| ExtractionError::conversion("number", text, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_normalize_string() {
        assert_eq!(normalize_string("Évê"), "eve");
        assert_eq!(normalize_string("  O'Brien-Smith "), "obriensmith");
        assert_eq!(normalize_string("Müller"), "muller");
    }

    #[test]
    fn test_human_name_expands_to_parts() {
        let name = json!({"family": "Chalmers", "given": ["Peter", "James"], "text": "Peter Chalmers"});
        let values = ValueConverter::to_string_values(&name).unwrap();
        let normalized: Vec<_> = values
            .iter()
            .map(|v| match v {
                IndexValue::String { normalized, .. } => normalized.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(normalized, vec!["chalmers", "peter", "james", "peterchalmers"]);
    }

    #[test]
    fn test_address_expands_to_parts() {
        let addr = json!({"line": ["534 Erewhon St"], "city": "PleasantVille", "postalCode": "3999"});
        assert_eq!(ValueConverter::to_string_values(&addr).unwrap().len(), 3);
    }

    #[test]
    fn test_string_rejects_numbers() {
        assert!(ValueConverter::to_string_values(&json!(42)).is_err());
    }

    #[test]
    fn test_codeable_concept_tokens() {
        let cc = json!({
            "coding": [
                {"system": "http://loinc.org", "code": "8480-6", "display": "Systolic"},
                {"system": "http://snomed.info/sct", "code": "271649006"}
            ],
            "text": "Systolic blood pressure"
        });
        let tokens = ValueConverter::to_tokens(&cc).unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(
            tokens[1],
            IndexValue::token(
                Some("http://snomed.info/sct"),
                Some("271649006"),
                Some("Systolic blood pressure")
            )
        );
        assert_eq!(
            tokens[2],
            IndexValue::token(None, None, Some("Systolic blood pressure"))
        );
    }

    #[test]
    fn test_identifier_and_boolean_tokens() {
        let ident = json!({"system": "urn:oid:1.2.36.146.595.217.0.1", "value": "12345"});
        assert_eq!(
            ValueConverter::to_tokens(&ident).unwrap(),
            vec![IndexValue::token(Some("urn:oid:1.2.36.146.595.217.0.1"), Some("12345"), None)]
        );
        assert_eq!(
            ValueConverter::to_tokens(&json!(true)).unwrap(),
            vec![IndexValue::token(None, Some("true"), None)]
        );
    }

    #[test]
    fn test_token_shape_errors() {
        assert!(ValueConverter::to_tokens(&json!({"foo": 1})).is_err());
        assert!(ValueConverter::to_tokens(&json!({"coding": "x"})).is_err());
        assert!(ValueConverter::to_tokens(&json!(1.5)).is_err());
    }

    #[test]
    fn test_date_and_period() {
        let day = ValueConverter::to_date(&json!("2024-03-01")).unwrap();
        let IndexValue::Date(t) = &day[0] else { unreachable!() };
        assert_eq!(t.to_range().start_key(), "2024-03-01T00:00:00.000Z");
        assert_eq!(t.to_range().end_key(), "2024-03-02T00:00:00.000Z");

        let open = ValueConverter::to_date(&json!({"start": "2024-01-01"})).unwrap();
        let IndexValue::Date(t) = &open[0] else { unreachable!() };
        assert_eq!(t.to_range().end_key(), crate::types::RANGE_MAX);
    }

    #[test]
    fn test_bad_dates_are_conversion_errors() {
        assert!(matches!(
            ValueConverter::to_date(&json!("yesterday")),
            Err(ExtractionError::ConversionFailed { .. })
        ));
        assert!(ValueConverter::to_date(&json!({"start": "2024-02-01", "end": "2024-01-01"})).is_err());
    }

    #[test]
    fn test_number() {
        assert_eq!(
            ValueConverter::to_number(&json!(3.25)).unwrap(),
            vec![IndexValue::Number(dec("3.25"))]
        );
        assert_eq!(
            ValueConverter::to_number(&json!(1e3)).unwrap(),
            vec![IndexValue::Number(dec("1000"))]
        );
        assert!(ValueConverter::to_number(&json!("3")).is_err());
    }

    #[test]
    fn test_quantity_canonical_only_when_unit_aware() {
        let q = json!({"value": 1.2, "unit": "kg", "system": "http://unitsofmeasure.org", "code": "kg"});
        let aware = ValueConverter::to_quantity(&q, true).unwrap();
        let IndexValue::Quantity { canonical, .. } = &aware[0] else { unreachable!() };
        assert_eq!(canonical.as_ref().map(|c| c.value), Some(dec("1200")));

        let plain = ValueConverter::to_quantity(&q, false).unwrap();
        let IndexValue::Quantity { canonical, .. } = &plain[0] else { unreachable!() };
        assert!(canonical.is_none());
    }

    #[test]
    fn test_quantity_without_value() {
        assert!(ValueConverter::to_quantity(&json!({"unit": "kg"}), true).is_err());
    }

    #[test]
    fn test_reference_conversion() {
        let targets = vec!["Patient".to_string()];
        let values =
            ValueConverter::to_reference(&json!({"reference": "urn:uuid:abc-1"}), &targets).unwrap();
        let IndexValue::Reference(t) = &values[0] else { unreachable!() };
        assert_eq!(t.canonical().as_deref(), Some("Patient/abc-1"));

        assert!(
            ValueConverter::to_reference(&json!({"reference": "#c1"}), &targets)
                .unwrap()
                .is_empty()
        );
        assert!(
            ValueConverter::to_reference(&json!({"identifier": {"value": "x"}}), &targets)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_for_rule_composite_has_no_converter() {
        assert!(ValueConverter::for_rule(SearchParamType::Composite, false, &[]).is_none());
        let uri = ValueConverter::for_rule(SearchParamType::Uri, false, &[]).unwrap();
        assert_eq!(uri(&json!("http://x")).unwrap(), vec![IndexValue::Uri("http://x".into())]);
    }
}
