//! Element paths used by search parameter expressions.
//!
//! Only the navigational subset of FHIRPath that R4 search parameters need is
//! accepted:
//!
//! - dotted field access with implicit array flattening
//! - choice-type fields (`Observation.effective` finds `effectiveDateTime`)
//! - `.ofType(X)` and `as X`
//! - unions with `|`
//! - `.where(resolve() is X)` on references
//!
//! An untyped `urn:uuid:` reference cannot be resolved from the document
//! alone, so `resolve() is X` keeps it and records `X` in
//! [`Node::resolves_to`]; the caller settles it once storage has been
//! consulted.
//!
//! Anything else is rejected when the expression is compiled, so a malformed
//! definition never reaches the write path.

use std::fmt;

use serde_json::Value;

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Child element; choice-type variants match when the exact key is absent.
    Field(String),
    /// Keep only elements of the given FHIR type.
    OfType(String),
    /// Keep only references that point at the given resource type.
    ResolvesTo(String),
}

/// One alternative of a union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChain {
    /// Resource type the chain starts from (`Resource` and `DomainResource` match any).
    pub root: Option<String>,
    /// Steps applied in order.
    pub steps: Vec<Step>,
}

/// A compiled expression: a union of chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementPath {
    /// The union alternatives, evaluated in order.
    pub chains: Vec<PathChain>,
}

/// Why an expression could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError(pub String);

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PathError {}

/// An element selected by a path, with the type suffix of its choice key.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<'a> {
    /// The element.
    pub value: &'a Value,
    /// `Quantity` for `valueQuantity`, `None` for ordinary fields.
    pub choice_type: Option<&'a str>,
    /// Type the reference must resolve to, when that is still unknown.
    pub resolves_to: Option<String>,
}

impl ElementPath {
    /// Compiles an expression.
    pub fn parse(expression: &str) -> Result<Self, PathError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(PathError("empty expression".to_string()));
        }
        let chains = split_top_level(expression, '|')?
            .into_iter()
            .map(parse_chain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { chains })
    }

    /// Evaluates the path against a resource (or, for relative paths, any element).
    pub fn evaluate<'a>(&self, root: &'a Value) -> Vec<Node<'a>> {
        let resource_type = root.get("resourceType").and_then(Value::as_str);
        let mut out = Vec::new();
        for chain in &self.chains {
            if let Some(expected) = &chain.root
                && !matches!(expected.as_str(), "Resource" | "DomainResource")
                && resource_type != Some(expected.as_str())
            {
                continue;
            }
            let mut current = vec![Node {
                value: root,
                choice_type: None,
                resolves_to: None,
            }];
            for step in &chain.steps {
                current = apply_step(step, current);
                if current.is_empty() {
                    break;
                }
            }
            out.extend(current);
        }
        out
    }

    /// Field paths of every chain, e.g. `Observation.subject`.
    ///
    /// Used to label reference edges; filters are dropped.
    pub fn field_paths(&self) -> Vec<String> {
        self.chains
            .iter()
            .map(|chain| {
                let mut parts: Vec<&str> = chain.root.iter().map(String::as_str).collect();
                parts.extend(chain.steps.iter().filter_map(|s| match s {
                    Step::Field(name) => Some(name.as_str()),
                    _ => None,
                }));
                parts.join(".")
            })
            .collect()
    }
}

fn apply_step<'a>(step: &Step, input: Vec<Node<'a>>) -> Vec<Node<'a>> {
    let mut out = Vec::new();
    match step {
        Step::Field(name) => {
            for node in input {
                let Value::Object(map) = node.value else {
                    continue;
                };
                if let Some(child) = map.get(name) {
                    push_flattened(&mut out, child, None);
                    continue;
                }
                for (key, child) in map {
                    if let Some(suffix) = key.strip_prefix(name.as_str())
                        && suffix.starts_with(|c: char| c.is_ascii_uppercase())
                    {
                        push_flattened(&mut out, child, Some(suffix));
                    }
                }
            }
        }
        Step::OfType(type_name) => {
            out.extend(input.into_iter().filter(|n| is_of_type(n, type_name)));
        }
        Step::ResolvesTo(type_name) => {
            for mut node in input {
                match reference_type(node.value) {
                    Some(found) if found == *type_name => out.push(node),
                    None if is_urn_uuid(node.value) => {
                        node.resolves_to = Some(type_name.clone());
                        out.push(node);
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

fn push_flattened<'a>(out: &mut Vec<Node<'a>>, value: &'a Value, choice_type: Option<&'a str>) {
    match value {
        Value::Array(items) => out.extend(items.iter().map(|value| Node {
            value,
            choice_type,
            resolves_to: None,
        })),
        Value::Null => {}
        value => out.push(Node {
            value,
            choice_type,
            resolves_to: None,
        }),
    }
}

fn is_of_type(node: &Node<'_>, type_name: &str) -> bool {
    if let Some(choice) = node.choice_type {
        return choice.eq_ignore_ascii_case(type_name);
    }
    // Without a choice suffix, fall back to the JSON shape.
    match type_name {
        "Quantity" | "Age" | "Duration" | "SimpleQuantity" => node
            .value
            .get("value")
            .is_some_and(Value::is_number),
        "CodeableConcept" => node
            .value
            .as_object()
            .is_some_and(|o| o.contains_key("coding") || o.contains_key("text")),
        "Coding" => node.value.as_object().is_some_and(|o| o.contains_key("code")),
        "Reference" => node.value.as_object().is_some_and(|o| o.contains_key("reference")),
        "Period" => node
            .value
            .as_object()
            .is_some_and(|o| o.contains_key("start") || o.contains_key("end")),
        "string" | "uri" | "code" | "dateTime" | "date" | "instant" => node.value.is_string(),
        "boolean" => node.value.is_boolean(),
        "integer" | "decimal" => node.value.is_number(),
        _ => false,
    }
}

fn is_urn_uuid(value: &Value) -> bool {
    value
        .get("reference")
        .and_then(Value::as_str)
        .is_some_and(|r| r.starts_with("urn:uuid:"))
}

/// Resource type a Reference element points at, from `type` or the reference text.
pub fn reference_type(value: &Value) -> Option<String> {
    if let Some(t) = value.get("type").and_then(Value::as_str) {
        return Some(t.to_string());
    }
    let reference = value.get("reference").and_then(Value::as_str)?;
    let trimmed = match reference.find("/_history/") {
        Some(pos) => &reference[..pos],
        None => reference,
    };
    let mut segments = trimmed.rsplit('/');
    let _id = segments.next()?;
    let type_segment = segments.next()?;
    type_segment
        .starts_with(|c: char| c.is_ascii_uppercase())
        .then(|| type_segment.to_string())
}

fn parse_chain(text: &str) -> Result<PathChain, PathError> {
    let mut text = text.trim();
    while text.starts_with('(') && text.ends_with(')') && balanced(&text[1..text.len() - 1]) {
        text = text[1..text.len() - 1].trim();
    }
    if text.is_empty() {
        return Err(PathError("empty union member".to_string()));
    }

    // `X as T` is sugar for `X.ofType(T)`
    let (text, cast) = match text.rsplit_once(" as ") {
        Some((head, ty)) if is_identifier(ty.trim()) => (head.trim(), Some(ty.trim().to_string())),
        _ => (text, None),
    };

    let segments = split_top_level(text, '.')?;
    let mut chain = PathChain {
        root: None,
        steps: Vec::new(),
    };
    for (i, segment) in segments.iter().enumerate() {
        let segment = segment.trim();
        if i == 0 && segment.starts_with(|c: char| c.is_ascii_uppercase()) && is_identifier(segment)
        {
            chain.root = Some(segment.to_string());
            continue;
        }
        chain.steps.push(parse_step(segment)?);
    }
    if let Some(ty) = cast {
        chain.steps.push(Step::OfType(ty));
    }
    Ok(chain)
}

fn parse_step(segment: &str) -> Result<Step, PathError> {
    if is_identifier(segment) {
        return Ok(Step::Field(segment.to_string()));
    }
    if let Some(arg) = call_argument(segment, "ofType") {
        return if is_identifier(arg) {
            Ok(Step::OfType(arg.to_string()))
        } else {
            Err(PathError(format!("bad ofType argument '{}'", arg)))
        };
    }
    if let Some(arg) = call_argument(segment, "where") {
        if let Some(ty) = arg.strip_prefix("resolve()").map(str::trim)
            && let Some(ty) = ty.strip_prefix("is ")
            && is_identifier(ty.trim())
        {
            return Ok(Step::ResolvesTo(ty.trim().to_string()));
        }
        return Err(PathError(format!("unsupported where() criterion '{}'", arg)));
    }
    Err(PathError(format!("unsupported path segment '{}'", segment)))
}

fn call_argument<'a>(segment: &'a str, function: &str) -> Option<&'a str> {
    segment
        .strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn split_top_level(text: &str, sep: char) -> Result<Vec<&str>, PathError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(PathError(format!("unbalanced ')' in '{}'", text)));
                }
            }
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PathError(format!("unbalanced '(' in '{}'", text)));
    }
    parts.push(&text[start..]);
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(PathError(format!("empty segment in '{}'", text)));
    }
    Ok(parts)
}
