//! SearchParameter registry.
//!
//! Definitions are compiled into [`ExtractionRule`]s when they are
//! registered: the expression is parsed into an [`ElementPath`] and the
//! converter for the parameter type is chosen once. A definition that does
//! not compile is rejected here and never reaches the write path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::SearchParamType;

use super::converters::{Converter, ValueConverter};
use super::errors::{LoaderError, RegistryError};
use super::loader::SearchParameterLoader;
use super::path::ElementPath;

/// Status of a SearchParameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterStatus {
    /// Used for indexing and search.
    #[default]
    Active,
    /// Registered but not used.
    Draft,
    /// Disabled.
    Retired,
}

impl SearchParameterStatus {
    /// Parses a FHIR `SearchParameter.status` code.
    pub fn from_fhir_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SearchParameterStatus::Active),
            "draft" => Some(SearchParameterStatus::Draft),
            "retired" => Some(SearchParameterStatus::Retired),
            _ => None,
        }
    }

    /// Returns true if rules with this status index and match.
    pub fn is_usable(&self) -> bool {
        *self == SearchParameterStatus::Active
    }
}

/// Where a definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterSource {
    /// Built into the crate.
    #[default]
    Embedded,
    /// Loaded from a SearchParameter resource.
    Custom,
}

/// One component of a composite parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeComponentDef {
    /// URL of the component's own SearchParameter.
    pub definition: String,
    /// Expression relative to the composite's base element.
    pub expression: String,
}

/// A SearchParameter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    /// Canonical URL.
    pub url: String,
    /// The query-string name.
    pub code: String,
    /// Free text.
    pub description: Option<String>,
    /// Parameter type.
    pub param_type: SearchParamType,
    /// Element path expression.
    pub expression: String,
    /// Resource types the parameter applies to.
    pub base: Vec<String>,
    /// Allowed target types for reference parameters.
    pub target: Vec<String>,
    /// Components for composite parameters.
    pub component: Vec<CompositeComponentDef>,
    /// Current status.
    pub status: SearchParameterStatus,
    /// Origin of the definition.
    pub source: SearchParameterSource,
    /// Index quantities in canonical UCUM units as well.
    pub unit_aware: bool,
}

impl SearchParameterDefinition {
    /// Creates an active definition with no base types.
    ///
    /// Quantity parameters are unit-aware unless turned off.
    pub fn new(
        url: impl Into<String>,
        code: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            code: code.into(),
            description: None,
            param_type,
            expression: expression.into(),
            base: Vec::new(),
            target: Vec::new(),
            component: Vec::new(),
            status: SearchParameterStatus::Active,
            source: SearchParameterSource::Embedded,
            unit_aware: param_type == SearchParamType::Quantity,
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the reference target types.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a composite component.
    pub fn with_component(
        mut self,
        definition: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.component.push(CompositeComponentDef {
            definition: definition.into(),
            expression: expression.into(),
        });
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: SearchParameterStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the source.
    pub fn with_source(mut self, source: SearchParameterSource) -> Self {
        self.source = source;
        self
    }

    /// Enables or disables canonical unit indexing.
    pub fn with_unit_aware(mut self, unit_aware: bool) -> Self {
        self.unit_aware = unit_aware;
        self
    }

    /// Returns true for composite parameters.
    pub fn is_composite(&self) -> bool {
        self.param_type == SearchParamType::Composite
    }

    /// Returns true if the parameter applies to `resource_type`.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base
            .iter()
            .any(|b| b == resource_type || is_any_resource(b))
    }
}

fn is_any_resource(base: &str) -> bool {
    base == "Resource" || base == "DomainResource"
}

/// A compiled component of a composite rule.
#[derive(Clone)]
pub struct CompiledComponent {
    /// Code of the component parameter.
    pub code: String,
    /// Type of the component parameter.
    pub param_type: SearchParamType,
    /// Path relative to the composite's base element.
    pub path: ElementPath,
    /// Converter for the component type.
    pub converter: Converter,
}

impl fmt::Debug for CompiledComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledComponent")
            .field("code", &self.code)
            .field("param_type", &self.param_type)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A definition compiled for extraction.
#[derive(Clone)]
pub struct ExtractionRule {
    /// The source definition.
    pub definition: Arc<SearchParameterDefinition>,
    /// Compiled expression.
    pub path: ElementPath,
    /// Converter; `None` for composites.
    pub converter: Option<Converter>,
    /// Compiled components; empty unless composite.
    pub components: Vec<CompiledComponent>,
}

impl ExtractionRule {
    /// The parameter code.
    pub fn code(&self) -> &str {
        &self.definition.code
    }

    /// The parameter type.
    pub fn param_type(&self) -> SearchParamType {
        self.definition.param_type
    }
}

impl fmt::Debug for ExtractionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionRule")
            .field("url", &self.definition.url)
            .field("code", &self.definition.code)
            .field("path", &self.path)
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

/// In-memory registry of compiled rules.
///
/// Rules are kept per base type in registration order; rules on `Resource`
/// apply to every type unless the type defines the same code itself.
#[derive(Default)]
pub struct SearchParameterRegistry {
    rules_by_type: HashMap<String, Vec<Arc<ExtractionRule>>>,
    rules_by_url: HashMap<String, Arc<ExtractionRule>>,
}

impl SearchParameterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the embedded R4 definitions.
    pub fn with_embedded() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register_all(SearchParameterLoader::new().load_embedded())?;
        Ok(registry)
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.rules_by_url.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.rules_by_url.is_empty()
    }

    /// Registers a batch, compiling composites after the parameters they use.
    pub fn register_all(
        &mut self,
        definitions: impl IntoIterator<Item = SearchParameterDefinition>,
    ) -> Result<usize, RegistryError> {
        let (composites, simple): (Vec<_>, Vec<_>) =
            definitions.into_iter().partition(|d| d.is_composite());
        let mut count = 0;
        for definition in simple.into_iter().chain(composites) {
            self.register(definition)?;
            count += 1;
        }
        Ok(count)
    }

    /// Parses SearchParameter resources (one, an array or a Bundle) and registers them.
    pub fn register_json(&mut self, json: &serde_json::Value) -> Result<usize, DefinitionLoadError> {
        let definitions = SearchParameterLoader::new().load_from_json(json)?;
        Ok(self.register_all(definitions)?)
    }

    /// Compiles and registers one definition.
    pub fn register(&mut self, definition: SearchParameterDefinition) -> Result<(), RegistryError> {
        if self.rules_by_url.contains_key(&definition.url) {
            return Err(RegistryError::DuplicateUrl {
                url: definition.url,
            });
        }
        let rule = Arc::new(self.compile(definition)?);
        self.insert(rule);
        Ok(())
    }

    fn compile(&self, definition: SearchParameterDefinition) -> Result<ExtractionRule, RegistryError> {
        let invalid = |message: String| RegistryError::InvalidDefinition {
            url: definition.url.clone(),
            message,
        };
        if definition.base.is_empty() {
            return Err(invalid("no base resource type".to_string()));
        }

        let path = ElementPath::parse(&definition.expression).map_err(|e| {
            RegistryError::InvalidExpression {
                url: definition.url.clone(),
                expression: definition.expression.clone(),
                message: e.to_string(),
            }
        })?;

        let converter =
            ValueConverter::for_rule(definition.param_type, definition.unit_aware, &definition.target);

        let mut components = Vec::new();
        if definition.is_composite() {
            if definition.component.len() < 2 {
                return Err(invalid("composite needs at least two components".to_string()));
            }
            for component in &definition.component {
                let Some(target) = self.rules_by_url.get(&component.definition) else {
                    return Err(invalid(format!(
                        "component '{}' is not registered",
                        component.definition
                    )));
                };
                let Some(converter) = target.converter.clone() else {
                    return Err(invalid(format!(
                        "component '{}' is itself composite",
                        component.definition
                    )));
                };
                let path = ElementPath::parse(&component.expression).map_err(|e| {
                    RegistryError::InvalidExpression {
                        url: definition.url.clone(),
                        expression: component.expression.clone(),
                        message: e.to_string(),
                    }
                })?;
                components.push(CompiledComponent {
                    code: target.definition.code.clone(),
                    param_type: target.definition.param_type,
                    path,
                    converter,
                });
            }
        }

        Ok(ExtractionRule {
            definition: Arc::new(definition),
            path,
            converter,
            components,
        })
    }

    fn insert(&mut self, rule: Arc<ExtractionRule>) {
        for base in &rule.definition.base {
            let rules = self.rules_by_type.entry(base.clone()).or_default();
            rules.retain(|r| r.definition.code != rule.definition.code);
            rules.push(Arc::clone(&rule));
        }
        self.rules_by_url
            .insert(rule.definition.url.clone(), rule);
    }

    /// Active rules for a resource type, type-specific ones first.
    pub fn rules_for(&self, resource_type: &str) -> Vec<Arc<ExtractionRule>> {
        let specific = self.rules_by_type.get(resource_type);
        let mut rules: Vec<Arc<ExtractionRule>> = specific
            .into_iter()
            .flatten()
            .filter(|r| r.definition.status.is_usable())
            .cloned()
            .collect();
        for base in ["Resource", "DomainResource"] {
            if base == resource_type {
                continue;
            }
            for rule in self.rules_by_type.get(base).into_iter().flatten() {
                if rule.definition.status.is_usable()
                    && !rules.iter().any(|r| r.definition.code == rule.definition.code)
                {
                    rules.push(Arc::clone(rule));
                }
            }
        }
        rules
    }

    /// The active rule named `code` for a resource type.
    pub fn get_rule(&self, resource_type: &str, code: &str) -> Option<Arc<ExtractionRule>> {
        [resource_type, "Resource", "DomainResource"]
            .iter()
            .filter_map(|base| self.rules_by_type.get(*base))
            .flat_map(|rules| rules.iter())
            .find(|r| r.definition.code == code && r.definition.status.is_usable())
            .cloned()
    }

    /// The definition named `code` for a resource type.
    pub fn get_param(&self, resource_type: &str, code: &str) -> Option<Arc<SearchParameterDefinition>> {
        self.get_rule(resource_type, code)
            .map(|r| Arc::clone(&r.definition))
    }

    /// Looks a rule up by canonical URL, whatever its status.
    pub fn get_by_url(&self, url: &str) -> Option<Arc<ExtractionRule>> {
        self.rules_by_url.get(url).cloned()
    }

    /// Changes the status of a definition.
    pub fn update_status(
        &mut self,
        url: &str,
        status: SearchParameterStatus,
    ) -> Result<(), RegistryError> {
        let rule = self.rules_by_url.get(url).ok_or_else(|| RegistryError::NotFound {
            url: url.to_string(),
        })?;
        let mut definition = (*rule.definition).clone();
        definition.status = status;
        let updated = Arc::new(ExtractionRule {
            definition: Arc::new(definition),
            ..(**rule).clone()
        });
        self.insert(updated);
        Ok(())
    }

    /// Removes a definition.
    pub fn unregister(&mut self, url: &str) -> Result<(), RegistryError> {
        let rule = self.rules_by_url.remove(url).ok_or_else(|| RegistryError::NotFound {
            url: url.to_string(),
        })?;
        for base in &rule.definition.base {
            if let Some(rules) = self.rules_by_type.get_mut(base) {
                rules.retain(|r| r.definition.url != url);
                if rules.is_empty() {
                    self.rules_by_type.remove(base);
                }
            }
        }
        Ok(())
    }

    /// Resource types with type-specific rules, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .rules_by_type
            .keys()
            .filter(|t| !is_any_resource(t))
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl fmt::Debug for SearchParameterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchParameterRegistry")
            .field("params_count", &self.rules_by_url.len())
            .field("resource_types", &self.resource_types())
            .finish()
    }
}

/// Failure to load custom definitions into the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionLoadError {
    /// The JSON is not a valid SearchParameter.
    Loader(LoaderError),
    /// The definition does not compile.
    Registry(RegistryError),
}

impl fmt::Display for DefinitionLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionLoadError::Loader(e) => e.fmt(f),
            DefinitionLoadError::Registry(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for DefinitionLoadError {}

impl From<LoaderError> for DefinitionLoadError {
    fn from(err: LoaderError) -> Self {
        DefinitionLoadError::Loader(err)
    }
}

impl From<RegistryError> for DefinitionLoadError {
    fn from(err: RegistryError) -> Self {
        DefinitionLoadError::Registry(err)
    }
}
