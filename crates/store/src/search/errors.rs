//! Search-specific error types.
//!
//! - Loading SearchParameter definitions
//! - Compiling definitions into the registry
//! - Converting element values into index values

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error during SearchParameter loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoaderError {
    /// Invalid SearchParameter resource structure.
    InvalidResource {
        /// Description of what was invalid.
        message: String,
        /// URL of the problematic parameter, if known.
        url: Option<String>,
    },

    /// Missing required field in SearchParameter.
    MissingField {
        /// Name of the missing field.
        field: String,
        /// URL of the parameter.
        url: Option<String>,
    },
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::InvalidResource { message, url } => {
                if let Some(url) = url {
                    write!(f, "Invalid SearchParameter '{}': {}", url, message)
                } else {
                    write!(f, "Invalid SearchParameter: {}", message)
                }
            }
            LoaderError::MissingField { field, url } => {
                if let Some(url) = url {
                    write!(
                        f,
                        "SearchParameter '{}' missing required field '{}'",
                        url, field
                    )
                } else {
                    write!(f, "SearchParameter missing required field '{}'", field)
                }
            }
        }
    }
}

impl std::error::Error for LoaderError {}

/// Error while compiling a definition into the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryError {
    /// Parameter with this URL already exists.
    DuplicateUrl {
        /// The duplicate URL.
        url: String,
    },

    /// The expression does not parse.
    InvalidExpression {
        /// URL of the parameter.
        url: String,
        /// The offending expression.
        expression: String,
        /// Parser message.
        message: String,
    },

    /// No parameter with this URL is registered.
    NotFound {
        /// The unknown URL.
        url: String,
    },

    /// The definition is inconsistent (e.g. a composite without components).
    InvalidDefinition {
        /// URL of the parameter.
        url: String,
        /// Description of the problem.
        message: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateUrl { url } => {
                write!(f, "SearchParameter with URL '{}' already exists", url)
            }
            RegistryError::InvalidExpression {
                url,
                expression,
                message,
            } => {
                write!(
                    f,
                    "SearchParameter '{}' has invalid expression '{}': {}",
                    url, expression, message
                )
            }
            RegistryError::NotFound { url } => {
                write!(f, "SearchParameter '{}' is not registered", url)
            }
            RegistryError::InvalidDefinition { url, message } => {
                write!(f, "Invalid SearchParameter definition '{}': {}", url, message)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Error converting one element into index values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionError {
    /// The element has a JSON shape the converter does not accept.
    UnsupportedShape {
        /// What the converter accepts.
        expected: String,
        /// A short rendering of the element.
        found: String,
    },

    /// The element has the right shape but an unusable value.
    ConversionFailed {
        /// The target index type.
        expected_type: String,
        /// The offending value.
        actual_value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The resource is not a JSON object.
    InvalidResource {
        /// Description of the problem.
        message: String,
    },

    /// A `urn:uuid:` reference whose type could not be established.
    UnresolvedReference {
        /// The reference text.
        reference: String,
        /// The type the parameter requires.
        expected_type: String,
    },
}

impl ExtractionError {
    /// Shape mismatch for `value`.
    pub fn shape(expected: &str, value: &serde_json::Value) -> Self {
        let mut found = value.to_string();
        if found.len() > 80 {
            let mut cut = 77;
            while !found.is_char_boundary(cut) {
                cut -= 1;
            }
            found.truncate(cut);
            found.push_str("...");
        }
        ExtractionError::UnsupportedShape {
            expected: expected.to_string(),
            found,
        }
    }

    /// Unusable value of the right shape.
    pub fn conversion(
        expected_type: &str,
        actual_value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ExtractionError::ConversionFailed {
            expected_type: expected_type.to_string(),
            actual_value: actual_value.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionError::UnsupportedShape { expected, found } => {
                write!(f, "expected {}, found {}", expected, found)
            }
            ExtractionError::ConversionFailed {
                expected_type,
                actual_value,
                reason,
            } => {
                write!(
                    f,
                    "cannot convert '{}' to {}: {}",
                    actual_value, expected_type, reason
                )
            }
            ExtractionError::InvalidResource { message } => {
                write!(f, "invalid resource: {}", message)
            }
            ExtractionError::UnresolvedReference {
                reference,
                expected_type,
            } => {
                write!(
                    f,
                    "cannot tell whether '{}' is a {}: no single live resource has that id",
                    reference, expected_type
                )
            }
        }
    }
}

impl std::error::Error for ExtractionError {}
