//! Errors that cross context boundaries.
//!
//! A handler failure is serialized into the reply's `err` field as
//! [`SerializedError`] and hydrated back into a [`RemoteError`] by the caller.
//! Hydration maps the error name onto a fixed registry of well-known kinds,
//! falling back to [`ErrorKind::Generic`] while keeping the original name and
//! every extra property.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Well-known error kinds recognized during hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `Error`
    Error,
    /// `TypeError`
    TypeError,
    /// `RangeError`
    RangeError,
    /// `ReferenceError`
    ReferenceError,
    /// `SyntaxError`
    SyntaxError,
    /// `EvalError`
    EvalError,
    /// `URIError`
    UriError,
    /// `AggregateError`
    AggregateError,
    /// Any other name. The original name is kept on the [`RemoteError`].
    Generic,
}

impl ErrorKind {
    const REGISTRY: [(&'static str, ErrorKind); 8] = [
        ("Error", ErrorKind::Error),
        ("TypeError", ErrorKind::TypeError),
        ("RangeError", ErrorKind::RangeError),
        ("ReferenceError", ErrorKind::ReferenceError),
        ("SyntaxError", ErrorKind::SyntaxError),
        ("EvalError", ErrorKind::EvalError),
        ("URIError", ErrorKind::UriError),
        ("AggregateError", ErrorKind::AggregateError),
    ];

    /// Map an error name onto a known kind.
    pub fn from_name(name: &str) -> ErrorKind {
        Self::REGISTRY
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Generic)
    }

    /// The default name for errors of this kind.
    pub fn default_name(self) -> &'static str {
        Self::REGISTRY
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("Error")
    }
}

fn default_error_name() -> String {
    "Error".to_string()
}

/// Wire form of an error carried in a reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Error name, e.g. `RangeError`.
    #[serde(default = "default_error_name")]
    pub name: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Stack trace, when the origin had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Every other enumerable property of the original error.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// An error raised in another context, rehydrated on arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    kind: ErrorKind,
    name: String,
    message: String,
    stack: Option<String>,
    properties: Map<String, Value>,
}

impl RemoteError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.default_name().to_string(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// A plain `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    /// A `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// A `RangeError`.
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message)
    }

    /// A custom-named error. Known names map onto their kind.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ErrorKind::from_name(&name),
            name,
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Attach an extra property.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The hydrated kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The original error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack trace, if any.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// An extra property by key.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// All extra properties.
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Serialize for the wire.
    pub fn to_serialized(&self) -> SerializedError {
        SerializedError {
            name: self.name.clone(),
            message: self.message.clone(),
            stack: self.stack.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl From<SerializedError> for RemoteError {
    fn from(err: SerializedError) -> Self {
        Self {
            kind: ErrorKind::from_name(&err.name),
            name: err.name,
            message: err.message,
            stack: err.stack,
            properties: err.properties,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}
