//! Tagged values produced by context lookups and built-in functions.

use core::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A value an expression can evaluate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Plain text.
    String(String),
    /// Boolean, produced by literals and comparison functions.
    Bool(bool),
    /// Ordered sequence of strings, e.g. a list of changed files.
    List(Vec<String>),
}

impl Value {
    /// Truthiness used by `not`, `and` and `or`.
    ///
    /// Booleans are themselves, strings and lists are true when non-empty.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(flag) => *flag,
            Self::String(text) => !text.is_empty(),
            Self::List(items) => !items.is_empty(),
        }
    }

    /// Name of the variant, used in type errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
        }
    }

    /// Borrow the items of a list; a string counts as a one-element list.
    #[must_use]
    pub fn as_items(&self) -> Option<Vec<&str>> {
        match self {
            Self::List(items) => Some(items.iter().map(String::as_str).collect()),
            Self::String(text) => Some(vec![text.as_str()]),
            Self::Bool(_) => None,
        }
    }

    /// Convert a parsed JSON document into a value.
    ///
    /// Only strings, booleans and arrays of strings are representable.
    #[must_use]
    pub fn from_json(json: &JsonValue) -> Option<Self> {
        match json {
            JsonValue::String(text) => Some(Self::String(text.clone())),
            JsonValue::Bool(flag) => Some(Self::Bool(*flag)),
            JsonValue::Number(number) => Some(Self::String(number.to_string())),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            JsonValue::Null | JsonValue::Object(_) => None,
        }
    }
}

impl Display for Value {
    /// Renders the value into template output: lists are space separated.
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::String(text) => formatter.write_str(text),
            Self::Bool(flag) => write!(formatter, "{flag}"),
            Self::List(items) => formatter.write_str(&items.join(" ")),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Self::String(text.to_owned())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Self::String(text)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}
