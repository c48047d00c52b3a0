//! Errors raised while parsing and evaluating templates.

use core::result::Result as CoreResult;

use thiserror::Error;

/// Result type for template parsing and evaluation.
pub type Result<T> = CoreResult<T, TemplateError>;

/// Errors raised while parsing or evaluating a step template.
///
/// Every variant names the offending expression so a failing step can be
/// diagnosed from the error alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template or one of its expressions is malformed.
    #[error("syntax error in `{expression}`: {message}")]
    Syntax {
        /// Source text of the malformed expression.
        expression: String,
        /// What the parser expected.
        message: String,
    },

    /// A dotted path did not resolve against the step context.
    #[error("unknown identifier `{path}` in `{expression}`")]
    UnknownIdentifier {
        /// Source text of the expression.
        expression: String,
        /// The dotted path that failed to resolve.
        path: String,
    },

    /// `previous_step` was referenced before any step ran.
    #[error("`previous_step` referenced in `{expression}` before any step ran")]
    NoPreviousStep {
        /// Source text of the expression.
        expression: String,
    },

    /// The called function is not one of the built-ins.
    #[error("unknown function `{name}` in `{expression}`")]
    UnknownFunction {
        /// Source text of the expression.
        expression: String,
        /// Name of the function.
        name: String,
    },

    /// A built-in was called with the wrong number of arguments.
    #[error("`{function}` expects {expected} argument(s), got {found} in `{expression}`")]
    Arity {
        /// Source text of the expression.
        expression: String,
        /// Name of the function.
        function: String,
        /// Human readable expected count.
        expected: String,
        /// Number of arguments supplied.
        found: usize,
    },

    /// A value had the wrong type for the operation applied to it.
    #[error("type error in `{expression}`: {message}")]
    Type {
        /// Source text of the expression.
        expression: String,
        /// Description of the mismatch.
        message: String,
    },
}

impl TemplateError {
    /// Source text of the expression that failed.
    #[must_use]
    pub fn expression(&self) -> &str {
        match self {
            Self::Syntax { expression, .. }
            | Self::UnknownIdentifier { expression, .. }
            | Self::NoPreviousStep { expression }
            | Self::UnknownFunction { expression, .. }
            | Self::Arity { expression, .. }
            | Self::Type { expression, .. } => expression,
        }
    }
}
