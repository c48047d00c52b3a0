//! Step templating for the batch execution engine.
//!
//! Step fields such as commands, conditions and output values may embed
//! `${{ <expr> }}` placeholders. This crate parses those templates and
//! evaluates them against the [`StepContext`] of the task being executed.

/// Per-task context threaded through the steps.
pub mod context;
/// Template error types.
pub mod error;
/// Expression evaluation and built-in functions.
pub mod eval;
/// Expression lexer and parser.
pub mod parser;
/// Template parsing and rendering.
pub mod template;
/// Values produced by expressions.
pub mod value;

pub use context::{BatchChangeAttributes, RepositoryAttributes, StepContext, StepSlot};
pub use error::{Result, TemplateError};
pub use eval::{Scope, evaluate};
pub use parser::{Expr, parse_expression};
pub use template::{Template, render};
pub use value::Value;
