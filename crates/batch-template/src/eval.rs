//! Expression evaluation: path resolution and built-in functions.

use glob::Pattern;

use crate::context::{StepContext, StepSlot};
use crate::error::{Result, TemplateError};
use crate::parser::Expr;
use crate::value::Value;

/// What an expression may see while it is evaluated.
///
/// `current` is the step whose outputs are being rendered; it is only set
/// after that step's command ran, which is what makes `step.*` available in
/// output templates and nowhere else.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'ctx> {
    context: &'ctx StepContext,
    current: Option<&'ctx StepSlot>,
}

impl<'ctx> Scope<'ctx> {
    /// Scope for rendering a step's command, environment and condition.
    #[must_use]
    pub fn new(context: &'ctx StepContext) -> Self {
        Self {
            context,
            current: None,
        }
    }

    /// Scope for rendering the outputs of the step that just ran.
    #[must_use]
    pub fn with_current_step(context: &'ctx StepContext, current: &'ctx StepSlot) -> Self {
        Self {
            context,
            current: Some(current),
        }
    }
}

/// Evaluate `expr`; `source` is quoted in any error.
///
/// # Errors
/// Returns a [`TemplateError`] for unresolved paths, unknown functions,
/// wrong arity or mismatched argument types.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>, source: &str) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => resolve(segments, scope, source),
        Expr::Call { name, args } => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, scope, source))
                .collect::<Result<Vec<_>>>()?;
            call(name, &values, source)
        }
    }
}

fn resolve(segments: &[String], scope: &Scope<'_>, source: &str) -> Result<Value> {
    let unknown = || TemplateError::UnknownIdentifier {
        expression: source.to_owned(),
        path: segments.join("."),
    };
    let context = scope.context;
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

    match parts.as_slice() {
        ["repository", "name"] => Ok(Value::from(context.repository().name.as_str())),
        ["repository", "revision"] => Ok(Value::from(context.repository().revision.as_str())),
        ["batch_change", "name"] => Ok(Value::from(context.batch_change().name.as_str())),
        ["batch_change", "description"] => {
            Ok(Value::from(context.batch_change().description.as_str()))
        }
        ["batch_change", "author"] => Ok(Value::from(context.batch_change().author.as_str())),
        ["previous_step", field] => {
            let slot = context
                .previous_step()
                .ok_or_else(|| TemplateError::NoPreviousStep {
                    expression: source.to_owned(),
                })?;
            slot_field(slot, field).ok_or_else(unknown)
        }
        ["step", field] => scope
            .current
            .and_then(|slot| slot_field(slot, field))
            .ok_or_else(unknown),
        ["steps", name, field] => context
            .named_step(name)
            .and_then(|slot| slot_field(slot, field))
            .ok_or_else(unknown),
        ["outputs", name] => context.outputs().get(*name).cloned().ok_or_else(unknown),
        _ => Err(unknown()),
    }
}

fn slot_field(slot: &StepSlot, field: &str) -> Option<Value> {
    let value = match field {
        "stdout" => Value::String(slot.stdout.clone()),
        "stderr" => Value::String(slot.stderr.clone()),
        "added_files" => Value::List(slot.added_files.clone()),
        "modified_files" => Value::List(slot.modified_files.clone()),
        "deleted_files" => Value::List(slot.deleted_files.clone()),
        "changed_files" => Value::List(slot.changed_files()),
        _ => return None,
    };
    Some(value)
}

fn call(name: &str, args: &[Value], source: &str) -> Result<Value> {
    match name {
        "join" => {
            let [sequence, separator] = exact::<2>(name, args, source)?;
            let items = sequence
                .as_items()
                .ok_or_else(|| type_error(source, "join expects a list", sequence))?;
            let separator = text(separator, source)?;
            Ok(Value::String(items.join(separator)))
        }
        "join_if" => {
            let (separator, rest) = args.split_first().ok_or_else(|| TemplateError::Arity {
                expression: source.to_owned(),
                function: name.to_owned(),
                expected: "at least 1".to_owned(),
                found: 0,
            })?;
            let separator = text(separator, source)?;
            let mut items = Vec::new();
            for value in rest {
                let parts = value
                    .as_items()
                    .ok_or_else(|| type_error(source, "join_if expects strings", value))?;
                items.extend(parts.into_iter().filter(|part| !part.is_empty()));
            }
            Ok(Value::String(items.join(separator)))
        }
        "eq" => {
            let [left, right] = exact::<2>(name, args, source)?;
            Ok(Value::Bool(left == right))
        }
        "ne" => {
            let [left, right] = exact::<2>(name, args, source)?;
            Ok(Value::Bool(left != right))
        }
        "not" => {
            let [operand] = exact::<1>(name, args, source)?;
            Ok(Value::Bool(!operand.is_truthy()))
        }
        "and" | "or" => {
            if args.is_empty() {
                return Err(TemplateError::Arity {
                    expression: source.to_owned(),
                    function: name.to_owned(),
                    expected: "at least 1".to_owned(),
                    found: 0,
                });
            }
            let result = if name == "and" {
                args.iter().all(Value::is_truthy)
            } else {
                args.iter().any(Value::is_truthy)
            };
            Ok(Value::Bool(result))
        }
        "split" => {
            let [input, separator] = exact::<2>(name, args, source)?;
            let input = text(input, source)?;
            let separator = text(separator, source)?;
            if input.is_empty() {
                return Ok(Value::List(Vec::new()));
            }
            Ok(Value::List(
                input.split(separator).map(str::to_owned).collect(),
            ))
        }
        "replace" => {
            let [input, from, to] = exact::<3>(name, args, source)?;
            Ok(Value::String(
                text(input, source)?.replace(text(from, source)?, text(to, source)?),
            ))
        }
        "matches" => {
            let [input, pattern] = exact::<2>(name, args, source)?;
            let pattern =
                Pattern::new(text(pattern, source)?).map_err(|err| TemplateError::Type {
                    expression: source.to_owned(),
                    message: format!("invalid glob pattern: {err}"),
                })?;
            Ok(Value::Bool(pattern.matches(text(input, source)?)))
        }
        _ => Err(TemplateError::UnknownFunction {
            expression: source.to_owned(),
            name: name.to_owned(),
        }),
    }
}

fn exact<'args, const N: usize>(
    name: &str,
    args: &'args [Value],
    source: &str,
) -> Result<&'args [Value; N]> {
    args.try_into().map_err(|_| TemplateError::Arity {
        expression: source.to_owned(),
        function: name.to_owned(),
        expected: N.to_string(),
        found: args.len(),
    })
}

fn text<'val>(value: &'val Value, source: &str) -> Result<&'val str> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(type_error(source, "expected a string", other)),
    }
}

fn type_error(source: &str, message: &str, value: &Value) -> TemplateError {
    TemplateError::Type {
        expression: source.to_owned(),
        message: format!("{message}, got {}", value.kind()),
    }
}
