//! Templates: free text interleaved with `${{ <expr> }}` placeholders.

use crate::error::{Result, TemplateError};
use crate::eval::{Scope, evaluate};
use crate::parser::{Expr, parse_expression};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder { source: String, expr: Expr },
}

/// A parsed step template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Split `input` into text and parsed placeholders.
    ///
    /// # Errors
    /// Returns [`TemplateError::Syntax`] for an unterminated placeholder or
    /// a malformed expression.
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = input;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_owned()));
            }
            let body = &rest[start + OPEN.len()..];
            let end = find_close(body).ok_or_else(|| TemplateError::Syntax {
                expression: rest[start..].to_owned(),
                message: "unterminated `${{` placeholder".to_owned(),
            })?;
            let source = body[..end].trim();
            segments.push(Segment::Placeholder {
                source: source.to_owned(),
                expr: parse_expression(source)?,
            });
            rest = &body[end + CLOSE.len()..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_owned()));
        }

        Ok(Self {
            source: input.to_owned(),
            segments,
        })
    }

    /// The unparsed template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template against `scope`.
    ///
    /// # Errors
    /// Returns the first [`TemplateError`] raised by a placeholder; nothing
    /// is substituted for a failing expression.
    pub fn render(&self, scope: &Scope<'_>) -> Result<String> {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Placeholder { source, expr } => {
                    let value = evaluate(expr, scope, source)?;
                    output.push_str(&value.to_string());
                }
            }
        }
        Ok(output)
    }

    /// Render the template and interpret the result as a boolean.
    ///
    /// Surrounding whitespace is ignored; an empty result is false.
    ///
    /// # Errors
    /// Returns a [`TemplateError`] if rendering fails or the result is
    /// neither `true`, `false` nor empty.
    pub fn evaluate_condition(&self, scope: &Scope<'_>) -> Result<bool> {
        let rendered = self.render(scope)?;
        match rendered.trim() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(TemplateError::Type {
                expression: self.source().to_owned(),
                message: format!("condition must render to `true` or `false`, got `{other}`"),
            }),
        }
    }
}

/// Offset of the closing `}}`, skipping braces inside string literals.
fn find_close(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (index, ch) in body.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' && open == '"' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '`' => quote = Some(ch),
            '}' if body[index..].starts_with(CLOSE) => return Some(index),
            _ => {}
        }
    }
    None
}

/// Parse and render `input` in one go.
///
/// # Errors
/// Returns a [`TemplateError`] if parsing or rendering fails.
pub fn render(input: &str, scope: &Scope<'_>) -> Result<String> {
    Template::parse(input)?.render(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BatchChangeAttributes, RepositoryAttributes, StepContext, StepSlot};
    use crate::value::Value;

    fn context() -> StepContext {
        StepContext::new(
            RepositoryAttributes {
                name: "repoA".to_owned(),
                revision: "main".to_owned(),
            },
            BatchChangeAttributes::default(),
        )
    }

    #[test]
    fn test_plain_text_round_trips() {
        let context = context();
        let rendered = render("echo hello", &Scope::new(&context));
        assert_eq!(rendered, Ok("echo hello".to_owned()));
    }

    #[test]
    fn test_render_modified_files_scenario() {
        let context = context().with_step(StepSlot {
            modified_files: vec!["main.go".to_owned()],
            ..StepSlot::default()
        });
        let rendered = render(
            r#"touch modified-${{ join previous_step.modified_files " " }}.md"#,
            &Scope::new(&context),
        );
        assert_eq!(rendered, Ok("touch modified-main.go.md".to_owned()));
    }

    #[test]
    fn test_render_outputs() {
        let context =
            context().with_outputs([("myOutput".to_owned(), Value::from("hello.txt"))]);
        let rendered = render("touch output-${{outputs.myOutput}}", &Scope::new(&context));
        assert_eq!(rendered, Ok("touch output-hello.txt".to_owned()));
    }

    #[test]
    fn test_braces_inside_string_literal() {
        let context = context();
        let rendered = render(r#"echo ${{ join_if "}}" "a" "b" }}"#, &Scope::new(&context));
        assert_eq!(rendered, Ok("echo a}}b".to_owned()));
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert!(matches!(
            Template::parse("echo ${{ repository.name"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_failing_placeholder_does_not_substitute() {
        let context = context();
        let rendered = render("rm -rf ${{ outputs.target }}/", &Scope::new(&context));
        assert!(matches!(
            rendered,
            Err(TemplateError::UnknownIdentifier { ref path, .. }) if path == "outputs.target"
        ));
    }

    #[test]
    fn test_condition() {
        let context = context();
        let scope = Scope::new(&context);
        let matching = Template::parse(r#"${{ eq repository.name "repoA" }}"#)
            .and_then(|template| template.evaluate_condition(&scope));
        let other = Template::parse(r#"${{ eq repository.name "repoB" }}"#)
            .and_then(|template| template.evaluate_condition(&scope));
        assert_eq!(matching, Ok(true));
        assert_eq!(other, Ok(false));

        let invalid = Template::parse("${{ repository.name }}")
            .and_then(|template| template.evaluate_condition(&scope));
        match invalid {
            Err(TemplateError::Type { expression, .. }) => {
                assert_eq!(expression, "${{ repository.name }}");
            }
            other => panic!("expected a type error, got {other:?}"),
        }
    }
}
