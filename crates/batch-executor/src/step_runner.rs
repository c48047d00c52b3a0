//! Sequential execution of a task's steps inside its workspace.
//!
//! Each step moves through `Pending -> Skipped | Ran -> next | Done` or ends
//! the task with an error. The [`StepContext`] is threaded by value: every
//! step consumes the context of its predecessor and returns a new one.

use std::collections::BTreeMap;

use batch_core::{
    OutputFormat, Result, Step, StepCondition, StepContext, StepExecutionError, StepSlot,
    TaskErrorKind,
};
use batch_template::{Scope, Template, TemplateError, Value, render};
use batch_workspace::Workspace;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callback invoked with the 1-based step number before each step starts.
pub type StepObserver<'obs> = &'obs (dyn Fn(usize, &Step) + Send + Sync);

/// Runs the steps of one task.
pub struct StepRunner<'run> {
    workspace: &'run mut Workspace,
    cancel: &'run CancellationToken,
    observer: StepObserver<'run>,
}

impl<'run> StepRunner<'run> {
    /// Create a runner operating on `workspace`.
    pub fn new(
        workspace: &'run mut Workspace,
        cancel: &'run CancellationToken,
        observer: StepObserver<'run>,
    ) -> Self {
        Self {
            workspace,
            cancel,
            observer,
        }
    }

    /// Run `steps` in order starting from `context`.
    ///
    /// # Errors
    /// Returns the first step failure; later steps are not run.
    pub async fn run_all(&mut self, steps: &[Step], context: StepContext) -> Result<StepContext> {
        let mut context = context;
        for (index, step) in steps.iter().enumerate() {
            let number = index + 1;
            if self.cancel.is_cancelled() {
                return Err(TaskErrorKind::Cancelled);
            }
            (self.observer)(number, step);
            context = self.run_step(number, step, context).await?;
        }
        Ok(context)
    }

    async fn run_step(
        &mut self,
        number: usize,
        step: &Step,
        context: StepContext,
    ) -> Result<StepContext> {
        let template_error = |source: TemplateError| TaskErrorKind::Template {
            step: number,
            source,
        };

        let scope = Scope::new(&context);
        if !should_run(step, &scope).map_err(template_error)? {
            info!(step = number, label = %step.label(), "skipping step");
            return Ok(context.with_step(StepSlot::skipped(step.name.clone())));
        }

        let command = render(&step.run, &scope).map_err(template_error)?;
        let env = step
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), render(value, &scope)?)))
            .collect::<core::result::Result<BTreeMap<_, _>, TemplateError>>()
            .map_err(template_error)?;

        debug!(step = number, %command, container = ?step.container, "running step");
        let output = self
            .workspace
            .apply_step(self.cancel, &command, step.container.as_deref(), &env)
            .await?;
        if !output.success() {
            return Err(TaskErrorKind::StepExecution {
                step: number,
                source: StepExecutionError {
                    command,
                    exit_code: output.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
            });
        }

        let changes = self.workspace.changed_files().await?;
        let slot = StepSlot {
            name: step.name.clone(),
            skipped: false,
            stdout: output.stdout,
            stderr: output.stderr,
            added_files: changes.added,
            modified_files: changes.modified,
            deleted_files: changes.deleted,
        };
        let outputs = render_outputs(number, step, &context, &slot)?;
        debug!(
            step = number,
            changed = slot.changed_files().len(),
            outputs = outputs.len(),
            "step finished"
        );
        Ok(context.with_step(slot).with_outputs(outputs))
    }
}

fn should_run(step: &Step, scope: &Scope<'_>) -> core::result::Result<bool, TemplateError> {
    match &step.condition {
        None => Ok(true),
        Some(StepCondition::SkipIf(condition)) => {
            Ok(!Template::parse(condition)?.evaluate_condition(scope)?)
        }
        Some(StepCondition::RunIf(condition)) => {
            Template::parse(condition)?.evaluate_condition(scope)
        }
    }
}

fn render_outputs(
    number: usize,
    step: &Step,
    context: &StepContext,
    slot: &StepSlot,
) -> Result<Vec<(String, Value)>> {
    let scope = Scope::with_current_step(context, slot);
    let mut outputs = Vec::with_capacity(step.outputs.len());

    for (name, spec) in &step.outputs {
        let rendered = render(&spec.value, &scope).map_err(|source| TaskErrorKind::Template {
            step: number,
            source,
        })?;
        let text = rendered.trim_end_matches(['\n', '\r']);
        let value = match spec.format {
            OutputFormat::Text => Value::String(text.to_owned()),
            OutputFormat::Json => parse_json_output(text).map_err(|message| {
                TaskErrorKind::Output {
                    step: number,
                    output: name.clone(),
                    format: "json".to_owned(),
                    message,
                }
            })?,
        };
        outputs.push((name.clone(), value));
    }
    Ok(outputs)
}

fn parse_json_output(text: &str) -> core::result::Result<Value, String> {
    let json: JsonValue = serde_json::from_str(text).map_err(|error| error.to_string())?;
    Value::from_json(&json)
        .ok_or_else(|| "expected a string, a boolean or a list of strings".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_core::{BatchChangeAttributes, OutputSpec, Repository, RepositoryAttributes};

    fn context() -> StepContext {
        StepContext::new(
            Repository::new("repoA", "main").attributes(),
            BatchChangeAttributes::default(),
        )
    }

    fn ran(stdout: &str) -> StepSlot {
        StepSlot {
            stdout: stdout.to_owned(),
            added_files: vec!["hello.txt".to_owned()],
            ..StepSlot::default()
        }
    }

    #[test]
    fn test_conditions() {
        let context = context();
        let scope = Scope::new(&context);

        assert!(should_run(&Step::new("true"), &scope).unwrap_or(false));
        let skipped = Step::new("true").skip_if("${{ eq repository.name \"repoA\" }}");
        assert!(!should_run(&skipped, &scope).unwrap_or(true));
        let gated = Step::new("true").run_if("${{ eq repository.name \"repoB\" }}");
        assert!(!should_run(&gated, &scope).unwrap_or(true));
        let allowed = Step::new("true").run_if("${{ eq repository.name \"repoA\" }}");
        assert!(should_run(&allowed, &scope).unwrap_or(false));
    }

    #[test]
    fn test_condition_referencing_missing_step_fails() {
        let context = context();
        let step = Step::new("true").skip_if("${{ eq previous_step.stdout \"\" }}");
        assert!(matches!(
            should_run(&step, &Scope::new(&context)),
            Err(TemplateError::NoPreviousStep { .. })
        ));
    }

    #[test]
    fn test_outputs_strip_trailing_newline() {
        let step = Step::new("echo hello.txt")
            .with_output("myOutput", OutputSpec::text("${{ step.stdout }}"));
        let outputs = match render_outputs(1, &step, &context(), &ran("hello.txt\n")) {
            Ok(outputs) => outputs,
            Err(error) => panic!("render failed: {error}"),
        };
        assert_eq!(
            outputs,
            vec![("myOutput".to_owned(), Value::String("hello.txt".to_owned()))]
        );
    }

    #[test]
    fn test_json_outputs() {
        let step = Step::new("true")
            .with_output("files", OutputSpec::json("${{ step.stdout }}"));
        let outputs = match render_outputs(1, &step, &context(), &ran("[\"a\", \"b\"]\n")) {
            Ok(outputs) => outputs,
            Err(error) => panic!("render failed: {error}"),
        };
        assert_eq!(
            outputs,
            vec![(
                "files".to_owned(),
                Value::List(vec!["a".to_owned(), "b".to_owned()])
            )]
        );

        let invalid = render_outputs(1, &step, &context(), &ran("{\"a\": 1}"));
        assert!(matches!(invalid, Err(TaskErrorKind::Output { step: 1, .. })));
    }

    #[test]
    fn test_step_scope_only_in_outputs() {
        let context = StepContext::new(
            RepositoryAttributes::default(),
            BatchChangeAttributes::default(),
        );
        let rendered = render("${{ step.stdout }}", &Scope::new(&context));
        assert!(rendered.is_err());
    }
}
