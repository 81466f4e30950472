//! Shell command executor.
//!
//! Renders a command line from a template whose `{path}` placeholders are
//! filled from the job, then runs it through the shell with a timeout.
//! `{{` and `}}` produce literal braces.
//!
//! Every filled value is shell-quoted, so job data always reaches the command
//! as one literal word. Placeholders inside quotes or after a backslash are
//! rejected when the template is parsed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::action::{Action, ActionError, Outcome};
use crate::domain::{FieldPath, FieldValue, Job, JobError};

/// Template parsing and rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("Empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),

    #[error("Placeholder at byte {0} is inside shell quotes or escaped")]
    QuotedPlaceholder(usize),

    #[error("Value of placeholder '{{{0}}}' cannot be shell-quoted")]
    Unquotable(String),

    #[error("Cannot fill placeholder '{{{placeholder}}}': {source}")]
    Field {
        placeholder: String,
        #[source]
        source: JobError,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(FieldPath),
}

/// A parsed command template
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();
        let mut shell = ShellState::default();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    shell.advance('{');
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    shell.advance('}');
                    literal.push('}');
                }
                '{' => {
                    if !shell.is_bare() {
                        return Err(TemplateError::QuotedPlaceholder(pos));
                    }

                    let mut field = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        field.push(c);
                    }

                    if !closed {
                        return Err(TemplateError::Unterminated(pos));
                    }
                    let field = field.trim();
                    if field.is_empty() {
                        return Err(TemplateError::EmptyPlaceholder(pos));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(FieldPath::parse(field)));
                }
                other => {
                    shell.advance(other);
                    literal.push(other);
                }
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Field paths referenced by the template, in order
    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(path) => Some(path),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, job: &Job) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value = job.lookup(path).map_err(|source| TemplateError::Field {
                        placeholder: path.to_string(),
                        source,
                    })?;
                    let text = render_value(value);
                    let quoted = shlex::try_quote(&text)
                        .map_err(|_| TemplateError::Unquotable(path.to_string()))?;
                    out.push_str(&quoted);
                }
            }
        }

        Ok(out)
    }
}

/// Quoting state of the literal template text seen so far
#[derive(Debug, Default)]
struct ShellState {
    quote: Option<char>,
    escaped: bool,
}

impl ShellState {
    fn advance(&mut self, c: char) {
        if self.escaped {
            self.escaped = false;
            return;
        }
        match (self.quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => self.quote = None,
            (Some('\''), _) => {}
            (_, '\\') => self.escaped = true,
            (None, '\'' | '"') => self.quote = Some(c),
            _ => {}
        }
    }

    /// A substituted word here would stand on its own
    fn is_bare(&self) -> bool {
        self.quote.is_none() && !self.escaped
    }
}

/// Text form of a field value, before quoting
pub fn render_value(value: FieldValue<'_>) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Number(n) => render_number(n),
        FieldValue::String(s) => s.to_string(),
        FieldValue::Sequence(items) => items
            .iter()
            .map(|item| render_value(FieldValue::from(item)))
            .collect::<Vec<_>>()
            .join(","),
        FieldValue::Map(map) => Value::Object(map.clone()).to_string(),
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Runs a rendered command for every job it receives
pub struct CommandExecutor {
    name: String,
    template: CommandTemplate,
    shell: String,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            shell: "sh".to_string(),
            timeout: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell used as `<shell> -c <command>`
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Run a rendered command line and return its stdout
    async fn execute(&self, command: &str) -> Result<String, ActionError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ActionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ActionError::Timeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| ActionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActionError::Executor {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Action for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, _cancel, job), fields(executor = %self.name))]
    async fn run(&self, _cancel: CancellationToken, job: Arc<Job>) -> Outcome {
        let command = self.template.render(&job).map_err(ActionError::from)?;
        debug!(%command, "Executing");

        let stdout = self.execute(&command).await?;
        info!(
            jid = job.id().unwrap_or("-"),
            output_bytes = stdout.len(),
            "Command succeeded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(json: &str) -> Job {
        Job::from_bytes(json).unwrap()
    }

    #[test]
    fn test_parse_and_render() {
        let template =
            CommandTemplate::parse("retry {class} --arg {args[1]} --n {payload.count}").unwrap();
        let rendered = template
            .render(&job(
                r#"{"class":"HardWorker","args":[1,"two",3.5],"payload":{"count":4}}"#,
            ))
            .unwrap();

        assert_eq!(rendered, "retry HardWorker --arg two --n 4");
        assert_eq!(template.fields().count(), 3);
    }

    #[test]
    fn test_render_value_forms() {
        let data = job(r#"{"flag":true,"none":null,"meta":{"a":1},"args":[1,"two",3.5]}"#);
        let value = |path: &str| render_value(data.lookup(&FieldPath::parse(path)).unwrap());

        assert_eq!(value("flag"), "true");
        assert_eq!(value("none"), "");
        assert_eq!(value("meta"), r#"{"a":1}"#);
        assert_eq!(value("args"), "1,two,3.5");
    }

    #[test]
    fn test_rendered_values_are_quoted() {
        let template = CommandTemplate::parse("echo {msg}").unwrap();
        let rendered = template.render(&job(r#"{"msg":"a; rm -rf $(pwd)"}"#)).unwrap();

        assert_ne!(rendered, "echo a; rm -rf $(pwd)");
        let words = shlex::split(&rendered).unwrap();
        assert_eq!(words, vec!["echo", "a; rm -rf $(pwd)"]);
    }

    #[test]
    fn test_placeholder_inside_quotes_is_rejected() {
        assert!(matches!(
            CommandTemplate::parse("echo '{jid}'"),
            Err(TemplateError::QuotedPlaceholder(6))
        ));
        assert!(matches!(
            CommandTemplate::parse(r#"echo "x {jid}""#),
            Err(TemplateError::QuotedPlaceholder(8))
        ));
        assert!(matches!(
            CommandTemplate::parse(r"echo \{jid}"),
            Err(TemplateError::QuotedPlaceholder(6))
        ));
        assert!(CommandTemplate::parse(r#"printf '%s\n' "a" {jid}"#).is_ok());
    }

    #[test]
    fn test_nul_byte_cannot_be_quoted() {
        let template = CommandTemplate::parse("echo {jid}").unwrap();
        assert!(matches!(
            template.render(&job(r#"{"jid":"a\u0000b"}"#)),
            Err(TemplateError::Unquotable(_))
        ));
    }

    #[test]
    fn test_escaped_braces() {
        let template = CommandTemplate::parse("echo {{literal}} {jid}").unwrap();
        assert_eq!(template.render(&job(r#"{"jid":"a"}"#)).unwrap(), "echo {literal} a");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CommandTemplate::parse("echo {jid"),
            Err(TemplateError::Unterminated(5))
        ));
        assert!(matches!(
            CommandTemplate::parse("echo {}"),
            Err(TemplateError::EmptyPlaceholder(5))
        ));
    }

    #[test]
    fn test_missing_field() {
        let template = CommandTemplate::parse("echo {missing}").unwrap();
        assert!(matches!(
            template.render(&job("{}")),
            Err(TemplateError::Field { .. })
        ));
    }

    #[tokio::test]
    async fn test_executor_success_and_failure() {
        let ok = CommandExecutor::new("ok", CommandTemplate::parse("echo {jid}").unwrap());
        let job = Arc::new(job(r#"{"jid":"abc"}"#));
        assert!(ok.run(CancellationToken::new(), job.clone()).await.is_ok());

        let fail = CommandExecutor::new(
            "fail",
            CommandTemplate::parse("echo oops >&2; exit 3").unwrap(),
        );
        let errors = fail.run(CancellationToken::new(), job).await.unwrap_err();
        match errors.iter().next() {
            Some(ActionError::Executor { exit_code, stderr, .. }) => {
                assert_eq!(*exit_code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_payload_cannot_run_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let marker = dir.path().join("marker");

        let template =
            CommandTemplate::parse(&format!("printf '%s' {{args[0]}} > {}", out.display())).unwrap();
        let executor = CommandExecutor::new("echo", template);

        let payload = format!("x; touch {0} $(touch {0}) `touch {0}`", marker.display());
        let job = Arc::new(Job::from_value(&serde_json::json!({ "args": [payload.as_str()] })).unwrap());
        executor.run(CancellationToken::new(), job).await.unwrap();

        assert!(!marker.exists());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let slow = CommandExecutor::new("slow", CommandTemplate::parse("sleep 5").unwrap())
            .with_timeout(Duration::from_millis(100));
        let errors = slow
            .run(CancellationToken::new(), Arc::new(job("{}")))
            .await
            .unwrap_err();
        assert!(matches!(errors.iter().next(), Some(ActionError::Timeout { .. })));
    }
}
