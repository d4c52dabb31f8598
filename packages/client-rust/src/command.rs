//! Executable commands: call-pattern binding and execution.
//!
//! Each command an application declares runs one of two ways. Commands with
//! a call pattern spawn an external process: the pattern is parsed into
//! literal and `{placeholder}` segments at construction, bound against the
//! resolved parameter map at dispatch time, and run through the shell with
//! captured output. Commands backed by a [`CommandHandler`] run in-process.
//! Both paths honor cancellation and end in a terminal
//! [`CalculationStatus`] plus captured [`ExecutionDetails`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use xtalhub_core::calculation::{CalculationStatus, ExecutionDetails};
use xtalhub_core::spec::{CommandSpec, SpecError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures building or binding an executable command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("call pattern is empty")]
    EmptyPattern,
    #[error("command '{0}' has no call pattern and no in-process handler")]
    NotExecutable(String),
    #[error("call pattern references undeclared parameter '{0}'")]
    UndeclaredPlaceholder(String),
    #[error("no value bound for call-pattern parameter '{0}'")]
    UnboundParameter(String),
    #[error("parameter '{name}' cannot be rendered into a command line")]
    Unrenderable { name: String },
}

// ---------------------------------------------------------------------------
// Call patterns
// ---------------------------------------------------------------------------

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // A placeholder is one brace-delimited name with no nested braces or
    // whitespace; anything else stays literal.
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}\s]+)\}").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed command-line template with `{param}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPattern {
    segments: Vec<Segment>,
}

impl CallPattern {
    /// Splits a pattern into literal and placeholder segments.
    pub fn parse(pattern: &str) -> Result<Self, CommandError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(CommandError::EmptyPattern);
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for found in placeholder_pattern().find_iter(trimmed) {
            if found.start() > last {
                segments.push(Segment::Literal(trimmed[last..found.start()].to_string()));
            }
            let name = &trimmed[found.start() + 1..found.end() - 1];
            segments.push(Segment::Placeholder(name.to_string()));
            last = found.end();
        }
        if last < trimmed.len() {
            segments.push(Segment::Literal(trimmed[last..].to_string()));
        }
        Ok(Self { segments })
    }

    /// Placeholder names in order of first appearance, deduplicated.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }

    /// Substitutes parameter values into the pattern, yielding the command
    /// line to run.
    pub fn bind(&self, parameters: &HashMap<String, rmpv::Value>) -> Result<String, CommandError> {
        let mut bound = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => bound.push_str(text),
                Segment::Placeholder(name) => {
                    let value = parameters
                        .get(name)
                        .ok_or_else(|| CommandError::UnboundParameter(name.clone()))?;
                    let rendered =
                        render_value(value).ok_or_else(|| CommandError::Unrenderable {
                            name: name.clone(),
                        })?;
                    bound.push_str(&rendered);
                }
            }
        }
        Ok(bound)
    }
}

/// Scalar-to-text rendering for command lines. Containers and binary blobs
/// have no command-line form.
fn render_value(value: &rmpv::Value) -> Option<String> {
    match value {
        rmpv::Value::String(text) => text.as_str().map(ToString::to_string),
        rmpv::Value::Integer(number) => number
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| number.as_u64().map(|v| v.to_string())),
        rmpv::Value::F32(v) => Some(v.to_string()),
        rmpv::Value::F64(v) => Some(v.to_string()),
        rmpv::Value::Boolean(v) => Some(v.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// In-process implementation of one command.
///
/// The token is cancelled when the server asks the calculation to stop;
/// implementations should return promptly once it fires. An `Err` is
/// reported as a failed calculation with the message on stderr.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(
        &self,
        parameters: HashMap<String, rmpv::Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionDetails>;
}

// ---------------------------------------------------------------------------
// Executable commands
// ---------------------------------------------------------------------------

enum CommandKind {
    External(CallPattern),
    Handler(Arc<dyn CommandHandler>),
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: CalculationStatus,
    pub details: ExecutionDetails,
}

impl ExecutionOutcome {
    fn successful(details: ExecutionDetails) -> Self {
        Self {
            status: CalculationStatus::Successful,
            details,
        }
    }

    fn failed(details: ExecutionDetails) -> Self {
        Self {
            status: CalculationStatus::Failed,
            details,
        }
    }

    fn cancelled(details: ExecutionDetails) -> Self {
        Self {
            status: CalculationStatus::Cancelled,
            details,
        }
    }
}

/// One command bound to the way it runs.
pub struct ExecutableCommand {
    spec: CommandSpec,
    kind: CommandKind,
}

impl ExecutableCommand {
    /// Builds an external command from its spec's call pattern.
    ///
    /// Fails when the spec has no call pattern or the pattern references a
    /// parameter the spec does not declare.
    pub fn from_spec(spec: &CommandSpec) -> Result<Self, CommandError> {
        let Some(pattern) = &spec.call_pattern else {
            return Err(CommandError::NotExecutable(spec.name.clone()));
        };
        let pattern = CallPattern::parse(pattern)?;
        for name in pattern.parameter_names() {
            if spec.parameter(name).is_none() {
                return Err(CommandError::UndeclaredPlaceholder(name.to_string()));
            }
        }
        Ok(Self {
            spec: spec.clone(),
            kind: CommandKind::External(pattern),
        })
    }

    /// Builds an in-process command; any call pattern on the spec is
    /// ignored in favor of the handler.
    #[must_use]
    pub fn with_handler(spec: &CommandSpec, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            spec: spec.clone(),
            kind: CommandKind::Handler(handler),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Checks a supplied parameter map against the command schema and fills
    /// in declared defaults.
    pub fn resolve(
        &self,
        supplied: &HashMap<String, rmpv::Value>,
    ) -> Result<HashMap<String, rmpv::Value>, SpecError> {
        self.spec.resolve_parameters(supplied)
    }

    /// Runs the command to a terminal outcome. Never panics and never
    /// returns a non-terminal status; execution problems become `failed`
    /// outcomes with the cause on stderr.
    pub async fn execute(
        &self,
        parameters: &HashMap<String, rmpv::Value>,
        cancel: &CancellationToken,
        output_cap: usize,
    ) -> ExecutionOutcome {
        match &self.kind {
            CommandKind::External(pattern) => match pattern.bind(parameters) {
                Ok(command_line) => run_external(&command_line, cancel, output_cap).await,
                Err(error) => {
                    ExecutionOutcome::failed(ExecutionDetails::from_error(error.to_string()))
                }
            },
            CommandKind::Handler(handler) => {
                run_handler(handler.as_ref(), parameters, cancel).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution paths
// ---------------------------------------------------------------------------

async fn run_external(
    command_line: &str,
    cancel: &CancellationToken,
    output_cap: usize,
) -> ExecutionOutcome {
    tracing::debug!(command = %command_line, "spawning external command");
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            return ExecutionOutcome::failed(ExecutionDetails::from_error(format!(
                "failed to spawn '{command_line}': {error}"
            )));
        }
    };

    // The pipes are drained while the process runs so it can never block on
    // a full pipe; the readers stop retaining past the cap.
    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), output_cap));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), output_cap));

    let (wait_result, was_cancelled) = tokio::select! {
        result = child.wait() => (result, false),
        () = cancel.cancelled() => {
            tracing::info!(command = %command_line, "killing cancelled command");
            if let Err(error) = child.start_kill() {
                tracing::warn!(%error, "failed to kill the cancelled command");
            }
            (child.wait().await, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    match wait_result {
        Ok(exit) => {
            let details = ExecutionDetails {
                returncode: exit.code(),
                stdout,
                stderr,
            };
            if was_cancelled {
                ExecutionOutcome::cancelled(details)
            } else if exit.success() {
                ExecutionOutcome::successful(details)
            } else {
                ExecutionOutcome::failed(details)
            }
        }
        Err(error) => ExecutionOutcome::failed(ExecutionDetails {
            returncode: None,
            stdout,
            stderr: format!("failed to reap the command: {error}"),
        }),
    }
}

async fn run_handler(
    handler: &dyn CommandHandler,
    parameters: &HashMap<String, rmpv::Value>,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    tokio::select! {
        result = handler.run(parameters.clone(), cancel.child_token()) => match result {
            Ok(details) => ExecutionOutcome::successful(details),
            Err(error) => {
                ExecutionOutcome::failed(ExecutionDetails::from_error(error.to_string()))
            }
        },
        () = cancel.cancelled() => ExecutionOutcome::cancelled(ExecutionDetails::default()),
    }
}

/// Reads a pipe to EOF, retaining at most `cap` bytes.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut retained: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if retained.len() < cap {
                    let take = n.min(cap - retained.len());
                    retained.extend_from_slice(&chunk[..take]);
                }
            }
            Err(error) => {
                tracing::debug!(%error, "output pipe closed early");
                break;
            }
        }
    }
    String::from_utf8_lossy(&retained).into_owned()
}
