//! User-declared CLI commands exposed to the model as tools.
//!
//! A [`Definition`] is parsed once with shell-word tokenization; leading
//! `KEY=VAL` words become environment overrides for the subprocess (the
//! definition's own env map wins over inline assignments). At call time the
//! model may append extra arguments. The subprocess outcome is always
//! reported back as a normal tool result, including timeouts and spawn
//! failures, so the model can react to it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::AxeErr;
use crate::error::Result;
use crate::tools::Tool;
use crate::tools::ToolOutput;
use crate::util::clip_string;

const OUTPUT_CLIP_CHARS: usize = 3_000;

/// Exit code reported when the subprocess hit the configured deadline.
const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported when the subprocess never started.
const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// Describes one CLI command offered to the agent. `name` must be unique
/// across all tools of a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub command: String,
    pub desc: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
}

impl Definition {
    /// Parses `command` into argv plus inline env assignments. `env` entries
    /// take precedence over inline `KEY=VAL` prefixes.
    pub fn new(
        name: &str,
        command: &str,
        desc: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let tokens = shlex::split(command).ok_or_else(|| {
            AxeErr::InvalidConfig(format!("cli tool {name}: cannot tokenize command {command:?}"))
        })?;

        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        let mut args: Vec<String> = Vec::new();
        for token in tokens {
            if args.is_empty() {
                if let Some((key, value)) = split_env_assignment(&token) {
                    merged.insert(key.to_string(), value.to_string());
                    continue;
                }
            }
            args.push(token);
        }
        if args.is_empty() {
            return Err(AxeErr::InvalidConfig(format!(
                "cli tool {name}: command is empty"
            )));
        }
        merged.extend(env);

        Ok(Self {
            name: name.to_string(),
            command: command.to_string(),
            desc: desc.to_string(),
            args,
            env: merged,
        })
    }
}

/// Splits a shell word of the form `KEY=VAL` where KEY is an identifier.
fn split_env_assignment(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

/// Result of one subprocess execution, serialized for the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Outcome {
    pub ran: bool,
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub(crate) struct CliTool {
    def: Definition,
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl CliTool {
    pub(crate) fn new(def: Definition, workdir: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            def,
            workdir,
            timeout,
        }
    }

    async fn execute(&self, argv: &[String]) -> Outcome {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&self.def.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.workdir.as_os_str().is_empty() {
            command.current_dir(&self.workdir);
        }

        let result = match self.timeout {
            Some(limit) => timeout(limit, command.output()).await,
            None => Ok(command.output().await),
        };

        let (exit_code, stdout, stderr) = match result {
            // Deadline: the child is killed on drop; report -1.
            Err(_) => (TIMEOUT_EXIT_CODE, String::new(), String::new()),
            Ok(Err(e)) => (
                SPAWN_FAILURE_EXIT_CODE,
                String::new(),
                format!("command error: {e}"),
            ),
            Ok(Ok(output)) => (
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
        };

        let duration = start.elapsed();
        Outcome {
            ran: true,
            command: argv.join(" "),
            exit_code,
            duration_ms: duration.as_millis() as u64,
            stdout: clip_string(&stdout, OUTPUT_CLIP_CHARS),
            stderr: clip_string(&stderr, OUTPUT_CLIP_CHARS),
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CliToolRequest {
    #[serde(default)]
    args: Vec<String>,
}

#[async_trait]
impl Tool for CliTool {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn description(&self) -> String {
        self.def.desc.clone()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Additional arguments to append to the configured command.",
                },
            },
            "additionalProperties": false,
        })
    }

    async fn invoke(&self, arguments: &str) -> Result<ToolOutput> {
        debug!(command = self.def.command, arguments, "cli tool: executing command");
        let arguments = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };

        let request: CliToolRequest = match serde_json::from_str(arguments) {
            Ok(request) => request,
            Err(e) => {
                return Ok(ToolOutput::text(format!(
                    "{}: invalid arguments: {e}",
                    self.def.name
                )));
            }
        };

        let mut argv = self.def.args.clone();
        argv.extend(request.args);

        let outcome = self.execute(&argv).await;
        Ok(ToolOutput::text(serde_json::to_string(&outcome)?))
    }
}
