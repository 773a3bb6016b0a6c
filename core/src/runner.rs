//! The react loop driver.
//!
//! A [`Runner`] owns one editing session: it renders the container as
//! CodeInput, streams model turns, dispatches tool calls sequentially, and
//! records the transcript in the history file when the loop terminates. One
//! consumer task drains the bounded output channel into the
//! [`OutputRecorder`]; at most one tool-call decoder task is alive at a time
//! (see `stream.rs`). Tools never run concurrently, so the container has a
//! single mutator.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

use crate::chat_completions::ModelConfig;
use crate::chat_completions::stream_chat_completions;
use crate::container::CodeContainer;
use crate::error::AxeErr;
use crate::error::Result;
use crate::history::Changelog;
use crate::history::ChangelogHandle;
use crate::history::DEFAULT_HISTORY_FILE;
use crate::history::History;
use crate::history::read_history_from_file;
use crate::models::assistant_message;
use crate::models::tool_message;
use crate::prompt::build_initial_messages;
use crate::stream::consume_stream;
use crate::tools::Tool;
use crate::tools::ToolRegistry;
use crate::tools::apply_edit::APPLY_EDIT_TOOL_NAME;
use crate::tools::apply_edit::ApplyEditTool;
use crate::tools::cli::CliTool;
use crate::tools::cli::Definition;
use crate::tools::finalize::FINALIZE_TOOL_NAME;
use crate::tools::finalize::FinalizeTool;

pub const MODEL_GPT5: &str = "gpt-5";
pub const MODEL_GPT4O: &str = "gpt-4o";
pub const MODEL_GPT4O_MINI: &str = "gpt-4o-mini";

pub const DEFAULT_MAX_STEPS: usize = 20;
const DEFAULT_OUTPUT_BUFFER: usize = 4096;

pub struct RunnerBuilder {
    base_dir: PathBuf,
    instructions: Vec<String>,
    container: CodeContainer,
    model: String,
    max_steps: usize,
    tools: Vec<Definition>,
    history_path: Option<PathBuf>,
    min_interval: Option<Duration>,
    sink: Option<Box<dyn Write + Send>>,
    output_buffer: usize,
    keep_history: bool,
    load_dotenv: bool,
    cli_timeout: Option<Duration>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl RunnerBuilder {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        instructions: Vec<String>,
        container: CodeContainer,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            instructions,
            container,
            model: MODEL_GPT4O.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            tools: Vec::new(),
            history_path: None,
            min_interval: None,
            sink: None,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            keep_history: true,
            load_dotenv: false,
            cli_timeout: None,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Definition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    /// Skip the run entirely when the last changelog is younger than this.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = Some(min_interval);
        self
    }

    /// Receives the live transcript: assistant text, tool-call headers,
    /// decoded argument chunks, and tool-response acknowledgments.
    pub fn with_sink(mut self, sink: impl Write + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer = size.max(1);
        self
    }

    /// `true` (default) appends the run's changelog to the history; `false`
    /// replaces the history with the new changelog alone.
    pub fn with_keep_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    /// Load `.env` at the top of the run (missing files are fine).
    pub fn with_dotenv(mut self, load_dotenv: bool) -> Self {
        self.load_dotenv = load_dotenv;
        self
    }

    /// Deadline applied to every CLI tool invocation.
    pub fn with_cli_timeout(mut self, timeout: Duration) -> Self {
        self.cli_timeout = Some(timeout);
        self
    }

    /// Explicit API key, bypassing the environment lookup.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    /// Explicit API base URL, bypassing the environment lookup.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn build(self) -> Result<Runner> {
        let instruction = self.instructions.join("\n").trim().to_string();
        if instruction.is_empty() {
            return Err(AxeErr::InvalidConfig("instruction is required".to_string()));
        }
        if self.container.is_empty() {
            return Err(AxeErr::InvalidConfig("no files to edit".to_string()));
        }
        if self.max_steps == 0 {
            return Err(AxeErr::InvalidConfig("max steps must be positive".to_string()));
        }

        let reserved = [APPLY_EDIT_TOOL_NAME, FINALIZE_TOOL_NAME];
        for (i, def) in self.tools.iter().enumerate() {
            if reserved.contains(&def.name.as_str())
                || self.tools[..i].iter().any(|other| other.name == def.name)
            {
                return Err(AxeErr::DuplicateTool(def.name.clone()));
            }
        }

        let history_path = self
            .history_path
            .unwrap_or_else(|| self.base_dir.join(DEFAULT_HISTORY_FILE));
        let history = read_history_from_file(history_path)?;

        Ok(Runner {
            base_dir: self.base_dir,
            instruction,
            container: Arc::new(Mutex::new(self.container)),
            model: self.model,
            max_steps: self.max_steps,
            tools: self.tools,
            history,
            min_interval: self.min_interval,
            sink: self.sink,
            output_buffer: self.output_buffer,
            keep_history: self.keep_history,
            load_dotenv: self.load_dotenv,
            cli_timeout: self.cli_timeout,
            api_key: self.api_key,
            base_url: self.base_url,
        })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

pub struct Runner {
    base_dir: PathBuf,
    instruction: String,
    container: Arc<Mutex<CodeContainer>>,
    model: String,
    max_steps: usize,
    tools: Vec<Definition>,
    history: History,
    min_interval: Option<Duration>,
    sink: Option<Box<dyn Write + Send>>,
    output_buffer: usize,
    keep_history: bool,
    load_dotenv: bool,
    cli_timeout: Option<Duration>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl Runner {
    pub fn builder(
        base_dir: impl Into<PathBuf>,
        instructions: Vec<String>,
        container: CodeContainer,
    ) -> RunnerBuilder {
        RunnerBuilder::new(base_dir, instructions, container)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Drives the react loop to completion and returns the agent's final
    /// output. Intended to be called once per runner; the history file is
    /// written at most once.
    pub async fn run(&mut self) -> Result<String> {
        if self.load_dotenv {
            dotenvy::dotenv().ok();
        }

        if let Some(min_interval) = self.min_interval {
            if let Some(last) = self.history.last_changelog_timestamp() {
                let age = Utc::now()
                    .signed_duration_since(last)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age < min_interval {
                    info!(
                        last_run = %last,
                        "skipping run: last changelog is newer than the minimum interval"
                    );
                    return Ok(String::new());
                }
            }
        }

        let config = ModelConfig::resolve(
            &self.model,
            self.api_key.as_deref(),
            self.base_url.as_deref(),
        )?;
        let client = reqwest::Client::new();

        let changelog = ChangelogHandle::new(Changelog::new());

        let mut tools: Vec<Box<dyn Tool>> = vec![
            Box::new(ApplyEditTool::new(self.container.clone())),
            Box::new(FinalizeTool::new(changelog.clone())),
        ];
        for def in &self.tools {
            tools.push(Box::new(CliTool::new(
                def.clone(),
                self.base_dir.clone(),
                self.cli_timeout,
            )));
        }
        let registry = ToolRegistry::new(tools)?;
        let schemas = registry.schemas();

        let code_input = {
            let container = self
                .container
                .lock()
                .map_err(|_| AxeErr::InvalidConfig("code container lock poisoned".to_string()))?;
            container.build_code_input(&[]).to_xml()
        };
        let mut messages =
            build_initial_messages(&self.instruction, &code_input, !self.tools.is_empty());

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.output_buffer);
        let recorder = Arc::new(Mutex::new(OutputRecorder {
            buffer: String::new(),
            sink: self.sink.take(),
        }));
        let consumer = tokio::spawn({
            let recorder = recorder.clone();
            async move {
                while let Some(chunk) = out_rx.recv().await {
                    if let Ok(mut recorder) = recorder.lock() {
                        recorder.write(&chunk);
                    }
                }
            }
        });

        let loop_result = drive_loop(
            &mut messages,
            &registry,
            &schemas,
            &config,
            &client,
            &out_tx,
            self.max_steps,
        )
        .await;

        // Close the channel exactly once; the consumer exits when it drains.
        drop(out_tx);
        let _ = consumer.await;

        let transcript = recorder
            .lock()
            .map(|recorder| recorder.buffer.clone())
            .unwrap_or_default();
        if !transcript.is_empty() {
            changelog.add_log(transcript);
        }

        let entry = changelog.snapshot();
        if self.keep_history {
            self.history.append_changelog(entry);
        } else {
            self.history.replace_with(entry);
        }
        self.history.save()?;

        loop_result
    }
}

async fn drive_loop(
    messages: &mut Vec<Value>,
    registry: &ToolRegistry,
    schemas: &[Value],
    config: &ModelConfig,
    client: &reqwest::Client,
    out: &mpsc::Sender<String>,
    max_steps: usize,
) -> Result<String> {
    for step in 0..max_steps {
        debug!(step, "react loop: requesting model turn");
        let mut stream = stream_chat_completions(messages, schemas, config, client).await?;
        let turn = consume_stream(&mut stream, out).await?;

        if !turn.has_tool_calls() {
            // A plain assistant reply ends the loop.
            return Ok(turn.content);
        }
        messages.push(assistant_message(&turn.content, &turn.tool_calls));

        for call in &turn.tool_calls {
            let tool = registry
                .get(&call.name)
                .ok_or_else(|| AxeErr::UnknownTool(call.name.clone()))?;
            let output = tool.invoke(&call.arguments).await?;
            let _ = out
                .send(format!(
                    "\nTool response [{}]:\n{}\n",
                    call.name, output.content
                ))
                .await;
            messages.push(tool_message(&call.id, &output.content));
            if output.return_directly {
                return Ok(output.content);
            }
        }
    }
    Err(AxeErr::MaxStepsExceeded(max_steps))
}

/// Thread-safe transcript collector that also fans out to the caller's sink.
struct OutputRecorder {
    buffer: String,
    sink: Option<Box<dyn Write + Send>>,
}

impl OutputRecorder {
    fn write(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if let Some(sink) = &mut self.sink {
            let _ = sink.write_all(chunk.as_bytes());
            let _ = sink.flush();
        }
    }
}
