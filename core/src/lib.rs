//! Root of the `axe-core` library.
//!
//! Axe drives a tool-calling chat model through a bounded react loop that
//! edits a user-selected set of source files. The caller supplies the files,
//! natural-language instructions, and an optional whitelist of CLI tools; the
//! runner streams the conversation to a sink, applies structured edits
//! through the v4a patch engine, and records every run in an XML history
//! file.

// User-visible output must go through the caller's sink or the tracing
// stack, never straight to stdout/stderr.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod chat_completions;
pub mod container;
pub mod error;
mod flags;
pub mod history;
pub mod json_stream;
mod models;
mod prompt;
pub mod runner;
mod stream;
mod tool_call_stream;
pub mod tools;
mod util;
mod xml;

pub use container::CodeContainer;
pub use error::AxeErr;
pub use error::Result;
pub use history::DEFAULT_HISTORY_FILE;
pub use history::History;
pub use runner::Runner;
pub use runner::RunnerBuilder;
pub use tools::cli::Definition;

/// Loads `.env` from the current directory into the process environment.
/// Missing files are ignored.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}
