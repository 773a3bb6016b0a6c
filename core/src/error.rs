use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AxeErr>;

/// Structural failures that escape a run. Everything the model can recover
/// from on its own (patch rejections, malformed tool arguments, failed
/// subprocesses) is rendered to text and returned through the tool channel
/// instead.
#[derive(Debug, Error)]
pub enum AxeErr {
    #[error("missing API key; set AXE_API_KEY or OPENAI_API_KEY")]
    MissingApiKey,

    #[error("invalid runner configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("unknown tool requested by the model: {0}")]
    UnknownTool(String),

    #[error("react loop exceeded the maximum of {0} steps")]
    MaxStepsExceeded(usize),

    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("history file error: {0}")]
    History(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
