//! Error types for the outreach pipeline.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for a dispatch run.
///
/// Only configuration-level and run-level failures ever surface here.
/// Per-recipient failures are recorded as outcomes and never escape the
/// dispatch controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recipient source error: {0}")]
    Source(#[from] SourceError),

    #[error("Outcome log error: {0}")]
    Recorder(#[from] RecorderError),
}

/// Configuration-related errors. Always fatal, always raised before the
/// first recipient is processed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Attachment not found: {0}")]
    MissingAttachment(PathBuf),

    #[error("Dataset {path:?} is unreadable: {reason}")]
    UnreadableDataset { path: PathBuf, reason: String },

    #[error("Dataset is missing required column: {0}")]
    MissingColumn(String),

    #[error("Mail transport setup failed: {0}")]
    Transport(String),

    #[error("LLM provider setup failed: {0}")]
    Llm(#[from] LlmError),

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from re-reading the recipient dataset.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to open dataset {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Personalization failures. Any of these yields an ERROR generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Malformed generation response: {0}")]
    MalformedResponse(String),
}

/// Errors turning a composed message into a transport-ready MIME message.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build email: {0}")]
    Build(String),
}

/// Errors raised by a sink while accepting or closing.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Failed to write preview {path:?}: {source}")]
    PreviewWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("SMTP send failed: {0}")]
    SendFailed(String),

    #[error("Transport task failed: {0}")]
    Join(String),
}

/// Outcome log write failures. These abort the run: an audit trail that
/// cannot be written is a run-level failure.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Pipeline stage that failed for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Compose,
    Deliver,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Compose => "compose",
            Self::Deliver => "deliver",
        }
    }
}

/// A recoverable per-recipient failure: recorded as an ERROR outcome, the
/// batch continues.
#[derive(Debug, thiserror::Error)]
#[error("{} stage failed: {detail}", stage.label())]
pub struct StageError {
    pub stage: Stage,
    pub detail: String,
}

impl StageError {
    pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}
