//! Error handling

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse classification of a job outcome, recorded in batch reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid scheduling or generation parameters.
    Config,
    /// Network, 5xx or explicit rate-limit failures that outlived their retries.
    Transient,
    /// Auth, policy or invalid payload failures. Never retried.
    Permanent,
    /// The rate limiter could not hand out a token in time.
    RateLimitTimeout,
    /// The scene analysis response could not be parsed.
    AnalysisParse,
    /// Output path already exists and overwriting was forbidden.
    Collision,
    /// The job was never attempted because the batch was cancelled.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::AnalysisParse => "analysis_parse",
            Self::Collision => "collision",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors produced while scheduling, generating or persisting images.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationError {
    /// Invalid parameters, caught before any remote call.
    Config(String),
    /// Retryable remote failure that exhausted its attempts.
    Transient(String),
    /// Non-retryable remote failure.
    Permanent(String),
    /// The remote service kept returning bodies that could not be parsed.
    MalformedResponse(String),
    /// No rate limit token was granted within the given bound.
    RateLimitTimeout(Duration),
    /// Scene analysis could not be parsed after all attempts.
    AnalysisParse(String),
    /// Output file exists and overwrite is forbidden.
    Collision(PathBuf),
    /// Job was not attempted.
    Cancelled,
    /// Local filesystem or image codec failure.
    Io(String),
}

impl GenerationError {
    /// The report classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) | Self::MalformedResponse(_) | Self::Io(_) => ErrorKind::Permanent,
            Self::RateLimitTimeout(_) => ErrorKind::RateLimitTimeout,
            Self::AnalysisParse(_) => ErrorKind::AnalysisParse,
            Self::Collision(_) => ErrorKind::Collision,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Transient(msg) => write!(f, "Transient remote failure: {msg}"),
            Self::Permanent(msg) => write!(f, "Permanent remote failure: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "Malformed remote response: {msg}"),
            Self::RateLimitTimeout(waited) => {
                write!(f, "No rate limit token available within {waited:?}")
            }
            Self::AnalysisParse(msg) => write!(f, "Failed to parse scene analysis: {msg}"),
            Self::Collision(path) => {
                write!(f, "Output already exists and overwrite is forbidden: {}", path.display())
            }
            Self::Cancelled => write!(f, "Job cancelled before it was dispatched"),
            Self::Io(msg) => write!(f, "I/O failure: {msg}"),
        }
    }
}

impl std::error::Error for GenerationError {}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        GenerationError::Io(err.to_string())
    }
}

impl From<image::ImageError> for GenerationError {
    fn from(err: image::ImageError) -> Self {
        GenerationError::Io(err.to_string())
    }
}
