//! The remote generation service, seen through a single `invoke` call.

use async_trait::async_trait;

use crate::prompt::GenerationRequest;

pub mod gemini;

pub use gemini::GeminiClient;

/// How a failure should be treated by the retry loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff.
    Transient,
    /// Retrying can't help.
    Permanent,
}

/// Transport level failures of one call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ApiError {
    /// The request timed out.
    Timeout(String),
    /// Connection or protocol failure before a status was received.
    Network(String),
    /// The service signalled that its quota is exhausted.
    RateLimited(String),
    /// Any other non-success HTTP status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },
}

impl ApiError {
    /// Timeouts, network errors, rate limiting, 408 and 5xx are transient.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited(_) => ErrorClass::Transient,
            Self::Status { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "request timed out: {msg}"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::RateLimited(msg) => write!(f, "rate limited by service: {msg}"),
            Self::Status { status, body } => write!(f, "service returned {status}: {body}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Problems found in a response body that arrived with a success status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseError {
    /// Body could not be parsed or lacked the expected content.
    Malformed(String),
    /// The service refused the request, eg a content policy block.
    Rejected(String),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
            Self::Rejected(msg) => write!(f, "request rejected: {msg}"),
        }
    }
}

impl std::error::Error for ResponseError {}

/// Image returned by a generation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedImage {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// MIME type reported by the service.
    pub mime_type: Option<String>,
    /// Text the model returned alongside the image.
    pub commentary: Option<String>,
}

/// The one primitive the rest of the crate needs from the remote service.
///
/// Implementations return the raw response body; parsing belongs to the caller
/// so that corrupt bodies never leave the retry loop.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Sends one request and returns the raw success body.
    async fn invoke(&self, request: &GenerationRequest) -> Result<Vec<u8>, ApiError>;
}
