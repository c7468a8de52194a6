use std::time::Duration;

use crate::util::truncate_chars;

/// Error surfaced to callers of [`crate::client::ChatClient`] and delivered as
/// the terminal event of a failed stream.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Response body is not readable: {0}")]
    UnreadableBody(String),
    #[error("Stream read error: {0}")]
    Read(String),
    #[error("Stream read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("Response decode error: {0}")]
    Decode(String),
}

/// Diagnostics absorbed inside the stream driver.
///
/// These never terminate a stream; they are logged and the read loop keeps
/// going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Skipped malformed frame ({message}): {payload_preview}")]
    Decode {
        payload_preview: String,
        message: String,
    },
    #[error("Dropped {dropped_bytes} undecodable trailing byte(s) at end of stream")]
    Encoding { dropped_bytes: usize },
    #[error("Discarded {bytes} byte(s) of unterminated trailing line")]
    TruncatedFrame { bytes: usize },
}

/// Broad error category, useful to callers that implement their own retry
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Transport,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl ChatError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::InvalidRequest(_) | ChatError::Config(_) => ErrorCategory::InvalidRequest,
            ChatError::Connection(_)
            | ChatError::UnreadableBody(_)
            | ChatError::Read(_)
            | ChatError::ReadTimeout(_) => ErrorCategory::Transport,
            ChatError::Decode(_) => ErrorCategory::ServerError,
            ChatError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// Whether a caller-side retry of the same request could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::RateLimit | ErrorCategory::ServerError
        )
    }
}

const UPSTREAM_MESSAGE_MAX_CHARS: usize = 512;

/// Build an [`ChatError::Upstream`] from a status and raw response body,
/// truncating the body so log lines stay bounded.
#[must_use]
pub fn upstream_error(status: u16, body: &str) -> ChatError {
    let trimmed = body.trim();
    let message = if trimmed.is_empty() {
        format!("HTTP error! status: {status}")
    } else {
        truncate_chars(trimmed, UPSTREAM_MESSAGE_MAX_CHARS)
    };
    ChatError::Upstream { status, message }
}
