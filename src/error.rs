//! Error types for the rategate engine.

use thiserror::Error;

/// The default message returned to clients when a rate limit is exceeded
/// and no custom message was configured (or rendering the custom one failed).
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// A rejection message after rendering, ready for the transport layer.
///
/// Text bodies are emitted as plain text, structured bodies as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedMessage {
    /// Plain text body.
    Text(String),
    /// Structured JSON body.
    Json(serde_json::Value),
}

impl std::fmt::Display for RenderedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderedMessage::Text(text) => write!(f, "{}", text),
            RenderedMessage::Json(value) => write!(f, "{}", value),
        }
    }
}

/// Main error type for rategate operations.
#[derive(Error, Debug)]
pub enum RateGateError {
    /// Configuration-related errors. Fatal and raised before any counting
    /// occurs; never produced by the per-request path for a valid setup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A client exceeded its limit. Expected control flow, not a bug: the
    /// caller's transport layer translates this into a wire-level response.
    #[error("Too many requests: {message}")]
    TooManyRequests {
        /// HTTP-like status code to report (default 429).
        status_code: u16,
        /// The rendered rejection body.
        message: RenderedMessage,
        /// Seconds until the client's window resets, when known.
        retry_after_secs: Option<u64>,
    },

    /// A backing store operation failed. Propagated unmodified; the engine
    /// performs no retry and takes no default-allow/deny stance.
    #[error("Store error: {0}")]
    Store(String),

    /// I/O errors (rule file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rategate operations.
pub type Result<T> = std::result::Result<T, RateGateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_message_display() {
        let text = RenderedMessage::Text("slow down".to_string());
        assert_eq!(text.to_string(), "slow down");

        let json = RenderedMessage::Json(serde_json::json!({ "error": "rate_limited" }));
        assert_eq!(json.to_string(), r#"{"error":"rate_limited"}"#);
    }

    #[test]
    fn test_too_many_requests_display() {
        let err = RateGateError::TooManyRequests {
            status_code: 429,
            message: RenderedMessage::Text(DEFAULT_MESSAGE.to_string()),
            retry_after_secs: Some(1),
        };
        assert_eq!(
            err.to_string(),
            "Too many requests: Too many requests, please try again later."
        );
    }
}
