//! Error types for the orchestration core

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Rate-limit details parsed from a 429 response.
///
/// Backends report reset hints in different places (JSON body fields,
/// `X-...-Reset-After-Seconds`-style headers); adapters normalize whatever
/// they find into this struct so the retry wrapper can act on it uniformly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// Server-suggested wait before retrying, when the backend provided one.
    pub retry_after: Option<Duration>,

    /// Plan label reported by the backend (e.g. "pro", "free"), if any.
    pub plan: Option<String>,

    /// Percentage of the quota window already consumed, if reported.
    pub used_percent: Option<f64>,
}

/// Main error type for the orchestration core.
///
/// The taxonomy follows how errors must be routed: anything the retry
/// wrapper can act on (`RateLimit`, `Http`, transient `Api` statuses) is
/// returned synchronously from `Provider::stream`; anything that can occur
/// mid-stream arrives as an `Err` item on the event stream before
/// end-of-stream.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-2xx API response that is not a rate limit or auth failure
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// 401/403 from a backend. Never retried.
    #[error("authentication failed: {0} (re-run login for this provider)")]
    Auth(String),

    /// 429 from a backend, with whatever reset hints it supplied
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        info: RateLimitInfo,
    },

    /// Streaming error (malformed frame, dropped transport mid-stream)
    #[error("streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("tool execution error: {0}")]
    Tool(String),

    /// Subprocess backend error (spawn failure, abnormal exit, bad frame)
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The agentic loop exceeded its turn budget
    #[error("exceeded max turns ({0})")]
    MaxTurnsExceeded(u32),

    /// The stream was cancelled by its consumer
    #[error("cancelled")]
    Cancelled,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an API error from a status code and body text
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a new auth error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a rate-limit error
    pub fn rate_limit(msg: impl Into<String>, info: RateLimitInfo) -> Self {
        Error::RateLimit {
            message: msg.into(),
            info,
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new subprocess error
    pub fn subprocess(msg: impl Into<String>) -> Self {
        Error::Subprocess(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether the retry wrapper may re-issue the request after this error.
    ///
    /// Rate limits and transport-level failures are retryable; auth errors,
    /// schema errors, and anything the caller got wrong are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimit { .. } => true,
            Error::Http(_) => true,
            Error::Stream(_) => true,
            Error::Api { status, .. } => matches!(status, 500 | 502 | 503 | 504 | 529),
            _ => false,
        }
    }

    /// Rate-limit details, when this is a rate-limit error.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Error::RateLimit { info, .. } => Some(info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_api() {
        let err = Error::api(500, "Internal Server Error");
        assert!(matches!(err, Error::Api { status: 500, .. }));
        assert_eq!(err.to_string(), "API error 500: Internal Server Error");
    }

    #[test]
    fn test_error_auth_mentions_reauth() {
        let err = Error::auth("expired token");
        assert!(err.to_string().contains("re-run login"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_rate_limit_carries_info() {
        let info = RateLimitInfo {
            retry_after: Some(Duration::from_secs(3)),
            plan: Some("pro".to_string()),
            used_percent: Some(92.5),
        };
        let err = Error::rate_limit("quota window exhausted", info.clone());
        assert!(err.is_retryable());
        assert_eq!(err.rate_limit_info(), Some(&info));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(Error::api(503, "unavailable").is_retryable());
        assert!(Error::api(529, "overloaded").is_retryable());
        assert!(!Error::api(400, "bad request").is_retryable());
        assert!(!Error::api(404, "not found").is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!Error::config("missing model").is_retryable());
        assert!(!Error::invalid_input("empty prompt").is_retryable());
        assert!(!Error::tool("boom").is_retryable());
        assert!(!Error::MaxTurnsExceeded(20).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_max_turns_message() {
        let err = Error::MaxTurnsExceeded(20);
        assert!(err.to_string().contains("exceeded max turns"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
