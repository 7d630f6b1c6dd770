//! Backend adapters.
//!
//! One module per backend family. Every adapter implements
//! [`crate::Provider`] and shares the translation contract described there;
//! this module holds the error-mapping helpers they have in common.

pub mod claude_cli;
pub mod gemini;
pub mod messages;
pub mod openai;
pub mod responses;

use crate::error::RateLimitInfo;
use crate::Error;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;

/// Header names carrying reset hints, in the order backends tend to use.
const RESET_HEADERS: &[&str] = &[
    "retry-after",
    "x-ratelimit-reset-after-seconds",
    "anthropic-ratelimit-unified-reset-after",
];

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

/// Parse whatever reset hints a 429 response carried, from headers and the
/// JSON body.
pub(crate) fn parse_rate_limit(headers: &HeaderMap, body: &str) -> RateLimitInfo {
    let mut info = RateLimitInfo::default();

    for name in RESET_HEADERS {
        if let Some(seconds) = header_f64(headers, name) {
            info.retry_after = Some(Duration::from_secs_f64(seconds.max(0.0)));
            break;
        }
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if info.retry_after.is_none() {
            let seconds = json["retry_after"]
                .as_f64()
                .or_else(|| json["error"]["retry_after"].as_f64())
                .or_else(|| json["reset_after_seconds"].as_f64());
            if let Some(seconds) = seconds {
                info.retry_after = Some(Duration::from_secs_f64(seconds.max(0.0)));
            }
        }
        info.plan = json["plan"]
            .as_str()
            .or_else(|| json["error"]["plan"].as_str())
            .map(str::to_string);
        info.used_percent = json["used_percent"]
            .as_f64()
            .or_else(|| json["error"]["used_percent"].as_f64());
    }

    info
}

/// Map a non-2xx response onto the error taxonomy. Adapters call this
/// synchronously, before any stream is handed to the caller, so the retry
/// wrapper can see the status.
pub(crate) fn http_error(status: StatusCode, headers: &HeaderMap, body: &str) -> Error {
    let snippet: String = body.chars().take(600).collect();
    match status.as_u16() {
        401 | 403 => Error::auth(snippet),
        429 => {
            let info = parse_rate_limit(headers, body);
            Error::rate_limit(snippet, info)
        }
        code => Error::api(code, snippet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    #[test]
    fn test_parse_rate_limit_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from_static("7"),
        );
        let info = parse_rate_limit(&headers, r#"{"retry_after": 99}"#);
        assert_eq!(info.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_rate_limit_body_fields() {
        let info = parse_rate_limit(
            &HeaderMap::new(),
            r#"{"retry_after": 2.5, "plan": "pro", "used_percent": 98.0}"#,
        );
        assert_eq!(info.retry_after, Some(Duration::from_secs_f64(2.5)));
        assert_eq!(info.plan.as_deref(), Some("pro"));
        assert_eq!(info.used_percent, Some(98.0));
    }

    #[test]
    fn test_http_error_routing() {
        let headers = HeaderMap::new();
        assert!(matches!(
            http_error(StatusCode::UNAUTHORIZED, &headers, "no key"),
            Error::Auth(_)
        ));
        assert!(matches!(
            http_error(StatusCode::TOO_MANY_REQUESTS, &headers, "{}"),
            Error::RateLimit { .. }
        ));
        assert!(matches!(
            http_error(StatusCode::BAD_REQUEST, &headers, "bad"),
            Error::Api { status: 400, .. }
        ));
    }
}
