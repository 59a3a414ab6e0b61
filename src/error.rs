//! Error taxonomy for calls to external providers.
//!
//! Every failure observed at a provider boundary (OCR, embeddings, chat,
//! payment) is reduced to an [`ErrorSignal`] and classified by the pure
//! function [`classify`] into a closed [`ErrorKind`]. The kind alone decides
//! whether the [`ResilientClient`](crate::resilient::ResilientClient) retries.
//!
//! | Kind | Typical signal | Retried |
//! |------|----------------|---------|
//! | `rate_limited` | HTTP 429, "rate limit" | yes |
//! | `authentication` | HTTP 401, "invalid api key" | no |
//! | `permission` | HTTP 403, "forbidden" | no |
//! | `malformed_request` | HTTP 400/404/413/422, "invalid" | no |
//! | `server_side` | HTTP 5xx | yes |
//! | `network` | timeout, connection reset, HTTP 408 | yes |
//! | `unknown` | anything else | yes |

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Closed classification of an external-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Authentication,
    Permission,
    MalformedRequest,
    ServerSide,
    Network,
    Unknown,
}

impl ErrorKind {
    /// Whether the resilient wrapper may try the call again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerSide | ErrorKind::Network | ErrorKind::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::ServerSide => "server_side",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider boundary observed when a call failed.
///
/// Providers fill in whatever they know; [`classify`] never needs anything
/// beyond these fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSignal {
    /// HTTP status code, when a response was received.
    pub status: Option<u16>,
    /// The request never produced a response (timeout, connect, reset).
    pub transport_failure: bool,
    /// Provider message or response body.
    pub message: String,
    /// Wait time stated by the provider (e.g. the `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl ErrorSignal {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            transport_failure: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Map an error signal to its kind.
///
/// Status codes take precedence over transport flags, which take precedence
/// over message heuristics. The mapping depends on nothing but the signal.
pub fn classify(signal: &ErrorSignal) -> ErrorKind {
    if let Some(status) = signal.status {
        match status {
            429 => return ErrorKind::RateLimited,
            401 => return ErrorKind::Authentication,
            403 => return ErrorKind::Permission,
            408 => return ErrorKind::Network,
            400..=499 => return ErrorKind::MalformedRequest,
            500..=599 => return ErrorKind::ServerSide,
            _ => {}
        }
    }

    if signal.transport_failure {
        return ErrorKind::Network;
    }

    let msg = signal.message.to_lowercase();
    if msg.contains("rate limit") || msg.contains("too many requests") {
        ErrorKind::RateLimited
    } else if msg.contains("unauthorized") || msg.contains("invalid api key") {
        ErrorKind::Authentication
    } else if msg.contains("forbidden") || msg.contains("permission") {
        ErrorKind::Permission
    } else if msg.contains("invalid") || msg.contains("bad request") {
        ErrorKind::MalformedRequest
    } else if msg.contains("timed out") || msg.contains("connection") {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

/// A classified failure of an external call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind} error: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-stated wait before the next attempt, or the admission-control
    /// wait for a fail-fast throttle.
    pub retry_after: Option<Duration>,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_signal(signal: ErrorSignal) -> Self {
        Self {
            kind: classify(&signal),
            retry_after: signal.retry_after,
            message: signal.message,
        }
    }

    /// Admission control refused the call in fail-fast mode.
    pub fn throttled(rate_key: &str, wait: Duration) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: format!(
                "local rate limit reached for '{}', retry in {:.2}s",
                rate_key,
                wait.as_secs_f64()
            ),
            retry_after: Some(wait),
        }
    }

    /// Seconds the caller should wait before retrying, if known.
    pub fn wait_seconds(&self) -> Option<f64> {
        self.retry_after.map(|d| d.as_secs_f64())
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let signal = match err.status() {
            Some(status) => ErrorSignal::status(status.as_u16(), err.to_string()),
            None if err.is_timeout() || err.is_connect() || err.is_request() => {
                ErrorSignal::transport(err.to_string())
            }
            None if err.is_decode() || err.is_body() => ErrorSignal {
                message: format!("malformed response: {}", err),
                ..Default::default()
            },
            None => ErrorSignal::transport(err.to_string()),
        };
        Self::from_signal(signal)
    }

    /// Classify a non-success HTTP response, consuming its body for the message.
    pub async fn from_response(provider: &str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Self::from_signal(
            ErrorSignal::status(status, format!("{} API error {}: {}", provider, status, body))
                .with_retry_after(retry_after),
        )
    }
}

/// Longest provider-stated wait taken at face value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Parse a `Retry-After` header given in (possibly fractional) seconds,
/// capped at [`MAX_RETRY_AFTER`].
///
/// HTTP-date values are not interpreted; the wrapper falls back to its own
/// backoff for them.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    let stated = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER);
    Some(stated.min(MAX_RETRY_AFTER))
}
