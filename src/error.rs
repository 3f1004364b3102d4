// ===============================
// src/error.rs
// ===============================
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// How the retry combinator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Generic exponential backoff.
    Transient,
    /// Dedicated, longer ramp.
    RateLimited,
    /// Stop the owning connector.
    Fatal,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

impl FeedError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FeedError::RateLimited(_) => ErrorClass::RateLimited,
            FeedError::Authentication(_) => ErrorClass::Fatal,
            FeedError::Transient(_)
            | FeedError::MalformedPayload(_)
            | FeedError::Disconnected(_) => ErrorClass::Transient,
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> FeedError {
        match status.as_u16() {
            429 => FeedError::RateLimited(format!("{context}: {status}")),
            401 | 403 => FeedError::Authentication(format!("{context}: {status}")),
            _ => FeedError::Transient(format!("{context}: {status}")),
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FeedError::from_status(status, "http"),
            None if e.is_decode() => FeedError::MalformedPayload(e.to_string()),
            None => FeedError::Transient(e.to_string()),
        }
    }
}

impl From<tungstenite::Error> for FeedError {
    fn from(e: tungstenite::Error) -> Self {
        match &e {
            tungstenite::Error::Http(resp) => match resp.status().as_u16() {
                401 | 403 => FeedError::Authentication(format!("ws handshake: {}", resp.status())),
                429 => FeedError::RateLimited(format!("ws handshake: {}", resp.status())),
                _ => FeedError::Transient(format!("ws handshake: {}", resp.status())),
            },
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                FeedError::Disconnected(e.to_string())
            }
            _ => FeedError::Transient(e.to_string()),
        }
    }
}

/// Local artifact and remote upload failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid account identifier {0:?}: expected 0x followed by 40 hex digits")]
    InvalidAccount(String),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = FeedError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "poll");
        assert_eq!(e.class(), ErrorClass::RateLimited);
        let e = FeedError::from_status(reqwest::StatusCode::UNAUTHORIZED, "poll");
        assert_eq!(e.class(), ErrorClass::Fatal);
        let e = FeedError::from_status(reqwest::StatusCode::BAD_GATEWAY, "poll");
        assert_eq!(e.class(), ErrorClass::Transient);
    }

    #[test]
    fn disconnect_is_never_fatal() {
        assert_eq!(FeedError::Disconnected("eof".into()).class(), ErrorClass::Transient);
        assert_eq!(FeedError::MalformedPayload("x".into()).class(), ErrorClass::Transient);
    }
}
