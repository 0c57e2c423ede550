//! Error types for the feed consumer, cache and transports.

use thiserror::Error;

/// Why a non-blank feed line could not be classified.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Main error type.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(#[from] DecodeError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport interrupted: {0}")]
    TransportInterrupted(String),

    #[error("Observer {observer} failed: {message}")]
    ObserverFailed { observer: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Notifier already started for collection {0}")]
    AlreadyStarted(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Json(e.to_string())
    }
}

impl From<url::ParseError> for FeedError {
    fn from(e: url::ParseError) -> Self {
        FeedError::InvalidUrl(e.to_string())
    }
}

impl From<ureq::Error> for FeedError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(status, response) => FeedError::Http {
                status,
                message: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => FeedError::Transport(transport.to_string()),
        }
    }
}

/// Result type for feed and cache operations.
pub type Result<T> = std::result::Result<T, FeedError>;
