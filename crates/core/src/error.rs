//! Error taxonomy shared by every layer of the transfer core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transfer error type.
///
/// Every failure the core can surface maps to exactly one [`ErrorKind`]. Storage
/// and metadata layers convert their own errors into this type at the crate
/// boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("bad sequence: expected chunk {expected}, got {got}")]
    BadSequence { expected: u64, got: u64 },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("upload is already sealed")]
    SealedAlready,

    #[error("incomplete upload: received {received} of {expected} chunks")]
    IncompleteUpload { received: u64, expected: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadInput(_) => ErrorKind::BadInput,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::BadSequence { .. } => ErrorKind::BadSequence,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::SealedAlready => ErrorKind::SealedAlready,
            Self::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Expired(_) => ErrorKind::Expired,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Rebuild an error from a wire code and message.
    ///
    /// Structured fields that do not survive the wire are folded into the
    /// message; unknown codes become [`Error::Internal`].
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::parse(code) {
            Some(ErrorKind::BadInput) => Self::BadInput(message),
            Some(ErrorKind::HashMismatch) => Self::HashMismatch {
                expected: String::new(),
                actual: message,
            },
            Some(ErrorKind::BadSequence) => Self::BadSequence {
                expected: 0,
                got: 0,
            },
            Some(ErrorKind::QuotaExceeded) => Self::QuotaExceeded(message),
            Some(ErrorKind::SealedAlready) => Self::SealedAlready,
            Some(ErrorKind::IncompleteUpload) => Self::IncompleteUpload {
                received: 0,
                expected: 0,
            },
            Some(ErrorKind::NotFound) => Self::NotFound(message),
            Some(ErrorKind::Expired) => Self::Expired(message),
            Some(ErrorKind::Cancelled) => Self::Cancelled(message),
            Some(ErrorKind::Transient) => Self::Transient(message),
            Some(ErrorKind::Internal) | None => Self::Internal(message),
        }
    }
}

/// Classification of transfer errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadInput,
    HashMismatch,
    BadSequence,
    QuotaExceeded,
    SealedAlready,
    IncompleteUpload,
    NotFound,
    Expired,
    Cancelled,
    Transient,
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 11] = [
        Self::BadInput,
        Self::HashMismatch,
        Self::BadSequence,
        Self::QuotaExceeded,
        Self::SealedAlready,
        Self::IncompleteUpload,
        Self::NotFound,
        Self::Expired,
        Self::Cancelled,
        Self::Transient,
        Self::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadInput => "bad_input",
            Self::HashMismatch => "hash_mismatch",
            Self::BadSequence => "bad_sequence",
            Self::QuotaExceeded => "quota_exceeded",
            Self::SealedAlready => "sealed_already",
            Self::IncompleteUpload => "incomplete_upload",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Transient => "transient",
            Self::Internal => "internal",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == code)
    }

    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                Self::BadInput(err.to_string())
            }
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

/// JSON body of an error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Set on `internal` errors; matches the server's log line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Self::from_code(&body.code, body.message)
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;
