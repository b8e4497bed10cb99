//! Client error types.

use ferry_core::{ErrorBody, ErrorKind};

/// Errors surfaced by the ferry client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error body.
    #[error("{} ({status}): {}", .body.code, .body.message)]
    Api { status: u16, body: ErrorBody },

    /// The requested range starts at or past the end of a `total_size` byte file.
    #[error("range not satisfiable for a {total_size} byte file")]
    RangeNotSatisfiable { total_size: u64 },

    /// The request never produced a response (connect, timeout, reset).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The server's response did not match the protocol.
    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A local failure, such as a source file shorter than declared.
    #[error(transparent)]
    Local(#[from] ferry_core::Error),
}

impl ClientError {
    /// Build an API error from a status and a (possibly non-JSON) body.
    ///
    /// Bodies that are not ferry error objects, such as a proxy's 502 page,
    /// are classified by status: gateway failures are transient, anything
    /// else is internal.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let body = serde_json::from_slice::<ErrorBody>(body).unwrap_or_else(|_| {
            let kind = match status {
                502..=504 => ErrorKind::Transient,
                400 => ErrorKind::BadInput,
                404 => ErrorKind::NotFound,
                _ => ErrorKind::Internal,
            };
            ErrorBody {
                code: kind.as_str().to_string(),
                message: String::from_utf8_lossy(body).chars().take(512).collect(),
                correlation_id: None,
            }
        });
        Self::Api { status, body }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api { body, .. } => ErrorKind::parse(&body.code).unwrap_or(ErrorKind::Internal),
            Self::RangeNotSatisfiable { .. } => ErrorKind::BadInput,
            Self::Transport(_) => ErrorKind::Transient,
            Self::InvalidUrl(_) => ErrorKind::BadInput,
            Self::Protocol(_) => ErrorKind::Internal,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Internal,
            Self::Local(e) => e.kind(),
        }
    }

    /// Whether the same request may be sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Correlation id of an opaque server-side failure, for support requests.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Api { body, .. } => body.correlation_id.as_deref(),
            _ => None,
        }
    }
}

impl From<ClientError> for ferry_core::Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api { body, .. } => body.into(),
            ClientError::Local(e) => e,
            other => Self::from_code(other.kind().as_str(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
