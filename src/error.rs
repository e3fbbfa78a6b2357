//! Error types for the connection engine.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// A decoded `-ERR ...`-shaped reply.
///
/// RESP errors are a single line: a leading all-uppercase kind token (e.g.
/// `ERR`, `WRONGTYPE`, `NOAUTH`) followed by a space and free-form text. A
/// line with no recognizable kind token falls back to `ERR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: String,
    pub message: String,
}

impl ServerError {
    pub fn parse(text: &str) -> Self {
        match text.split_once(' ') {
            Some((kind, rest))
                if !kind.is_empty() && kind.bytes().all(|b| b.is_ascii_uppercase()) =>
            {
                Self {
                    kind: kind.to_string(),
                    message: rest.to_string(),
                }
            }
            _ => Self {
                kind: "ERR".to_string(),
                message: text.to_string(),
            },
        }
    }

    /// True for the generic `ERR` kind, as opposed to a named error like
    /// `WRONGTYPE` or `NOAUTH`.
    pub fn is_err_kind(&self) -> bool {
        self.kind == "ERR"
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.message)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(ServerError),

    #[error("timeout waiting for completion{}", .0.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Timeout(Option<String>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for errors that
    /// mean the underlying connection can no longer be trusted and must be
    /// torn down, as opposed to a per-message failure the connection
    /// survives (e.g. a decoded `Server` error on a single reply).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Closed(_) | Error::Protocol(_))
    }
}
