//! Error types for appool.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for appool.
#[derive(Error, Debug)]
pub enum Error {
    /// The spawn service rejected a spawn request. Carries the service's
    /// message verbatim and, when the service produced one, a renderable
    /// HTML error page for the front end.
    #[error("spawn failed: {message}")]
    Spawn {
        message: String,
        page: Option<String>,
    },

    /// The pool cannot satisfy the request right now; retry later.
    #[error("the application pool is too busy")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A filesystem or system-call failure with the operation and path
    /// that triggered it.
    #[error("cannot {op} {path}: {source}")]
    System {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Fatal misconfiguration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A cooperative cancellation signal aborted the operation.
    #[error("operation interrupted")]
    Interrupted,

    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result type alias for appool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The `<kind>` token used on the wire for error responses.
    ///
    /// `Busy` and `Interrupted` never travel as `error` frames: the former
    /// has its own `busy` response and the latter is connection-local.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Error::Spawn { .. } => "Spawn",
            Error::System { .. } => "System",
            Error::Config(_) => "Config",
            _ => "Io",
        }
    }

    /// Reconstruct an error from a wire `<kind>` and message.
    pub fn from_wire(kind: &str, message: String, page: Option<String>) -> Self {
        match kind {
            "Spawn" => Error::Spawn { message, page },
            "System" => Error::System {
                op: "perform remote operation",
                path: PathBuf::new(),
                source: std::io::Error::other(message),
            },
            "Config" => Error::Config(message),
            _ => Error::Io(std::io::Error::other(message)),
        }
    }

    /// The renderable error page attached to a spawn failure, if any.
    pub fn error_page(&self) -> Option<&str> {
        match self {
            Error::Spawn { page, .. } => page.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kind_round_trip() {
        let err = Error::Spawn {
            message: "no such app".into(),
            page: Some("<html></html>".into()),
        };
        assert_eq!(err.wire_kind(), "Spawn");

        let back = Error::from_wire("Spawn", "no such app".into(), None);
        assert!(matches!(back, Error::Spawn { .. }));

        let back = Error::from_wire("Config", "bad socket path".into(), None);
        assert!(matches!(back, Error::Config(_)));

        let back = Error::from_wire("Io", "read failed".into(), None);
        assert!(matches!(back, Error::Io(_)));
    }

    #[test]
    fn error_page_only_on_spawn() {
        let err = Error::Spawn {
            message: "boom".into(),
            page: Some("<h1>boom</h1>".into()),
        };
        assert_eq!(err.error_page(), Some("<h1>boom</h1>"));
        assert!(Error::Busy.error_page().is_none());
    }
}
