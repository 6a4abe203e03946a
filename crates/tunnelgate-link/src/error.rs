//! Link errors

use std::io;
use thiserror::Error;

/// Reason a link stopped working.
///
/// Cloneable so every waiter on a link's latch sees the same first error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("IO error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("link closed")]
    Closed,
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => LinkError::PeerClosed,
            kind => LinkError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}
