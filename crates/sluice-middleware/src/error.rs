//! Error types shared by the writer stack, the origin matcher and the
//! transport bridge.

use std::io;
use thiserror::Error;

/// Errors surfaced by response writer capabilities.
#[derive(Debug, Error)]
pub enum WriterError {
    /// No writer in the chain supports flushing.
    #[error("response writer does not support flushing")]
    FlushNotSupported,

    /// No writer in the chain supports hijacking.
    #[error("response writer does not support hijacking")]
    HijackNotSupported,

    /// The connection was hijacked; the HTTP response can no longer be used.
    #[error("connection has been hijacked")]
    Hijacked,

    /// The connection was already taken by an earlier hijack.
    #[error("connection already hijacked")]
    AlreadyHijacked,

    /// The transport failed while flushing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WriterError {
    /// Wraps this error for the `io::Result` returned by body writes.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

/// Reasons a configured origin entry is rejected by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    /// The entry contains a scheme separator (`://`).
    #[error("origin contains scheme (://)")]
    Scheme,

    /// The entry contains a path separator (`/`).
    #[error("origin contains path (/)")]
    Path,

    /// The entry carries an explicit port.
    #[error("origin contains port")]
    Port,

    /// The entry is the wildcard token.
    #[error("origin is wildcard (*)")]
    Wildcard,

    /// The entry is empty.
    #[error("origin is empty")]
    Empty,
}

/// Errors produced by the hyper transport bridge.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The handler chain ended without producing a response head.
    #[error("handler aborted before sending a response")]
    Aborted,

    /// The handler chain ended abnormally after the response head was sent.
    #[error("response stream aborted")]
    StreamAborted,
}
