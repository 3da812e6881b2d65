//! Error taxonomy for the messaging substrate.
//!
//! Callers need to tell "bad data" apart from "network down": framing and
//! schema violations are protocol bugs, while timeouts are recoverable and
//! connection loss ends the current session.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A length prefix outside `(0, MAX_FRAME_LEN]`, or a chunk header
    /// declaring more payload than a chunk may carry.
    #[error("invalid frame length: {length}")]
    InvalidFrameLength { length: u64 },

    /// A blocking operation exceeded its deadline. Recoverable.
    #[error("operation timed out")]
    Timeout,

    /// The socket was closed, reset, or failed with a non-timeout I/O error.
    /// Terminal for the current session.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer worker was stopped while a caller was still waiting.
    #[error("worker stopped")]
    Stopped,

    /// Wrong arity or value type against a declared schema, a missing field,
    /// or text that is not a JSON object.
    #[error("schema violation: {0}")]
    Schema(String),

    /// A structurally valid message that breaks the exchange rules
    /// (unexpected kind, mismatched responding id, rejected handshake, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Received file does not have the declared size.
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Received file does not have the declared SHA-256 digest.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Filesystem errors from the file-transfer path. Socket I/O is mapped
    /// to `Timeout` / `ConnectionLost` before it reaches callers.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that end the current connection session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::Stopped)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
