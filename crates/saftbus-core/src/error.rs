//! Error values that cross the wire.
//!
//! Every remote failure travels as a (kind, message) pair and is rebuilt
//! into a [`BusError`] on the receiving side. Consumers display both parts
//! verbatim and never parse the message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message carried by the error returned for a call whose cached
/// ObjectId no longer matches the current registration.
pub const STALE_OBJECT: &str = "object was replaced since lookup";

/// Message carried by the error returned when no object is registered
/// under the requested (interface, path).
pub const NO_SUCH_OBJECT: &str = "no such object";

/// Error taxonomy shared by broker and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The arguments of a call were rejected by the callee.
    InvalidArgs,
    /// The caller is not allowed to perform the operation.
    AccessDenied,
    /// Generic failure.
    Failed,
    /// An I/O operation failed.
    IoError,
}

impl ErrorKind {
    /// Stable name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgs => "InvalidArgs",
            Self::AccessDenied => "AccessDenied",
            Self::Failed => "Failed",
            Self::IoError => "IoError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, message) error value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    /// The error returned for a call made with a replaced ObjectId.
    pub fn stale_object() -> Self {
        Self::failed(STALE_OBJECT)
    }

    /// The error returned when nothing is registered under a path.
    pub fn no_such_object() -> Self {
        Self::failed(NO_SUCH_OBJECT)
    }

    /// Returns true if this is the stale-reference error.
    pub fn is_stale_object(&self) -> bool {
        self.kind == ErrorKind::Failed && self.message == STALE_OBJECT
    }

    /// Returns true if this is the object-not-found error.
    pub fn is_no_such_object(&self) -> bool {
        self.kind == ErrorKind::Failed && self.message == NO_SUCH_OBJECT
    }
}

impl From<crate::wire::WireError> for BusError {
    fn from(err: crate::wire::WireError) -> Self {
        Self::failed(format!("protocol error: {err}"))
    }
}

/// Result type for operations that fail with a [`BusError`].
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{from_bytes, to_bytes, WireError};

    #[test]
    fn test_bus_error_display() {
        let err = BusError::invalid_args("by must be positive");
        assert_eq!(err.to_string(), "InvalidArgs: by must be positive");
    }

    #[test]
    fn test_stale_distinct_from_not_found() {
        let stale = BusError::stale_object();
        let missing = BusError::no_such_object();
        assert_eq!(stale.kind, ErrorKind::Failed);
        assert_eq!(missing.kind, ErrorKind::Failed);
        assert_ne!(stale.message, missing.message);
        assert!(stale.is_stale_object());
        assert!(!stale.is_no_such_object());
        assert!(missing.is_no_such_object());
    }

    #[test]
    fn test_wire_error_becomes_failed() {
        let err: BusError = WireError::UnexpectedEnd {
            needed: 4,
            remaining: 1,
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.message.starts_with("protocol error:"));
    }

    #[test]
    fn test_bus_error_travels_over_wire() {
        let err = BusError::access_denied("already owned by client-4");
        let bytes = to_bytes(&err).unwrap();
        let back: BusError = from_bytes(&bytes).unwrap();
        assert_eq!(back, err);
    }
}
