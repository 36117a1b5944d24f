//! Transport and framing errors.

use std::io;

use saftbus_core::WireError;
use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed payload: {0}")]
    Wire(#[from] WireError),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("peer closed after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    /// The peer closed the stream at a frame boundary.
    #[error("connection closed")]
    Closed,

    #[error("expected a file descriptor with the message")]
    MissingDescriptor,

    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u8),
}

impl ProtocolError {
    /// Returns true if the peer went away, cleanly or mid-frame.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed | Self::Truncated { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
