//! Codec errors.

use std::fmt::Display;
use thiserror::Error;

/// Errors raised while encoding or decoding wire values.
///
/// A decode error always means the two ends disagree about the shape of a
/// payload. It is fatal for the message being decoded, never for the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("invalid bool byte: {0}")]
    InvalidBool(u8),

    #[error("invalid option tag: {0}")]
    InvalidOptionTag(u8),

    #[error("invalid char value: {0:#x}")]
    InvalidChar(u32),

    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("length {0} does not fit the 32-bit length header")]
    LengthOverflow(usize),

    #[error("sequence elements overran their byte count")]
    SequenceOverrun,

    /// A non-empty sequence whose elements encode to nothing, such as
    /// `vec![(), ()]`. It would decode as an empty sequence.
    #[error("sequence of {0} zero-sized elements cannot be encoded")]
    ZeroSizedElements(usize),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("{0} is not supported by the wire format")]
    Unsupported(&'static str),

    #[error("{0}")]
    Message(String),
}

impl serde::ser::Error for WireError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }
}

impl serde::de::Error for WireError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }
}
