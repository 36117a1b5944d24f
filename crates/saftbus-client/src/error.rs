//! Error types for the client link.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use saftbus_core::{BusError, ErrorKind, WireError};
use saftbus_protocol::ProtocolError;

/// Client link errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The rendezvous socket could not be reached.
    #[error("Failed to connect to broker at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },

    /// The broker refused the handshake.
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    /// The remote object answered with an error.
    #[error(transparent)]
    Remote(#[from] BusError),

    /// Transport failure on the control socket.
    #[error("Transport error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A value could not be encoded, or a reply could not be decoded.
    #[error("Codec error: {0}")]
    Wire(#[from] WireError),

    /// No reply within the configured call timeout.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// An earlier failure left the control socket out of step.
    #[error("Connection is unusable after an earlier transport failure")]
    Poisoned,

    /// A signal arrived on a channel that belongs to another object.
    #[error("Signal for {got_interface} at {got_path} on channel of {interface} at {path}")]
    SignalMismatch {
        path: String,
        interface: String,
        got_path: String,
        got_interface: String,
    },

    /// The proxy was created without a signal channel.
    #[error("Proxy has no signal channel")]
    NoSignalChannel,

    /// The broker closed the signal channel.
    #[error("Signal channel closed by broker")]
    SignalChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Error kind as seen by callers that only care about the bus taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(e) => e.kind,
            Self::Io(_) | Self::Connect { .. } => ErrorKind::IoError,
            _ => ErrorKind::Failed,
        }
    }

    /// Returns the remote error, if this is one.
    pub fn as_remote(&self) -> Option<&BusError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if the cached ObjectId was replaced since lookup.
    pub fn is_stale_object(&self) -> bool {
        self.as_remote().is_some_and(BusError::is_stale_object)
    }

    /// Returns true if nothing is registered under the target.
    pub fn is_no_such_object(&self) -> bool {
        self.as_remote().is_some_and(BusError::is_no_such_object)
    }

    /// Errors after which the control socket can no longer be trusted.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Wire(_) | Self::Timeout(_))
    }
}

impl From<ClientError> for BusError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote(e) => e,
            other => BusError::new(other.kind(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
