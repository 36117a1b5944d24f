//! Broker actor commands and errors.
//!
//! Each request-style command carries a oneshot `respond_to` channel; the
//! actor answers after the command has been applied in full, so a caller
//! that got its response can rely on the broker state it implies.

use std::os::fd::OwnedFd;

use thiserror::Error;
use tokio::sync::oneshot;

use saftbus_core::{BusError, ClientId, ObjectId, ProxyId};
use saftbus_protocol::{CallEnvelope, FlightTimeHistogram, ObjectListing, Reply, StateDump};

use super::channels::ChannelKey;
use crate::service::ServiceObject;

// ============================================================================
// Broker Commands
// ============================================================================

/// Commands sent to the broker actor.
pub enum BrokerCommand {
    /// A client finished its handshake and needs a ClientId.
    ///
    /// # Errors
    /// - `BrokerError::TooManyClients` if the client limit is reached
    Connect {
        respond_to: oneshot::Sender<Result<ClientId, BrokerError>>,
    },

    /// A client's control socket closed. Runs the disconnect cleanup.
    Disconnect {
        client: ClientId,
        respond_to: Option<oneshot::Sender<()>>,
    },

    /// Register an object under (interface, path).
    Register {
        interface: String,
        path: String,
        object: Box<dyn ServiceObject>,
        respond_to: oneshot::Sender<Result<ObjectId, BusError>>,
    },

    /// Remove a registry entry.
    Unregister {
        object_id: ObjectId,
        respond_to: oneshot::Sender<Result<(), BusError>>,
    },

    /// Dispatch a method call or property access.
    Call {
        client: ClientId,
        envelope: CallEnvelope,
        respond_to: oneshot::Sender<Reply>,
    },

    /// Resolve (interface, path) to the current ObjectId.
    Lookup {
        path: String,
        interface: String,
        respond_to: oneshot::Sender<Result<ObjectId, BusError>>,
    },

    /// Fetch an object's introspection document.
    Introspect {
        path: String,
        interface: String,
        respond_to: oneshot::Sender<Result<String, BusError>>,
    },

    /// Adopt the write end of a client's signal pipe.
    ///
    /// The response is sent only once the channel is registered, so every
    /// signal emitted afterwards reaches it.
    OpenSignalChannel {
        client: ClientId,
        path: String,
        interface: String,
        proxy_id: ProxyId,
        writer: OwnedFd,
        respond_to: oneshot::Sender<Result<(), BusError>>,
    },

    /// The reader of a signal channel went away.
    ChannelHungUp { key: ChannelKey },

    /// Emit a signal from outside any handler. Responds with the number of
    /// channels it was written to.
    EmitSignal {
        path: String,
        interface: String,
        name: String,
        args: Vec<u8>,
        respond_to: Option<oneshot::Sender<usize>>,
    },

    /// One-way flight time report from a client.
    RecordFlightTime { micros: u64 },

    SetLogging {
        enabled: bool,
        respond_to: oneshot::Sender<()>,
    },

    SetFlightTimeTracking {
        enabled: bool,
        respond_to: oneshot::Sender<()>,
    },

    DumpState {
        respond_to: oneshot::Sender<StateDump>,
    },

    FlightTimeHistogram {
        respond_to: oneshot::Sender<FlightTimeHistogram>,
    },

    ListObjects {
        respond_to: oneshot::Sender<ObjectListing>,
    },
}

impl BrokerCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Call { .. } => "call",
            Self::Lookup { .. } => "lookup",
            Self::Introspect { .. } => "introspect",
            Self::OpenSignalChannel { .. } => "open_signal_channel",
            Self::ChannelHungUp { .. } => "channel_hung_up",
            Self::EmitSignal { .. } => "emit_signal",
            Self::RecordFlightTime { .. } => "record_flight_time",
            Self::SetLogging { .. } => "set_logging",
            Self::SetFlightTimeTracking { .. } => "set_flight_time_tracking",
            Self::DumpState { .. } => "dump_state",
            Self::FlightTimeHistogram { .. } => "flight_time_histogram",
            Self::ListObjects { .. } => "list_objects",
        }
    }
}

impl std::fmt::Debug for BrokerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Broker Errors
// ============================================================================

/// Errors returned by [`super::BrokerHandle`].
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker already serves its maximum number of clients.
    #[error("too many clients (max: {max})")]
    TooManyClients { max: usize },

    /// The broker rejected the operation.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The actor has shut down.
    #[error("broker channel closed")]
    ChannelClosed,
}

impl From<BrokerError> for BusError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Bus(e) => e,
            other => BusError::failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::TooManyClients { max: 2 };
        assert_eq!(err.to_string(), "too many clients (max: 2)");

        let err = BrokerError::Bus(BusError::stale_object());
        assert_eq!(err.to_string(), "Failed: object was replaced since lookup");

        assert_eq!(BrokerError::ChannelClosed.to_string(), "broker channel closed");
    }

    #[test]
    fn test_bus_error_passes_through() {
        let bus: BusError = BrokerError::Bus(BusError::no_such_object()).into();
        assert!(bus.is_no_such_object());

        let bus: BusError = BrokerError::ChannelClosed.into();
        assert_eq!(bus.kind, saftbus_core::ErrorKind::Failed);
    }

    #[test]
    fn test_command_names() {
        let (tx, _rx) = oneshot::channel();
        let cmd = BrokerCommand::DumpState { respond_to: tx };
        assert_eq!(cmd.name(), "dump_state");
        assert_eq!(format!("{cmd:?}"), "dump_state");
        assert_eq!(BrokerCommand::RecordFlightTime { micros: 1 }.name(), "record_flight_time");
    }
}
