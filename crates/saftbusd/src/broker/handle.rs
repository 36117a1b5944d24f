//! Client interface for interacting with the BrokerActor.
//!
//! The `BrokerHandle` is a cheap-to-clone interface used by connection
//! handlers, the daemon binary and in-process services.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `BrokerError::ChannelClosed`

use std::os::fd::OwnedFd;

use tokio::sync::{mpsc, oneshot};

use saftbus_core::{ClientId, ObjectId, ProxyId};
use saftbus_protocol::{CallEnvelope, FlightTimeHistogram, ObjectListing, Reply, StateDump};

use super::commands::{BrokerCommand, BrokerError};
use crate::service::ServiceObject;

// ============================================================================
// Broker Handle
// ============================================================================

/// Handle for interacting with the broker actor.
///
/// ```ignore
/// let handle = spawn_broker(BrokerOptions::default());
/// let id = handle.register_object("demo.Counter", "/demo/counter", Counter::new()).await?;
/// let listing = handle.list_objects().await;
/// ```
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(sender: mpsc::Sender<BrokerCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    /// Allocates a ClientId for a connection that completed its handshake.
    ///
    /// # Errors
    ///
    /// - `BrokerError::TooManyClients` if the client limit is reached
    /// - `BrokerError::ChannelClosed` if the actor has shut down
    pub async fn client_connected(&self) -> Result<ClientId, BrokerError> {
        self.request(|respond_to| BrokerCommand::Connect { respond_to })
            .await?
    }

    /// Runs the disconnect cleanup for `client` and waits for it to finish.
    pub async fn client_disconnected(&self, client: ClientId) {
        let _ = self
            .request(|tx| BrokerCommand::Disconnect {
                client,
                respond_to: Some(tx),
            })
            .await;
    }

    /// Registers an in-process object under (interface, path).
    ///
    /// # Errors
    ///
    /// - `BrokerError::Bus` with invalid-args for malformed names
    /// - `BrokerError::ChannelClosed` if the actor has shut down
    pub async fn register_object(
        &self,
        interface: impl Into<String>,
        path: impl Into<String>,
        object: impl ServiceObject,
    ) -> Result<ObjectId, BrokerError> {
        let interface = interface.into();
        let path = path.into();
        let object: Box<dyn ServiceObject> = Box::new(object);
        Ok(self
            .request(|respond_to| BrokerCommand::Register {
                interface,
                path,
                object,
                respond_to,
            })
            .await??)
    }

    /// # Errors
    ///
    /// - `BrokerError::Bus` with the no-such-object error if `object_id` is unknown
    /// - `BrokerError::ChannelClosed` if the actor has shut down
    pub async fn unregister_object(&self, object_id: ObjectId) -> Result<(), BrokerError> {
        Ok(self
            .request(|respond_to| BrokerCommand::Unregister {
                object_id,
                respond_to,
            })
            .await??)
    }

    /// Dispatches a call on behalf of `client`.
    pub async fn call(&self, client: ClientId, envelope: CallEnvelope) -> Reply {
        self.request(|respond_to| BrokerCommand::Call {
            client,
            envelope,
            respond_to,
        })
        .await
        .unwrap_or_else(|e| Reply::Error(e.into()))
    }

    pub async fn lookup(
        &self,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<ObjectId, BrokerError> {
        let (path, interface) = (path.into(), interface.into());
        Ok(self
            .request(|respond_to| BrokerCommand::Lookup {
                path,
                interface,
                respond_to,
            })
            .await??)
    }

    pub async fn introspect(
        &self,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<String, BrokerError> {
        let (path, interface) = (path.into(), interface.into());
        Ok(self
            .request(|respond_to| BrokerCommand::Introspect {
                path,
                interface,
                respond_to,
            })
            .await??)
    }

    /// Hands the write end of a signal pipe to the broker.
    ///
    /// Returns once the channel is registered.
    pub async fn open_signal_channel(
        &self,
        client: ClientId,
        path: impl Into<String>,
        interface: impl Into<String>,
        proxy_id: ProxyId,
        writer: OwnedFd,
    ) -> Result<(), BrokerError> {
        let (path, interface) = (path.into(), interface.into());
        Ok(self
            .request(|respond_to| BrokerCommand::OpenSignalChannel {
                client,
                path,
                interface,
                proxy_id,
                writer,
                respond_to,
            })
            .await??)
    }

    /// Emits a signal from outside any object handler.
    ///
    /// Returns the number of signal channels it was written to.
    pub async fn emit_signal(
        &self,
        path: impl Into<String>,
        interface: impl Into<String>,
        name: impl Into<String>,
        args: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let (path, interface, name) = (path.into(), interface.into(), name.into());
        self.request(|tx| BrokerCommand::EmitSignal {
            path,
            interface,
            name,
            args,
            respond_to: Some(tx),
        })
        .await
    }

    /// Fire-and-forget: records one flight time sample.
    pub async fn record_flight_time(&self, micros: u64) {
        let _ = self
            .sender
            .send(BrokerCommand::RecordFlightTime { micros })
            .await;
    }

    pub async fn set_logging(&self, enabled: bool) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::SetLogging {
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn set_flight_time_tracking(&self, enabled: bool) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::SetFlightTimeTracking {
            enabled,
            respond_to,
        })
        .await
    }

    /// Snapshot of broker state. Empty if the actor has shut down.
    pub async fn dump_state(&self) -> StateDump {
        self.request(|respond_to| BrokerCommand::DumpState { respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn flight_time_histogram(&self) -> FlightTimeHistogram {
        self.request(|respond_to| BrokerCommand::FlightTimeHistogram { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Path to interfaces of every live registration. Empty if the actor has
    /// shut down.
    pub async fn list_objects(&self) -> ObjectListing {
        self.request(|respond_to| BrokerCommand::ListObjects { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Returns `true` while the command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
