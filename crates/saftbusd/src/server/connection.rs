//! Connection handler for individual client connections.
//!
//! Each client gets its own `ConnectionHandler` that:
//! - Receives the private control socket over the rendezvous connection
//! - Performs protocol version negotiation and obtains a ClientId
//! - Decodes requests and routes them to the broker
//! - Runs the broker's disconnect cleanup when the socket closes
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use saftbus_core::{from_bytes, to_bytes, BusError, ClientId, WireError};
use saftbus_protocol::{
    accept_private, FramedSocket, Handshake, ProtocolError, ProtocolVersion, Reply, Request,
};

use crate::broker::{BrokerError, BrokerHandle};

/// Time allowed for the rendezvous and the Hello exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Accepted rendezvous connection; replaced by the private socket.
    public: Option<UnixStream>,

    socket: Option<FramedSocket>,

    broker: BrokerHandle,

    /// Assigned after a successful handshake.
    client_id: Option<ClientId>,

    cancel_token: CancellationToken,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        public: UnixStream,
        broker: BrokerHandle,
        cancel_token: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            public: Some(public),
            socket: None,
            broker,
            client_id: None,
            cancel_token,
            connection_number,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Returns the ClientId the connection was assigned, if any.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New rendezvous connection");

        match timeout(HANDSHAKE_TIMEOUT, self.handle_handshake()).await {
            Ok(Ok(client_id)) => {
                self.client_id = Some(client_id);
                info!(client_id = %client_id, "Client handshake completed");
            }
            Ok(Err(e)) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
            Err(_) => {
                warn!(connection = self.connection_number, "Handshake timed out");
                return None;
            }
        }

        let client_id = self.client_id?;

        if let Err(e) = self.process_requests(client_id).await {
            debug!(client_id = %client_id, error = %e, "Connection closed with error");
        }

        self.broker.client_disconnected(client_id).await;
        Some(client_id)
    }

    /// Receives the private socket and answers the client's Hello.
    async fn handle_handshake(&mut self) -> Result<ClientId, ConnectionError> {
        let public = self.public.take().ok_or(ConnectionError::Closed)?;
        let private = accept_private(&public).await?;
        drop(public);

        let socket = self.socket.insert(FramedSocket::new(private));
        let request: Request = socket.recv_value().await?;

        let version = match request {
            Request::Hello { version } => version,
            other => {
                send_with_timeout(socket, &Handshake::rejected("expected Hello")).await?;
                return Err(ConnectionError::UnexpectedMessage(other.name().to_string()));
            }
        };

        if !version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            let reason = format!(
                "protocol version {version} not compatible with broker version {}",
                ProtocolVersion::CURRENT
            );
            send_with_timeout(socket, &Handshake::rejected(reason)).await?;
            return Err(ConnectionError::VersionMismatch {
                client: version,
                server: ProtocolVersion::CURRENT,
            });
        }

        let client_id = match self.broker.client_connected().await {
            Ok(id) => id,
            Err(e) => {
                send_with_timeout(socket, &Handshake::rejected(e.to_string())).await?;
                return Err(e.into());
            }
        };

        if let Err(e) = send_with_timeout(socket, &Handshake::accepted(client_id)).await {
            self.broker.client_disconnected(client_id).await;
            return Err(e);
        }
        Ok(client_id)
    }

    /// Request loop. Returns `Ok(())` on a clean close.
    async fn process_requests(&mut self, client_id: ClientId) -> Result<(), ConnectionError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        loop {
            let frame = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!(client_id = %client_id, "Connection cancelled by shutdown");
                    return Ok(());
                }
                frame = socket.read_frame() => frame?,
            };

            let Some(frame) = frame else {
                debug!(client_id = %client_id, "Client closed control socket");
                return Ok(());
            };

            let request: Request = from_bytes(&frame)?;
            debug!(client_id = %client_id, request = request.name(), "Received request");

            handle_request(&self.broker, socket, client_id, request).await?;

            // descriptors that arrived without an OpenSignalChannel frame
            if socket.buffered() == 0 {
                let stray = socket.discard_fds();
                if stray > 0 {
                    warn!(client_id = %client_id, count = stray, "Closed unclaimed descriptors");
                }
            }
        }
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }
}

/// Routes one request to the broker and writes its answer.
async fn handle_request(
    broker: &BrokerHandle,
    socket: &mut FramedSocket,
    client_id: ClientId,
    request: Request,
) -> Result<(), ConnectionError> {
    match request {
        Request::Hello { .. } => {
            let reply = Reply::Error(BusError::failed("already registered"));
            send_with_timeout(socket, &reply).await
        }
        Request::Call(envelope) => {
            let reply = broker.call(client_id, envelope).await;
            send_with_timeout(socket, &reply).await
        }
        Request::Lookup { path, interface } => {
            let reply = encode_result(broker.lookup(path, interface).await);
            send_with_timeout(socket, &reply).await
        }
        Request::Introspect { path, interface } => {
            let reply = encode_result(broker.introspect(path, interface).await);
            send_with_timeout(socket, &reply).await
        }
        Request::OpenSignalChannel {
            path,
            interface,
            proxy_id,
        } => {
            let reply = match socket.take_fd() {
                Some(writer) => encode_result(
                    broker
                        .open_signal_channel(client_id, path, interface, proxy_id, writer)
                        .await,
                ),
                None => Reply::Error(BusError::invalid_args(
                    "signal channel request carried no descriptor",
                )),
            };
            send_with_timeout(socket, &reply).await
        }
        Request::FlightTime { micros } => {
            broker.record_flight_time(micros).await;
            Ok(())
        }
        Request::SetLogging { enabled } => {
            broker.set_logging(enabled).await?;
            send_with_timeout(socket, &()).await
        }
        Request::SetFlightTimeTracking { enabled } => {
            broker.set_flight_time_tracking(enabled).await?;
            send_with_timeout(socket, &()).await
        }
        Request::DumpState => {
            let dump = broker.dump_state().await;
            send_with_timeout(socket, &dump).await
        }
        Request::FlightTimeHistogram => {
            let histogram = broker.flight_time_histogram().await;
            send_with_timeout(socket, &histogram).await
        }
        Request::ListObjects => {
            let listing = broker.list_objects().await;
            send_with_timeout(socket, &listing).await
        }
    }
}

/// Encodes a broker result as a reply.
fn encode_result<T: serde::Serialize>(result: Result<T, BrokerError>) -> Reply {
    match result {
        Ok(value) => match to_bytes(&value) {
            Ok(bytes) => Reply::Return(bytes),
            Err(e) => Reply::Error(e.into()),
        },
        Err(e) => Reply::Error(e.into()),
    }
}

async fn send_with_timeout<T: serde::Serialize + ?Sized>(
    socket: &mut FramedSocket,
    value: &T,
) -> Result<(), ConnectionError> {
    match timeout(WRITE_TIMEOUT, socket.send_value(value)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, broker {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Malformed request: {0}")]
    Decode(#[from] WireError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Connection closed")]
    Closed,

    #[error("Write timeout")]
    WriteTimeout,
}
