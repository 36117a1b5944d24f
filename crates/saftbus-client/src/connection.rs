//! Control connection to the broker.
//!
//! A [`Connection`] owns one private control socket. Requests and replies
//! are strictly paired: the socket sits behind an async mutex that is held
//! from writing a request until its reply has been read, so concurrent
//! callers sharing a connection never see each other's replies.
//!
//! The connection is created explicitly by the application and cloned into
//! every [`Proxy`]; there is no process-wide instance.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use saftbus_core::{from_bytes, to_bytes, ClientId, ObjectId, ProxyId};
use saftbus_protocol::{
    connect_private, socket_path_from_env, FlightTimeHistogram, FramedSocket, Handshake,
    ObjectListing, ProtocolVersion, Reply, Request, StateDump,
};

use crate::error::{ClientError, Result};
use crate::proxy::Proxy;

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings.
///
/// ```rust
/// use saftbus_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     call_timeout: Some(Duration::from_secs(5)),
///     ..ClientConfig::from_env()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Rendezvous socket of the broker.
    pub socket_path: PathBuf,

    /// Upper bound on one request/reply exchange. `None` waits forever.
    ///
    /// A timed-out exchange poisons the connection: the late reply would
    /// otherwise be read as the answer to the next request.
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ClientConfig {
    /// Settings from `SAFTBUS_SOCKET_PATH` (or the default path), no timeout.
    pub fn from_env() -> Self {
        Self {
            socket_path: socket_path_from_env(),
            call_timeout: None,
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Shared handle to one control socket. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Mutex<FramedSocket>,
    client_id: ClientId,
    broker_version: ProtocolVersion,
    call_timeout: Option<Duration>,
    next_proxy: AtomicU64,
    poisoned: AtomicBool,
}

impl Connection {
    /// Connects to the broker and performs the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::Connect` if the rendezvous socket is unreachable
    /// - `ClientError::Rejected` if the broker refuses the client
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = connect_private(&config.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: config.socket_path.clone(),
                source,
            })?;
        let mut socket = FramedSocket::new(stream);

        let handshake = async {
            socket.send_value(&Request::hello()).await?;
            socket.recv_value::<Handshake>().await
        };
        let handshake = match config.call_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_| ClientError::Timeout(limit))??,
            None => handshake.await?,
        };

        let (client_id, broker_version) = match handshake {
            Handshake::Accepted { version, client_id } => (client_id, version),
            Handshake::Rejected { reason, version } => {
                warn!(broker_version = %version, reason = %reason, "Broker rejected handshake");
                return Err(ClientError::Rejected(reason));
            }
        };

        info!(
            client_id = %client_id,
            broker_version = %broker_version,
            socket = %config.socket_path.display(),
            "Connected to broker"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                socket: Mutex::new(socket),
                client_id,
                broker_version,
                call_timeout: config.call_timeout,
                next_proxy: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
            }),
        })
    }

    /// Connects using [`ClientConfig::from_env`].
    pub async fn connect_default() -> Result<Self> {
        Self::connect(&ClientConfig::from_env()).await
    }

    /// Identity the broker assigned to this connection.
    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn broker_version(&self) -> ProtocolVersion {
        self.inner.broker_version
    }

    /// Returns true once a transport failure or timeout made the socket
    /// unusable. Every further request fails with `ClientError::Poisoned`.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    /// Allocates a process-unique proxy id.
    pub(crate) fn next_proxy_id(&self) -> ProxyId {
        ProxyId::new(self.inner.next_proxy.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Creates a proxy with a signal channel for the object at (path, interface).
    pub async fn proxy(&self, path: &str, interface: &str) -> Result<Proxy> {
        Proxy::new(self, path, interface).await
    }

    // ========================================================================
    // Exchanges
    // ========================================================================

    /// Sends `request` and waits for its reply.
    pub async fn request<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        self.exchange(request, None).await
    }

    /// Sends `request` with `fd` attached and waits for its reply.
    pub(crate) async fn request_with_fd<T: DeserializeOwned>(
        &self,
        request: &Request,
        fd: BorrowedFd<'_>,
    ) -> Result<T> {
        self.exchange(request, Some(fd)).await
    }

    /// Sends a request that has no reply.
    pub async fn send_oneway(&self, request: &Request) -> Result<()> {
        self.check_poisoned()?;
        let mut socket = self.inner.socket.lock().await;
        let result = socket.send_value(request).await.map_err(ClientError::from);
        self.poison_on(&result);
        result
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        request: &Request,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<T> {
        self.check_poisoned()?;
        let mut socket = self.inner.socket.lock().await;

        let roundtrip = async {
            let bytes = to_bytes(request)?;
            match fd {
                Some(fd) => socket.write_frame_with_fd(&bytes, fd).await?,
                None => socket.write_frame(&bytes).await?,
            }
            Ok::<T, ClientError>(socket.recv_value::<T>().await?)
        };

        let result = match self.inner.call_timeout {
            Some(limit) => match timeout(limit, roundtrip).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(limit)),
            },
            None => roundtrip.await,
        };

        self.poison_on(&result);
        debug!(
            client_id = %self.inner.client_id,
            request = request.name(),
            ok = result.is_ok(),
            "Request completed"
        );
        result
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(ClientError::Poisoned);
        }
        Ok(())
    }

    fn poison_on<T>(&self, result: &Result<T>) {
        if let Err(e) = result {
            if e.poisons_connection() && !self.inner.poisoned.swap(true, Ordering::AcqRel) {
                warn!(client_id = %self.inner.client_id, error = %e, "Control connection poisoned");
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Resolves (path, interface) to the current ObjectId.
    pub async fn lookup(&self, path: &str, interface: &str) -> Result<ObjectId> {
        let reply: Reply = self.request(&Request::lookup(path, interface)).await?;
        Ok(from_bytes(&reply.into_result()?)?)
    }

    /// Fetches the introspection document of (path, interface).
    pub async fn introspect(&self, path: &str, interface: &str) -> Result<String> {
        let reply: Reply = self.request(&Request::introspect(path, interface)).await?;
        Ok(from_bytes(&reply.into_result()?)?)
    }

    /// Reports a measured signal flight time. No reply.
    pub async fn report_flight_time(&self, micros: u64) -> Result<()> {
        self.send_oneway(&Request::FlightTime { micros }).await
    }

    pub async fn list_objects(&self) -> Result<ObjectListing> {
        self.request(&Request::ListObjects).await
    }

    pub async fn dump_state(&self) -> Result<StateDump> {
        self.request(&Request::DumpState).await
    }

    pub async fn flight_time_histogram(&self) -> Result<FlightTimeHistogram> {
        self.request(&Request::FlightTimeHistogram).await
    }

    pub async fn set_logging(&self, enabled: bool) -> Result<()> {
        self.request(&Request::SetLogging { enabled }).await
    }

    pub async fn set_flight_time_tracking(&self, enabled: bool) -> Result<()> {
        self.request(&Request::SetFlightTimeTracking { enabled })
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.inner.client_id)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
