//! Unix socket server for the broker.
//!
//! The server:
//! - Listens on the public rendezvous socket
//! - Spawns a ConnectionHandler for each accepted connection
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    BusServer    │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  private socket  ┌─────────────────┐
//! │ConnectionHandler│─────────────────▶│  BrokerHandle   │
//! │   (per client)  │                  │                 │
//! └─────────────────┘                  └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, HANDSHAKE_TIMEOUT};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerHandle;
use crate::config::{BrokerConfig, DEFAULT_SOCKET_MODE};

/// Unix socket server for the broker.
pub struct BusServer {
    socket_path: PathBuf,

    /// Permission bits applied to the socket after bind.
    socket_mode: u32,

    broker: BrokerHandle,

    cancel_token: CancellationToken,

    connection_counter: AtomicU64,
}

impl BusServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        broker: BrokerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            socket_mode: DEFAULT_SOCKET_MODE,
            broker,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Creates a server for the socket described by `config`.
    pub fn from_config(
        config: &BrokerConfig,
        broker: BrokerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self::new(&config.socket_path, broker, cancel_token).with_socket_mode(config.socket_mode)
    }

    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(
            socket = %self.socket_path.display(),
            mode = %format!("{:#o}", self.socket_mode),
            "Broker listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        // stale socket from a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(setup_error)?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(self.socket_mode),
        )
        .map_err(setup_error)?;

        Ok(listener)
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let handler = ConnectionHandler::new(
            stream,
            self.broker.clone(),
            self.cancel_token.child_token(),
            connection_number,
        );

        tokio::spawn(async move {
            if let Some(client_id) = handler.run().await {
                debug!(client_id = %client_id, "Connection task finished");
            }
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
