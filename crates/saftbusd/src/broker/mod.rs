//! Object broker using the Actor pattern.
//!
//! The broker owns every piece of shared bus state: the object registry,
//! the (interface, path) index, the signal channels and the per-client
//! bookkeeping. Connection handlers talk to it through a [`BrokerHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  BrokerCommand   ┌──────────────────┐  signal frames  ┌───────────────┐
//! │ConnectionHandler │─────────────────▶│   BrokerActor    │────────────────▶│ signal pipes  │
//! │  (per client)    │◀─────────────────│ registry, index, │                 │ (one / proxy) │
//! └──────────────────┘  oneshot reply   │ channels, subs   │◀────────────────└───────────────┘
//!                                       └──────────────────┘   hang-up watch
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

mod actor;
mod channels;
mod commands;
mod handle;
mod registry;

pub use actor::BrokerActor;
pub use channels::ChannelKey;
pub use commands::{BrokerCommand, BrokerError};
pub use handle::BrokerHandle;
pub use registry::{ObjectRegistry, RegistryEntry};

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 256;

/// Default limit on concurrently connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 256;

/// Broker tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    pub max_clients: usize,
    /// Initial state of the flight-time stamp on emitted signals.
    pub track_flight_time: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            track_flight_time: false,
        }
    }
}

/// Spawns the broker actor and returns a handle to it.
///
/// The actor runs until every clone of the returned handle is dropped.
///
/// # Example
///
/// ```no_run
/// use saftbusd::broker::{spawn_broker, BrokerOptions};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_broker(BrokerOptions::default());
///     let objects = handle.list_objects().await;
///     assert!(objects.is_empty());
/// }
/// ```
pub fn spawn_broker(options: BrokerOptions) -> BrokerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = BrokerActor::new(cmd_rx, cmd_tx.downgrade(), options);
    tokio::spawn(actor.run());
    BrokerHandle::new(cmd_tx)
}
