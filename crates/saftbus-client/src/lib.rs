//! saftbus client link
//!
//! - [`Connection`] - the private control socket, shared by every proxy
//! - [`Proxy`] - calls, properties and signals of one remote object
//! - [`SignalGroup`] - waits on the signal channels of many proxies
//!
//! The application creates a `Connection` once and passes it to each
//! proxy it builds:
//!
//! ```no_run
//! use saftbus_client::{ClientConfig, Connection, Proxy};
//!
//! # async fn example() -> saftbus_client::Result<()> {
//! let connection = Connection::connect(&ClientConfig::from_env()).await?;
//! let counter = Proxy::new(&connection, "/demo/counter", "demo.Counter").await?;
//!
//! let value: i32 = counter.call_value("Increment", &5i32).await?;
//! let current: i32 = counter.get_property("value").await?;
//! assert_eq!(value, current);
//! # Ok(())
//! # }
//! ```
//!
//! # Signal path
//!
//! ```text
//!   broker ──signal frame──▶ pipe ──▶ Proxy::dispatch ──▶ handlers
//!                                          ▲
//!                       SignalGroup::wait ─┘ (Auto members)
//! ```
//!
//! Signals never travel over the control socket, so a task blocked in a
//! call does not hold up signal delivery to another task.

mod connection;
mod error;
mod proxy;
mod signal_group;

pub use connection::{ClientConfig, Connection};
pub use error::{ClientError, Result};
pub use proxy::{Proxy, SignalHandler};
pub use signal_group::{DispatchMode, SignalGroup, WaitOutcome};

pub use saftbus_core::{BusError, ClientId, ErrorKind, ObjectId, ProxyId};
pub use saftbus_protocol::{FlightTimeHistogram, ObjectListing, SignalMessage, StateDump};
