//! saftbus Core - Shared types for the saftbus broker and its clients
//!
//! This crate provides the identifiers, the error taxonomy that crosses
//! the wire, object addressing rules and the schema-less wire codec.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod id;
pub mod path;
pub mod wire;

// Re-exports for convenience
pub use error::{BusError, BusResult, ErrorKind, NO_SUCH_OBJECT, STALE_OBJECT};
pub use id::{ClientId, ObjectId, ProxyId, SubscriptionId};
pub use path::{validate_interface_name, validate_object_path, PROPERTIES_INTERFACE};
pub use wire::{from_bytes, to_bytes, Reader, WireError, Writer};
