//! saftbus Protocol - Wire protocol between the broker and its clients
//!
//! This crate provides:
//! - `message` - request, reply and signal message types
//! - `frame` - length-prefixed framing over the control socket
//! - `fdpass` - descriptor passing over local sockets and signal pipes
//! - `rendezvous` - exchange of the private control socket
//! - `version` - protocol version negotiation

pub mod error;
pub mod fdpass;
pub mod frame;
pub mod message;
pub mod rendezvous;
pub mod version;

pub use error::ProtocolError;
pub use fdpass::{recv_with_fds, send_with_fd, set_nonblocking, signal_pipe};
pub use frame::{
    encode_signal_frame, read_full, read_signal_frame, write_full, FrameCodec, FramedSocket,
    SignalFrameCodec, Transfer, MAX_FRAME_SIZE, SIGNAL_FRAME_KIND,
};
pub use message::{
    CallEnvelope, ChannelSummary, ClientSummary, FlightTimeHistogram, Handshake, ObjectListing,
    ObjectSummary, PropertyGet, PropertySet, Reply, Request, SignalMessage, StateDump,
    SubscriptionSummary, PROPERTY_GET, PROPERTY_SET,
};
pub use rendezvous::{accept_private, connect_private};
pub use version::ProtocolVersion;

/// Environment variable naming an alternate rendezvous socket path.
pub const SOCKET_PATH_ENV: &str = "SAFTBUS_SOCKET_PATH";

/// Default rendezvous socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/saftbus.sock";

/// Returns the rendezvous socket path, honoring [`SOCKET_PATH_ENV`].
pub fn socket_path_from_env() -> std::path::PathBuf {
    std::env::var_os(SOCKET_PATH_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_SOCKET_PATH))
}
