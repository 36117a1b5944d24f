//! Private control socket exchange.
//!
//! Clients never talk over the public rendezvous socket. Instead each client
//! creates a socket pair, passes one end to the broker over the rendezvous
//! socket and keeps the other as its private control socket:
//!
//! ```text
//!   client                                   broker
//!     |  connect(/tmp/saftbus.sock)            |
//!     |--------------------------------------->|
//!     |  1 byte + SCM_RIGHTS(peer end)         |
//!     |--------------------------------------->|  accept_private()
//!     |                                        |
//!     |<======= private control socket =======>|
//! ```

use std::os::fd::AsFd;
use std::path::Path;

use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::ProtocolError;
use crate::fdpass::{recv_with_fds, send_with_fd};

/// Byte that carries the descriptor.
const RENDEZVOUS_BYTE: u8 = b'S';

/// Connects to the rendezvous socket at `path` and returns the client's end
/// of a fresh private control socket.
pub async fn connect_private(path: &Path) -> Result<UnixStream, ProtocolError> {
    let public = UnixStream::connect(path).await?;
    let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;

    let sent = public
        .async_io(Interest::WRITABLE, || {
            send_with_fd(public.as_fd(), &[RENDEZVOUS_BYTE], Some(theirs.as_fd()))
        })
        .await?;
    if sent == 0 {
        return Err(ProtocolError::Closed);
    }
    drop(theirs);

    ours.set_nonblocking(true)?;
    Ok(UnixStream::from_std(ours)?)
}

/// Receives a private control socket on an accepted rendezvous connection.
///
/// Fails with [`ProtocolError::MissingDescriptor`] if the peer sent bytes
/// without a descriptor. Extra descriptors are closed.
pub async fn accept_private(public: &UnixStream) -> Result<UnixStream, ProtocolError> {
    let mut byte = [0u8; 1];
    let mut fds = Vec::new();
    let n = public
        .async_io(Interest::READABLE, || {
            recv_with_fds(public.as_fd(), &mut byte, &mut fds)
        })
        .await?;

    let mut fds = fds.into_iter();
    let Some(fd) = fds.next() else {
        return Err(if n == 0 {
            ProtocolError::Closed
        } else {
            ProtocolError::MissingDescriptor
        });
    };

    let private = std::os::unix::net::UnixStream::from(fd);
    private.set_nonblocking(true)?;
    Ok(UnixStream::from_std(private)?)
}
