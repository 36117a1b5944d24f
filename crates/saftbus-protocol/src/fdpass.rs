//! File descriptor passing over local stream sockets.
//!
//! The broker receives two kinds of descriptors: the client's end of a
//! private control socket (once per client, on the rendezvous socket) and
//! the write end of a signal pipe (once per proxy, on the control socket).
//! Both travel as `SCM_RIGHTS` ancillary data attached to ordinary bytes.
//!
//! These functions perform exactly one `sendmsg`/`recvmsg` call and report
//! `WouldBlock` unchanged, so they can be driven by tokio's readiness API:
//!
//! ```text
//! stream.async_io(Interest::READABLE, || recv_with_fds(stream.as_fd(), &mut buf, &mut fds))
//! ```
//!
//! # Safety
//!
//! All unsafe code in this module is confined to building `msghdr` values
//! on the stack. Received descriptors are wrapped in `OwnedFd` immediately,
//! so they are closed even if the caller drops them unused.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use tracing::warn;

/// Control buffer size in 8-byte words. Room for a dozen descriptors, far
/// more than any single message carries.
const CMSG_BUFFER_WORDS: usize = 8;

/// Sends `data` with an optional descriptor attached to its first byte.
///
/// Returns the number of payload bytes written, which may be short.
/// Never raises `SIGPIPE`; a closed peer surfaces as `BrokenPipe`.
pub fn send_with_fd(
    socket: BorrowedFd<'_>,
    data: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_BUFFER_WORDS];

    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        let fd_len = mem::size_of::<RawFd>() as libc::c_uint;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(fd_len) } as usize;
        if space > mem::size_of_val(&cmsg_buf) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control buffer too small",
            ));
        }
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at a live, aligned buffer of at least
        // `space` bytes, so the first header and its data fit.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no room for control header",
                ));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
        }
    }

    // SAFETY: every pointer in msg refers to locals that outlive the call.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Receives bytes into `buf`, appending any passed descriptors to `fds`.
///
/// Returns the number of payload bytes read; zero means the peer closed.
/// Received descriptors are close-on-exec.
pub fn recv_with_fds(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_BUFFER_WORDS];

    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

    // SAFETY: every pointer in msg refers to locals that outlive the call.
    let received =
        unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!("ancillary data truncated, some descriptors were dropped");
    }

    // SAFETY: the kernel filled msg_control with well-formed headers and
    // msg_controllen bounds them; CMSG_NXTHDR returns null past the end.
    unsafe {
        let header_len = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..payload / mem::size_of::<RawFd>() {
                    let raw = ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(received as usize)
}

/// Creates a signal pipe, returning `(read_end, write_end)`.
///
/// Both ends are non-blocking and close-on-exec.
pub fn signal_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut raw: [RawFd; 2] = [-1, -1];
    // SAFETY: pipe2 writes two descriptors into the array on success.
    let rc = unsafe { libc::pipe2(raw.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success both descriptors are open and owned by nobody else.
    let ends = unsafe { (OwnedFd::from_raw_fd(raw[0]), OwnedFd::from_raw_fd(raw[1])) };
    Ok(ends)
}

/// Puts a descriptor received from a peer into non-blocking mode.
///
/// The sender is expected to have done this already; the broker does not
/// rely on it.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fcntl on a valid borrowed descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_pass_pipe_write_end() {
        let (a, b) = UnixStream::pair().unwrap();
        let (read_end, write_end) = signal_pipe().unwrap();

        let sent = send_with_fd(a.as_fd(), b"x", Some(write_end.as_fd())).unwrap();
        assert_eq!(sent, 1);
        drop(write_end);

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
        assert_eq!(fds.len(), 1);

        // the received descriptor writes into the original pipe
        let mut writer = File::from(fds.pop().unwrap());
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = File::from(read_end);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ping");
    }

    #[test]
    fn test_plain_bytes_carry_no_descriptor() {
        let (a, b) = UnixStream::pair().unwrap();
        send_with_fd(a.as_fd(), b"hello", None).unwrap();

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn test_recv_reports_peer_close() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        assert_eq!(recv_with_fds(b.as_fd(), &mut buf, &mut fds).unwrap(), 0);
    }

    #[test]
    fn test_send_to_closed_peer_is_broken_pipe() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let err = send_with_fd(a.as_fd(), b"x", None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_signal_pipe_is_nonblocking() {
        let (read_end, _write_end) = signal_pipe().unwrap();
        let mut reader = File::from(read_end);
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_set_nonblocking_is_idempotent() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_fd()).unwrap();
        set_nonblocking(a.as_fd()).unwrap();
        let mut buf = [0u8; 1];
        let err = (&a).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
