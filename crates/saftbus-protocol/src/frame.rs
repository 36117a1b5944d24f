//! Length-prefixed framing.
//!
//! Control-socket frame:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length LE)   |  (payload)       |
//! +----------------+------------------+
//! ```
//!
//! Signal-pipe frame:
//! ```text
//! +--------+----------------+-----------------------+
//! | 1 byte |  4 bytes       |  N bytes              |
//! | kind   |  (length LE)   |  (SignalMessage)      |
//! +--------+----------------+-----------------------+
//! ```
//!
//! [`FramedSocket`] always reads with `recvmsg`, so descriptors sent along
//! with a frame are never discarded by a plain `read`.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder};

use saftbus_core::wire;

use crate::error::ProtocolError;
use crate::fdpass::{recv_with_fds, send_with_fd};
use crate::message::SignalMessage;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest single write issued to the transport.
pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Kind byte of a signal frame on a signal pipe.
pub const SIGNAL_FRAME_KIND: u8 = 1;

const READ_CHUNK_SIZE: usize = 8 * 1024;

// ============================================================================
// Codec
// ============================================================================

/// Codec for length-prefixed control-socket frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    current_length: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(expected, received)` byte counts of a partially read frame,
    /// or `None` at a frame boundary.
    fn partial(&self, buffered: usize) -> Option<(usize, usize)> {
        match self.current_length {
            Some(len) => Some((LENGTH_PREFIX_SIZE + len, LENGTH_PREFIX_SIZE + buffered)),
            None if buffered > 0 => Some((LENGTH_PREFIX_SIZE, buffered)),
            None => None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32_le() as usize;

            if len > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.current_length = None;
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = checked_frame_len(item.len())?;
        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32_le(len);
        dst.put_slice(item);
        Ok(())
    }
}

fn checked_frame_len(size: usize) -> Result<u32, ProtocolError> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
        size,
        max: MAX_FRAME_SIZE,
    })
}

// ============================================================================
// Full transfers
// ============================================================================

/// Outcome of a full read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Every requested byte was transferred.
    Complete,
    /// The peer closed after `transferred` bytes.
    Closed { transferred: usize },
}

/// Reads until `buf` is full or the peer closes.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<Transfer>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while let Some(rest) = buf.get_mut(filled..).filter(|rest| !rest.is_empty()) {
        let n = reader.read(rest).await?;
        if n == 0 {
            return Ok(Transfer::Closed { transferred: filled });
        }
        filled += n;
    }
    Ok(Transfer::Complete)
}

/// Writes all of `data` in chunks of at most [`WRITE_CHUNK_SIZE`].
pub async fn write_full<W>(writer: &mut W, data: &[u8]) -> io::Result<Transfer>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    for chunk in data.chunks(WRITE_CHUNK_SIZE) {
        let mut offset = 0;
        while let Some(rest) = chunk.get(offset..).filter(|rest| !rest.is_empty()) {
            let n = writer.write(rest).await?;
            if n == 0 {
                return Ok(Transfer::Closed {
                    transferred: written + offset,
                });
            }
            offset += n;
        }
        written += chunk.len();
    }
    writer.flush().await?;
    Ok(Transfer::Complete)
}

// ============================================================================
// Framed control socket
// ============================================================================

/// A control socket that reads and writes whole frames.
///
/// Descriptors received alongside frames are queued and handed out in
/// arrival order by [`FramedSocket::take_fd`].
#[derive(Debug)]
pub struct FramedSocket {
    stream: UnixStream,
    codec: FrameCodec,
    read_buf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

impl FramedSocket {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            fds: VecDeque::new(),
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }

    /// Reads the next frame payload.
    ///
    /// Returns `Ok(None)` if the peer closed at a frame boundary and
    /// [`ProtocolError::Truncated`] if it closed inside a frame.
    pub async fn read_frame(&mut self) -> Result<Option<BytesMut>, ProtocolError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.recv_chunk(&mut chunk).await?;
            if n == 0 {
                return match self.codec.partial(self.read_buf.len()) {
                    None => Ok(None),
                    Some((expected, received)) => {
                        Err(ProtocolError::Truncated { expected, received })
                    }
                };
            }
            self.read_buf
                .extend_from_slice(chunk.get(..n).unwrap_or_default());
        }
    }

    async fn recv_chunk(&mut self, chunk: &mut [u8]) -> io::Result<usize> {
        let stream = &self.stream;
        let mut received = Vec::new();
        let n = stream
            .async_io(Interest::READABLE, || {
                recv_with_fds(stream.as_fd(), chunk, &mut received)
            })
            .await?;
        self.fds.extend(received);
        Ok(n)
    }

    /// Writes one frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut out = BytesMut::new();
        self.codec.encode(payload, &mut out)?;
        match write_full(&mut self.stream, &out).await? {
            Transfer::Complete => Ok(()),
            Transfer::Closed { .. } => Err(ProtocolError::Closed),
        }
    }

    /// Writes one frame with `fd` attached to its first byte.
    pub async fn write_frame_with_fd(
        &mut self,
        payload: &[u8],
        fd: BorrowedFd<'_>,
    ) -> Result<(), ProtocolError> {
        let mut out = BytesMut::new();
        self.codec.encode(payload, &mut out)?;

        let first = out.len().min(WRITE_CHUNK_SIZE);
        let head = out.get(..first).unwrap_or_default();
        let stream = &self.stream;
        let sent = stream
            .async_io(Interest::WRITABLE, || {
                send_with_fd(stream.as_fd(), head, Some(fd))
            })
            .await?;
        if sent == 0 {
            return Err(ProtocolError::Closed);
        }

        let rest = out.get(sent..).unwrap_or_default();
        match write_full(&mut self.stream, rest).await? {
            Transfer::Complete => Ok(()),
            Transfer::Closed { .. } => Err(ProtocolError::Closed),
        }
    }

    /// Pops the oldest received descriptor.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Number of received bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Closes any descriptors nobody claimed.
    pub fn discard_fds(&mut self) -> usize {
        let count = self.fds.len();
        self.fds.clear();
        count
    }

    /// Encodes `value` and writes it as one frame.
    pub async fn send_value<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), ProtocolError> {
        let bytes = wire::to_bytes(value)?;
        self.write_frame(&bytes).await
    }

    /// Reads one frame and decodes it as `T`.
    ///
    /// A close at a frame boundary is reported as [`ProtocolError::Closed`].
    pub async fn recv_value<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        match self.read_frame().await? {
            Some(frame) => Ok(wire::from_bytes(&frame)?),
            None => Err(ProtocolError::Closed),
        }
    }
}

// ============================================================================
// Signal pipe frames
// ============================================================================

/// Encodes a signal frame ready to be written to a signal pipe.
pub fn encode_signal_frame(signal: &SignalMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = wire::to_bytes(signal)?;
    let len = checked_frame_len(payload.len())?;
    let mut out = Vec::with_capacity(1 + LENGTH_PREFIX_SIZE + payload.len());
    out.push(SIGNAL_FRAME_KIND);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads one signal frame.
///
/// Returns `Ok(None)` if the writer closed at a frame boundary.
pub async fn read_signal_frame<R>(reader: &mut R) -> Result<Option<SignalMessage>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut kind = [0u8; 1];
    if let Transfer::Closed { .. } = read_full(reader, &mut kind).await? {
        return Ok(None);
    }
    if kind[0] != SIGNAL_FRAME_KIND {
        return Err(ProtocolError::UnknownFrameKind(kind[0]));
    }

    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    if let Transfer::Closed { transferred } = read_full(reader, &mut header).await? {
        return Err(ProtocolError::Truncated {
            expected: 1 + LENGTH_PREFIX_SIZE,
            received: 1 + transferred,
        });
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    if let Transfer::Closed { transferred } = read_full(reader, &mut payload).await? {
        return Err(ProtocolError::Truncated {
            expected: 1 + LENGTH_PREFIX_SIZE + len,
            received: 1 + LENGTH_PREFIX_SIZE + transferred,
        });
    }

    Ok(Some(wire::from_bytes(&payload)?))
}

/// Decoder for signal-pipe frames held in a caller-owned buffer.
///
/// Stateless: a frame stays in the buffer until it is complete, so
/// [`SignalFrameCodec::has_frame`] can answer without consuming anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalFrameCodec;

impl SignalFrameCodec {
    const HEADER_SIZE: usize = 1 + LENGTH_PREFIX_SIZE;

    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns true if `decode` would yield a frame or an error for `src`.
    pub fn has_frame(&self, src: &[u8]) -> bool {
        match Self::peek(src) {
            Some(Ok(len)) => src.len() >= Self::HEADER_SIZE + len,
            Some(Err(_)) => true,
            None => false,
        }
    }

    /// Payload length of the frame at the start of `src`, once its header
    /// is buffered.
    fn peek(src: &[u8]) -> Option<Result<usize, ProtocolError>> {
        if src.len() < Self::HEADER_SIZE {
            return None;
        }
        if src[0] != SIGNAL_FRAME_KIND {
            return Some(Err(ProtocolError::UnknownFrameKind(src[0])));
        }
        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        header.copy_from_slice(&src[1..Self::HEADER_SIZE]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Some(Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            }));
        }
        Some(Ok(len))
    }
}

impl Decoder for SignalFrameCodec {
    type Item = SignalMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match Self::peek(src) {
            Some(len) => len?,
            None => return Ok(None),
        };
        if src.len() < Self::HEADER_SIZE + len {
            src.reserve(Self::HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(len);
        Ok(Some(wire::from_bytes(&payload)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(signal) => Ok(Some(signal)),
            None if src.is_empty() => Ok(None),
            None => {
                let expected = match Self::peek(src) {
                    Some(Ok(len)) => Self::HEADER_SIZE + len,
                    _ => Self::HEADER_SIZE,
                };
                Err(ProtocolError::Truncated {
                    expected,
                    received: src.len(),
                })
            }
        }
    }
}
