//! Local stand-in for a remote object.
//!
//! A [`Proxy`] resolves its (path, interface) once at construction and caches
//! the resulting [`ObjectId`]. Every call carries that id; if the broker has
//! since replaced the object, the call fails with a stale-object error and a
//! new proxy must be built to reach the replacement.
//!
//! Unless created with [`Proxy::without_signals`], each proxy owns a private
//! signal pipe. The broker holds the write end; dropping the proxy closes the
//! read end, which the broker observes as a hang-up and drops the channel.
//!
//! Signals are read from the pipe into a per-proxy buffer until the pipe
//! would block, so the runtime's readiness flag always reflects whether
//! the pipe still holds data. A proxy counts as ready once a whole frame
//! is buffered or the broker has closed its end.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;
use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::unix::pipe;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use saftbus_core::{from_bytes, to_bytes, ObjectId, ProxyId};
use saftbus_protocol::{
    signal_pipe, CallEnvelope, ProtocolError, Reply, Request, SignalFrameCodec, SignalMessage,
};

use crate::connection::Connection;
use crate::error::{ClientError, Result};

/// Callback invoked for every received signal with a matching name.
pub type SignalHandler = Box<dyn FnMut(&SignalMessage) + Send>;

/// Handlers registered per signal name.
#[derive(Default)]
struct SignalHandlers {
    by_name: HashMap<String, Vec<SignalHandler>>,
}

impl SignalHandlers {
    fn connect(&mut self, name: String, handler: SignalHandler) {
        self.by_name.entry(name).or_default().push(handler);
    }

    fn disconnect(&mut self, name: &str) -> usize {
        self.by_name.remove(name).map_or(0, |handlers| handlers.len())
    }

    /// Takes the handlers for `name` out so they can run without the lock.
    fn take(&mut self, name: &str) -> Vec<SignalHandler> {
        self.by_name.remove(name).unwrap_or_default()
    }

    /// Puts handlers back ahead of any connected while they were running.
    fn restore(&mut self, name: &str, mut handlers: Vec<SignalHandler>) {
        if handlers.is_empty() {
            return;
        }
        if let Some(added) = self.by_name.remove(name) {
            handlers.extend(added);
        }
        self.by_name.insert(name.to_string(), handlers);
    }
}

/// Draining stops early once this much is buffered and a frame is complete;
/// the rest stays in the pipe, which then remains readable.
const SIGNAL_BUFFER_SOFT_LIMIT: usize = 64 * 1024;

const SIGNAL_READ_CHUNK: usize = 4 * 1024;

/// What the signal buffer holds right now.
enum Buffered {
    Signal(SignalMessage),
    Closed,
    Empty,
}

/// Read end of a signal pipe and the bytes read from it so far.
struct SignalReader {
    receiver: pipe::Receiver,
    codec: SignalFrameCodec,
    buf: BytesMut,
    closed: bool,
}

impl SignalReader {
    fn new(receiver: pipe::Receiver) -> Self {
        Self {
            receiver,
            codec: SignalFrameCodec::new(),
            buf: BytesMut::new(),
            closed: false,
        }
    }

    fn is_ready(&self) -> bool {
        self.closed || self.codec.has_frame(&self.buf)
    }

    /// Moves whatever the pipe holds into the buffer without waiting.
    fn fill(&mut self) -> io::Result<()> {
        while !self.closed {
            if self.buf.len() >= SIGNAL_BUFFER_SOFT_LIMIT && self.codec.has_frame(&self.buf) {
                break;
            }
            self.buf.reserve(SIGNAL_READ_CHUNK);
            match self.receiver.try_read_buf(&mut self.buf) {
                Ok(0) => self.closed = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Waits until a frame is buffered or the pipe is closed.
    async fn wait_ready(&mut self) -> io::Result<()> {
        while !self.is_ready() {
            self.receiver.readable().await?;
            self.fill()?;
        }
        Ok(())
    }

    fn next_buffered(&mut self) -> std::result::Result<Buffered, ProtocolError> {
        if let Some(signal) = self.codec.decode(&mut self.buf)? {
            return Ok(Buffered::Signal(signal));
        }
        if !self.closed {
            return Ok(Buffered::Empty);
        }
        Ok(match self.codec.decode_eof(&mut self.buf)? {
            Some(signal) => Buffered::Signal(signal),
            None => Buffered::Closed,
        })
    }
}

/// Client-side handle to one object on the bus.
pub struct Proxy {
    connection: Connection,
    path: String,
    interface: String,
    object_id: ObjectId,
    proxy_id: ProxyId,
    signals: Option<tokio::sync::Mutex<SignalReader>>,
    handlers: Mutex<SignalHandlers>,
}

impl Proxy {
    /// Resolves the object and registers a signal channel for it.
    ///
    /// Returns once the broker has acknowledged the channel, so any signal
    /// emitted afterwards is delivered to this proxy.
    ///
    /// # Errors
    ///
    /// - remote `no such object` if nothing is registered at (path, interface)
    /// - `ClientError::Io` if the pipe cannot be created
    pub async fn new(connection: &Connection, path: &str, interface: &str) -> Result<Self> {
        let mut proxy = Self::without_signals(connection, path, interface).await?;

        let (read_end, write_end) = signal_pipe()?;
        let request = Request::open_signal_channel(path, interface, proxy.proxy_id);
        let reply: Reply = connection
            .request_with_fd(&request, write_end.as_fd())
            .await?;
        drop(write_end);
        reply.into_result()?;

        let receiver = pipe::Receiver::from_owned_fd(read_end)?;
        proxy.signals = Some(tokio::sync::Mutex::new(SignalReader::new(receiver)));

        debug!(
            proxy_id = %proxy.proxy_id,
            path = %path,
            interface = %interface,
            "Signal channel registered"
        );
        Ok(proxy)
    }

    /// Resolves the object without a signal channel.
    pub async fn without_signals(
        connection: &Connection,
        path: &str,
        interface: &str,
    ) -> Result<Self> {
        let object_id = connection.lookup(path, interface).await?;
        let proxy_id = connection.next_proxy_id();

        Ok(Self {
            connection: connection.clone(),
            path: path.to_string(),
            interface: interface.to_string(),
            object_id,
            proxy_id,
            signals: None,
            handlers: Mutex::new(SignalHandlers::default()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The id resolved at construction. Never refreshed.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn proxy_id(&self) -> ProxyId {
        self.proxy_id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn has_signal_channel(&self) -> bool {
        self.signals.is_some()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Invokes `method` with pre-encoded arguments and returns the encoded
    /// result.
    pub async fn call(&self, method: &str, args: Vec<u8>) -> Result<Vec<u8>> {
        let envelope = CallEnvelope {
            object_id: self.object_id,
            path: self.path.clone(),
            sender: self.connection.client_id(),
            interface: self.interface.clone(),
            member: method.to_string(),
            args,
        };
        self.send_call(envelope).await
    }

    /// Encodes `args`, invokes `method` and decodes the result.
    ///
    /// Multiple arguments are passed as a tuple.
    pub async fn call_value<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.call(method, to_bytes(args)?).await?;
        Ok(from_bytes(&reply)?)
    }

    pub async fn get_property<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let envelope = CallEnvelope::property_get(
            self.object_id,
            self.path.as_str(),
            self.connection.client_id(),
            self.interface.as_str(),
            name,
        )?;
        let reply = self.send_call(envelope).await?;
        Ok(from_bytes(&reply)?)
    }

    pub async fn set_property<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let envelope = CallEnvelope::property_set(
            self.object_id,
            self.path.as_str(),
            self.connection.client_id(),
            self.interface.as_str(),
            name,
            to_bytes(value)?,
        )?;
        self.send_call(envelope).await?;
        Ok(())
    }

    pub async fn introspect(&self) -> Result<String> {
        self.connection.introspect(&self.path, &self.interface).await
    }

    async fn send_call(&self, envelope: CallEnvelope) -> Result<Vec<u8>> {
        trace!(
            object_id = %self.object_id,
            member = %envelope.member,
            "Calling remote object"
        );
        let reply: Reply = self.connection.request(&Request::Call(envelope)).await?;
        Ok(reply.into_result()?)
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Registers `handler` for signals called `name`.
    pub fn connect_signal<F>(&self, name: &str, handler: F)
    where
        F: FnMut(&SignalMessage) + Send + 'static,
    {
        self.lock_handlers()
            .connect(name.to_string(), Box::new(handler));
    }

    /// Removes all handlers for `name`. Returns how many were removed.
    pub fn disconnect_signal(&self, name: &str) -> usize {
        self.lock_handlers().disconnect(name)
    }

    /// Waits until a whole signal is buffered or the channel has been closed.
    pub async fn wait_readable(&self) -> Result<()> {
        let channel = self.signals.as_ref().ok_or(ClientError::NoSignalChannel)?;
        channel.lock().await.wait_ready().await?;
        Ok(())
    }

    /// Returns true if [`Proxy::dispatch`] would not have to wait.
    ///
    /// Never blocks. A proxy whose channel is busy in another task reports
    /// false.
    pub fn has_pending_signal(&self) -> bool {
        let Some(channel) = self.signals.as_ref() else {
            return false;
        };
        let Ok(mut reader) = channel.try_lock() else {
            return false;
        };
        reader.fill().is_err() || reader.is_ready()
    }

    /// Reads one signal from the pipe and runs its handlers.
    ///
    /// Waits if no complete signal is buffered yet. Returns the signal that
    /// was dispatched.
    ///
    /// # Errors
    ///
    /// - `ClientError::SignalChannelClosed` if the broker closed the channel
    /// - `ClientError::SignalMismatch` if the signal names another object;
    ///   the channel can no longer be trusted
    pub async fn dispatch(&self) -> Result<SignalMessage> {
        let channel = self.signals.as_ref().ok_or(ClientError::NoSignalChannel)?;
        let signal = {
            let mut reader = channel.lock().await;
            loop {
                match reader.next_buffered()? {
                    Buffered::Signal(signal) => break signal,
                    Buffered::Closed => return Err(ClientError::SignalChannelClosed),
                    Buffered::Empty => {
                        reader.receiver.readable().await?;
                        reader.fill()?;
                    }
                }
            }
        };
        self.deliver(signal).await
    }

    /// Dispatches a signal only if one can be had without waiting.
    ///
    /// Returns `Ok(None)` when nothing is buffered or another task is
    /// reading the channel.
    pub async fn try_dispatch(&self) -> Result<Option<SignalMessage>> {
        let channel = self.signals.as_ref().ok_or(ClientError::NoSignalChannel)?;
        let signal = {
            let Ok(mut reader) = channel.try_lock() else {
                return Ok(None);
            };
            reader.fill()?;
            match reader.next_buffered()? {
                Buffered::Signal(signal) => signal,
                Buffered::Closed => return Err(ClientError::SignalChannelClosed),
                Buffered::Empty => return Ok(None),
            }
        };
        self.deliver(signal).await.map(Some)
    }

    async fn deliver(&self, signal: SignalMessage) -> Result<SignalMessage> {
        if signal.path != self.path || signal.interface != self.interface {
            return Err(ClientError::SignalMismatch {
                path: self.path.clone(),
                interface: self.interface.clone(),
                got_path: signal.path,
                got_interface: signal.interface,
            });
        }

        if signal.track_flight_time {
            let micros = signal.flight_time_micros(Utc::now());
            if let Err(e) = self.connection.report_flight_time(micros).await {
                warn!(proxy_id = %self.proxy_id, error = %e, "Failed to report flight time");
            }
        }

        let mut handlers = self.lock_handlers().take(&signal.name);
        trace!(
            proxy_id = %self.proxy_id,
            signal = %signal.name,
            handlers = handlers.len(),
            "Dispatching signal"
        );
        for handler in handlers.iter_mut() {
            handler(&signal);
        }
        self.lock_handlers().restore(&signal.name, handlers);

        Ok(signal)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, SignalHandlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("object_id", &self.object_id)
            .field("proxy_id", &self.proxy_id)
            .field("signals", &self.signals.is_some())
            .finish()
    }
}
