//! Signal channels.
//!
//! A signal channel is the write end of a pipe whose read end lives in one
//! client-side proxy. The broker writes whole signal frames to it without
//! blocking; a write that fails or would block tears down that channel
//! only.
//!
//! Every channel has a hang-up watcher: a small task that waits for error
//! readiness on the write end, which the kernel reports once the reader has
//! closed its end, and then asks the actor to drop the channel.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use saftbus_core::{ClientId, ProxyId};
use saftbus_protocol::{set_nonblocking, ChannelSummary};

use super::commands::BrokerCommand;

/// Broker-local key of one signal channel. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(u64);

/// One registered signal channel.
pub struct SignalChannel {
    pub client: ClientId,
    pub proxy_id: ProxyId,
    pub interface: String,
    pub path: String,
    writer: Arc<AsyncFd<File>>,
    watcher: CancellationToken,
}

impl SignalChannel {
    /// Writes one encoded frame without blocking.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut file: &File = self.writer.get_ref();
        file.write_all(frame)
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            proxy_id: self.proxy_id,
            interface: self.interface.clone(),
            path: self.path.clone(),
        }
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

/// All open signal channels, indexed by (interface, path).
#[derive(Default)]
pub struct ChannelSet {
    channels: HashMap<ChannelKey, SignalChannel>,
    by_target: HashMap<(String, String), BTreeSet<ChannelKey>>,
    next_key: u64,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts `writer` as a new channel and starts its hang-up watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        &mut self,
        client: ClientId,
        proxy_id: ProxyId,
        interface: &str,
        path: &str,
        writer: OwnedFd,
        hangup: mpsc::WeakSender<BrokerCommand>,
    ) -> io::Result<ChannelKey> {
        set_nonblocking(writer.as_fd())?;
        let writer = Arc::new(AsyncFd::with_interest(File::from(writer), Interest::ERROR)?);

        self.next_key += 1;
        let key = ChannelKey(self.next_key);
        let watcher = CancellationToken::new();
        spawn_hangup_watcher(key, Arc::clone(&writer), watcher.clone(), hangup);

        self.channels.insert(
            key,
            SignalChannel {
                client,
                proxy_id,
                interface: interface.to_string(),
                path: path.to_string(),
                writer,
                watcher,
            },
        );
        self.by_target
            .entry((interface.to_string(), path.to_string()))
            .or_default()
            .insert(key);
        Ok(key)
    }

    /// Removes a channel and stops its watcher. Dropping the returned value
    /// closes the write end.
    pub fn remove(&mut self, key: ChannelKey) -> Option<SignalChannel> {
        let channel = self.channels.remove(&key)?;
        let target = (channel.interface.clone(), channel.path.clone());
        if let Some(keys) = self.by_target.get_mut(&target) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_target.remove(&target);
            }
        }
        Some(channel)
    }

    /// Keys of the channels subscribed to (interface, path).
    pub fn subscribed(&self, interface: &str, path: &str) -> Vec<ChannelKey> {
        self.by_target
            .get(&(interface.to_string(), path.to_string()))
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: ChannelKey) -> Option<&SignalChannel> {
        self.channels.get(&key)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn spawn_hangup_watcher(
    key: ChannelKey,
    writer: Arc<AsyncFd<File>>,
    cancel: CancellationToken,
    hangup: mpsc::WeakSender<BrokerCommand>,
) {
    tokio::spawn(async move {
        let hung_up = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = writer.ready(Interest::ERROR) => {
                if let Err(e) = &result {
                    debug!(channel = ?key, error = %e, "Signal channel poll failed");
                }
                true
            }
        };

        if hung_up {
            debug!(channel = ?key, "Signal channel reader hung up");
            if let Some(sender) = hangup.upgrade() {
                let _ = sender.send(BrokerCommand::ChannelHungUp { key }).await;
            }
        }
    });
}
