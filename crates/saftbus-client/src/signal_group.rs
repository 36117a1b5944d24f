//! Waits on the signal channels of several proxies at once.
//!
//! ```text
//!   SignalGroup::wait(timeout)
//!        │
//!        ├── membership changed ──▶ rebuild the wait set, keep waiting
//!        ├── deadline reached   ──▶ WaitOutcome::Timeout
//!        └── a signal is buffered ─▶ dispatch Auto members,
//!                                   report Manual members
//! ```
//!
//! Only signals already read from a pipe are dispatched, so a wait never
//! outlasts its timeout by waiting on a pipe.
//!
//! Members may be added or removed from other tasks while a wait is in
//! progress; the waiter picks up the change without returning.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use saftbus_core::ProxyId;

use crate::error::{ClientError, Result};
use crate::proxy::Proxy;

/// How a member's signals are handled when its pipe becomes readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// The group calls [`Proxy::dispatch`].
    #[default]
    Auto,
    /// The group only reports the proxy as ready; the caller dispatches.
    /// A closed channel keeps being reported until the caller dispatches
    /// and sees `ClientError::SignalChannelClosed`.
    Manual,
}

/// Result of [`SignalGroup::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one channel had data.
    Ready {
        /// Signals dispatched to `Auto` members.
        dispatched: usize,
        /// `Manual` members with a signal buffered or a closed channel.
        manual: Vec<ProxyId>,
    },
    /// The timeout elapsed with nothing to handle.
    Timeout,
    /// Waiting on a pipe failed. The error has been logged.
    PollError,
}

struct Member {
    proxy: Arc<Proxy>,
    mode: DispatchMode,
}

/// A set of proxies whose signal channels are waited on together.
#[derive(Default)]
pub struct SignalGroup {
    members: Mutex<BTreeMap<ProxyId, Member>>,
    changed: Notify,
}

impl SignalGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `proxy` to the group, replacing any member with the same id.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NoSignalChannel` if the proxy was created
    /// without a signal channel.
    pub fn add(&self, proxy: Arc<Proxy>, mode: DispatchMode) -> Result<()> {
        if !proxy.has_signal_channel() {
            return Err(ClientError::NoSignalChannel);
        }
        let proxy_id = proxy.proxy_id();
        self.lock_members().insert(proxy_id, Member { proxy, mode });
        self.changed.notify_waiters();
        debug!(proxy_id = %proxy_id, mode = ?mode, "Added proxy to signal group");
        Ok(())
    }

    /// Removes a member. Returns its proxy if it was in the group.
    pub fn remove(&self, proxy_id: ProxyId) -> Option<Arc<Proxy>> {
        let removed = self.lock_members().remove(&proxy_id).map(|m| m.proxy);
        if removed.is_some() {
            self.changed.notify_waiters();
            debug!(proxy_id = %proxy_id, "Removed proxy from signal group");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_members().is_empty()
    }

    pub fn contains(&self, proxy_id: ProxyId) -> bool {
        self.lock_members().contains_key(&proxy_id)
    }

    /// Waits until at least one member has a signal, or `timeout` elapses.
    ///
    /// `None` waits without limit. Members whose channel the broker closed
    /// are dropped from the group and waiting continues.
    ///
    /// # Errors
    ///
    /// Dispatch failures other than a closed channel are returned as is;
    /// `ClientError::SignalMismatch` in particular means a channel delivered
    /// another object's signal.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // registered before the snapshot so no change is missed
            let changed = self.changed.notified();
            tokio::pin!(changed);
            let members = self.snapshot();

            let first_ready = if members.is_empty() {
                tokio::select! {
                    _ = &mut changed => continue,
                    _ = sleep_until_deadline(deadline) => return Ok(WaitOutcome::Timeout),
                }
            } else {
                let waits = members
                    .iter()
                    .map(|(_, proxy, _)| Box::pin(proxy.wait_readable()));
                tokio::select! {
                    _ = &mut changed => continue,
                    _ = sleep_until_deadline(deadline) => return Ok(WaitOutcome::Timeout),
                    (result, index, _) = select_all(waits) => match result {
                        Ok(()) => index,
                        Err(e) => {
                            error!(error = %e, "Waiting on signal channels failed");
                            return Ok(WaitOutcome::PollError);
                        }
                    },
                }
            };

            let mut dispatched = 0;
            let mut manual = Vec::new();
            for (position, (proxy_id, proxy, mode)) in members.iter().enumerate() {
                match mode {
                    DispatchMode::Manual => {
                        if position == first_ready || proxy.has_pending_signal() {
                            manual.push(*proxy_id);
                        }
                    }
                    DispatchMode::Auto => match proxy.try_dispatch().await {
                        Ok(Some(_)) => dispatched += 1,
                        Ok(None) => {}
                        Err(ClientError::SignalChannelClosed) => {
                            warn!(proxy_id = %proxy_id, "Signal channel closed, leaving group");
                            self.remove(*proxy_id);
                        }
                        Err(e) => return Err(e),
                    },
                }
            }

            if dispatched > 0 || !manual.is_empty() {
                return Ok(WaitOutcome::Ready { dispatched, manual });
            }
        }
    }

    fn snapshot(&self) -> Vec<(ProxyId, Arc<Proxy>, DispatchMode)> {
        self.lock_members()
            .iter()
            .map(|(id, m)| (*id, Arc::clone(&m.proxy), m.mode))
            .collect()
    }

    fn lock_members(&self) -> MutexGuard<'_, BTreeMap<ProxyId, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
