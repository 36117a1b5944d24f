//! Broker actor - owns the registry, the signal channels and all client
//! bookkeeping, and processes commands one at a time.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Panics raised inside object handlers are caught at the dispatch
//!   boundary and answered with a failed-kind error
//! - Response channel send failures are ignored (the caller went away)

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use saftbus_core::{
    from_bytes, validate_interface_name, validate_object_path, BusError, ClientId, ObjectId,
    ProxyId, Reader, SubscriptionId, PROPERTIES_INTERFACE,
};
use saftbus_protocol::{
    encode_signal_frame, CallEnvelope, ClientSummary, FlightTimeHistogram, PropertyGet,
    PropertySet, Reply, SignalMessage, StateDump, SubscriptionSummary, PROPERTY_GET, PROPERTY_SET,
};

use super::channels::{ChannelKey, ChannelSet};
use super::commands::{BrokerCommand, BrokerError};
use super::registry::ObjectRegistry;
use super::BrokerOptions;
use crate::service::{CallContext, Effect, ServiceObject};

// ============================================================================
// Bookkeeping
// ============================================================================

/// Per-client state, torn down together on disconnect.
#[derive(Debug, Default)]
struct ClientRecord {
    channels: BTreeSet<ChannelKey>,
}

/// An object's interest in one client's disconnection.
#[derive(Debug, Clone)]
struct Subscription {
    owner: ClientId,
    object_id: ObjectId,
    interface: String,
    path: String,
}

/// What a call envelope asks the target object to do.
enum Access {
    Method,
    Get(String),
    Set(String, Vec<u8>),
}

// ============================================================================
// Broker Actor
// ============================================================================

/// The broker actor.
///
/// Receives commands via an mpsc channel and handles each to completion
/// before taking the next, so object handlers never run concurrently.
pub struct BrokerActor {
    receiver: mpsc::Receiver<BrokerCommand>,

    /// Handed to hang-up watchers; weak so the actor still stops once every
    /// handle is gone.
    hangup: mpsc::WeakSender<BrokerCommand>,

    registry: ObjectRegistry,
    channels: ChannelSet,
    clients: BTreeMap<ClientId, ClientRecord>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,

    next_client: u64,
    next_subscription: u64,
    max_clients: usize,

    logging: bool,
    track_flight_time: bool,
    histogram: FlightTimeHistogram,
}

impl BrokerActor {
    pub fn new(
        receiver: mpsc::Receiver<BrokerCommand>,
        hangup: mpsc::WeakSender<BrokerCommand>,
        options: BrokerOptions,
    ) -> Self {
        Self {
            receiver,
            hangup,
            registry: ObjectRegistry::new(),
            channels: ChannelSet::new(),
            clients: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            next_client: 0,
            next_subscription: 0,
            max_clients: options.max_clients,
            logging: false,
            track_flight_time: options.track_flight_time,
            histogram: FlightTimeHistogram::default(),
        }
    }

    /// Runs the actor until every handle has been dropped.
    pub async fn run(mut self) {
        info!(max_clients = self.max_clients, "Broker actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            objects = self.registry.len(),
            clients = self.clients.len(),
            "Broker actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Connect { respond_to } => {
                let _ = respond_to.send(self.handle_connect());
            }
            BrokerCommand::Disconnect { client, respond_to } => {
                self.handle_disconnect(client);
                if let Some(tx) = respond_to {
                    let _ = tx.send(());
                }
            }
            BrokerCommand::Register {
                interface,
                path,
                object,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_register(&interface, &path, object));
            }
            BrokerCommand::Unregister {
                object_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_unregister(object_id));
            }
            BrokerCommand::Call {
                client,
                envelope,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_call(client, envelope));
            }
            BrokerCommand::Lookup {
                path,
                interface,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.resolve(&interface, &path));
            }
            BrokerCommand::Introspect {
                path,
                interface,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_introspect(&interface, &path));
            }
            BrokerCommand::OpenSignalChannel {
                client,
                path,
                interface,
                proxy_id,
                writer,
                respond_to,
            } => {
                let result = self.handle_open_channel(client, &path, &interface, proxy_id, writer);
                let _ = respond_to.send(result);
            }
            BrokerCommand::ChannelHungUp { key } => {
                if let Some(channel) = self.close_channel(key) {
                    debug!(
                        client_id = %channel.client,
                        proxy_id = %channel.proxy_id,
                        path = %channel.path,
                        interface = %channel.interface,
                        "Signal channel closed by client"
                    );
                }
            }
            BrokerCommand::EmitSignal {
                path,
                interface,
                name,
                args,
                respond_to,
            } => {
                let delivered = self.emit_signal(&path, &interface, &name, args);
                if let Some(tx) = respond_to {
                    let _ = tx.send(delivered);
                }
            }
            BrokerCommand::RecordFlightTime { micros } => {
                self.histogram.record(micros);
            }
            BrokerCommand::SetLogging {
                enabled,
                respond_to,
            } => {
                self.logging = enabled;
                info!(enabled, "Call logging toggled");
                let _ = respond_to.send(());
            }
            BrokerCommand::SetFlightTimeTracking {
                enabled,
                respond_to,
            } => {
                self.track_flight_time = enabled;
                info!(enabled, "Flight time tracking toggled");
                let _ = respond_to.send(());
            }
            BrokerCommand::DumpState { respond_to } => {
                let _ = respond_to.send(self.dump_state());
            }
            BrokerCommand::FlightTimeHistogram { respond_to } => {
                let _ = respond_to.send(self.histogram.clone());
            }
            BrokerCommand::ListObjects { respond_to } => {
                let _ = respond_to.send(self.registry.listing());
            }
        }
    }

    // ========================================================================
    // Clients
    // ========================================================================

    fn handle_connect(&mut self) -> Result<ClientId, BrokerError> {
        if self.clients.len() >= self.max_clients {
            warn!(
                current = self.clients.len(),
                max = self.max_clients,
                "Client limit reached, rejecting handshake"
            );
            return Err(BrokerError::TooManyClients {
                max: self.max_clients,
            });
        }

        self.next_client += 1;
        let client = ClientId::new(self.next_client);
        self.clients.insert(client, ClientRecord::default());
        info!(client_id = %client, "Client registered");
        Ok(client)
    }

    /// Disconnect cleanup.
    ///
    /// Every object watching this client gets exactly one owner-vanished
    /// callback before its subscription is erased. Then the client's signal
    /// channels are closed and unreachable registry entries collected.
    fn handle_disconnect(&mut self, client: ClientId) {
        let Some(record) = self.clients.remove(&client) else {
            debug!(client_id = %client, "Disconnect for unknown client");
            return;
        };

        let owned: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.owner == client)
            .map(|(id, _)| *id)
            .collect();

        let mut vanished = 0usize;
        for id in owned {
            let Some(object_id) = self.subscriptions.get(&id).map(|s| s.object_id) else {
                continue;
            };
            let effects = self.notify_owner_vanished(client, object_id);
            self.subscriptions.remove(&id);
            self.apply_effects(effects);
            vanished += 1;
        }

        let channel_count = record.channels.len();
        for key in record.channels {
            self.channels.remove(key);
        }

        let collected = self.collect_unreachable();

        info!(
            client_id = %client,
            channels = channel_count,
            owner_vanished = vanished,
            collected,
            "Client disconnected"
        );
    }

    fn notify_owner_vanished(&mut self, owner: ClientId, object_id: ObjectId) -> Vec<Effect> {
        let Some(entry) = self.registry.get_mut(object_id) else {
            return Vec::new();
        };
        let mut ctx = CallContext::new(
            None,
            object_id,
            entry.path.as_str(),
            entry.interface.as_str(),
        );
        let object = &mut entry.object;
        let _ = guarded(object_id, "owner_vanished", || {
            object.owner_vanished(owner, &mut ctx);
            Ok(())
        });
        ctx.into_effects()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    fn handle_register(
        &mut self,
        interface: &str,
        path: &str,
        object: Box<dyn ServiceObject>,
    ) -> Result<ObjectId, BusError> {
        let replaced = self.registry.current(interface, path);
        let id = self.registry.register(interface, path, object)?;
        info!(
            object_id = %id,
            interface,
            path,
            replaced = ?replaced,
            "Object registered"
        );
        Ok(id)
    }

    fn handle_unregister(&mut self, object_id: ObjectId) -> Result<(), BusError> {
        let entry = self
            .registry
            .unregister(object_id)
            .ok_or_else(BusError::no_such_object)?;
        self.subscriptions.retain(|_, s| s.object_id != object_id);
        info!(
            object_id = %object_id,
            interface = %entry.interface,
            path = %entry.path,
            "Object unregistered"
        );
        Ok(())
    }

    fn handle_introspect(&self, interface: &str, path: &str) -> Result<String, BusError> {
        let id = self.registry.resolve(interface, path)?;
        let entry = self.registry.get(id).ok_or_else(BusError::no_such_object)?;
        guarded(id, "introspect", || Ok(entry.object.introspect()))
    }

    fn collect_unreachable(&mut self) -> usize {
        let collected = self.registry.collect_unreachable();
        for (id, entry) in &collected {
            self.subscriptions.retain(|_, s| s.object_id != *id);
            debug!(
                object_id = %id,
                interface = %entry.interface,
                path = %entry.path,
                "Collected unreachable object"
            );
        }
        collected.len()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn handle_call(&mut self, client: ClientId, envelope: CallEnvelope) -> Reply {
        if envelope.sender != client {
            warn!(
                client_id = %client,
                claimed = %envelope.sender,
                "Call envelope names another sender"
            );
            return Reply::Error(BusError::access_denied(
                "sender does not match the connection",
            ));
        }

        let started = Instant::now();
        let result = self.dispatch_call(client, &envelope);
        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        if self.logging {
            info!(
                client_id = %client,
                object_id = %envelope.object_id,
                path = %envelope.path,
                interface = %envelope.interface,
                member = %envelope.member,
                ok = result.is_ok(),
                elapsed_us,
                "Call dispatched"
            );
        } else {
            debug!(
                client_id = %client,
                object_id = %envelope.object_id,
                member = %envelope.member,
                ok = result.is_ok(),
                "Call dispatched"
            );
        }

        result.into()
    }

    fn dispatch_call(&mut self, client: ClientId, env: &CallEnvelope) -> Result<Vec<u8>, BusError> {
        let (interface, access) = if env.is_property_access() {
            match env.member.as_str() {
                PROPERTY_GET => {
                    let get: PropertyGet = from_bytes(&env.args)?;
                    (get.interface, Access::Get(get.name))
                }
                PROPERTY_SET => {
                    let set: PropertySet = from_bytes(&env.args)?;
                    (set.interface, Access::Set(set.name, set.value))
                }
                other => {
                    return Err(BusError::invalid_args(format!(
                        "unknown member '{other}' on {PROPERTIES_INTERFACE}"
                    )))
                }
            }
        } else {
            (env.interface.clone(), Access::Method)
        };

        let object_id = self.registry.verify(&interface, &env.path, env.object_id)?;
        let entry = self
            .registry
            .get_mut(object_id)
            .ok_or_else(BusError::no_such_object)?;

        let mut ctx = CallContext::new(Some(client), object_id, env.path.as_str(), interface);
        let object = &mut entry.object;
        let result = guarded(object_id, &env.member, || match access {
            Access::Method => {
                let mut args = Reader::new(&env.args);
                object.call(&env.member, &mut args, &mut ctx)
            }
            Access::Get(name) => object.get_property(&name, &mut ctx),
            Access::Set(name, value) => {
                let mut reader = Reader::new(&value);
                object
                    .set_property(&name, &mut reader, &mut ctx)
                    .map(|()| Vec::new())
            }
        });

        self.apply_effects(ctx.into_effects());
        result
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Emit {
                    path,
                    interface,
                    name,
                    args,
                } => {
                    self.emit_signal(&path, &interface, &name, args);
                }
                Effect::Register {
                    interface,
                    path,
                    object,
                } => {
                    if let Err(e) = self.handle_register(&interface, &path, object) {
                        warn!(interface, path, error = %e, "Deferred registration failed");
                    }
                }
                Effect::Unregister(object_id) => {
                    if let Err(e) = self.handle_unregister(object_id) {
                        debug!(
                            object_id = %object_id,
                            error = %e,
                            "Deferred unregistration failed"
                        );
                    }
                }
                Effect::WatchOwner { owner, object_id } => self.watch_owner(owner, object_id),
                Effect::UnwatchOwner { owner, object_id } => {
                    self.subscriptions
                        .retain(|_, s| !(s.owner == owner && s.object_id == object_id));
                }
            }
        }
    }

    fn watch_owner(&mut self, owner: ClientId, object_id: ObjectId) {
        if !self.clients.contains_key(&owner) {
            warn!(
                client_id = %owner,
                object_id = %object_id,
                "Watch on a client that is not connected"
            );
            return;
        }
        let exists = self
            .subscriptions
            .values()
            .any(|s| s.owner == owner && s.object_id == object_id);
        if exists {
            return;
        }
        let Some(entry) = self.registry.get(object_id) else {
            return;
        };

        self.next_subscription += 1;
        let id = SubscriptionId::new(self.next_subscription);
        self.subscriptions.insert(
            id,
            Subscription {
                owner,
                object_id,
                interface: entry.interface.clone(),
                path: entry.path.clone(),
            },
        );
        debug!(subscription = %id, client_id = %owner, object_id = %object_id, "Watching owner");
    }

    // ========================================================================
    // Signals
    // ========================================================================

    fn handle_open_channel(
        &mut self,
        client: ClientId,
        path: &str,
        interface: &str,
        proxy_id: ProxyId,
        writer: OwnedFd,
    ) -> Result<(), BusError> {
        validate_object_path(path)?;
        validate_interface_name(interface)?;
        let Some(record) = self.clients.get_mut(&client) else {
            return Err(BusError::access_denied("client is not registered"));
        };

        let key = self
            .channels
            .open(client, proxy_id, interface, path, writer, self.hangup.clone())
            .map_err(|e| BusError::io(format!("cannot adopt signal pipe: {e}")))?;
        record.channels.insert(key);

        debug!(
            client_id = %client,
            proxy_id = %proxy_id,
            path,
            interface,
            "Signal channel registered"
        );
        Ok(())
    }

    /// Writes one signal to every channel subscribed to (interface, path).
    ///
    /// A channel whose write fails is torn down; the others still get the
    /// signal. Returns the number of channels written to.
    fn emit_signal(&mut self, path: &str, interface: &str, name: &str, args: Vec<u8>) -> usize {
        let keys = self.channels.subscribed(interface, path);
        if keys.is_empty() {
            return 0;
        }

        let signal = SignalMessage::new(path, interface, name, args, self.track_flight_time);
        let frame = match encode_signal_frame(&signal) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(path, interface, signal = name, error = %e, "Cannot encode signal");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut broken = Vec::new();
        for key in keys {
            let Some(channel) = self.channels.get(key) else {
                continue;
            };
            match channel.write_frame(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        client_id = %channel.client,
                        proxy_id = %channel.proxy_id,
                        path,
                        interface,
                        signal = name,
                        error = %e,
                        "Signal channel write failed, closing it"
                    );
                    broken.push(key);
                }
            }
        }

        for key in broken {
            self.close_channel(key);
        }
        delivered
    }

    fn close_channel(&mut self, key: ChannelKey) -> Option<super::channels::SignalChannel> {
        let channel = self.channels.remove(key)?;
        if let Some(record) = self.clients.get_mut(&channel.client) {
            record.channels.remove(&key);
        }
        Some(channel)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    fn dump_state(&self) -> StateDump {
        let clients = self
            .clients
            .iter()
            .map(|(id, record)| ClientSummary {
                id: *id,
                signal_channels: record
                    .channels
                    .iter()
                    .filter_map(|key| self.channels.get(*key))
                    .map(|channel| channel.summary())
                    .collect(),
                subscriptions: u32::try_from(
                    self.subscriptions.values().filter(|s| s.owner == *id).count(),
                )
                .unwrap_or(u32::MAX),
            })
            .collect();

        let subscriptions = self
            .subscriptions
            .iter()
            .map(|(id, sub)| SubscriptionSummary {
                id: *id,
                owner: sub.owner,
                object_id: sub.object_id,
                interface: sub.interface.clone(),
                path: sub.path.clone(),
            })
            .collect();

        StateDump {
            objects: self.registry.summaries(),
            clients,
            subscriptions,
            logging: self.logging,
            track_flight_time: self.track_flight_time,
        }
    }
}

/// Runs a handler, turning a panic into a failed-kind error.
fn guarded<T>(
    object_id: ObjectId,
    handler: &str,
    f: impl FnOnce() -> Result<T, BusError>,
) -> Result<T, BusError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let detail = panic_message(payload.as_ref());
        error!(object_id = %object_id, handler, panic = %detail, "Handler panicked");
        Err(BusError::failed(format!("handler panicked: {detail}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
