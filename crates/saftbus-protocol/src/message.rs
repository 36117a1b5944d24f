//! Protocol message types.
//!
//! Every control-socket frame carries exactly one encoded value. Requests
//! start with their variant index, which doubles as the message-type tag,
//! so new requests must only ever be appended.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use saftbus_core::wire::{self, WireError};
use saftbus_core::{BusError, ClientId, ObjectId, ProxyId, SubscriptionId, PROPERTIES_INTERFACE};

use crate::version::ProtocolVersion;

/// Member name of a property read on [`PROPERTIES_INTERFACE`].
pub const PROPERTY_GET: &str = "Get";

/// Member name of a property write on [`PROPERTIES_INTERFACE`].
pub const PROPERTY_SET: &str = "Set";

/// Messages sent by clients to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Handshake; must be the first frame on a control socket.
    Hello { version: ProtocolVersion },

    /// Method call or property access on a registered object.
    Call(CallEnvelope),

    /// Resolve (path, interface) to the current ObjectId.
    Lookup { path: String, interface: String },

    /// Fetch the introspection document of an object.
    Introspect { path: String, interface: String },

    /// Register a signal channel. The write end of the pipe travels as
    /// ancillary data on the same frame.
    OpenSignalChannel {
        path: String,
        interface: String,
        proxy_id: ProxyId,
    },

    /// Measured delivery latency of a tracked signal. No reply.
    FlightTime { micros: u64 },

    /// Toggle per-call logging inside the broker.
    SetLogging { enabled: bool },

    /// Toggle flight-time tracking of emitted signals.
    SetFlightTimeTracking { enabled: bool },

    /// Snapshot of the broker's internal tables.
    DumpState,

    /// Flight-time histogram collected so far.
    FlightTimeHistogram,

    /// Object path to interface mapping.
    ListObjects,
}

impl Request {
    pub fn hello() -> Self {
        Self::Hello {
            version: ProtocolVersion::CURRENT,
        }
    }

    pub fn lookup(path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self::Lookup {
            path: path.into(),
            interface: interface.into(),
        }
    }

    pub fn introspect(path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self::Introspect {
            path: path.into(),
            interface: interface.into(),
        }
    }

    pub fn open_signal_channel(
        path: impl Into<String>,
        interface: impl Into<String>,
        proxy_id: ProxyId,
    ) -> Self {
        Self::OpenSignalChannel {
            path: path.into(),
            interface: interface.into(),
            proxy_id,
        }
    }

    /// Returns false for one-way messages.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::FlightTime { .. })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Call(_) => "call",
            Self::Lookup { .. } => "lookup",
            Self::Introspect { .. } => "introspect",
            Self::OpenSignalChannel { .. } => "open_signal_channel",
            Self::FlightTime { .. } => "flight_time",
            Self::SetLogging { .. } => "set_logging",
            Self::SetFlightTimeTracking { .. } => "set_flight_time_tracking",
            Self::DumpState => "dump_state",
            Self::FlightTimeHistogram => "flight_time_histogram",
            Self::ListObjects => "list_objects",
        }
    }
}

/// Everything the broker needs to route one call.
///
/// `object_id` is the id the caller resolved earlier. The broker rejects the
/// call if it no longer matches the current registration for
/// (`interface`, `path`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub object_id: ObjectId,
    pub path: String,
    pub sender: ClientId,
    pub interface: String,
    pub member: String,
    pub args: Vec<u8>,
}

impl CallEnvelope {
    /// Builds a property read on the reserved properties interface.
    pub fn property_get(
        object_id: ObjectId,
        path: impl Into<String>,
        sender: ClientId,
        interface: impl Into<String>,
        property: impl Into<String>,
    ) -> Result<Self, WireError> {
        let args = wire::to_bytes(&PropertyGet {
            interface: interface.into(),
            name: property.into(),
        })?;
        Ok(Self {
            object_id,
            path: path.into(),
            sender,
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTY_GET.to_string(),
            args,
        })
    }

    /// Builds a property write on the reserved properties interface.
    pub fn property_set(
        object_id: ObjectId,
        path: impl Into<String>,
        sender: ClientId,
        interface: impl Into<String>,
        property: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<Self, WireError> {
        let args = wire::to_bytes(&PropertySet {
            interface: interface.into(),
            name: property.into(),
            value,
        })?;
        Ok(Self {
            object_id,
            path: path.into(),
            sender,
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTY_SET.to_string(),
            args,
        })
    }

    /// Returns true if this envelope targets the properties pseudo-interface.
    pub fn is_property_access(&self) -> bool {
        self.interface == PROPERTIES_INTERFACE
    }
}

/// Arguments of a property read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyGet {
    pub interface: String,
    pub name: String,
}

/// Arguments of a property write. `value` holds the encoded new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    pub interface: String,
    pub name: String,
    pub value: Vec<u8>,
}

/// Reply to a call, lookup, introspection or channel registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Return(Vec<u8>),
    Error(BusError),
}

impl Reply {
    pub fn into_result(self) -> Result<Vec<u8>, BusError> {
        match self {
            Self::Return(bytes) => Ok(bytes),
            Self::Error(err) => Err(err),
        }
    }
}

impl From<Result<Vec<u8>, BusError>> for Reply {
    fn from(result: Result<Vec<u8>, BusError>) -> Self {
        match result {
            Ok(bytes) => Self::Return(bytes),
            Err(err) => Self::Error(err),
        }
    }
}

/// Broker's answer to [`Request::Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Handshake {
    Accepted {
        version: ProtocolVersion,
        client_id: ClientId,
    },
    Rejected {
        reason: String,
        version: ProtocolVersion,
    },
}

impl Handshake {
    pub fn accepted(client_id: ClientId) -> Self {
        Self::Accepted {
            version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            version: ProtocolVersion::CURRENT,
        }
    }
}

/// A signal as written to a signal channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub path: String,
    pub interface: String,
    pub name: String,
    pub sent_secs: i64,
    pub sent_nanos: u32,
    pub track_flight_time: bool,
    pub args: Vec<u8>,
}

impl SignalMessage {
    /// Creates a signal stamped with the current time.
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        name: impl Into<String>,
        args: Vec<u8>,
        track_flight_time: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            interface: interface.into(),
            name: name.into(),
            sent_secs: now.timestamp(),
            sent_nanos: now.timestamp_subsec_nanos(),
            track_flight_time,
            args,
        }
    }

    /// Emission time, if the stamp is representable.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.sent_secs, self.sent_nanos).single()
    }

    /// Microseconds between emission and `now`, clamped at zero.
    pub fn flight_time_micros(&self, now: DateTime<Utc>) -> u64 {
        self.sent_at()
            .and_then(|sent| (now - sent).num_microseconds())
            .map_or(0, |micros| u64::try_from(micros).unwrap_or(0))
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Object path to the set of interfaces registered under it.
pub type ObjectListing = BTreeMap<String, BTreeSet<String>>;

/// One registry entry as seen in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub id: ObjectId,
    pub interface: String,
    pub path: String,
    /// False if a newer registration replaced this entry in the path index.
    pub reachable: bool,
}

/// One signal channel as seen in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub proxy_id: ProxyId,
    pub interface: String,
    pub path: String,
}

/// One connected client as seen in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub signal_channels: Vec<ChannelSummary>,
    pub subscriptions: u32,
}

/// One owner-vanished subscription as seen in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub id: SubscriptionId,
    pub owner: ClientId,
    pub object_id: ObjectId,
    pub interface: String,
    pub path: String,
}

/// Snapshot of the broker's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDump {
    pub objects: Vec<ObjectSummary>,
    pub clients: Vec<ClientSummary>,
    pub subscriptions: Vec<SubscriptionSummary>,
    pub logging: bool,
    pub track_flight_time: bool,
}

impl StateDump {
    /// Returns the client entry for `id`, if connected.
    pub fn client(&self, id: ClientId) -> Option<&ClientSummary> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Number of subscriptions owned by `id`.
    pub fn subscriptions_of(&self, id: ClientId) -> usize {
        self.subscriptions.iter().filter(|s| s.owner == id).count()
    }
}

/// Signal flight times in power-of-two microsecond buckets.
///
/// Bucket `b` counts samples in `[2^(b-1), 2^b)` µs; bucket 0 counts 0 µs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightTimeHistogram {
    pub buckets: BTreeMap<u32, u64>,
}

impl FlightTimeHistogram {
    /// Bucket index for a sample.
    pub fn bucket_for(micros: u64) -> u32 {
        u64::BITS - micros.leading_zeros()
    }

    pub fn record(&mut self, micros: u64) {
        *self.buckets.entry(Self::bucket_for(micros)).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saftbus_core::wire::{from_bytes, to_bytes};

    #[test]
    fn test_request_tag_is_variant_index() {
        let bytes = to_bytes(&Request::lookup("/demo/counter", "demo.Counter")).unwrap();
        assert_eq!(bytes.get(..4), Some(&[2u8, 0, 0, 0][..]));

        let bytes = to_bytes(&Request::ListObjects).unwrap();
        assert_eq!(bytes, vec![10, 0, 0, 0]);
    }

    #[test]
    fn test_call_envelope_survives_wire() {
        let call = Request::Call(CallEnvelope {
            object_id: ObjectId::new(4),
            path: "/demo/counter".into(),
            sender: ClientId::new(2),
            interface: "demo.Counter".into(),
            member: "Increment".into(),
            args: to_bytes(&5i32).unwrap(),
        });
        let bytes = to_bytes(&call).unwrap();
        assert_eq!(from_bytes::<Request>(&bytes).unwrap(), call);
    }

    #[test]
    fn test_property_get_envelope() {
        let env = CallEnvelope::property_get(
            ObjectId::new(1),
            "/demo/counter",
            ClientId::new(3),
            "demo.Counter",
            "value",
        )
        .unwrap();
        assert!(env.is_property_access());
        assert_eq!(env.member, PROPERTY_GET);
        let args: PropertyGet = from_bytes(&env.args).unwrap();
        assert_eq!(args.interface, "demo.Counter");
        assert_eq!(args.name, "value");
    }

    #[test]
    fn test_only_flight_time_is_one_way() {
        assert!(!Request::FlightTime { micros: 3 }.expects_reply());
        assert!(Request::DumpState.expects_reply());
        assert!(Request::hello().expects_reply());
    }

    #[test]
    fn test_reply_result_conversion() {
        let ok: Reply = Ok(vec![1, 2]).into();
        assert_eq!(ok.into_result(), Ok(vec![1, 2]));

        let err: Reply = Err(BusError::stale_object()).into();
        assert!(err.into_result().unwrap_err().is_stale_object());
    }

    #[test]
    fn test_flight_time_from_stamp() {
        let mut msg = SignalMessage::new("/a", "x.Y", "Changed", Vec::new(), true);
        msg.sent_secs = 100;
        msg.sent_nanos = 0;
        let now = Utc.timestamp_opt(100, 2_500_000).single().unwrap();
        assert_eq!(msg.flight_time_micros(now), 2_500);

        // clock went backwards
        let earlier = Utc.timestamp_opt(99, 0).single().unwrap();
        assert_eq!(msg.flight_time_micros(earlier), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        assert_eq!(FlightTimeHistogram::bucket_for(0), 0);
        assert_eq!(FlightTimeHistogram::bucket_for(1), 1);
        assert_eq!(FlightTimeHistogram::bucket_for(3), 2);
        assert_eq!(FlightTimeHistogram::bucket_for(1024), 11);

        let mut hist = FlightTimeHistogram::default();
        hist.record(3);
        hist.record(2);
        hist.record(900);
        assert_eq!(hist.buckets.get(&2), Some(&2));
        assert_eq!(hist.total(), 3);
    }

    #[test]
    fn test_state_dump_queries() {
        let dump = StateDump {
            clients: vec![ClientSummary {
                id: ClientId::new(1),
                signal_channels: Vec::new(),
                subscriptions: 1,
            }],
            subscriptions: vec![SubscriptionSummary {
                id: SubscriptionId::new(1),
                owner: ClientId::new(1),
                object_id: ObjectId::new(1),
                interface: "demo.Counter".into(),
                path: "/demo/counter".into(),
            }],
            ..Default::default()
        };
        assert!(dump.client(ClientId::new(1)).is_some());
        assert!(dump.client(ClientId::new(2)).is_none());
        assert_eq!(dump.subscriptions_of(ClientId::new(1)), 1);
    }
}
