//! Identifier newtypes used by the broker and its clients.
//!
//! All identifiers are opaque integers. They are never parsed from or
//! formatted into strings on the wire; `Display` exists for logging only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-local identifier of one registered object instance.
///
/// Allocated on registration from a monotonically increasing counter and
/// never reused within one broker process. Re-registering the same
/// (interface, path) pair yields a new, distinguishable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Creates an ObjectId from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the id that follows this one.
    ///
    /// Returns `None` once the id space is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity token assigned by the broker to one accepted client connection.
///
/// Signal channels and owner subscriptions are attributed to a ClientId so
/// they can be torn down together when the client's control socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a ClientId from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Process-unique identifier of one client-side proxy.
///
/// Together with the owning [`ClientId`] it names a signal channel globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(u64);

impl ProxyId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy-{}", self.0)
    }
}

/// Handle of one owner-vanished subscription held by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_next_is_monotonic() {
        let id = ObjectId::new(7);
        assert_eq!(id.next(), Some(ObjectId::new(8)));
        assert!(ObjectId::new(8) > id);
    }

    #[test]
    fn test_object_id_exhaustion() {
        assert_eq!(ObjectId::new(u32::MAX).next(), None);
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(ObjectId::new(3).to_string(), "#3");
        assert_eq!(ClientId::new(12).to_string(), "client-12");
        assert_eq!(ProxyId::new(1).to_string(), "proxy-1");
        assert_eq!(SubscriptionId::new(9).to_string(), "sub-9");
    }
}
