//! Object registry and path index.
//!
//! The registry maps ObjectIds to registered objects; the path index maps
//! (interface, path) to the *current* ObjectId. Re-registering an
//! (interface, path) pair moves the index to the new id and leaves the old
//! entry in place, unreachable by lookup, until it is unregistered or
//! collected.

use std::collections::BTreeMap;

use saftbus_core::{validate_interface_name, validate_object_path, BusError, ObjectId};
use saftbus_protocol::{ObjectListing, ObjectSummary};

use crate::service::ServiceObject;

/// One registered object.
pub struct RegistryEntry {
    pub interface: String,
    pub path: String,
    pub object: Box<dyn ServiceObject>,
}

/// Registered objects plus the (interface, path) index.
#[derive(Default)]
pub struct ObjectRegistry {
    entries: BTreeMap<ObjectId, RegistryEntry>,
    index: BTreeMap<String, BTreeMap<String, ObjectId>>,
    last_id: u32,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` and points the index for (interface, path) at it.
    ///
    /// # Errors
    ///
    /// Invalid-arguments for a malformed path or interface name, or for the
    /// reserved properties interface; failed once the id space is exhausted.
    pub fn register(
        &mut self,
        interface: &str,
        path: &str,
        object: Box<dyn ServiceObject>,
    ) -> Result<ObjectId, BusError> {
        validate_object_path(path)?;
        validate_interface_name(interface)?;

        let id = ObjectId::new(self.last_id)
            .next()
            .ok_or_else(|| BusError::failed("object id space exhausted"))?;
        self.last_id = id.get();

        self.entries.insert(
            id,
            RegistryEntry {
                interface: interface.to_string(),
                path: path.to_string(),
                object,
            },
        );
        self.index
            .entry(interface.to_string())
            .or_default()
            .insert(path.to_string(), id);
        Ok(id)
    }

    /// Removes the entry for `id`. The index is left untouched.
    pub fn unregister(&mut self, id: ObjectId) -> Option<RegistryEntry> {
        self.entries.remove(&id)
    }

    /// Id the index currently holds for (interface, path).
    pub fn current(&self, interface: &str, path: &str) -> Option<ObjectId> {
        self.index.get(interface)?.get(path).copied()
    }

    /// Resolves (interface, path) to a live ObjectId.
    pub fn resolve(&self, interface: &str, path: &str) -> Result<ObjectId, BusError> {
        match self.current(interface, path) {
            Some(id) if self.entries.contains_key(&id) => Ok(id),
            _ => Err(BusError::no_such_object()),
        }
    }

    /// Checks a caller's cached id against the current registration.
    ///
    /// Fails with the stale-object error if (interface, path) now names a
    /// different object, and with the no-such-object error if nothing live
    /// is registered there.
    pub fn verify(
        &self,
        interface: &str,
        path: &str,
        claimed: ObjectId,
    ) -> Result<ObjectId, BusError> {
        let Some(current) = self.current(interface, path) else {
            return Err(BusError::no_such_object());
        };
        if current != claimed {
            return Err(BusError::stale_object());
        }
        if !self.entries.contains_key(&current) {
            return Err(BusError::no_such_object());
        }
        Ok(current)
    }

    pub fn get(&self, id: ObjectId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if the index still leads to `id`.
    pub fn is_reachable(&self, id: ObjectId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| self.current(&e.interface, &e.path) == Some(id))
    }

    /// Drops entries the index no longer leads to, and index slots that
    /// point at removed entries.
    pub fn collect_unreachable(&mut self) -> Vec<(ObjectId, RegistryEntry)> {
        let unreachable: Vec<ObjectId> = self
            .entries
            .keys()
            .copied()
            .filter(|id| !self.is_reachable(*id))
            .collect();

        let collected = unreachable
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect();

        let entries = &self.entries;
        for paths in self.index.values_mut() {
            paths.retain(|_, id| entries.contains_key(id));
        }
        self.index.retain(|_, paths| !paths.is_empty());

        collected
    }

    /// Path to the set of interfaces with a live registration there.
    pub fn listing(&self) -> ObjectListing {
        let mut listing = ObjectListing::new();
        for (interface, paths) in &self.index {
            for (path, id) in paths {
                if self.entries.contains_key(id) {
                    listing
                        .entry(path.clone())
                        .or_default()
                        .insert(interface.clone());
                }
            }
        }
        listing
    }

    pub fn summaries(&self) -> Vec<ObjectSummary> {
        self.entries
            .iter()
            .map(|(id, entry)| ObjectSummary {
                id: *id,
                interface: entry.interface.clone(),
                path: entry.path.clone(),
                reachable: self.is_reachable(*id),
            })
            .collect()
    }
}
