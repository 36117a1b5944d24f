//! Contract between the broker and the objects it hosts.
//!
//! An object implements [`ServiceObject`] and is registered with the broker
//! under an (interface, path) pair. The broker invokes its handlers from the
//! actor task, one at a time, so implementations need no locking.
//!
//! Handlers must not block. Anything a handler wants to change in the broker
//! (emitting a signal, registering another object, watching a client) is
//! queued on the [`CallContext`] and applied after the handler returns.

use serde::Serialize;

use saftbus_core::{to_bytes, BusError, ClientId, ObjectId, Reader};

/// An object exposed on the bus.
pub trait ServiceObject: Send + 'static {
    /// Introspection document returned verbatim to clients.
    fn introspect(&self) -> String;

    /// Invokes `method` with the encoded arguments in `args`.
    ///
    /// Returns the encoded return value.
    fn call(
        &mut self,
        method: &str,
        args: &mut Reader<'_>,
        ctx: &mut CallContext,
    ) -> Result<Vec<u8>, BusError>;

    /// Returns the encoded value of property `name`.
    fn get_property(&mut self, name: &str, ctx: &mut CallContext) -> Result<Vec<u8>, BusError> {
        let _ = ctx;
        Err(BusError::invalid_args(format!("no such property '{name}'")))
    }

    /// Sets property `name` from the encoded value in `value`.
    fn set_property(
        &mut self,
        name: &str,
        value: &mut Reader<'_>,
        ctx: &mut CallContext,
    ) -> Result<(), BusError> {
        let _ = (value, ctx);
        Err(BusError::access_denied(format!(
            "property '{name}' is not writable"
        )))
    }

    /// A client this object watched with [`CallContext::watch_owner`]
    /// disconnected.
    fn owner_vanished(&mut self, owner: ClientId, ctx: &mut CallContext) {
        let _ = (owner, ctx);
    }
}

/// A broker change requested by a handler.
pub enum Effect {
    Emit {
        path: String,
        interface: String,
        name: String,
        args: Vec<u8>,
    },
    Register {
        interface: String,
        path: String,
        object: Box<dyn ServiceObject>,
    },
    Unregister(ObjectId),
    WatchOwner {
        owner: ClientId,
        object_id: ObjectId,
    },
    UnwatchOwner {
        owner: ClientId,
        object_id: ObjectId,
    },
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emit {
                path,
                interface,
                name,
                ..
            } => write!(f, "Emit({interface}.{name} on {path})"),
            Self::Register {
                interface, path, ..
            } => write!(f, "Register({interface} at {path})"),
            Self::Unregister(id) => write!(f, "Unregister({id})"),
            Self::WatchOwner { owner, object_id } => {
                write!(f, "WatchOwner({owner} by {object_id})")
            }
            Self::UnwatchOwner { owner, object_id } => {
                write!(f, "UnwatchOwner({owner} by {object_id})")
            }
        }
    }
}

/// Per-invocation context handed to every handler.
#[derive(Debug)]
pub struct CallContext {
    sender: Option<ClientId>,
    object_id: ObjectId,
    path: String,
    interface: String,
    effects: Vec<Effect>,
}

impl CallContext {
    /// Context for a call made by `sender`.
    pub fn new(
        sender: Option<ClientId>,
        object_id: ObjectId,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            object_id,
            path: path.into(),
            interface: interface.into(),
            effects: Vec::new(),
        }
    }

    /// Client that issued the call; `None` for broker-originated callbacks.
    pub fn sender(&self) -> Option<ClientId> {
        self.sender
    }

    /// Id of the object being invoked.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Emits signal `name` from this object with pre-encoded arguments.
    pub fn emit(&mut self, name: impl Into<String>, args: Vec<u8>) {
        self.effects.push(Effect::Emit {
            path: self.path.clone(),
            interface: self.interface.clone(),
            name: name.into(),
            args,
        });
    }

    /// Emits signal `name` from this object with one encoded value.
    pub fn emit_value<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), BusError> {
        let args = to_bytes(value)?;
        self.emit(name, args);
        Ok(())
    }

    /// Emits a signal on behalf of another object.
    pub fn emit_on(
        &mut self,
        path: impl Into<String>,
        interface: impl Into<String>,
        name: impl Into<String>,
        args: Vec<u8>,
    ) {
        self.effects.push(Effect::Emit {
            path: path.into(),
            interface: interface.into(),
            name: name.into(),
            args,
        });
    }

    /// Registers another object once this handler returns.
    pub fn register(
        &mut self,
        interface: impl Into<String>,
        path: impl Into<String>,
        object: Box<dyn ServiceObject>,
    ) {
        self.effects.push(Effect::Register {
            interface: interface.into(),
            path: path.into(),
            object,
        });
    }

    /// Unregisters an object once this handler returns.
    pub fn unregister(&mut self, object_id: ObjectId) {
        self.effects.push(Effect::Unregister(object_id));
    }

    /// Asks for [`ServiceObject::owner_vanished`] when `owner` disconnects.
    pub fn watch_owner(&mut self, owner: ClientId) {
        self.effects.push(Effect::WatchOwner {
            owner,
            object_id: self.object_id,
        });
    }

    /// Drops a watch set with [`CallContext::watch_owner`].
    pub fn unwatch_owner(&mut self, owner: ClientId) {
        self.effects.push(Effect::UnwatchOwner {
            owner,
            object_id: self.object_id,
        });
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}
