//! Demo `Counter` object, registered by `saftbusd start --demo`.
//!
//! | member              | kind      | signature            |
//! |---------------------|-----------|----------------------|
//! | `Increment(by)`     | method    | `i32 -> i32`         |
//! | `Own()` / `Disown()`| method    | `() -> ()`           |
//! | `GetOwner()`        | method    | `() -> Option<ClientId>` |
//! | `value`             | property  | `i32`, read-only     |
//! | `Changed(value)`    | signal    | `i32`                |
//!
//! Only the owning client may increment while the counter is owned.

use tracing::debug;

use saftbus_core::{to_bytes, BusError, ClientId, ObjectId, Reader};

use crate::broker::{BrokerError, BrokerHandle};
use crate::service::{CallContext, ServiceObject};

pub const COUNTER_PATH: &str = "/demo/counter";
pub const COUNTER_INTERFACE: &str = "demo.Counter";

const COUNTER_INTROSPECTION: &str = r#"<interface name="demo.Counter">
  <method name="Increment">
    <arg name="by" type="i" direction="in"/>
    <arg name="value" type="i" direction="out"/>
  </method>
  <method name="Own"/>
  <method name="Disown"/>
  <method name="GetOwner">
    <arg name="owner" type="mt" direction="out"/>
  </method>
  <property name="value" type="i" access="read"/>
  <signal name="Changed">
    <arg name="value" type="i"/>
  </signal>
</interface>
"#;

#[derive(Debug, Default)]
pub struct Counter {
    value: i32,
    owner: Option<ClientId>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    fn check_owner(&self, sender: Option<ClientId>) -> Result<(), BusError> {
        match (self.owner, sender) {
            (Some(owner), Some(sender)) if owner != sender => Err(BusError::access_denied(
                format!("counter is owned by client {owner}"),
            )),
            _ => Ok(()),
        }
    }
}

impl ServiceObject for Counter {
    fn introspect(&self) -> String {
        COUNTER_INTROSPECTION.to_string()
    }

    fn call(
        &mut self,
        method: &str,
        args: &mut Reader<'_>,
        ctx: &mut CallContext,
    ) -> Result<Vec<u8>, BusError> {
        match method {
            "Increment" => {
                let by: i32 = args.get()?;
                self.check_owner(ctx.sender())?;
                self.value = self
                    .value
                    .checked_add(by)
                    .ok_or_else(|| BusError::invalid_args("counter overflow"))?;
                ctx.emit_value("Changed", &self.value)?;
                Ok(to_bytes(&self.value)?)
            }
            "Own" => {
                let sender = ctx
                    .sender()
                    .ok_or_else(|| BusError::failed("Own requires a calling client"))?;
                self.check_owner(Some(sender))?;
                self.owner = Some(sender);
                ctx.watch_owner(sender);
                Ok(Vec::new())
            }
            "Disown" => {
                self.check_owner(ctx.sender())?;
                if let Some(owner) = self.owner.take() {
                    ctx.unwatch_owner(owner);
                }
                Ok(Vec::new())
            }
            "GetOwner" => Ok(to_bytes(&self.owner)?),
            other => Err(BusError::invalid_args(format!(
                "unknown method '{other}' on {COUNTER_INTERFACE}"
            ))),
        }
    }

    fn get_property(&mut self, name: &str, _ctx: &mut CallContext) -> Result<Vec<u8>, BusError> {
        match name {
            "value" => Ok(to_bytes(&self.value)?),
            other => Err(BusError::invalid_args(format!("no such property '{other}'"))),
        }
    }

    fn owner_vanished(&mut self, owner: ClientId, _ctx: &mut CallContext) {
        if self.owner == Some(owner) {
            debug!(client_id = %owner, "Counter owner vanished, releasing");
            self.owner = None;
        }
    }
}

/// Registers a fresh [`Counter`] at `/demo/counter`.
pub async fn register_demo(broker: &BrokerHandle) -> Result<ObjectId, BrokerError> {
    broker
        .register_object(COUNTER_INTERFACE, COUNTER_PATH, Counter::new())
        .await
}
