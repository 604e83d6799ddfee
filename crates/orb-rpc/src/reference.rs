//! How values cross a connection: substitution on the way out, reference
//! rebinding on the way in.

use std::any::Any;
use std::sync::Arc;

use orb_protocol::{too_deep, ReferenceHook, WireValue, MAX_NESTING};
use orb_types::{downcast, ByVal, Handle, Instance, Object, ObjectError, ObjectResult, Value};
use tracing::trace;

use crate::connection::Shared;

/// An object exported by the peer of a connection.
///
/// Every invocation is shipped to the peer and blocks until the correlated
/// reply arrives. Dropping the proxy queues a `GarbageFound` notice so the
/// peer can release its hold. The root proxy (`target == None`) addresses
/// the peer's fixed exported object and sends no notice.
pub struct RemoteProxy {
    target: Option<u64>,
    conn: Arc<Shared>,
}

impl RemoteProxy {
    pub(crate) fn new(conn: Arc<Shared>, target: Option<u64>) -> Self {
        Self { target, conn }
    }

    /// The peer's export id, or `None` for the root.
    pub fn target(&self) -> Option<u64> {
        self.target
    }

    pub(crate) fn belongs_to(&self, conn: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.conn, conn)
    }
}

impl Object for RemoteProxy {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        self.conn.call(self.target, method, args, block)
    }

    fn type_name(&self) -> &str {
        "RemoteProxy"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn inspect(&self) -> String {
        match self.target {
            Some(id) => format!("#<RemoteProxy {} @ {}>", id, self.conn.peer()),
            None => format!("#<RemoteProxy root @ {}>", self.conn.peer()),
        }
    }
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        if let Some(id) = self.target {
            self.conn.release_later(id);
        }
    }
}

impl Shared {
    /// Substitute `value` for transmission to this connection's peer.
    ///
    /// Precedence for objects: a `ByVal` wrapper is copied, a `ByRef`
    /// wrapper is exported, a proxy for one of the peer's own exports goes
    /// back as a local reference, and anything else is exported. Value-typed
    /// data and errors are always copied.
    ///
    /// Every export id minted on the way is pushed onto `minted`; a message
    /// that is never sent must hand them back through [`Shared::revoke`].
    pub(crate) fn dump(
        self: &Arc<Self>,
        value: &Value,
        minted: &mut Vec<u64>,
    ) -> ObjectResult<WireValue> {
        self.dump_at(value, 1, minted)
    }

    fn dump_at(
        self: &Arc<Self>,
        value: &Value,
        depth: usize,
        minted: &mut Vec<u64>,
    ) -> ObjectResult<WireValue> {
        if depth > MAX_NESTING {
            return Err(too_deep());
        }
        Ok(match value {
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(n) => WireValue::Int(*n),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Symbol(s) => WireValue::Symbol(s.clone()),
            Value::Range(r) => WireValue::Range(*r),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|v| self.dump_at(v, depth + 1, minted))
                    .collect::<ObjectResult<_>>()?,
            ),
            Value::Map(pairs) => WireValue::Map(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        Ok((
                            self.dump_at(k, depth + 1, minted)?,
                            self.dump_at(v, depth + 1, minted)?,
                        ))
                    })
                    .collect::<ObjectResult<_>>()?,
            ),
            Value::Error(e) => WireValue::Error(e.clone()),
            Value::Object(handle) => self.dump_object(handle, depth, minted)?,
        })
    }

    fn dump_object(
        self: &Arc<Self>,
        handle: &Handle,
        depth: usize,
        minted: &mut Vec<u64>,
    ) -> ObjectResult<WireValue> {
        if let Some(ByVal(inner)) = downcast::<ByVal>(handle) {
            return self.copy(inner, depth, minted);
        }
        // A `ByRef` wrapper, like any other object, falls through to export.
        if let Some(proxy) = downcast::<RemoteProxy>(handle) {
            if proxy.belongs_to(self) {
                if let Some(id) = proxy.target {
                    return Ok(WireValue::Local(id));
                }
            }
        }
        let id = self.export(handle);
        minted.push(id);
        Ok(WireValue::Remote(id))
    }

    /// Copy `value` by value: plain data as-is, registered instances as a
    /// class name plus fields. Fields are substituted normally.
    fn copy(
        self: &Arc<Self>,
        value: &Value,
        depth: usize,
        minted: &mut Vec<u64>,
    ) -> ObjectResult<WireValue> {
        let Value::Object(handle) = value else {
            return self.dump_at(value, depth, minted);
        };
        if let Some(instance) = downcast::<Instance>(handle) {
            let fields = instance
                .fields()
                .into_iter()
                .map(|(field, v)| Ok((field.name, self.dump_at(&v, depth + 1, minted)?)))
                .collect::<ObjectResult<_>>()?;
            return Ok(WireValue::Instance {
                class: instance.class().name().to_string(),
                fields,
            });
        }
        match handle.resolved() {
            Some(target) => self.copy(&target?, depth, minted),
            None => Err(ObjectError::NotCopyable(handle.type_name().to_string())),
        }
    }
}

/// Load hook bound to one connection.
pub(crate) struct Rebind<'a> {
    pub(crate) conn: &'a Arc<Shared>,
}

impl ReferenceHook for Rebind<'_> {
    fn remote(&self, id: u64) -> ObjectResult<Value> {
        Ok(Value::object(RemoteProxy::new(Arc::clone(self.conn), Some(id))))
    }

    fn local(&self, id: u64) -> ObjectResult<Value> {
        trace!(id, "resolving local reference");
        self.conn
            .exported_object(id)
            .map(Value::Object)
            .ok_or_else(|| ObjectError::InvalidReference(format!("no local object {id}")))
    }

    fn instance(&self, class: &str, fields: Vec<(String, Value)>) -> ObjectResult<Value> {
        match self.conn.registry() {
            Some(registry) => registry.instantiate(class, fields),
            None => Err(ObjectError::UnknownClass(class.to_string())),
        }
    }
}
