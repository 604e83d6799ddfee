use std::any::Any;
use std::sync::Arc;

use crate::error::{ObjectError, ObjectResult};
use crate::value::Value;

/// Shared handle to an object.
pub type Handle = Arc<dyn Object>;

/// The capability every addressable object implements.
///
/// All method calls go through the single [`invoke`](Object::invoke) entry
/// point, which is what lets a proxy stand in for a local, persistent, or
/// remote target without the caller noticing. The remaining methods are the
/// identity and type predicates each variant answers for itself.
pub trait Object: Any + Send + Sync {
    /// Invoke `method` with `args`, forwarding `block` as the trailing
    /// callback.
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value>;

    /// Name of the concrete type (for instances, the class name).
    fn type_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn is_nil(&self) -> bool {
        false
    }

    /// `true` for handles that forward to some other target.
    fn is_proxy(&self) -> bool {
        false
    }

    /// The target of a transparent proxy, resolving it if necessary.
    /// `None` for objects that are their own target.
    fn resolved(&self) -> Option<ObjectResult<Value>> {
        None
    }

    fn inspect(&self) -> String {
        format!("#<{}>", self.type_name())
    }
}

/// Identity of a handle: the address of the shared allocation.
///
/// Only meaningful while the handle is alive; callers that key maps by
/// identity must keep the handle alive alongside the key.
pub fn identity(handle: &Handle) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// Downcast a handle to its concrete type.
pub fn downcast<T: Object>(handle: &Handle) -> Option<&T> {
    handle.as_any().downcast_ref::<T>()
}

/// Call the trailing block, failing if none was given.
pub fn yield_block(block: Option<&Value>, args: Vec<Value>) -> ObjectResult<Value> {
    match block {
        Some(b) if !b.is_nil() => b.send("call", args, None),
        _ => Err(ObjectError::Application("no block given (yield)".into())),
    }
}

type CallbackFn = dyn Fn(Vec<Value>) -> ObjectResult<Value> + Send + Sync;

/// A closure that answers `call`; the block passed alongside a method call.
pub struct Callback {
    f: Box<CallbackFn>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> ObjectResult<Value> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }

    pub fn into_value(self) -> Value {
        Value::object(self)
    }
}

impl Object for Callback {
    fn invoke(&self, method: &str, args: Vec<Value>, _block: Option<Value>) -> ObjectResult<Value> {
        match method {
            "call" => (self.f)(args),
            other => Err(ObjectError::no_method("Proc", other)),
        }
    }

    fn type_name(&self) -> &str {
        "Proc"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Forces copy semantics when the wrapped value crosses a connection.
/// Locally it is transparent.
pub struct ByVal(pub Value);

impl ByVal {
    pub fn wrap(value: Value) -> Value {
        Value::object(ByVal(value))
    }
}

impl Object for ByVal {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        self.0.send(method, args, block)
    }

    fn type_name(&self) -> &str {
        self.0.type_name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn resolved(&self) -> Option<ObjectResult<Value>> {
        Some(Ok(self.0.clone()))
    }

    fn inspect(&self) -> String {
        self.0.inspect()
    }
}

/// Forces reference semantics when the wrapped value crosses a connection,
/// even for value-typed data. Locally it is transparent.
pub struct ByRef(pub Value);

impl ByRef {
    pub fn wrap(value: Value) -> Value {
        Value::object(ByRef(value))
    }
}

impl Object for ByRef {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        self.0.send(method, args, block)
    }

    fn type_name(&self) -> &str {
        self.0.type_name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn resolved(&self) -> Option<ObjectResult<Value>> {
        Some(Ok(self.0.clone()))
    }

    fn inspect(&self) -> String {
        self.0.inspect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_answers_call() {
        let cb = Callback::new(|args| Ok(Value::Int(args.len() as i64)));
        let v = cb.into_value();
        let out = v.send("call", vec![Value::Nil, Value::Nil], None).unwrap();
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn yield_without_block_fails() {
        assert!(yield_block(None, vec![]).is_err());
        assert!(yield_block(Some(&Value::Nil), vec![]).is_err());
    }

    #[test]
    fn yield_forwards_args() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let block = Callback::new(move |args| {
            counter.fetch_add(args[0].as_int()? as usize, Ordering::SeqCst);
            Ok(Value::Nil)
        })
        .into_value();
        yield_block(Some(&block), vec![Value::Int(5)]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn wrappers_are_transparent_locally() {
        let v = ByVal::wrap(Value::Int(4));
        assert_eq!(v.send("+", vec![Value::Int(1)], None).unwrap(), Value::Int(5));
        assert_eq!(v.type_name(), "Integer");
        assert!(!v.is_nil());

        let r = ByRef::wrap(Value::Nil);
        assert!(r.is_nil());
        assert_eq!(r.clone().resolve_proxies().unwrap(), Value::Nil);
    }

    #[test]
    fn identity_is_stable_across_clones() {
        let h: Handle = Arc::new(Callback::new(|_| Ok(Value::Nil)));
        let h2 = Arc::clone(&h);
        assert_eq!(identity(&h), identity(&h2));
        assert!(downcast::<Callback>(&h).is_some());
        assert!(downcast::<ByVal>(&h).is_none());
    }
}
