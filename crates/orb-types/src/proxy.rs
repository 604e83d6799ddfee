//! The transparent proxy shared by the persistent store and the remote
//! protocol.

use std::any::Any;
use std::sync::OnceLock;

use crate::error::ObjectResult;
use crate::object::Object;
use crate::value::Value;

/// Produces the target of a [`LazyProxy`].
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self) -> ObjectResult<Value>;

    /// Short description used in diagnostics for unresolved proxies.
    fn describe(&self) -> String;
}

/// A handle that materializes its target on first use and forwards every
/// invocation to it.
///
/// Resolution happens at most once per proxy; the result is cached and reused
/// for all later calls. Failed resolutions are not cached.
pub struct LazyProxy<R> {
    resolver: R,
    target: OnceLock<Value>,
}

impl<R: Resolve> LazyProxy<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            target: OnceLock::new(),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// The cached target, without resolving.
    pub fn peek(&self) -> Option<&Value> {
        self.target.get()
    }

    /// The target, resolving it on first call.
    pub fn target(&self) -> ObjectResult<&Value> {
        if let Some(v) = self.target.get() {
            return Ok(v);
        }
        let resolved = self.resolver.resolve()?;
        Ok(self.target.get_or_init(|| resolved))
    }

    pub fn into_value(self) -> Value {
        Value::object(self)
    }
}

impl<R: Resolve> Object for LazyProxy<R> {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        let target = self.target()?.clone();
        target.send(method, args, block)
    }

    fn type_name(&self) -> &str {
        match self.peek() {
            Some(target) => target.type_name(),
            None => "Proxy",
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_nil(&self) -> bool {
        self.peek().is_some_and(Value::is_nil)
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn resolved(&self) -> Option<ObjectResult<Value>> {
        Some(self.target().cloned())
    }

    fn inspect(&self) -> String {
        match self.target() {
            Ok(target) => target.inspect(),
            Err(_) => format!("#<Proxy {}>", self.resolver.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObjectError;
    use crate::object::Callback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Resolver backed by a closure.
    struct FnResolver<F> {
        f: F,
        label: String,
    }

    impl<F> FnResolver<F>
    where
        F: Fn() -> ObjectResult<Value> + Send + Sync + 'static,
    {
        fn new(label: impl Into<String>, f: F) -> Self {
            Self {
                f,
                label: label.into(),
            }
        }
    }

    impl<F> Resolve for FnResolver<F>
    where
        F: Fn() -> ObjectResult<Value> + Send + Sync + 'static,
    {
        fn resolve(&self) -> ObjectResult<Value> {
            (self.f)()
        }

        fn describe(&self) -> String {
            self.label.clone()
        }
    }

    /// Resolver for a target that can never be produced.
    struct Dangling(String);

    impl Resolve for Dangling {
        fn resolve(&self) -> ObjectResult<Value> {
            Err(ObjectError::InvalidReference(self.0.clone()))
        }

        fn describe(&self) -> String {
            self.0.clone()
        }
    }

    fn counting_proxy(hits: Arc<AtomicUsize>) -> Value {
        LazyProxy::new(FnResolver::new("counter", move || {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(41))
        }))
        .into_value()
    }

    #[test]
    fn resolves_at_most_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let proxy = counting_proxy(Arc::clone(&hits));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let a = proxy.send("+", vec![Value::Int(1)], None).unwrap();
        let b = proxy.send("to_s", vec![], None).unwrap();
        assert_eq!(a, Value::Int(42));
        assert_eq!(b, Value::Str("41".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forwards_to_resolved_object() {
        let target = Callback::new(|args| Ok(Value::List(args))).into_value();
        let proxy = LazyProxy::new(FnResolver::new("cb", move || Ok(target.clone()))).into_value();
        let out = proxy.send("call", vec![Value::Int(1)], None).unwrap();
        assert_eq!(out, Value::List(vec![Value::Int(1)]));
    }

    #[test]
    fn dangling_proxy_is_invalid_reference() {
        let proxy = LazyProxy::new(Dangling("object 9".into())).into_value();
        let err = proxy.send("inspect", vec![], None).unwrap_err();
        assert!(matches!(err, ObjectError::InvalidReference(_)));
        assert_eq!(proxy.inspect(), "#<Proxy object 9>");
    }

    #[test]
    fn proxy_is_not_nil_until_target_says_so() {
        let proxy = LazyProxy::new(FnResolver::new("nil", || Ok(Value::Nil))).into_value();
        assert!(!proxy.is_nil());
        assert_eq!(proxy.clone().resolve_proxies().unwrap(), Value::Nil);
        assert!(proxy.is_nil());
    }

    #[test]
    fn type_name_follows_target() {
        let proxy = LazyProxy::new(FnResolver::new("s", || Ok(Value::Str("x".into()))));
        assert_eq!(proxy.type_name(), "Proxy");
        proxy.target().unwrap();
        assert_eq!(proxy.type_name(), "String");
    }
}
