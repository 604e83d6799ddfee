use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorValue, ObjectError, ObjectResult};
use crate::object::{Handle, Object};

/// Inclusive or exclusive integer range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: i64,
    pub end: i64,
    pub exclusive: bool,
}

impl Range {
    pub fn inclusive(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            exclusive: false,
        }
    }

    pub fn exclusive(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            exclusive: true,
        }
    }

    pub fn contains(&self, n: i64) -> bool {
        if self.exclusive {
            n >= self.start && n < self.end
        } else {
            n >= self.start && n <= self.end
        }
    }
}

/// A dynamic value.
///
/// Every variant except [`Value::Object`] is value-typed: it is copied when it
/// crosses a process boundary and stored inline as a serialized payload.
/// Objects are shared by handle and cross boundaries by reference.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Range(Range),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Error(ErrorValue),
    Object(Handle),
}

/// The object-free mirror of [`Value`]; what value-typed data serializes as.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Range(Range),
    List(Vec<Datum>),
    Map(Vec<(Datum, Datum)>),
    Error(ErrorValue),
}

impl Value {
    /// Wrap an object in a fresh handle.
    pub fn object(object: impl Object) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Value::Symbol(name.into())
    }

    /// Nil check that honours proxies: a handle is nil only if its concrete
    /// variant says so.
    pub fn is_nil(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Object(h) => h.is_nil(),
            _ => false,
        }
    }

    pub fn is_value_typed(&self) -> bool {
        !matches!(self, Value::Object(_))
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Object(h) => Some(h),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Range(_) => "Range",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Error(e) => &e.class,
            Value::Object(h) => h.type_name(),
        }
    }

    /// Follow transparent proxies down to their target.
    pub fn resolve_proxies(self) -> ObjectResult<Value> {
        let mut current = self;
        loop {
            let next = match &current {
                Value::Object(h) => match h.resolved() {
                    Some(target) => target?,
                    None => return Ok(current),
                },
                _ => return Ok(current),
            };
            current = next;
        }
    }

    pub fn as_bool(&self) -> ObjectResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ObjectError::type_mismatch("Bool", other.type_name())),
        }
    }

    pub fn as_int(&self) -> ObjectResult<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(ObjectError::type_mismatch("Integer", other.type_name())),
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_float(&self) -> ObjectResult<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(n) => Ok(*n as f64),
            other => Err(ObjectError::type_mismatch("Float", other.type_name())),
        }
    }

    pub fn as_str(&self) -> ObjectResult<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Ok(s),
            other => Err(ObjectError::type_mismatch("String", other.type_name())),
        }
    }

    pub fn as_list(&self) -> ObjectResult<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(ObjectError::type_mismatch("List", other.type_name())),
        }
    }

    /// Copy into a [`Datum`]. Fails if an object handle is reachable.
    pub fn to_datum(&self) -> ObjectResult<Datum> {
        Ok(match self {
            Value::Nil => Datum::Nil,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Int(n) => Datum::Int(*n),
            Value::Float(f) => Datum::Float(*f),
            Value::Str(s) => Datum::Str(s.clone()),
            Value::Symbol(s) => Datum::Symbol(s.clone()),
            Value::Range(r) => Datum::Range(*r),
            Value::List(items) => {
                Datum::List(items.iter().map(Value::to_datum).collect::<ObjectResult<_>>()?)
            }
            Value::Map(pairs) => Datum::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((k.to_datum()?, v.to_datum()?)))
                    .collect::<ObjectResult<_>>()?,
            ),
            Value::Error(e) => Datum::Error(e.clone()),
            Value::Object(h) => return Err(ObjectError::NotCopyable(h.type_name().to_string())),
        })
    }

    /// Human-readable rendering in the style of an interactive console.
    pub fn inspect(&self) -> String {
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format!("{f:?}"),
            Value::Str(s) => format!("{s:?}"),
            Value::Symbol(s) => format!(":{s}"),
            Value::Range(r) => {
                let dots = if r.exclusive { "..." } else { ".." };
                format!("{}{dots}{}", r.start, r.end)
            }
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::inspect).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(pairs) => {
                let inner: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{} => {}", k.inspect(), v.inspect()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Error(e) => format!("#<{}: {}>", e.class, e.message),
            Value::Object(h) => h.inspect(),
        }
    }

    /// Send a message to this value. Objects dispatch through
    /// [`Object::invoke`]; value-typed receivers answer a small built-in set.
    pub fn send(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        match self {
            Value::Object(h) => h.invoke(method, args, block),
            _ => self.send_builtin(method, args),
        }
    }

    fn send_builtin(&self, method: &str, args: Vec<Value>) -> ObjectResult<Value> {
        match (method, args.len()) {
            ("inspect", 0) => Ok(Value::Str(self.inspect())),
            ("to_s", 0) => Ok(Value::Str(match self {
                Value::Str(s) | Value::Symbol(s) => s.clone(),
                Value::Nil => String::new(),
                other => other.inspect(),
            })),
            ("class", 0) => Ok(Value::Str(self.type_name().to_string())),
            ("nil?", 0) => Ok(Value::Bool(self.is_nil())),
            ("==", 1) => {
                let other = args.into_iter().next().unwrap_or_default().resolve_proxies()?;
                Ok(Value::Bool(*self == other))
            }
            ("to_f", 0) => Ok(Value::Float(self.as_float()?)),
            ("to_i", 0) => match self {
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                other => Ok(Value::Int(other.as_int()?)),
            },
            ("length" | "size", 0) => match self {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(pairs) => Ok(Value::Int(pairs.len() as i64)),
                _ => Err(ObjectError::no_method(self.type_name(), method)),
            },
            ("[]", 1) => {
                let key = args.into_iter().next().unwrap_or_default().resolve_proxies()?;
                self.index(&key)
            }
            ("+" | "-" | "*" | "/", 1) => {
                let rhs = args.into_iter().next().unwrap_or_default().resolve_proxies()?;
                self.arithmetic(method, &rhs)
            }
            _ => Err(ObjectError::no_method(self.type_name(), method)),
        }
    }

    fn index(&self, key: &Value) -> ObjectResult<Value> {
        match self {
            Value::List(items) => {
                let i = key.as_int()?;
                let i = if i < 0 { items.len() as i64 + i } else { i };
                Ok(usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default())
            }
            Value::Map(pairs) => Ok(pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()),
            _ => Err(ObjectError::no_method(self.type_name(), "[]")),
        }
    }

    fn arithmetic(&self, op: &str, rhs: &Value) -> ObjectResult<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                let result = match op {
                    "+" => a.checked_add(*b),
                    "-" => a.checked_sub(*b),
                    "*" => a.checked_mul(*b),
                    _ => {
                        if *b == 0 {
                            return Err(ObjectError::Application("divided by 0".into()));
                        }
                        a.checked_div(*b)
                    }
                };
                result
                    .map(Value::Int)
                    .ok_or_else(|| ObjectError::Application("integer overflow".into()))
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let (a, b) = (self.as_float()?, rhs.as_float()?);
                Ok(Value::Float(match op {
                    "+" => a + b,
                    "-" => a - b,
                    "*" => a * b,
                    _ => a / b,
                }))
            }
            (Value::Str(a), Value::Str(b)) if op == "+" => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) if op == "+" => {
                Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            _ => Err(ObjectError::type_mismatch(self.type_name(), rhs.type_name())),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

impl From<Datum> for Value {
    fn from(datum: Datum) -> Self {
        match datum {
            Datum::Nil => Value::Nil,
            Datum::Bool(b) => Value::Bool(b),
            Datum::Int(n) => Value::Int(n),
            Datum::Float(f) => Value::Float(f),
            Datum::Str(s) => Value::Str(s),
            Datum::Symbol(s) => Value::Symbol(s),
            Datum::Range(r) => Value::Range(r),
            Datum::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Datum::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (Value::from(k), Value::from(v)))
                    .collect(),
            ),
            Datum::Error(e) => Value::Error(e),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Value::Error(e)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Object(h)
    }
}
