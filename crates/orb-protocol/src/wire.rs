//! Values as they travel between peers.

use std::cell::Cell;

use orb_types::{Datum, ErrorValue, ObjectError, ObjectResult, Range, Value};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Deepest nesting of wire values a frame may carry. Each wire value counts
/// as one level, leaves included.
pub const MAX_NESTING: usize = 128;

/// The wire form of a [`Value`].
///
/// Value-typed data is copied. Objects travel either as references (an
/// export id minted by one side of the connection) or, when forced by value,
/// as a class name plus field values.
///
/// Decoding fails on values nested deeper than [`MAX_NESTING`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum WireValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Range(Range),
    List(Vec<WireValue>),
    Map(Vec<(WireValue, WireValue)>),
    Error(ErrorValue),
    /// An object exported by the sender under this id.
    Remote(u64),
    /// An object the receiver exported earlier, handed back to it.
    Local(u64),
    /// A copied instance of a registered class.
    Instance {
        class: String,
        fields: Vec<(String, WireValue)>,
    },
}

/// Rewrites the references embedded in a [`WireValue`] while it is loaded.
pub trait ReferenceHook {
    /// An object exported by the peer: bind a proxy to this connection.
    fn remote(&self, id: u64) -> ObjectResult<Value>;

    /// One of our own exports coming back: resolve it directly.
    fn local(&self, id: u64) -> ObjectResult<Value>;

    /// Re-materialize a copied instance.
    fn instance(&self, class: &str, fields: Vec<(String, Value)>) -> ObjectResult<Value>;
}

impl WireValue {
    /// Turn into a [`Value`], passing every reference through `hook`.
    pub fn load(self, hook: &dyn ReferenceHook) -> ObjectResult<Value> {
        self.load_at(hook, 1)
    }

    fn load_at(self, hook: &dyn ReferenceHook, depth: usize) -> ObjectResult<Value> {
        if depth > MAX_NESTING {
            return Err(too_deep());
        }
        let depth = depth + 1;
        Ok(match self {
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(n) => Value::Int(n),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Symbol(s) => Value::Symbol(s),
            WireValue::Range(r) => Value::Range(r),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| v.load_at(hook, depth))
                    .collect::<ObjectResult<_>>()?,
            ),
            WireValue::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((k.load_at(hook, depth)?, v.load_at(hook, depth)?)))
                    .collect::<ObjectResult<_>>()?,
            ),
            WireValue::Error(e) => Value::Error(e),
            WireValue::Remote(id) => hook.remote(id)?,
            WireValue::Local(id) => hook.local(id)?,
            WireValue::Instance { class, fields } => {
                let fields = fields
                    .into_iter()
                    .map(|(name, v)| Ok((name, v.load_at(hook, depth)?)))
                    .collect::<ObjectResult<_>>()?;
                hook.instance(&class, fields)?
            }
        })
    }
}

/// The error for a value nested deeper than [`MAX_NESTING`].
pub fn too_deep() -> ObjectError {
    ObjectError::Application(format!("value nested deeper than {MAX_NESTING} levels"))
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One level of [`WireValue`] being decoded on this thread.
struct DecodeLevel;

impl DecodeLevel {
    fn enter() -> Option<Self> {
        DECODE_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            (next <= MAX_NESTING).then(|| {
                depth.set(next);
                DecodeLevel
            })
        })
    }
}

impl Drop for DecodeLevel {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Field-for-field mirror of [`WireValue`] that decoding goes through, so
/// each nested value passes the depth check again.
#[derive(Deserialize)]
#[serde(rename = "WireValue")]
enum Nested {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Range(Range),
    List(Vec<WireValue>),
    Map(Vec<(WireValue, WireValue)>),
    Error(ErrorValue),
    Remote(u64),
    Local(u64),
    Instance {
        class: String,
        fields: Vec<(String, WireValue)>,
    },
}

impl From<Nested> for WireValue {
    fn from(nested: Nested) -> Self {
        match nested {
            Nested::Nil => WireValue::Nil,
            Nested::Bool(b) => WireValue::Bool(b),
            Nested::Int(n) => WireValue::Int(n),
            Nested::Float(f) => WireValue::Float(f),
            Nested::Str(s) => WireValue::Str(s),
            Nested::Symbol(s) => WireValue::Symbol(s),
            Nested::Range(r) => WireValue::Range(r),
            Nested::List(items) => WireValue::List(items),
            Nested::Map(pairs) => WireValue::Map(pairs),
            Nested::Error(e) => WireValue::Error(e),
            Nested::Remote(id) => WireValue::Remote(id),
            Nested::Local(id) => WireValue::Local(id),
            Nested::Instance { class, fields } => WireValue::Instance { class, fields },
        }
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let _level = DecodeLevel::enter().ok_or_else(|| D::Error::custom(too_deep()))?;
        Nested::deserialize(deserializer).map(WireValue::from)
    }
}

impl From<Datum> for WireValue {
    fn from(datum: Datum) -> Self {
        match datum {
            Datum::Nil => WireValue::Nil,
            Datum::Bool(b) => WireValue::Bool(b),
            Datum::Int(n) => WireValue::Int(n),
            Datum::Float(f) => WireValue::Float(f),
            Datum::Str(s) => WireValue::Str(s),
            Datum::Symbol(s) => WireValue::Symbol(s),
            Datum::Range(r) => WireValue::Range(r),
            Datum::List(items) => WireValue::List(items.into_iter().map(Into::into).collect()),
            Datum::Map(pairs) => WireValue::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            Datum::Error(e) => WireValue::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_types::ObjectError;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<String>>,
    }

    impl ReferenceHook for Recorder {
        fn remote(&self, id: u64) -> ObjectResult<Value> {
            self.seen.borrow_mut().push(format!("remote {id}"));
            Ok(Value::Int(id as i64))
        }

        fn local(&self, id: u64) -> ObjectResult<Value> {
            if id == 0 {
                return Err(ObjectError::InvalidReference("local 0".into()));
            }
            self.seen.borrow_mut().push(format!("local {id}"));
            Ok(Value::Int(-(id as i64)))
        }

        fn instance(&self, class: &str, fields: Vec<(String, Value)>) -> ObjectResult<Value> {
            self.seen.borrow_mut().push(format!("{class}/{}", fields.len()));
            Ok(Value::Str(class.to_string()))
        }
    }

    #[test]
    fn load_routes_references_through_hook() {
        let hook = Recorder::default();
        let wire = WireValue::List(vec![
            WireValue::Remote(3),
            WireValue::Map(vec![(WireValue::Symbol("k".into()), WireValue::Local(4))]),
            WireValue::Instance {
                class: "Employee".into(),
                fields: vec![("name".into(), WireValue::Str("brian".into()))],
            },
        ]);
        let value = wire.load(&hook).unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::Int(3),
                Value::Map(vec![(Value::symbol("k"), Value::Int(-4))]),
                Value::Str("Employee".into()),
            ])
        );
        assert_eq!(
            *hook.seen.borrow(),
            vec!["remote 3", "local 4", "Employee/1"]
        );
    }

    #[test]
    fn hook_failure_aborts_load() {
        let hook = Recorder::default();
        let err = WireValue::List(vec![WireValue::Local(0)]).load(&hook).unwrap_err();
        assert!(matches!(err, ObjectError::InvalidReference(_)));
    }

    #[test]
    fn plain_data_loads_without_the_hook() {
        let hook = Recorder::default();
        let datum = Value::List(vec![Value::Int(1), Value::Str("a".into())])
            .to_datum()
            .unwrap();
        let value = WireValue::from(datum).load(&hook).unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(1), Value::Str("a".into())]));
        assert!(hook.seen.borrow().is_empty());
    }

    fn nested(levels: usize) -> WireValue {
        (0..levels).fold(WireValue::Nil, |inner, _| WireValue::List(vec![inner]))
    }

    #[test]
    fn load_stops_at_the_nesting_limit() {
        let hook = Recorder::default();
        assert!(nested(MAX_NESTING - 1).load(&hook).is_ok());
        let err = nested(MAX_NESTING).load(&hook).unwrap_err();
        assert!(matches!(err, ObjectError::Application(_)));
    }

    #[test]
    fn decoding_stops_at_the_nesting_limit() {
        let ok = bincode::serialize(&nested(MAX_NESTING - 1)).unwrap();
        let back: WireValue = bincode::deserialize(&ok).unwrap();
        assert_eq!(back, nested(MAX_NESTING - 1));

        let deep = bincode::serialize(&nested(MAX_NESTING)).unwrap();
        assert!(bincode::deserialize::<WireValue>(&deep).is_err());
        // The depth count unwinds after a failure.
        assert!(bincode::deserialize::<WireValue>(&ok).is_ok());
    }
}
