//! Arrays whose elements are stored one row per index and pulled in lazily.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use orb_types::{
    yield_block, Class, ClassBuilder, ClassRegistry, Object, ObjectError, ObjectResult, Value,
};

use crate::error::StoreResult;
use crate::session::Session;

/// Class name persistent arrays are registered under.
pub const ARRAY_CLASS: &str = "Array";

/// Register the `Array` class with `registry` unless it is already there.
pub fn register_array_class(registry: &ClassRegistry) -> ObjectResult<Arc<Class>> {
    if let Some(class) = registry.get(ARRAY_CLASS) {
        return Ok(class);
    }
    registry.register(
        ClassBuilder::new(ARRAY_CLASS)
            .allocator(|class| Ok(Value::object(PersistentArray::new(Arc::clone(class))))),
    )
}

struct Binding {
    session: Weak<Session>,
    id: i64,
    stored_len: Option<usize>,
}

/// An array object.
///
/// Unbound arrays hold their elements in memory. Once written or read, the
/// array is bound to its row id; indexes not yet touched are fetched from
/// the `arrays` relation on first access.
pub struct PersistentArray {
    class: Arc<Class>,
    data: Mutex<BTreeMap<usize, Value>>,
    binding: Mutex<Option<Binding>>,
}

impl PersistentArray {
    pub fn new(class: Arc<Class>) -> Self {
        Self::from_values(class, Vec::new())
    }

    pub fn from_values(class: Arc<Class>, values: Vec<Value>) -> Self {
        Self {
            class,
            data: Mutex::new(values.into_iter().enumerate().collect()),
            binding: Mutex::new(None),
        }
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    /// Row id once bound.
    pub fn id(&self) -> Option<i64> {
        self.binding
            .lock()
            .expect("array lock poisoned")
            .as_ref()
            .map(|b| b.id)
    }

    /// Bind to row `id`. An array already bound to another row keeps its
    /// binding; rebinding to the same row adopts the current session.
    pub(crate) fn bind(&self, session: &Weak<Session>, id: i64) {
        let mut binding = self.binding.lock().expect("array lock poisoned");
        match binding.as_mut() {
            Some(existing) if existing.id == id => existing.session = session.clone(),
            Some(_) => {}
            None => {
                *binding = Some(Binding {
                    session: session.clone(),
                    id,
                    stored_len: None,
                })
            }
        }
    }

    fn session(&self) -> ObjectResult<Option<(Arc<Session>, i64)>> {
        let binding = self.binding.lock().expect("array lock poisoned");
        let Some(b) = binding.as_ref() else {
            return Ok(None);
        };
        let session = b.session.upgrade().ok_or_else(|| {
            ObjectError::InvalidReference(format!("array {} outlived its transaction", b.id))
        })?;
        Ok(Some((session, b.id)))
    }

    fn stored_len(&self) -> ObjectResult<usize> {
        {
            let binding = self.binding.lock().expect("array lock poisoned");
            match binding.as_ref() {
                None => return Ok(0),
                Some(b) => {
                    if let Some(len) = b.stored_len {
                        return Ok(len);
                    }
                }
            }
        }
        let Some((session, id)) = self.session()? else {
            return Ok(0);
        };
        let len = session.db().with(|r| r.array_len(id))?;
        if let Some(b) = self.binding.lock().expect("array lock poisoned").as_mut() {
            b.stored_len = Some(len);
        }
        Ok(len)
    }

    pub fn len(&self) -> ObjectResult<usize> {
        let local = self
            .data
            .lock()
            .expect("array lock poisoned")
            .keys()
            .next_back()
            .map_or(0, |k| k + 1);
        Ok(local.max(self.stored_len()?))
    }

    pub fn is_empty(&self) -> ObjectResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Element `index`; nil past the end.
    pub fn get(&self, index: usize) -> ObjectResult<Value> {
        if let Some(v) = self.data.lock().expect("array lock poisoned").get(&index) {
            return Ok(v.clone());
        }
        let Some((session, id)) = self.session()? else {
            return Ok(Value::Nil);
        };
        let element = session.db().with(|r| r.array_element(id, index))?;
        let value = session.proxy(element);
        Ok(self
            .data
            .lock()
            .expect("array lock poisoned")
            .entry(index)
            .or_insert(value)
            .clone())
    }

    pub fn set(&self, index: usize, value: Value) {
        self.data
            .lock()
            .expect("array lock poisoned")
            .insert(index, value);
    }

    /// Append `value`; returns its index.
    pub fn push(&self, value: Value) -> ObjectResult<usize> {
        let index = self.len()?;
        self.set(index, value);
        Ok(index)
    }

    pub fn to_values(&self) -> ObjectResult<Vec<Value>> {
        (0..self.len()?).map(|i| self.get(i)).collect()
    }

    /// Write every element held in memory as an insert-or-update of its
    /// index. Elements never loaded keep their rows.
    pub(crate) fn flush(&self, session: &Session, id: i64) -> StoreResult<()> {
        let entries: Vec<(usize, Value)> = self
            .data
            .lock()
            .expect("array lock poisoned")
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (index, value) in entries {
            let child = session.write_object(&value)?;
            session
                .db()
                .with(|r| r.upsert_element(id, index, child))?;
        }
        Ok(())
    }

    fn index_arg(&self, arg: Value) -> ObjectResult<Option<usize>> {
        let i = arg.resolve_proxies()?.as_int()?;
        let i = if i < 0 { self.len()? as i64 + i } else { i };
        Ok(usize::try_from(i).ok())
    }
}

impl Object for PersistentArray {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        let given = args.len();
        let mut args = args.into_iter();
        let mut arg = || args.next().unwrap_or_default();
        match (method, given) {
            ("length" | "size", 0) => Ok(Value::Int(self.len()? as i64)),
            ("empty?", 0) => Ok(Value::Bool(self.is_empty()?)),
            ("[]", 1) => match self.index_arg(arg())? {
                Some(i) => self.get(i),
                None => Ok(Value::Nil),
            },
            ("[]=", 2) => {
                let index = self.index_arg(arg())?.ok_or_else(|| {
                    ObjectError::Application("index out of array bounds".into())
                })?;
                let value = arg();
                self.set(index, value.clone());
                Ok(value)
            }
            ("<<" | "push", 1) => {
                let value = arg();
                self.push(value.clone())?;
                Ok(value)
            }
            ("each", 0) => {
                for i in 0..self.len()? {
                    yield_block(block.as_ref(), vec![self.get(i)?])?;
                }
                Ok(Value::Nil)
            }
            ("each_index", 0) => {
                for i in 0..self.len()? {
                    yield_block(block.as_ref(), vec![Value::Int(i as i64)])?;
                }
                Ok(Value::Nil)
            }
            ("to_a", 0) => Ok(Value::List(self.to_values()?)),
            ("class", 0) => Ok(Value::Object(self.class.handle())),
            ("inspect" | "to_s", 0) => Ok(Value::Str(self.inspect())),
            _ => Err(ObjectError::no_method(ARRAY_CLASS, method)),
        }
    }

    fn type_name(&self) -> &str {
        ARRAY_CLASS
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inspect(&self) -> String {
        match self.to_values() {
            Ok(items) => {
                let inner: Vec<String> = items.iter().map(Value::inspect).collect();
                format!("[{}]", inner.join(", "))
            }
            Err(_) => "#<Array>".into(),
        }
    }
}
