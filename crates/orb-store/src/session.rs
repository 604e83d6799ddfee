//! Per-transaction state: materializing rows into objects and writing object
//! graphs back into rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use orb_types::{
    downcast, identity, Class, Handle, Instance, LazyProxy, Object, ObjectError, ObjectResult,
    Resolve, Value, OBJECT_CLASS,
};
use tracing::{trace, warn};

use crate::array::PersistentArray;
use crate::blob::{slot_index, slot_member, Shape};
use crate::database::{DbInner, BASE_MEMBER, CLASS_MEMBER};
use crate::error::{StoreError, StoreResult};

/// Resolver of a lazily read object row.
///
/// Only valid while the transaction that created it is open; afterwards an
/// unresolved proxy fails with `InvalidReference`.
pub struct StoredRef {
    db: Weak<DbInner>,
    session: Weak<Session>,
    id: i64,
}

/// Proxy over an object row.
pub type StoredProxy = LazyProxy<StoredRef>;

impl StoredRef {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn belongs_to(&self, db: &Arc<DbInner>) -> bool {
        std::ptr::eq(self.db.as_ptr(), Arc::as_ptr(db))
    }
}

impl Resolve for StoredRef {
    fn resolve(&self) -> ObjectResult<Value> {
        let session = self.session.upgrade().ok_or_else(|| {
            ObjectError::InvalidReference(format!("object {} outlived its transaction", self.id))
        })?;
        Ok(session.read_object(Some(self.id))?)
    }

    fn describe(&self) -> String {
        format!("object {}", self.id)
    }
}

/// Id of a proxy over a row of `db`, without resolving it.
pub(crate) fn stored_id(db: &Arc<DbInner>, value: &Value) -> Option<i64> {
    let proxy = downcast::<StoredProxy>(value.as_handle()?)?;
    proxy
        .resolver()
        .belongs_to(db)
        .then(|| proxy.resolver().id())
}

/// The caches of one transaction attempt.
///
/// A session lives exactly as long as its transaction attempt. Dropping it
/// releases every cache, and proxies it handed out stop resolving.
pub struct Session {
    this: Weak<Session>,
    db: Arc<DbInner>,
    /// Row id → materialized value.
    read_cache: Mutex<HashMap<i64, Value>>,
    /// Object identity → assigned id. The handle keeps the identity from
    /// being reused while the entry exists.
    written: Mutex<HashMap<usize, (i64, Handle)>>,
    /// Identity of each object materialized by `read_object` → its row id.
    materialized: Mutex<HashMap<usize, i64>>,
}

impl Session {
    pub(crate) fn new(db: Arc<DbInner>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            db,
            read_cache: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            materialized: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn db(&self) -> &Arc<DbInner> {
        &self.db
    }

    pub(crate) fn clear(&self) {
        self.read_cache.lock().expect("session lock poisoned").clear();
        self.written.lock().expect("session lock poisoned").clear();
        self.materialized.lock().expect("session lock poisoned").clear();
    }

    /// Next unused id: one past the largest, or 0 for an empty store.
    pub fn new_id(&self) -> StoreResult<i64> {
        self.db.with(|r| r.next_id())
    }

    /// A value standing for row `id`: the already materialized value if
    /// this transaction has read it, otherwise a lazy proxy.
    pub fn proxy(&self, id: Option<i64>) -> Value {
        let Some(id) = id else {
            return Value::Nil;
        };
        if let Some(cached) = self.cached(id) {
            return cached;
        }
        LazyProxy::new(StoredRef {
            db: Arc::downgrade(&self.db),
            session: self.this.clone(),
            id,
        })
        .into_value()
    }

    fn cached(&self, id: i64) -> Option<Value> {
        self.read_cache
            .lock()
            .expect("session lock poisoned")
            .get(&id)
            .cloned()
    }

    fn cache(&self, id: i64, value: &Value) {
        if let Value::Object(handle) = value {
            self.materialized
                .lock()
                .expect("session lock poisoned")
                .insert(identity(handle), id);
        }
        self.read_cache
            .lock()
            .expect("session lock poisoned")
            .insert(id, value.clone());
    }

    /// Materialize row `id`. Absent ids read as nil.
    pub fn read_object(&self, id: Option<i64>) -> StoreResult<Value> {
        let Some(id) = id else {
            return Ok(Value::Nil);
        };
        if let Some(cached) = self.cached(id) {
            return Ok(cached);
        }
        let row = self
            .db
            .with(|r| r.fetch_object(id))?
            .ok_or(StoreError::NotFound(id))?;
        trace!(id, "materializing object");

        if let Some(blob) = row.value {
            let shape: Shape = bincode::deserialize(&blob)?;
            let mut slots = Vec::new();
            if shape.has_slots() {
                for (member, member_id) in self.db.with(|r| r.members(id))? {
                    if let Some(slot) = slot_index(&member) {
                        if slots.len() <= slot {
                            slots.resize(slot + 1, Value::Nil);
                        }
                        slots[slot] = self.proxy(member_id);
                    }
                }
            }
            let value = shape.fill(id, &slots)?;
            self.cache(id, &value);
            return Ok(value);
        }

        let members = self.db.with(|r| r.members(id))?;

        if let Some(name) = row.class_name {
            let class = self
                .db
                .registry
                .get(&name)
                .ok_or(StoreError::UnknownClass(name))?;
            self.cache(id, &Value::Object(class.handle()));
            for (member, member_id) in &members {
                if let Some(var) = member.strip_prefix("@@") {
                    class.set_class_variable(var, self.proxy(*member_id));
                }
            }
            return Ok(Value::Object(class.handle()));
        }

        let class = self.read_class(id, &members)?;
        let object = class.allocate()?;
        let handle = object.as_handle().ok_or_else(|| StoreError::CorruptObject {
            id,
            reason: format!("{} allocated a value-typed object", class.name()),
        })?;
        if let Some(array) = downcast::<PersistentArray>(handle) {
            array.bind(&self.this, id);
        }
        self.cache(id, &object);

        for (member, member_id) in &members {
            if member == CLASS_MEMBER || member == BASE_MEMBER {
                continue;
            }
            if let Some(var) = member.strip_prefix("@@") {
                class.set_class_variable(var, self.proxy(*member_id));
            } else if let Some(field) = member.strip_prefix('@') {
                if let Some(instance) = downcast::<Instance>(handle) {
                    if let Err(err) = instance.set(field, self.proxy(*member_id)) {
                        warn!(id, field, %err, "dropping stored field");
                    }
                }
            }
        }
        Ok(object)
    }

    fn read_class(&self, id: i64, members: &[(String, Option<i64>)]) -> StoreResult<Arc<Class>> {
        let class_id = members
            .iter()
            .find(|(name, _)| name == CLASS_MEMBER)
            .and_then(|(_, member_id)| *member_id);
        let Some(class_id) = class_id else {
            return Ok(self.db.registry.lookup(OBJECT_CLASS)?);
        };
        let class_value = self.read_object(Some(class_id))?;
        let name = class_value
            .as_handle()
            .and_then(|h| downcast::<Class>(h))
            .map(|c| c.name().to_string())
            .ok_or_else(|| StoreError::CorruptObject {
                id,
                reason: format!("class pointer {class_id} is not a class"),
            })?;
        self.db
            .registry
            .get(&name)
            .ok_or(StoreError::UnknownClass(name))
    }

    /// Write `value` and everything reachable from it; returns its id, or
    /// `None` for nil. Writing the same object twice in one transaction
    /// returns the same id.
    pub fn write_object(&self, value: &Value) -> StoreResult<Option<i64>> {
        match value {
            Value::Nil => Ok(None),
            Value::Object(handle) => self.write_handle(handle),
            other => {
                let (blob, slots) = encode(other)?;
                let id = self.new_id()?;
                self.db.with(|r| r.insert_object(id, None, Some(&blob)))?;
                self.write_slots(id, &slots)?;
                Ok(Some(id))
            }
        }
    }

    /// Write the objects held by value row `id` as its `$n` members.
    fn write_slots(&self, id: i64, slots: &[Handle]) -> StoreResult<()> {
        for (slot, handle) in slots.iter().enumerate() {
            let child = self.write_handle(handle)?;
            let name = slot_member(slot);
            self.db.with(|r| r.insert_member(id, &name, child))?;
        }
        Ok(())
    }

    fn written_id(&self, key: usize) -> Option<i64> {
        self.written
            .lock()
            .expect("session lock poisoned")
            .get(&key)
            .map(|(id, _)| *id)
    }

    fn remember(&self, handle: &Handle, id: i64) {
        self.written
            .lock()
            .expect("session lock poisoned")
            .insert(identity(handle), (id, Arc::clone(handle)));
    }

    fn write_handle(&self, handle: &Handle) -> StoreResult<Option<i64>> {
        if let Some(id) = self.written_id(identity(handle)) {
            return Ok(Some(id));
        }

        if let Some(proxy) = downcast::<StoredProxy>(handle) {
            if proxy.resolver().belongs_to(&self.db) {
                let id = proxy.resolver().id();
                self.remember(handle, id);
                // A proxy that never resolved may still stand for a row this
                // transaction read and changed through another path.
                match proxy.peek() {
                    Some(target) => self.rewrite(id, target)?,
                    None => {
                        if let Some(cached) = self.cached(id) {
                            self.rewrite(id, &cached)?;
                        }
                    }
                }
                return Ok(Some(id));
            }
        }

        if handle.is_proxy() {
            if let Some(target) = handle.resolved() {
                let target = target?;
                return self.write_object(&target);
            }
        }

        let materialized = self
            .materialized
            .lock()
            .expect("session lock poisoned")
            .get(&identity(handle))
            .copied();
        if let Some(id) = materialized {
            self.rewrite(id, &Value::Object(Arc::clone(handle)))?;
            return Ok(Some(id));
        }

        self.write_new(handle).map(Some)
    }

    /// Replace the contents of existing row `id` with `target`.
    fn rewrite(&self, id: i64, target: &Value) -> StoreResult<()> {
        match target {
            Value::Object(handle) => {
                if self.written_id(identity(handle)).is_some() {
                    return Ok(());
                }
                check_persistable(handle)?;
                self.remember(handle, id);
                self.db.with(|r| {
                    r.update_value(id, None)?;
                    r.delete_members(id)
                })?;
                self.write_body(id, handle)
            }
            value => {
                let (blob, slots) = encode(value)?;
                self.db.with(|r| {
                    r.update_value(id, Some(&blob))?;
                    r.delete_members(id)
                })?;
                self.write_slots(id, &slots)
            }
        }
    }

    fn write_new(&self, handle: &Handle) -> StoreResult<i64> {
        check_persistable(handle)?;
        let id = match downcast::<Class>(handle) {
            Some(class) => match self.db.with(|r| r.find_class(class.name()))? {
                Some(id) => {
                    self.db.with(|r| r.delete_members(id))?;
                    id
                }
                None => {
                    let id = self.new_id()?;
                    self.db
                        .with(|r| r.insert_object(id, Some(class.name()), None))?;
                    id
                }
            },
            None => {
                let id = self.new_id()?;
                self.db.with(|r| r.insert_object(id, None, None))?;
                id
            }
        };
        self.remember(handle, id);
        self.write_body(id, handle)?;
        Ok(id)
    }

    /// Members (or array elements) of `handle`, then its class pointer, then
    /// for classes the class variables and base-class pointer.
    fn write_body(&self, id: i64, handle: &Handle) -> StoreResult<()> {
        if let Some(array) = downcast::<PersistentArray>(handle) {
            array.bind(&self.this, id);
            array.flush(self, id)?;
        } else if let Some(instance) = downcast::<Instance>(handle) {
            for (field, value) in instance.fields() {
                let child = self.write_object(&value)?;
                let name = format!("@{}", field.name);
                self.db.with(|r| r.insert_member(id, &name, child))?;
            }
        }

        let class = self.class_of(handle)?;
        let class_id = self.write_handle(&class.handle())?;
        self.db.with(|r| r.insert_member(id, CLASS_MEMBER, class_id))?;

        if let Some(class) = downcast::<Class>(handle) {
            for (name, value) in class.class_variables() {
                let child = match stored_id(&self.db, &value) {
                    Some(id) => Some(id),
                    None => self.write_object(&value)?,
                };
                let name = format!("@@{name}");
                self.db.with(|r| r.insert_member(id, &name, child))?;
            }
            let base = match class.superclass() {
                Some(superclass) => self.write_handle(&superclass.handle())?,
                None => None,
            };
            self.db.with(|r| r.insert_member(id, BASE_MEMBER, base))?;
        }
        Ok(())
    }

    fn class_of(&self, handle: &Handle) -> StoreResult<Arc<Class>> {
        if let Some(instance) = downcast::<Instance>(handle) {
            return Ok(Arc::clone(instance.class()));
        }
        if let Some(array) = downcast::<PersistentArray>(handle) {
            return Ok(Arc::clone(array.class()));
        }
        Ok(self.db.registry.meta_class())
    }
}

fn check_persistable(handle: &Handle) -> StoreResult<()> {
    let persistable = downcast::<Instance>(handle).is_some()
        || downcast::<PersistentArray>(handle).is_some()
        || downcast::<Class>(handle).is_some();
    if persistable {
        Ok(())
    } else {
        Err(StoreError::Unpersistable(handle.type_name().to_string()))
    }
}

/// Payload of a value row, and the objects its slots stand for.
fn encode(value: &Value) -> StoreResult<(Vec<u8>, Vec<Handle>)> {
    let mut slots = Vec::new();
    let shape = Shape::of(value, &mut slots)?;
    Ok((bincode::serialize(&shape)?, slots))
}
