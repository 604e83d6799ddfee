use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use orb_types::{ClassRegistry, Object, ObjectResult, Value};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::array::register_array_class;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::session::Session;
use crate::sqlite::SqliteRelations;
use crate::traits::{Relations, TxMode};

/// Id of the root object.
pub const ROOT_ID: i64 = 0;
/// Member name of the class pointer.
pub const CLASS_MEMBER: &str = "c";
/// Member name of a class's base-class pointer.
pub const BASE_MEMBER: &str = "b";

pub(crate) struct DbInner {
    relations: Mutex<Box<dyn Relations>>,
    /// Held for exactly one transaction attempt.
    critical: Mutex<()>,
    pub(crate) registry: Arc<ClassRegistry>,
    config: StoreConfig,
}

impl DbInner {
    /// Run one or more statements with the relations locked.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&mut dyn Relations) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut relations = self.relations.lock().expect("relations lock poisoned");
        f(relations.as_mut())
    }
}

/// A transactional object graph stored in three relations.
///
/// Cloning an `ObjectDb` yields another handle to the same store; all
/// handles share one critical section, so at most one transaction body runs
/// at a time per store. Separate `ObjectDb`s opened on the same file are
/// serialized by SQLite instead, and conflicting transactions are retried.
#[derive(Clone)]
pub struct ObjectDb {
    inner: Arc<DbInner>,
}

impl ObjectDb {
    /// Open the store at `config.path`. The relations must already exist
    /// (see [`create`](Self::create)).
    pub fn open(config: StoreConfig, registry: Arc<ClassRegistry>) -> StoreResult<Self> {
        let relations = SqliteRelations::open(&config.path, config.busy_timeout())?;
        info!(path = %config.path.display(), "opened object store");
        Self::with_relations(Box::new(relations), config, registry)
    }

    /// A private store in memory.
    pub fn open_in_memory(registry: Arc<ClassRegistry>) -> StoreResult<Self> {
        let config = StoreConfig {
            path: ":memory:".into(),
            max_backoff_ms: 10,
            vacuum_after_gc: false,
            ..StoreConfig::default()
        };
        Self::with_relations(Box::new(SqliteRelations::open_in_memory()?), config, registry)
    }

    /// A store over any [`Relations`] implementation.
    pub fn with_relations(
        relations: Box<dyn Relations>,
        config: StoreConfig,
        registry: Arc<ClassRegistry>,
    ) -> StoreResult<Self> {
        register_array_class(&registry)?;
        Ok(Self {
            inner: Arc::new(DbInner {
                relations: Mutex::new(relations),
                critical: Mutex::new(()),
                registry,
                config,
            }),
        })
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Drop and recreate the relations, then write `root` as id 0.
    pub fn create(&self, root: Value) -> StoreResult<()> {
        if root.is_nil() {
            return Err(StoreError::NilRoot);
        }
        self.retrying(|| {
            self.inner.with(|r| {
                r.begin(TxMode::Immediate)?;
                r.reset_schema()
            })?;
            let session = Session::new(Arc::clone(&self.inner));
            let id = session.write_object(&root)?;
            session.clear();
            if id != Some(ROOT_ID) {
                return Err(StoreError::CorruptObject {
                    id: id.unwrap_or(ROOT_ID),
                    reason: "root was not written first".into(),
                });
            }
            self.inner.with(|r| r.commit())
        })?;
        info!("created object store");
        Ok(())
    }

    /// Run `body` against the root in one transaction.
    ///
    /// Unless `read_only`, the root graph is written back before commit.
    /// Proxies handed out during the transaction stop resolving once it
    /// ends. Serialization conflicts are retried after a random pause; any
    /// other failure rolls back and is returned. `body` may run more than
    /// once. Calling `transaction` from inside `body` deadlocks.
    pub fn transaction<T, F>(&self, read_only: bool, mut body: F) -> StoreResult<T>
    where
        F: FnMut(&Value) -> StoreResult<T>,
    {
        self.with_session(read_only, |_, root| body(root))
    }

    /// [`transaction`](Self::transaction), also handing `body` the session
    /// for direct reads and writes.
    pub fn with_session<T, F>(&self, read_only: bool, mut body: F) -> StoreResult<T>
    where
        F: FnMut(&Session, &Value) -> StoreResult<T>,
    {
        let mode = if read_only {
            TxMode::Deferred
        } else {
            TxMode::Immediate
        };
        self.retrying(|| {
            self.inner.with(|r| r.begin(mode))?;
            let session = Session::new(Arc::clone(&self.inner));
            let root = session.proxy(Some(ROOT_ID));
            let outcome = body(&session, &root).and_then(|value| {
                if !read_only {
                    session.write_object(&root)?;
                }
                Ok(value)
            });
            drop(root);
            session.clear();
            drop(session);
            let value = outcome?;
            self.inner.with(|r| r.commit())?;
            Ok(value)
        })
    }

    /// Delete every object unreachable from the root; returns the number of
    /// objects deleted.
    pub fn gc(&self) -> StoreResult<usize> {
        let deleted = self.retrying(|| {
            self.inner.with(|r| {
                r.begin(TxMode::Exclusive)?;
                r.clear_marks()?;
                r.mark(ROOT_ID)?;
                let mut passes = 0usize;
                loop {
                    passes += 1;
                    let marked = r.mark_member_targets()? + r.mark_array_targets()?;
                    debug!(pass = passes, marked, "gc mark pass");
                    if marked == 0 {
                        break;
                    }
                }
                let deleted = r.sweep()?;
                r.clear_marks()?;
                r.commit()?;
                Ok(deleted)
            })
        })?;
        info!(deleted, "collected unreachable objects");

        if self.inner.config.vacuum_after_gc {
            let _critical = self.inner.critical.lock().expect("critical section poisoned");
            self.inner.with(|r| r.vacuum())?;
        }
        Ok(deleted)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> StoreResult<usize> {
        let _critical = self.inner.critical.lock().expect("critical section poisoned");
        self.inner.with(|r| r.object_count())
    }

    /// Run `attempt` inside the critical section until it succeeds or fails
    /// with something other than a serialization conflict. Failed attempts
    /// are rolled back.
    fn retrying<T>(&self, mut attempt: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = {
                let _critical = self.inner.critical.lock().expect("critical section poisoned");
                let outcome = attempt();
                if outcome.is_err() {
                    self.abort();
                }
                outcome
            };
            match outcome {
                Err(err) if err.is_conflict() => {
                    debug!(attempt = attempts, %err, "serialization conflict, retrying");
                    self.backoff();
                }
                other => return other,
            }
        }
    }

    fn abort(&self) {
        if let Err(err) = self.inner.with(|r| r.rollback()) {
            warn!(%err, "rollback failed");
        }
    }

    fn backoff(&self) {
        let max = self.inner.config.max_backoff_ms;
        if max > 0 {
            let pause = rand::thread_rng().gen_range(0..max);
            thread::sleep(Duration::from_millis(pause));
        }
    }
}

/// Any method sent to the store runs in a write transaction against the
/// root, and the result comes back with its proxies peeled.
impl Object for ObjectDb {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        Ok(self.transaction(false, |root| {
            let result = root.send(method, args.clone(), block.clone())?;
            Ok(result.resolve_proxies()?)
        })?)
    }

    fn type_name(&self) -> &str {
        "ObjectDb"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_types::{ClassBuilder, ObjectError, TypeTag};

    fn registry() -> Arc<ClassRegistry> {
        let registry = Arc::new(ClassRegistry::new());
        registry
            .register(ClassBuilder::new("Box").field("content", TypeTag::Any))
            .unwrap();
        registry
    }

    fn boxed(db: &ObjectDb, content: Value) -> Value {
        db.registry()
            .constructor("Box")
            .unwrap()
            .send("new", vec![content], None)
            .unwrap()
    }

    #[test]
    fn nil_root_is_rejected() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        assert!(matches!(db.create(Value::Nil), Err(StoreError::NilRoot)));
    }

    #[test]
    fn root_is_id_zero() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        db.create(boxed(&db, "x".into())).unwrap();
        let content = db
            .with_session(true, |session, _| {
                let root = session.read_object(Some(ROOT_ID))?;
                Ok(root.send("content", vec![], None)?)
            })
            .unwrap();
        assert_eq!(content, Value::Str("x".into()));
    }

    #[test]
    fn failed_body_changes_nothing() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        db.create(boxed(&db, Value::Int(1))).unwrap();
        let before = db.object_count().unwrap();

        let err = db
            .transaction(false, |root| {
                root.send("content=", vec![Value::Int(2)], None)?;
                Err::<(), _>(ObjectError::Application("boom".into()).into())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Object(ObjectError::Application(_))));

        let content = db
            .transaction(true, |root| Ok(root.send("content", vec![], None)?))
            .unwrap();
        assert_eq!(content, Value::Int(1));
        assert_eq!(db.object_count().unwrap(), before);
    }

    #[test]
    fn changes_to_a_root_read_by_id_are_saved() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        db.create(boxed(&db, Value::Int(1))).unwrap();

        // The root proxy handed to the body is never resolved.
        db.with_session(false, |session, _root| {
            let root = session.read_object(Some(ROOT_ID))?;
            root.send("content=", vec![Value::Int(2)], None)?;
            Ok(())
        })
        .unwrap();

        let content = db
            .transaction(true, |root| Ok(root.send("content", vec![], None)?))
            .unwrap();
        assert_eq!(content, Value::Int(2));
    }

    #[test]
    fn store_forwards_calls_to_root() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        db.create(boxed(&db, Value::Int(1))).unwrap();
        db.invoke("content=", vec![Value::Int(5)], None).unwrap();
        assert_eq!(db.invoke("content", vec![], None).unwrap(), Value::Int(5));
    }

    #[test]
    fn proxies_expire_with_their_transaction() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        let inner = boxed(&db, Value::Int(1));
        db.create(boxed(&db, inner)).unwrap();

        let (resolved, unresolved) = db
            .transaction(true, |root| {
                let resolved = root.send("content", vec![], None)?;
                let inner = root.send("content", vec![], None)?;
                let raw = orb_types::downcast::<orb_types::Instance>(inner.as_handle().unwrap())
                    .unwrap()
                    .get_raw("content")?;
                Ok((resolved, raw))
            })
            .unwrap();
        assert_eq!(resolved.send("content", vec![], None).unwrap_err().class_name(), "InvalidReferenceError");
        assert!(matches!(
            unresolved.send("to_s", vec![], None),
            Err(ObjectError::InvalidReference(_))
        ));
    }

    #[test]
    fn gc_keeps_reachable_and_drops_garbage() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        db.create(boxed(&db, boxed(&db, Value::Int(7)))).unwrap();

        db.transaction(false, |root| {
            root.send("content=", vec![Value::Str("replaced".into())], None)?;
            Ok(())
        })
        .unwrap();

        // The old inner box and its Int row are now unreachable.
        let deleted = db.gc().unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.gc().unwrap(), 0);

        let content = db
            .transaction(true, |root| Ok(root.send("content", vec![], None)?))
            .unwrap();
        assert_eq!(content, Value::Str("replaced".into()));
    }

    #[test]
    fn gc_collects_unreachable_cycles() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        let a = boxed(&db, Value::Nil);
        let b = boxed(&db, a.clone());
        a.send("content=", vec![b], None).unwrap();
        db.create(boxed(&db, a)).unwrap();

        db.transaction(false, |root| {
            root.send("content=", vec![Value::Nil], None)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.gc().unwrap(), 2);
    }

    #[test]
    fn objects_inside_lists_survive_gc() {
        let db = ObjectDb::open_in_memory(registry()).unwrap();
        let items = Value::List(vec![boxed(&db, Value::Int(7)), Value::Int(8)]);
        db.create(boxed(&db, items)).unwrap();
        assert_eq!(db.gc().unwrap(), 0);

        let first = db
            .transaction(true, |root| {
                let Value::List(items) = root.send("content", vec![], None)? else {
                    panic!("expected a list");
                };
                assert_eq!(items[1], Value::Int(8));
                Ok(items[0].send("content", vec![], None)?)
            })
            .unwrap();
        assert_eq!(first, Value::Int(7));

        db.transaction(false, |root| {
            root.send("content=", vec![Value::Nil], None)?;
            Ok(())
        })
        .unwrap();
        // The list row, the box it held, and the box's Int row.
        assert_eq!(db.gc().unwrap(), 3);
    }
}
