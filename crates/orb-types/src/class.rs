//! Classes, instances, and the class registry.
//!
//! Instead of reflecting over an object's fields at runtime, every class is
//! registered once with an explicit field-descriptor table. Persistence and
//! by-value copying walk that table; nothing is ever evaluated from a stored
//! field name.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::error::{ObjectError, ObjectResult};
use crate::object::{Handle, Object};
use crate::value::Value;

/// Name of the root class every other class descends from.
pub const OBJECT_CLASS: &str = "Object";
/// Name of the metaclass: the class of every class object.
pub const META_CLASS: &str = "Class";

/// Declared type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Any,
    Bool,
    Int,
    Float,
    Str,
    Symbol,
    Range,
    List,
    Map,
    Object,
}

impl TypeTag {
    /// Whether `value` may be stored in a field of this type. Nil is always
    /// accepted, and proxies are accepted unchecked since their target is not
    /// known until resolved.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Nil) | (TypeTag::Any, _) => true,
            (_, Value::Object(h)) if h.is_proxy() => true,
            (TypeTag::Bool, Value::Bool(_)) => true,
            (TypeTag::Int, Value::Int(_)) => true,
            (TypeTag::Float, Value::Float(_) | Value::Int(_)) => true,
            (TypeTag::Str, Value::Str(_)) => true,
            (TypeTag::Symbol, Value::Symbol(_)) => true,
            (TypeTag::Range, Value::Range(_)) => true,
            (TypeTag::List, Value::List(_)) => true,
            (TypeTag::Map, Value::Map(_)) => true,
            (TypeTag::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// One entry of a class's field table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ordinal: usize,
    pub tag: TypeTag,
}

/// An instance method: receives the instance, the arguments, and the block.
pub type Method =
    Arc<dyn Fn(&Instance, Vec<Value>, Option<Value>) -> ObjectResult<Value> + Send + Sync>;

/// Produces an empty object for a class. Classes without an allocator
/// produce plain [`Instance`]s.
pub type Allocator = Arc<dyn Fn(&Arc<Class>) -> ObjectResult<Value> + Send + Sync>;

/// A registered class. Class objects are themselves objects: they can be
/// stored, sent messages, and carry class variables.
pub struct Class {
    this: Weak<Class>,
    name: String,
    superclass: Option<Arc<Class>>,
    fields: Vec<FieldDescriptor>,
    methods: HashMap<String, Method>,
    class_variables: RwLock<BTreeMap<String, Value>>,
    allocator: Option<Allocator>,
    meta: bool,
}

impl Class {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `true` for the metaclass.
    pub fn is_meta(&self) -> bool {
        self.meta
    }

    /// Look a method up along the superclass chain.
    pub fn find_method(&self, name: &str) -> Option<Method> {
        let mut class = Some(self);
        while let Some(c) = class {
            if let Some(m) = c.methods.get(name) {
                return Some(Arc::clone(m));
            }
            class = c.superclass.as_deref();
        }
        None
    }

    /// `true` if this class is `name` or descends from it.
    pub fn is_a(&self, name: &str) -> bool {
        let mut class = Some(self);
        while let Some(c) = class {
            if c.name == name {
                return true;
            }
            class = c.superclass.as_deref();
        }
        false
    }

    pub fn class_variable(&self, name: &str) -> Option<Value> {
        self.class_variables
            .read()
            .expect("class variable lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn set_class_variable(&self, name: impl Into<String>, value: Value) {
        self.class_variables
            .write()
            .expect("class variable lock poisoned")
            .insert(name.into(), value);
    }

    /// Snapshot of all class variables, sorted by name.
    pub fn class_variables(&self) -> Vec<(String, Value)> {
        self.class_variables
            .read()
            .expect("class variable lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Allocate an empty object of this class.
    pub fn allocate(self: &Arc<Self>) -> ObjectResult<Value> {
        if let Some(alloc) = &self.allocator {
            return alloc(self);
        }
        if self.meta {
            return Err(ObjectError::Application(format!(
                "allocator undefined for {}",
                self.name
            )));
        }
        Ok(Value::object(Instance::new(Arc::clone(self))))
    }

    /// The class as a handle.
    pub fn handle(self: &Arc<Self>) -> Handle {
        Arc::clone(self) as Handle
    }

    fn construct(self: &Arc<Self>, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        let object = self.allocate()?;
        if let Some(init) = self.find_method("initialize") {
            if let Some(instance) = object.as_handle().and_then(|h| crate::object::downcast::<Instance>(h)) {
                init(instance, args, block)?;
            }
            return Ok(object);
        }
        if args.is_empty() {
            return Ok(object);
        }
        let instance = object
            .as_handle()
            .and_then(|h| crate::object::downcast::<Instance>(h))
            .ok_or_else(|| ObjectError::Arity {
                method: "new".into(),
                given: args.len(),
                expected: 0,
            })?;
        if args.len() > self.fields.len() {
            return Err(ObjectError::Arity {
                method: "new".into(),
                given: args.len(),
                expected: self.fields.len(),
            });
        }
        for (field, value) in self.fields.iter().zip(args) {
            instance.set(&field.name, value)?;
        }
        Ok(object)
    }
}

impl Object for Class {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        match (method, args.as_slice()) {
            ("name" | "to_s", []) => Ok(Value::Str(self.name.clone())),
            ("inspect", []) => Ok(Value::Str(self.name.clone())),
            ("superclass", []) => Ok(self
                .superclass
                .as_ref()
                .map(|s| Value::Object(s.handle()))
                .unwrap_or_default()),
            ("class_variable_get", [name]) => {
                let name = name.as_str()?;
                Ok(self.class_variable(name.trim_start_matches("@@")).unwrap_or_default())
            }
            ("class_variable_set", [name, value]) => {
                let name = name.as_str()?.trim_start_matches("@@").to_string();
                self.set_class_variable(name, value.clone());
                Ok(value.clone())
            }
            ("new", _) => {
                let this = self
                    .this
                    .upgrade()
                    .ok_or_else(|| ObjectError::InvalidReference(self.name.clone()))?;
                this.construct(args, block)
            }
            _ => Err(ObjectError::no_method(&self.name, method)),
        }
    }

    fn type_name(&self) -> &str {
        META_CLASS
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inspect(&self) -> String {
        self.name.clone()
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("superclass", &self.superclass.as_ref().map(|s| s.name()))
            .field("fields", &self.fields)
            .finish()
    }
}

/// Builder for a class registration.
pub struct ClassBuilder {
    name: String,
    superclass: Option<String>,
    fields: Vec<(String, TypeTag)>,
    methods: HashMap<String, Method>,
    class_variables: BTreeMap<String, Value>,
    allocator: Option<Allocator>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            fields: Vec::new(),
            methods: HashMap::new(),
            class_variables: BTreeMap::new(),
            allocator: None,
        }
    }

    pub fn superclass(mut self, name: impl Into<String>) -> Self {
        self.superclass = Some(name.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, tag: TypeTag) -> Self {
        self.fields.push((name.into(), tag));
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Instance, Vec<Value>, Option<Value>) -> ObjectResult<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn class_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.class_variables.insert(name.into(), value);
        self
    }

    pub fn allocator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Class>) -> ObjectResult<Value> + Send + Sync + 'static,
    {
        self.allocator = Some(Arc::new(f));
        self
    }
}

/// Name → class table shared by the store and connections.
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<Class>>>,
}

impl ClassRegistry {
    /// A registry holding the built-in `Object` and `Class` classes.
    pub fn new() -> Self {
        let object = Arc::new_cyclic(|this| Class {
            this: this.clone(),
            name: OBJECT_CLASS.into(),
            superclass: None,
            fields: Vec::new(),
            methods: HashMap::new(),
            class_variables: RwLock::new(BTreeMap::new()),
            allocator: None,
            meta: false,
        });
        let meta = Arc::new_cyclic(|this| Class {
            this: this.clone(),
            name: META_CLASS.into(),
            superclass: Some(Arc::clone(&object)),
            fields: Vec::new(),
            methods: HashMap::new(),
            class_variables: RwLock::new(BTreeMap::new()),
            allocator: None,
            meta: true,
        });
        let mut classes = HashMap::new();
        classes.insert(OBJECT_CLASS.to_string(), object);
        classes.insert(META_CLASS.to_string(), meta);
        Self {
            classes: RwLock::new(classes),
        }
    }

    /// Register a class, inheriting its superclass's fields. Registering a
    /// name again replaces the earlier definition.
    pub fn register(&self, builder: ClassBuilder) -> ObjectResult<Arc<Class>> {
        let superclass_name = builder
            .superclass
            .unwrap_or_else(|| OBJECT_CLASS.to_string());
        let superclass = self.lookup(&superclass_name)?;

        let mut fields: Vec<FieldDescriptor> = superclass.fields.clone();
        for (name, tag) in builder.fields {
            if fields.iter().any(|f| f.name == name) {
                continue;
            }
            fields.push(FieldDescriptor {
                ordinal: fields.len(),
                name,
                tag,
            });
        }

        let class = Arc::new_cyclic(|this| Class {
            this: this.clone(),
            name: builder.name,
            superclass: Some(superclass),
            fields,
            methods: builder.methods,
            class_variables: RwLock::new(builder.class_variables),
            allocator: builder.allocator,
            meta: false,
        });
        self.classes
            .write()
            .expect("registry lock poisoned")
            .insert(class.name.clone(), Arc::clone(&class));
        Ok(class)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Class>> {
        self.classes
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn lookup(&self, name: &str) -> ObjectResult<Arc<Class>> {
        self.get(name)
            .ok_or_else(|| ObjectError::UnknownClass(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn meta_class(&self) -> Arc<Class> {
        self.get(META_CLASS).expect("metaclass is always registered")
    }

    /// The named class as a value that answers `new`.
    pub fn constructor(&self, name: &str) -> ObjectResult<Value> {
        Ok(Value::Object(self.lookup(name)?.handle()))
    }

    /// Allocate and populate an instance of `name`, assigning fields by
    /// name. Used when a copied instance arrives over the wire.
    pub fn instantiate(&self, name: &str, fields: Vec<(String, Value)>) -> ObjectResult<Value> {
        let class = self.lookup(name)?;
        let object = class.allocate()?;
        if let Some(instance) = object.as_handle().and_then(|h| crate::object::downcast::<Instance>(h)) {
            for (field, value) in fields {
                instance.set(&field, value)?;
            }
        }
        Ok(object)
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let classes = self.classes.read().expect("registry lock poisoned");
        let mut names: Vec<&String> = classes.keys().collect();
        names.sort();
        f.debug_struct("ClassRegistry").field("classes", &names).finish()
    }
}

/// An object of a registered class.
pub struct Instance {
    class: Arc<Class>,
    fields: RwLock<Vec<Value>>,
}

impl Instance {
    pub fn new(class: Arc<Class>) -> Self {
        let fields = vec![Value::Nil; class.fields.len()];
        Self {
            class,
            fields: RwLock::new(fields),
        }
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    fn descriptor(&self, name: &str) -> ObjectResult<&FieldDescriptor> {
        self.class
            .field(name)
            .ok_or_else(|| ObjectError::UnknownField {
                class: self.class.name.clone(),
                field: name.to_string(),
            })
    }

    /// Read a field, resolving any proxy stored in it.
    pub fn get(&self, name: &str) -> ObjectResult<Value> {
        self.get_raw(name)?.resolve_proxies()
    }

    /// Read a field exactly as stored.
    pub fn get_raw(&self, name: &str) -> ObjectResult<Value> {
        let ordinal = self.descriptor(name)?.ordinal;
        Ok(self.fields.read().expect("field lock poisoned")[ordinal].clone())
    }

    pub fn set(&self, name: &str, value: Value) -> ObjectResult<()> {
        let field = self.descriptor(name)?;
        if !field.tag.accepts(&value) {
            return Err(ObjectError::type_mismatch(
                format!("{:?} for {}", field.tag, field.name),
                value.type_name(),
            ));
        }
        let ordinal = field.ordinal;
        self.fields.write().expect("field lock poisoned")[ordinal] = value;
        Ok(())
    }

    /// Snapshot of every field with its descriptor, values as stored.
    pub fn fields(&self) -> Vec<(FieldDescriptor, Value)> {
        let values = self.fields.read().expect("field lock poisoned");
        self.class
            .fields
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect()
    }

    fn responds_to(&self, method: &str) -> bool {
        self.class.find_method(method).is_some()
            || self.class.field(method.trim_end_matches('=')).is_some()
            || matches!(method, "class" | "inspect" | "respond_to?" | "instance_variables")
    }
}

impl Object for Instance {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        if let Some(m) = self.class.find_method(method) {
            return m(self, args, block);
        }
        if let Some(field) = method.strip_suffix('=') {
            if self.class.field(field).is_some() {
                let value = match <[Value; 1]>::try_from(args) {
                    Ok([value]) => value,
                    Err(args) => {
                        return Err(ObjectError::Arity {
                            method: method.into(),
                            given: args.len(),
                            expected: 1,
                        })
                    }
                };
                self.set(field, value.clone())?;
                return Ok(value);
            }
        }
        if self.class.field(method).is_some() && args.is_empty() {
            return self.get(method);
        }
        match method {
            "class" => Ok(Value::Object(self.class.handle())),
            "inspect" | "to_s" => Ok(Value::Str(self.inspect())),
            "respond_to?" => {
                let name = args.first().map(Value::as_str).transpose()?.unwrap_or_default();
                Ok(Value::Bool(self.responds_to(name)))
            }
            "instance_variables" => Ok(Value::List(
                self.class
                    .fields
                    .iter()
                    .map(|f| Value::Symbol(format!("@{}", f.name)))
                    .collect(),
            )),
            _ => Err(ObjectError::no_method(&self.class.name, method)),
        }
    }

    fn type_name(&self) -> &str {
        &self.class.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inspect(&self) -> String {
        let parts: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(field, value)| format!("@{}={}", field.name, value.inspect()))
            .collect();
        if parts.is_empty() {
            format!("#<{}>", self.class.name)
        } else {
            format!("#<{} {}>", self.class.name, parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{downcast, yield_block};

    fn employee_registry() -> ClassRegistry {
        let registry = ClassRegistry::new();
        registry
            .register(
                ClassBuilder::new("Employee")
                    .field("name", TypeTag::Str)
                    .field("salary", TypeTag::Float)
                    .method("raise!", |this, args, _| {
                        let percent = args.first().cloned().unwrap_or_default().as_float()?;
                        let salary = this.get("salary")?.as_float()?;
                        let raised = Value::Float(salary + salary * (percent / 100.0));
                        this.set("salary", raised.clone())?;
                        Ok(raised)
                    }),
            )
            .unwrap();
        registry
    }

    fn employee(registry: &ClassRegistry) -> Value {
        registry
            .constructor("Employee")
            .unwrap()
            .send("new", vec!["brian".into(), Value::Int(2)], None)
            .unwrap()
    }

    #[test]
    fn constructor_assigns_fields_positionally() {
        let registry = employee_registry();
        let e = employee(&registry);
        assert_eq!(e.send("name", vec![], None).unwrap(), Value::Str("brian".into()));
        assert_eq!(e.send("salary", vec![], None).unwrap(), Value::Int(2));
    }

    #[test]
    fn methods_mutate_fields() {
        let registry = employee_registry();
        let e = employee(&registry);
        e.send("raise!", vec![Value::Int(10)], None).unwrap();
        let salary = e.send("salary", vec![], None).unwrap().as_float().unwrap();
        assert!((salary - 2.2).abs() < 1e-9);
    }

    #[test]
    fn setter_checks_field_type() {
        let registry = employee_registry();
        let e = employee(&registry);
        let err = e.send("name=", vec![Value::Int(3)], None).unwrap_err();
        assert!(matches!(err, ObjectError::TypeMismatch { .. }));
        e.send("name=", vec!["ollenberger".into()], None).unwrap();
        assert_eq!(
            e.send("name", vec![], None).unwrap(),
            Value::Str("ollenberger".into())
        );
    }

    #[test]
    fn unknown_method_is_no_method() {
        let registry = employee_registry();
        let e = employee(&registry);
        let err = e.send("fire!", vec![], None).unwrap_err();
        assert!(matches!(err, ObjectError::NoMethod { .. }));
    }

    #[test]
    fn subclass_inherits_fields_and_methods() {
        let registry = employee_registry();
        let manager = registry
            .register(
                ClassBuilder::new("Manager")
                    .superclass("Employee")
                    .field("reports", TypeTag::Int),
            )
            .unwrap();
        let names: Vec<&str> = manager.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["name", "salary", "reports"]);
        assert!(manager.is_a("Employee"));
        assert!(manager.is_a(OBJECT_CLASS));
        assert!(manager.find_method("raise!").is_some());
    }

    #[test]
    fn unknown_superclass_is_rejected() {
        let registry = ClassRegistry::new();
        let err = registry
            .register(ClassBuilder::new("Orphan").superclass("Nope"))
            .unwrap_err();
        assert!(matches!(err, ObjectError::UnknownClass(_)));
    }

    #[test]
    fn metaclass_cannot_allocate() {
        let registry = ClassRegistry::new();
        assert!(registry.meta_class().allocate().is_err());
        assert!(registry.meta_class().is_meta());
    }

    #[test]
    fn class_variables_via_messages() {
        let registry = employee_registry();
        let class = registry.lookup("Employee").unwrap();
        let handle = Value::Object(class.handle());
        handle
            .send("class_variable_set", vec!["@@count".into(), Value::Int(3)], None)
            .unwrap();
        assert_eq!(class.class_variable("count"), Some(Value::Int(3)));
        assert_eq!(
            handle.send("class_variable_get", vec!["@@count".into()], None).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn initialize_receives_block() {
        let registry = ClassRegistry::new();
        registry
            .register(
                ClassBuilder::new("Greeter")
                    .field("greeting", TypeTag::Str)
                    .method("initialize", |this, _args, block| {
                        let greeting = yield_block(block.as_ref(), vec![])?;
                        this.set("greeting", greeting)?;
                        Ok(Value::Nil)
                    }),
            )
            .unwrap();
        let block = crate::object::Callback::new(|_| Ok("hello".into())).into_value();
        let g = registry
            .constructor("Greeter")
            .unwrap()
            .send("new", vec![], Some(block))
            .unwrap();
        assert_eq!(g.send("greeting", vec![], None).unwrap(), Value::Str("hello".into()));
    }

    #[test]
    fn instantiate_by_field_name() {
        let registry = employee_registry();
        let v = registry
            .instantiate("Employee", vec![("salary".into(), Value::Float(5.0))])
            .unwrap();
        let instance = downcast::<Instance>(v.as_handle().unwrap()).unwrap();
        assert_eq!(instance.get("salary").unwrap(), Value::Float(5.0));
        assert_eq!(instance.get("name").unwrap(), Value::Nil);
    }

    #[test]
    fn inspect_lists_fields() {
        let registry = employee_registry();
        let e = employee(&registry);
        assert_eq!(e.inspect(), "#<Employee @name=\"brian\", @salary=2>");
    }
}
