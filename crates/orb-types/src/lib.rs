//! Core object model for orb.
//!
//! Everything the store, the wire protocol, and connections pass around is a
//! [`Value`]. Value-typed data is plain data; everything else is an
//! [`Object`] behind a shared [`Handle`] that answers messages through a
//! single [`Object::invoke`] entry point.
//!
//! # Key Types
//!
//! - [`Value`] / [`Datum`]: dynamic values and their serializable mirror
//! - [`Object`]: the invocation capability every handle implements
//! - [`LazyProxy`]: a handle that materializes its target on first use
//! - [`Class`], [`Instance`], [`ClassRegistry`]: explicitly described classes
//! - [`ObjectError`] / [`ErrorValue`]: failures, as errors and as data

pub mod class;
pub mod error;
pub mod object;
pub mod proxy;
pub mod value;

pub use class::{
    Allocator, Class, ClassBuilder, ClassRegistry, FieldDescriptor, Instance, Method, TypeTag,
    META_CLASS, OBJECT_CLASS,
};
pub use error::{ErrorValue, ObjectError, ObjectResult};
pub use object::{downcast, identity, yield_block, ByRef, ByVal, Callback, Handle, Object};
pub use proxy::{LazyProxy, Resolve};
pub use value::{Datum, Range, Value};
