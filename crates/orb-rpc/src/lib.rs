//! Remote method calls for orb objects.
//!
//! A [`Connection`] joins two peers over a socket. Each side exports one
//! root object; every other object that crosses the connection by reference
//! is registered in a per-connection [`GcSet`], which doubles as the set of
//! ids the peer is allowed to address. Proxies for the peer's objects send a
//! release notice when dropped, so exports are reclaimed once the peer holds
//! no more references.

pub mod connection;
pub mod error;
pub mod gc_set;
pub mod reference;

pub use connection::{Connection, ConnectionConfig};
pub use error::RpcError;
pub use gc_set::GcSet;
pub use reference::RemoteProxy;
