//! Persistent object store for orb.
//!
//! An [`ObjectDb`] keeps a whole object graph, class metadata included, in
//! three relations:
//!
//! - `objects`: one row per object; value-typed objects carry a serialized
//!   payload, classes carry their name (one row per class)
//! - `members`: one row per named field, pointing at another object row;
//!   objects held inside a stored list or map hang off `$n` members
//! - `arrays`: one row per element of a [`PersistentArray`]
//!
//! Everything reachable from the root (id 0) survives; [`ObjectDb::gc`]
//! deletes the rest with a mark-and-sweep pass over the member and array
//! edges.
//!
//! # Transactions
//!
//! [`ObjectDb::transaction`] hands its body a lazy proxy over the root.
//! Objects are read from the relations only when first used, and the root
//! graph is written back before commit. The caches that make reads and
//! writes cycle-safe live in a [`Session`] scoped to one transaction
//! attempt. Serialization conflicts are retried after a random pause.

pub mod array;
mod blob;
pub mod config;
pub mod database;
pub mod error;
pub mod session;
pub mod sqlite;
pub mod traits;

pub use array::{register_array_class, PersistentArray, ARRAY_CLASS};
pub use config::StoreConfig;
pub use database::{ObjectDb, BASE_MEMBER, CLASS_MEMBER, ROOT_ID};
pub use error::{StoreError, StoreResult};
pub use session::{Session, StoredProxy, StoredRef};
pub use sqlite::SqliteRelations;
pub use traits::{ObjectRow, Relations, TxMode};
