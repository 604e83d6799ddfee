//! TCP listener for orb.
//!
//! Accepts connections and starts one [`orb_rpc::Connection`] per peer, each
//! exporting the same root object. Usually that root is an
//! [`orb_store::ObjectDb`], so every call a peer makes runs as a store
//! transaction against the persistent root.

pub mod config;
pub mod error;
pub mod server;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{ServerError, ServerResult};
pub use server::ObjectServer;
