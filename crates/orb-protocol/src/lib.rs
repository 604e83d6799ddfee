//! Wire protocol for orb connections.
//!
//! Defines the framing, the three message types, and the wire form of
//! values. Frames are `[u32 BE length][u8 tag][bincode payload]`. References
//! inside a decoded message are rewritten by a [`ReferenceHook`] when the
//! message is loaded, before application code sees it.

pub mod codec;
pub mod error;
pub mod message;
pub mod wire;

pub use codec::RpcCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Inbound, RpcMessage, MAX_MESSAGE_SIZE};
pub use wire::{too_deep, ReferenceHook, WireValue, MAX_NESTING};
