use std::io;

use orb_protocol::ProtocolError;
use orb_types::ObjectError;
use thiserror::Error;

/// Errors produced while setting up or driving a connection.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket setup or thread spawn failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection is already known to be dead.
    #[error("connection to {0} is closed")]
    Closed(String),
}

impl From<RpcError> for ObjectError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Closed(peer) => ObjectError::PeerUnreachable(peer),
            other => ObjectError::PeerUnreachable(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the rpc crate.
pub type Result<T> = std::result::Result<T, RpcError>;
