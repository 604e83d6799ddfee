use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("connection error: {0}")]
    Rpc(#[from] orb_rpc::RpcError),

    #[error("store error: {0}")]
    Store(#[from] orb_store::StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
