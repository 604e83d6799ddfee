use orb_types::ObjectError;
use thiserror::Error;

/// Errors from persistent object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failure reported by SQLite.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `value` payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Failure raised by an object while the transaction body ran.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// `create` was given a nil root.
    #[error("root object must not be nil")]
    NilRoot,

    /// A member or array row names an object row that does not exist.
    #[error("object {0} not found")]
    NotFound(i64),

    /// Rows that do not describe a valid object.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: i64, reason: String },

    /// The object graph holds something that cannot be stored.
    #[error("{0} cannot be persisted")]
    Unpersistable(String),

    /// A class row names a class this process never registered.
    #[error("class {0} is not registered")]
    UnknownClass(String),
}

impl StoreError {
    /// `true` when the backing store reported a serialization conflict
    /// (SQLite busy or locked). These are retried, never surfaced.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Object(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for ObjectError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Object(inner) => inner,
            StoreError::NotFound(id) => ObjectError::InvalidReference(format!("object {id}")),
            StoreError::UnknownClass(name) => ObjectError::UnknownClass(name),
            other => ObjectError::Storage {
                transient: other.is_conflict(),
                message: other.to_string(),
            },
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
