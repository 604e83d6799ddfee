use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error carried as data.
///
/// This is the form a failure takes when it crosses a process boundary or is
/// stored as a value: the originating error class, its message, and the call
/// trace accumulated so far (innermost frame first).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub class: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl ErrorValue {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Append a frame to the trace.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.trace.push(frame.into());
        self
    }

    /// Capture an [`ObjectError`] as data. Remote failures keep their
    /// original class and trace.
    pub fn from_error(err: &ObjectError) -> Self {
        match err {
            ObjectError::RemoteApplication(inner) => inner.clone(),
            other => Self::new(other.class_name(), other.to_string()),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Errors raised while invoking methods on objects.
#[derive(Clone, Debug, Error)]
pub enum ObjectError {
    /// Proxy resolution failed: the target is gone or was never valid.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// An inbound call named an object the peer was never handed.
    #[error("no reference given for remote object {0}")]
    UnauthorizedReference(u64),

    /// The connection carrying the call is known to be dead.
    #[error("unable to reach peer: {0}")]
    PeerUnreachable(String),

    /// A failure raised inside a remotely invoked method.
    #[error("{0}")]
    RemoteApplication(ErrorValue),

    #[error("undefined method `{method}` for {receiver}")]
    NoMethod { receiver: String, method: String },

    #[error("wrong number of arguments for `{method}` (given {given}, expected {expected})")]
    Arity {
        method: String,
        given: usize,
        expected: usize,
    },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("unknown field `{field}` on {class}")]
    UnknownField { class: String, field: String },

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("{0} cannot be copied by value")]
    NotCopyable(String),

    /// A backing-store failure surfaced through a lazy read. `transient`
    /// marks failures the store will retry (serialization conflicts).
    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    /// Raised by application methods.
    #[error("{0}")]
    Application(String),
}

impl ObjectError {
    pub fn no_method(receiver: impl Into<String>, method: impl Into<String>) -> Self {
        Self::NoMethod {
            receiver: receiver.into(),
            method: method.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Error class name used when the error is shipped as data.
    pub fn class_name(&self) -> &str {
        match self {
            Self::InvalidReference(_) => "InvalidReferenceError",
            Self::UnauthorizedReference(_) => "UnauthorizedReferenceError",
            Self::PeerUnreachable(_) => "PeerUnreachableError",
            Self::RemoteApplication(inner) => &inner.class,
            Self::NoMethod { .. } => "NoMethodError",
            Self::Arity { .. } => "ArgumentError",
            Self::TypeMismatch { .. } => "TypeError",
            Self::UnknownField { .. } => "NameError",
            Self::UnknownClass(_) => "NameError",
            Self::NotCopyable(_) => "TypeError",
            Self::Storage { .. } => "StorageError",
            Self::Application(_) => "RuntimeError",
        }
    }

    /// Returns `true` for storage conflicts that a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }
}

/// Result alias for object invocations.
pub type ObjectResult<T> = Result<T, ObjectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_value_display() {
        let ev = ErrorValue::new("RuntimeError", "boom");
        assert_eq!(ev.to_string(), "RuntimeError: boom");
    }

    #[test]
    fn from_error_keeps_remote_trace() {
        let remote = ErrorValue::new("RuntimeError", "boom").with_frame("Employee#raise!");
        let err = ObjectError::RemoteApplication(remote.clone());
        assert_eq!(ErrorValue::from_error(&err), remote);
    }

    #[test]
    fn from_error_uses_class_name() {
        let ev = ErrorValue::from_error(&ObjectError::UnauthorizedReference(7));
        assert_eq!(ev.class, "UnauthorizedReferenceError");
        assert!(ev.message.contains('7'));
        assert!(ev.trace.is_empty());
    }

    #[test]
    fn transient_only_for_conflicts() {
        let conflict = ObjectError::Storage {
            message: "database is locked".into(),
            transient: true,
        };
        assert!(conflict.is_transient());
        assert!(!ObjectError::InvalidReference("x".into()).is_transient());
    }
}
