use orb_types::{ObjectResult, Value};
use serde::{Deserialize, Serialize};

use crate::wire::{ReferenceHook, WireValue};

pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// All messages exchanged over a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Invoke `method` on `target`, or on the receiver's exported root when
    /// `target` is `None`. `caller` correlates the reply.
    MethodCall {
        caller: u64,
        target: Option<u64>,
        method: String,
        args: Vec<WireValue>,
        block: WireValue,
    },
    /// Outcome of the call identified by `caller`.
    ReturnValue {
        is_exception: bool,
        result: WireValue,
        caller: u64,
    },
    /// The sender dropped its last reference to export `object_id`.
    GarbageFound { object_id: u64 },
}

/// A message with its references loaded.
#[derive(Debug)]
pub enum Inbound {
    MethodCall {
        caller: u64,
        target: Option<u64>,
        method: String,
        args: Vec<Value>,
        block: Option<Value>,
    },
    ReturnValue {
        is_exception: bool,
        result: Value,
        caller: u64,
    },
    GarbageFound { object_id: u64 },
}

impl RpcMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::MethodCall { .. } => 1,
            Self::ReturnValue { .. } => 2,
            Self::GarbageFound { .. } => 3,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MethodCall { .. } => "MethodCall",
            Self::ReturnValue { .. } => "ReturnValue",
            Self::GarbageFound { .. } => "GarbageFound",
        }
    }

    /// Correlation id carried by calls and replies.
    pub fn caller(&self) -> Option<u64> {
        match self {
            Self::MethodCall { caller, .. } | Self::ReturnValue { caller, .. } => Some(*caller),
            Self::GarbageFound { .. } => None,
        }
    }

    /// Load every embedded value through `hook`.
    pub fn load(self, hook: &dyn ReferenceHook) -> ObjectResult<Inbound> {
        Ok(match self {
            Self::MethodCall {
                caller,
                target,
                method,
                args,
                block,
            } => Inbound::MethodCall {
                caller,
                target,
                method,
                args: args
                    .into_iter()
                    .map(|a| a.load(hook))
                    .collect::<ObjectResult<_>>()?,
                block: match block {
                    WireValue::Nil => None,
                    other => Some(other.load(hook)?),
                },
            },
            Self::ReturnValue {
                is_exception,
                result,
                caller,
            } => Inbound::ReturnValue {
                is_exception,
                result: result.load(hook)?,
                caller,
            },
            Self::GarbageFound { object_id } => Inbound::GarbageFound { object_id },
        })
    }
}

pub(crate) fn is_known_tag(tag: u8) -> bool {
    (1..=3).contains(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_types::ObjectError;

    struct Remotes;

    impl ReferenceHook for Remotes {
        fn remote(&self, id: u64) -> ObjectResult<Value> {
            Ok(Value::Symbol(format!("remote-{id}")))
        }

        fn local(&self, id: u64) -> ObjectResult<Value> {
            Err(ObjectError::InvalidReference(format!("local {id}")))
        }

        fn instance(&self, class: &str, _fields: Vec<(String, Value)>) -> ObjectResult<Value> {
            Err(ObjectError::UnknownClass(class.to_string()))
        }
    }

    #[test]
    fn type_tags_unique() {
        let msgs = [
            RpcMessage::MethodCall {
                caller: 1,
                target: None,
                method: "x".into(),
                args: vec![],
                block: WireValue::Nil,
            },
            RpcMessage::ReturnValue {
                is_exception: false,
                result: WireValue::Nil,
                caller: 1,
            },
            RpcMessage::GarbageFound { object_id: 1 },
        ];
        let mut tags: Vec<u8> = msgs.iter().map(|m| m.type_tag()).collect();
        tags.dedup();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(tags.iter().all(|t| is_known_tag(*t)));
        assert!(!is_known_tag(0) && !is_known_tag(4));
    }

    #[test]
    fn nil_block_loads_as_none() {
        let msg = RpcMessage::MethodCall {
            caller: 9,
            target: Some(2),
            method: "each".into(),
            args: vec![WireValue::Remote(5)],
            block: WireValue::Nil,
        };
        assert_eq!(msg.caller(), Some(9));
        match msg.load(&Remotes).unwrap() {
            Inbound::MethodCall {
                target, args, block, ..
            } => {
                assert_eq!(target, Some(2));
                assert_eq!(args, vec![Value::symbol("remote-5")]);
                assert!(block.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reply_load_failure_is_reported() {
        let msg = RpcMessage::ReturnValue {
            is_exception: false,
            result: WireValue::Local(3),
            caller: 4,
        };
        assert!(matches!(msg.load(&Remotes), Err(ObjectError::InvalidReference(_))));
    }

    #[test]
    fn garbage_has_no_caller() {
        assert_eq!(RpcMessage::GarbageFound { object_id: 3 }.caller(), None);
        assert_eq!(RpcMessage::GarbageFound { object_id: 3 }.type_name(), "GarbageFound");
    }
}
