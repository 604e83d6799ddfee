//! Payload encoding of value-typed rows.
//!
//! A value row stores its value as a bincode [`Shape`]. Collections may hold
//! objects; each one becomes a [`Shape::Slot`] naming a `$n` member of the
//! row, so the objects stay rows of their own and the collector reaches them
//! over ordinary member edges.

use std::sync::Arc;

use orb_types::{Datum, Handle, Value};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Prefix of the member rows that back the slots of a value row.
pub(crate) const SLOT_PREFIX: char = '$';

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Shape {
    Datum(Datum),
    List(Vec<Shape>),
    Map(Vec<(Shape, Shape)>),
    Slot(usize),
}

pub(crate) fn slot_member(slot: usize) -> String {
    format!("{SLOT_PREFIX}{slot}")
}

/// Slot index of member `name`, if it backs a slot.
pub(crate) fn slot_index(name: &str) -> Option<usize> {
    name.strip_prefix(SLOT_PREFIX)?.parse().ok()
}

impl Shape {
    /// Shape of `value`; every object it holds is appended to `slots`.
    pub(crate) fn of(value: &Value, slots: &mut Vec<Handle>) -> StoreResult<Shape> {
        if let Ok(datum) = value.to_datum() {
            return Ok(Shape::Datum(datum));
        }
        Ok(match value {
            Value::Object(handle) => {
                slots.push(Arc::clone(handle));
                Shape::Slot(slots.len() - 1)
            }
            Value::List(items) => Shape::List(
                items
                    .iter()
                    .map(|item| Shape::of(item, slots))
                    .collect::<StoreResult<_>>()?,
            ),
            Value::Map(pairs) => Shape::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((Shape::of(k, slots)?, Shape::of(v, slots)?)))
                    .collect::<StoreResult<_>>()?,
            ),
            other => return Err(StoreError::Unpersistable(other.type_name().to_string())),
        })
    }

    pub(crate) fn has_slots(&self) -> bool {
        match self {
            Shape::Datum(_) => false,
            Shape::Slot(_) => true,
            Shape::List(items) => items.iter().any(Shape::has_slots),
            Shape::Map(pairs) => pairs.iter().any(|(k, v)| k.has_slots() || v.has_slots()),
        }
    }

    /// Rebuild the value of row `id`, taking slot contents from `slots`.
    pub(crate) fn fill(self, id: i64, slots: &[Value]) -> StoreResult<Value> {
        Ok(match self {
            Shape::Datum(datum) => Value::from(datum),
            Shape::Slot(slot) => slots
                .get(slot)
                .cloned()
                .ok_or_else(|| StoreError::CorruptObject {
                    id,
                    reason: format!("missing member {}", slot_member(slot)),
                })?,
            Shape::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| item.fill(id, slots))
                    .collect::<StoreResult<_>>()?,
            ),
            Shape::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((k.fill(id, slots)?, v.fill(id, slots)?)))
                    .collect::<StoreResult<_>>()?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_need_no_slots() {
        let mut slots = Vec::new();
        let value = Value::List(vec![Value::Int(1), Value::from("two")]);
        let shape = Shape::of(&value, &mut slots).unwrap();
        assert!(matches!(shape, Shape::Datum(_)));
        assert!(!shape.has_slots());
        assert!(slots.is_empty());
    }

    #[test]
    fn objects_become_numbered_slots() {
        let mut slots = Vec::new();
        let a = orb_types::Callback::new(|_| Ok(Value::Nil)).into_value();
        let value = Value::Map(vec![
            (Value::symbol("first"), a.clone()),
            (Value::symbol("rest"), Value::List(vec![Value::Int(3), a.clone()])),
        ]);
        let shape = Shape::of(&value, &mut slots).unwrap();
        assert!(shape.has_slots());
        assert_eq!(slots.len(), 2);
        assert_eq!(slot_member(1), "$1");
        assert_eq!(slot_index("$1"), Some(1));
        assert_eq!(slot_index("@name"), None);

        let filled = shape.fill(4, &[Value::Int(7), Value::Int(8)]).unwrap();
        assert_eq!(
            filled,
            Value::Map(vec![
                (Value::symbol("first"), Value::Int(7)),
                (Value::symbol("rest"), Value::List(vec![Value::Int(3), Value::Int(8)])),
            ])
        );
    }

    #[test]
    fn missing_slot_is_corrupt() {
        let err = Shape::Slot(2).fill(9, &[]).unwrap_err();
        assert!(matches!(err, StoreError::CorruptObject { id: 9, .. }));
    }
}
