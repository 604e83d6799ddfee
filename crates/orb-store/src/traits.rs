use crate::error::StoreResult;

/// How a backing-store transaction takes its locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// Read-only: locks are taken lazily.
    Deferred,
    /// Read-write: the write lock is taken up front.
    Immediate,
    /// Maintenance: no other connection may read or write.
    Exclusive,
}

/// One row of the `objects` relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRow {
    pub class_name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// The three relations backing an object store.
///
/// Every method is one statement against the backing engine. Callers group
/// them between [`begin`](Relations::begin) and
/// [`commit`](Relations::commit); a failure anywhere is followed by
/// [`rollback`](Relations::rollback).
///
/// Implementations must:
/// - cascade deletion of an object row to the member and array rows it owns;
/// - refuse (at statement end) to delete an object row still referenced as
///   a member or array element target;
/// - report serialization conflicts as errors for which
///   [`StoreError::is_conflict`](crate::StoreError::is_conflict) holds.
pub trait Relations: Send {
    fn begin(&mut self, mode: TxMode) -> StoreResult<()>;
    fn commit(&mut self) -> StoreResult<()>;
    fn rollback(&mut self) -> StoreResult<()>;

    /// Drop and recreate all three relations.
    fn reset_schema(&mut self) -> StoreResult<()>;

    /// One past the largest object id, or 0 when the store is empty.
    fn next_id(&mut self) -> StoreResult<i64>;

    fn fetch_object(&mut self, id: i64) -> StoreResult<Option<ObjectRow>>;

    /// Id of the class row named `class_name`, if one exists.
    fn find_class(&mut self, class_name: &str) -> StoreResult<Option<i64>>;

    fn insert_object(
        &mut self,
        id: i64,
        class_name: Option<&str>,
        value: Option<&[u8]>,
    ) -> StoreResult<()>;

    fn update_value(&mut self, id: i64, value: Option<&[u8]>) -> StoreResult<()>;

    /// All member rows of `id`: `(member_name, member_id)`.
    fn members(&mut self, id: i64) -> StoreResult<Vec<(String, Option<i64>)>>;

    fn insert_member(&mut self, id: i64, name: &str, member_id: Option<i64>) -> StoreResult<()>;

    fn delete_members(&mut self, id: i64) -> StoreResult<()>;

    /// One past the largest element index of array `id`.
    fn array_len(&mut self, id: i64) -> StoreResult<usize>;

    /// Target of element `index` of array `id`; `None` if absent or nil.
    fn array_element(&mut self, id: i64, index: usize) -> StoreResult<Option<i64>>;

    /// Insert element `index` of array `id`, or update it if present.
    fn upsert_element(&mut self, id: i64, index: usize, object: Option<i64>) -> StoreResult<()>;

    /// Set the mark flag of `id`.
    fn mark(&mut self, id: i64) -> StoreResult<usize>;

    /// Mark every unmarked target of a member row owned by a marked object.
    /// Returns the number of newly marked objects.
    fn mark_member_targets(&mut self) -> StoreResult<usize>;

    /// Mark every unmarked element of an array owned by a marked object.
    fn mark_array_targets(&mut self) -> StoreResult<usize>;

    /// Delete every unmarked object; returns the number deleted.
    fn sweep(&mut self) -> StoreResult<usize>;

    fn clear_marks(&mut self) -> StoreResult<()>;

    /// Reclaim free pages. Must run outside a transaction.
    fn vacuum(&mut self) -> StoreResult<()>;

    /// Number of rows in the `objects` relation.
    fn object_count(&mut self) -> StoreResult<usize>;
}
