//! Per-connection export table: the objects a peer may address, with the
//! number of references to each that the peer still holds.

use std::collections::HashMap;

use orb_types::{identity, Handle};

struct Export {
    handle: Handle,
    count: u64,
}

/// Reference counts for the objects one connection has exported.
///
/// Exported objects are keyed by a locally minted id, never by address. Each
/// export of the same object to the same connection bumps its count; each
/// release notice from the peer decrements it. At zero the strong hold is
/// dropped and the id stops being addressable.
pub struct GcSet {
    by_id: HashMap<u64, Export>,
    by_identity: HashMap<usize, u64>,
    next_id: u64,
}

impl GcSet {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_identity: HashMap::new(),
            next_id: 1,
        }
    }

    /// Export `handle`, returning its id. Repeated exports of the same
    /// object share one id and raise its count.
    pub fn export(&mut self, handle: &Handle) -> u64 {
        let key = identity(handle);
        if let Some(id) = self.by_identity.get(&key) {
            if let Some(entry) = self.by_id.get_mut(id) {
                entry.count += 1;
                return *id;
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_identity.insert(key, id);
        self.by_id.insert(
            id,
            Export {
                handle: Handle::clone(handle),
                count: 1,
            },
        );
        id
    }

    /// The object exported under `id`, if the peer may still address it.
    pub fn get(&self, id: u64) -> Option<Handle> {
        self.by_id.get(&id).map(|e| Handle::clone(&e.handle))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Outstanding reference count for `id` (zero once released).
    pub fn count(&self, id: u64) -> u64 {
        self.by_id.get(&id).map_or(0, |e| e.count)
    }

    /// Drop one reference to `id`. When the count reaches zero the entry is
    /// removed and its handle returned so the caller can release it outside
    /// any lock. Unknown ids are ignored.
    pub fn release(&mut self, id: u64) -> Option<Handle> {
        let entry = self.by_id.get_mut(&id)?;
        entry.count = entry.count.saturating_sub(1);
        if entry.count > 0 {
            return None;
        }
        let entry = self.by_id.remove(&id)?;
        self.by_identity.remove(&identity(&entry.handle));
        Some(entry.handle)
    }

    /// Forget every export, returning the handles that were held.
    pub fn clear(&mut self) -> Vec<Handle> {
        self.by_identity.clear();
        self.by_id.drain().map(|(_, e)| e.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for GcSet {
    fn default() -> Self {
        Self::new()
    }
}
