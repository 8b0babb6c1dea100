//! # Connection Registry
//!
//! Slab-backed arena mapping opaque [`ConnectionId`]s to connection objects.
//!
//! A `ConnectionId` packs the slab key in the low 32 bits and a per-slot
//! generation in the high 32 bits. Every time a slot is reused its
//! generation advances, so an id held past its connection's teardown never
//! resolves to the connection that later occupies the same slot.

use std::fmt;

use slab::Slab;

// ─── ConnectionId ────────────────────────────────────────────────────────────

/// Opaque handle identifying one peer connection.
///
/// Never zero: generations start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn new(index: usize, generation: u32) -> Self {
        ConnectionId(((generation as u64) << 32) | (index as u64 & 0xFFFF_FFFF))
    }

    /// Rebuild an id from its raw integer form.
    pub fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }

    /// Raw integer form, suitable for crossing an API boundary.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Arena slot this id refers to.
    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// Generation of the arena slot at the time the id was issued.
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct Entry<T> {
    generation: u32,
    value: T,
}

/// Generation-tagged arena of connection objects.
pub struct ConnectionRegistry<T> {
    entries: Slab<Entry<T>>,
    /// Last generation issued per slab key. Grows monotonically with the slab.
    generations: Vec<u32>,
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        ConnectionRegistry {
            entries: Slab::new(),
            generations: Vec::new(),
        }
    }

    /// Register a connection object and return its fresh id.
    pub fn insert(&mut self, value: T) -> ConnectionId {
        let slot = self.entries.vacant_entry();
        let key = slot.key();
        if key >= self.generations.len() {
            self.generations.resize(key + 1, 0);
        }
        let generation = match self.generations[key].wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.generations[key] = generation;
        slot.insert(Entry { generation, value });
        ConnectionId::new(key, generation)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.entries
            .get(id.index())
            .filter(|e| e.generation == id.generation())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation())
            .map(|e| &mut e.value)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a connection. Stale ids return `None` and leave the slot alone.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        Some(self.entries.remove(id.index()).value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all live ids, in slot order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .map(|(key, e)| ConnectionId::new(key, e.generation))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> + '_ {
        self.entries
            .iter()
            .map(|(key, e)| (ConnectionId::new(key, e.generation), &e.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut T)> + '_ {
        self.entries
            .iter_mut()
            .map(|(key, e)| (ConnectionId::new(key, e.generation), &mut e.value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_zero() {
        let mut reg = ConnectionRegistry::new();
        let id = reg.insert("a");
        assert_ne!(id.raw(), 0);
        assert_eq!(id.index(), 0);
        assert_eq!(id.generation(), 1);
    }

    #[test]
    fn insert_get_remove() {
        let mut reg = ConnectionRegistry::new();
        let a = reg.insert(10);
        let b = reg.insert(20);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(a), Some(&10));
        *reg.get_mut(b).unwrap() += 1;
        assert_eq!(reg.remove(b), Some(21));
        assert!(!reg.contains(b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut reg = ConnectionRegistry::new();
        let old = reg.insert("old");
        reg.remove(old);

        let new = reg.insert("new");
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert_eq!(new.generation(), old.generation() + 1);

        // The stale id must not alias the new occupant.
        assert!(reg.get(old).is_none());
        assert!(reg.remove(old).is_none());
        assert_eq!(reg.get(new), Some(&"new"));
    }

    #[test]
    fn ids_snapshot_matches_iter() {
        let mut reg = ConnectionRegistry::new();
        let a = reg.insert(1);
        let b = reg.insert(2);
        let c = reg.insert(3);
        reg.remove(b);
        assert_eq!(reg.ids(), vec![a, c]);
        let sum: i32 = reg.iter().map(|(_, v)| *v).sum();
        assert_eq!(sum, 4);
    }

    #[test]
    fn raw_roundtrip() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(());
        let id = reg.insert(());
        assert_eq!(ConnectionId::from_raw(id.raw()), id);
        assert_eq!(id.to_string(), id.raw().to_string());
    }
}
