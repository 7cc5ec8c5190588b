//! General-purpose open-addressed hash table (§4.6), shared by the
//! globals table, each class's method table, and each instance's field
//! table. Keys are [`Handle`]s to already-interned strings: because the
//! interning table (§4.5, implemented in `heap::Heap`) guarantees equal
//! byte sequences share one handle, two equal keys here are always the
//! *same* handle, so hashing the handle's raw index is a legitimate
//! (if unusual) hash function for this table — see DESIGN.md.

use crate::handle::Handle;

const LOAD_FACTOR_MAX: f64 = 0.75;

#[derive(Clone)]
enum Slot<V> {
    Empty,
    Tombstone,
    Occupied(Handle, V),
}

/// An open-addressed map from interned string [`Handle`]s to `V`,
/// linear-probed, with tombstones so probing continues past deletions
/// and a capacity that is always a power of two.
pub struct Table<V> {
    slots: Vec<Slot<V>>,
    /// Occupied entries, not counting tombstones. Used for the 0.75
    /// load-factor check and reported by `len()`.
    count: usize,
    /// Occupied entries *plus* tombstones. Counted toward the resize
    /// threshold so a delete-heavy workload still grows the table
    /// instead of probing an ever-longer tombstone chain.
    used: usize,
}

impl<V: Clone> Default for Table<V> {
    fn default() -> Self {
        Table::new()
    }
}

impl<V: Clone> Table<V> {
    pub fn new() -> Table<V> {
        Table {
            slots: Vec::new(),
            count: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot index a `key` would probe to in a table of
    /// capacity `cap`, continuing past tombstones and non-matching
    /// occupied slots (there may be more than one key hashing to the
    /// same bucket).
    fn probe(slots: &[Slot<V>], key: Handle) -> usize {
        let cap = slots.len();
        let mut index = (key.index()) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &slots[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if *k == key => return index,
                Slot::Occupied(_, _) => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.slots.is_empty() { 8 } else { self.slots.len() * 2 };
        let mut new_slots: Vec<Slot<V>> = (0..new_capacity).map(|_| Slot::Empty).collect();
        for slot in self.slots.drain(..) {
            if let Slot::Occupied(key, value) = slot {
                let index = Self::probe(&new_slots, key);
                new_slots[index] = Slot::Occupied(key, value);
            }
        }
        self.slots = new_slots;
        self.used = self.count;
    }

    /// Inserts `value` under `key`, returning `true` iff this created a
    /// new entry (used by `VAR_DECL` to detect redeclaration and by
    /// `ASSIGN_GLOBAL` to detect assignment to an undefined global).
    pub fn insert(&mut self, key: Handle, value: V) -> bool {
        if self.slots.is_empty() || (self.used + 1) as f64 / self.capacity() as f64 > LOAD_FACTOR_MAX {
            self.grow();
        }
        let index = Self::probe(&self.slots, key);
        let is_new = !matches!(self.slots[index], Slot::Occupied(_, _));
        if matches!(self.slots[index], Slot::Empty) {
            self.used += 1;
        }
        if is_new {
            self.count += 1;
        }
        self.slots[index] = Slot::Occupied(key, value);
        is_new
    }

    pub fn get(&self, key: Handle) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        match &self.slots[Self::probe(&self.slots, key)] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Handle) -> Option<&mut V> {
        if self.slots.is_empty() {
            return None;
        }
        let index = Self::probe(&self.slots, key);
        match &mut self.slots[index] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Handle) -> bool {
        self.get(key).is_some()
    }

    /// Removes `key`, leaving a tombstone so later probes for other
    /// keys that collided with it keep working. Returns whether the
    /// key was present.
    pub fn delete(&mut self, key: Handle) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let index = Self::probe(&self.slots, key);
        if matches!(self.slots[index], Slot::Occupied(_, _)) {
            self.slots[index] = Slot::Tombstone;
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// All live (key, value) pairs. Used by the GC to mark every key
    /// and value reachable through this table (§4.4 step 1/2).
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, v)),
            _ => None,
        })
    }

    pub fn copy_from(&mut self, other: &Table<V>) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_roundtrip() {
        let mut t: Table<i64> = Table::new();
        let a = Handle::from_index(1);
        let b = Handle::from_index(2);
        assert!(t.insert(a, 10));
        assert!(t.insert(b, 20));
        assert!(!t.insert(a, 11));
        assert_eq!(t.get(a), Some(&11));
        assert_eq!(t.get(b), Some(&20));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn delete_leaves_tombstone_that_probing_skips() {
        let mut t: Table<i64> = Table::new();
        for i in 0..20 {
            t.insert(Handle::from_index(i), i as i64);
        }
        for i in 0..10 {
            t.delete(Handle::from_index(i));
        }
        for i in 10..20 {
            assert_eq!(t.get(Handle::from_index(i)), Some(&(i as i64)));
        }
        assert_eq!(t.len(), 10);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: Table<i64> = Table::new();
        for i in 0..1000 {
            t.insert(Handle::from_index(i), i as i64);
        }
        for i in 0..1000 {
            assert_eq!(t.get(Handle::from_index(i)), Some(&(i as i64)));
        }
    }
}
