//! An open-addressed, string-keyed hash table with tombstones (§4.D),
//! used for globals, class methods, and instance fields. Interning itself
//! is driven by [`crate::heap::Heap`], which holds one `Table`-adjacent
//! structure keyed by content rather than handle (see `find_string`).

use crate::heap::{Heap, ObjRef};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

/// FNV-1a, used to hash string bytes for interning and table probing.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u64, value: Value },
}

/// An open-addressed table from interned string keys to values.
#[derive(Default)]
pub struct Table {
    entries: Vec<Slot>,
    live: usize,
    used: usize, // live + tombstones, drives the load factor
}

impl Table {
    /// An empty table (no allocation until the first insert).
    #[must_use]
    pub fn new() -> Self {
        Table { entries: Vec::new(), live: 0, used: 0 }
    }

    /// Number of live (non-tombstone) entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// True if there are no live entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn grow_if_needed(&mut self) {
        if self.capacity() == 0 || self.used as f64 / self.capacity() as f64 > MAX_LOAD {
            let new_cap = if self.capacity() == 0 { 8 } else { self.capacity() * 2 };
            self.resize(new_cap);
        }
    }

    fn resize(&mut self, new_cap: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Slot::Empty; new_cap]);
        self.used = 0;
        self.live = 0;
        for slot in old {
            if let Slot::Occupied { key, hash, value } = slot {
                self.insert_fresh(key, hash, value);
            }
        }
    }

    /// Insert assuming the key is not already present (used while
    /// rehashing, where duplicates cannot occur).
    fn insert_fresh(&mut self, key: ObjRef, hash: u64, value: Value) {
        let idx = self.find_slot_for_insert(hash, |candidate| candidate == key);
        self.entries[idx] = Slot::Occupied { key, hash, value };
        self.live += 1;
        self.used += 1;
    }

    /// Probe sequence: returns the first matching slot, else the first
    /// tombstone seen, else the first empty slot.
    fn find_slot_for_insert(&self, hash: u64, is_match: impl Fn(ObjRef) -> bool) -> usize {
        let cap = self.capacity() as u64;
        let mut idx = (hash % cap) as usize;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.entries[idx] {
                Slot::Empty => return tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Slot::Occupied { key, hash: h, .. } if h == hash && is_match(key) => return idx,
                Slot::Occupied { .. } => {}
            }
            idx = (idx + 1) % self.capacity();
        }
    }

    /// Looks up `key` (already hashed via [`hash_bytes`] on its content).
    #[must_use]
    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let idx = self.find_slot_for_insert(hash, |k| k == key);
        match self.entries[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Inserts or overwrites `key -> value`. Returns `true` if this was a
    /// fresh key (not previously present).
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        self.grow_if_needed();
        let idx = self.find_slot_for_insert(hash, |k| k == key);
        let is_new = !matches!(self.entries[idx], Slot::Occupied { .. });
        let was_tombstone = matches!(self.entries[idx], Slot::Tombstone);
        self.entries[idx] = Slot::Occupied { key, hash, value };
        if is_new {
            self.live += 1;
            if !was_tombstone {
                self.used += 1;
            }
        }
        is_new
    }

    /// Removes `key`, leaving a tombstone so later probes keep working.
    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let idx = self.find_slot_for_insert(hash, |k| k == key);
        if matches!(self.entries[idx], Slot::Occupied { .. }) {
            self.entries[idx] = Slot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Copies every live entry of `self` into `dst` (used for `Inherit`).
    pub fn add_all(&self, dst: &mut Table) {
        for slot in &self.entries {
            if let Slot::Occupied { key, hash, value } = *slot {
                dst.set(key, hash, value);
            }
        }
    }

    /// Iterates live `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match *slot {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    /// String-interning bootstrap: find a live key whose *content* matches
    /// `bytes`, without having an `ObjRef` for it yet. Used only by
    /// [`Heap::intern`]; ordinary lookups use [`Table::get`] by handle
    /// identity once interning guarantees equal content shares one handle.
    #[must_use]
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u64) -> Option<ObjRef> {
        if self.capacity() == 0 {
            return None;
        }
        let cap = self.capacity() as u64;
        let mut idx = (hash % cap) as usize;
        loop {
            match self.entries[idx] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if h == hash && heap.string_bytes(key) == bytes => {
                    return Some(key)
                }
                _ => {}
            }
            idx = (idx + 1) % self.capacity();
        }
    }

    /// GC hook: drop every entry whose key is unmarked (run before sweep
    /// so the interning table never observes a dangling key). Takes a
    /// predicate rather than `&Heap` directly so callers inside
    /// `Heap::collect` can pass a closure borrowing just the arena field,
    /// since `self.strings` is itself a field of `Heap`.
    pub fn remove_unmarked(&mut self, mut is_marked: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.entries {
            if let Slot::Occupied { key, .. } = *slot {
                if !is_marked(key) {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = heap.intern("answer");
        let h = hash_bytes(b"answer");
        assert!(table.set(k, h, Value::Number(42.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(42.0)));
        assert!(table.delete(k, h));
        assert_eq!(table.get(k, h), None);
    }

    #[test]
    fn overwrite_is_not_a_new_key() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = heap.intern("x");
        let h = hash_bytes(b"x");
        assert!(table.set(k, h, Value::Number(1.0)));
        assert!(!table.set(k, h, Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let name = format!("v{i}");
            let k = heap.intern(&name);
            let h = hash_bytes(name.as_bytes());
            table.set(k, h, Value::Number(f64::from(i)));
        }
        assert_eq!(table.len(), 100);
    }
}
