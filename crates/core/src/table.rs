//! Open-addressed hash table keyed by hashable `Value`s.
//!
//! Used for language-level tables and for every name-indexed map in the
//! runtime (globals, publics, struct field maps, method tables, the module
//! cache). Linear probing, tombstone deletion, load factor capped at 0.6.
//!
//! Keys carry their hash in the entry so the table can rehash without
//! consulting the heap; callers compute hashes up front (interned strings
//! already store theirs). Key equality is [`values_equal`], which for
//! interned strings reduces to handle equality.

use crate::value::{Value, values_equal};

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 5; // 0.6
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
enum Entry {
    #[default]
    Empty,
    Tombstone,
    Full {
        hash: u32,
        key: Value,
        value: Value,
    },
}

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries.
    live: usize,
    /// Live entries plus tombstones; drives the load factor.
    used: usize,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`. Returns the index of the matching entry, or of the
    /// slot an insert should use (first tombstone on the probe path, else
    /// the terminating empty slot).
    fn find_slot(entries: &[Entry], hash: u32, key: Value) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { hash: h, key: k, .. } => {
                    if h == hash && values_equal(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() == 0 {
            INITIAL_CAPACITY
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_capacity]);
        self.used = 0;
        self.live = 0;
        for entry in old {
            if let Entry::Full { hash, key, value } = entry {
                let slot = Self::find_slot(&self.entries, hash, key);
                self.entries[slot] = Entry::Full { hash, key, value };
                self.live += 1;
                self.used += 1;
            }
        }
    }

    pub fn get(&self, hash: u32, key: Value) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        match self.entries[Self::find_slot(&self.entries, hash, key)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains_key(&self, hash: u32, key: Value) -> bool {
        self.get(hash, key).is_some()
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    pub fn set(&mut self, hash: u32, key: Value, value: Value) -> bool {
        if (self.used + 1) * TABLE_MAX_LOAD_DEN > self.capacity() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }
        let slot = Self::find_slot(&self.entries, hash, key);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Full { hash, key, value };
                false
            }
            Entry::Tombstone => {
                self.entries[slot] = Entry::Full { hash, key, value };
                self.live += 1;
                true
            }
            Entry::Empty => {
                self.entries[slot] = Entry::Full { hash, key, value };
                self.live += 1;
                self.used += 1;
                true
            }
        }
    }

    pub fn delete(&mut self, hash: u32, key: Value) -> bool {
        if self.live == 0 {
            return false;
        }
        let slot = Self::find_slot(&self.entries, hash, key);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Removes entries whose key fails the predicate. Used by the collector
    /// to drop unmarked keys without touching the probe sequences of
    /// survivors (deletion writes tombstones).
    pub fn retain_keys(&mut self, mut keep: impl FnMut(Value) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Full { key, .. } = entry {
                if !keep(*key) {
                    *entry = Entry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn byte_estimate(&self) -> usize {
        self.capacity() * std::mem::size_of::<Entry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_hash(i: i32) -> u32 {
        crate::heap::hash_f64_bits(f64::from(i))
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(int_hash(1), Value::Int(1), Value::Bool(true)));
        assert_eq!(table.get(int_hash(1), Value::Int(1)), Some(Value::Bool(true)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_len() {
        let mut table = Table::new();
        table.set(int_hash(7), Value::Int(7), Value::Int(1));
        assert!(!table.set(int_hash(7), Value::Int(7), Value::Int(2)));
        assert_eq!(table.get(int_hash(7), Value::Int(7)), Some(Value::Int(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_and_reinsert_through_tombstone() {
        let mut table = Table::new();
        for i in 0..16 {
            table.set(int_hash(i), Value::Int(i), Value::Int(i * 10));
        }
        assert!(table.delete(int_hash(3), Value::Int(3)));
        assert_eq!(table.get(int_hash(3), Value::Int(3)), None);
        assert_eq!(table.len(), 15);
        // Later keys on the same probe path must still be reachable.
        for i in 4..16 {
            assert_eq!(table.get(int_hash(i), Value::Int(i)), Some(Value::Int(i * 10)));
        }
        table.set(int_hash(3), Value::Int(3), Value::Int(99));
        assert_eq!(table.get(int_hash(3), Value::Int(3)), Some(Value::Int(99)));
        assert_eq!(table.len(), 16);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..200 {
            table.set(int_hash(i), Value::Int(i), Value::Int(-i));
        }
        assert_eq!(table.len(), 200);
        for i in 0..200 {
            assert_eq!(table.get(int_hash(i), Value::Int(i)), Some(Value::Int(-i)));
        }
    }

    #[test]
    fn test_int_and_float_keys_collide_numerically() {
        // 1 and 1.0 are the same key: equal values must hash equally.
        let mut table = Table::new();
        table.set(int_hash(1), Value::Int(1), Value::Int(10));
        let float_hash = crate::heap::hash_f64_bits(1.0);
        assert_eq!(float_hash, int_hash(1));
        assert_eq!(table.get(float_hash, Value::Float(1.0)), Some(Value::Int(10)));
    }
}
