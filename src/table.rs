// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings.
// Used for globals, instance fields, class methods, and the VM's string
// intern table. Linear probing, max load factor 0.75, capacity doubles
// from a minimum of 8. Deleted entries become tombstones so probe
// sequences stay intact; `count` includes tombstones, which is what
// keeps the load factor honest.

use std::mem;

use crate::heap::{Heap, ObjRef};
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Interned string key. `None` with a `true` value is a tombstone;
    /// `None` with `nil` is empty.
    key: Option<ObjRef>,
    /// The key's cached hash, kept here so rehashing never needs to
    /// chase the heap.
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Nil,
};

#[derive(Debug)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Approximate backing storage, charged to GC accounting by the
    /// objects that own a table.
    pub fn byte_size(&self) -> usize {
        self.entries.len() * mem::size_of::<Entry>()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Insert or update. Returns true iff the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            self.grow();
        }
        let idx = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        // Claiming a tombstone does not change the count.
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    /// Replace the entry with a tombstone. The count is left alone.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Probe by byte content rather than identity. This is how the
    /// intern table admits a candidate string that does not have a heap
    /// object yet.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // An empty non-tombstone entry terminates the probe.
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && heap.string(key).chars.as_ref() == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drop every entry whose key is unmarked. Runs between the GC's
    /// trace and sweep so the intern table never holds a freed string.
    pub fn remove_white(&mut self, heap: &Heap) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !heap.is_marked(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    /// Iterate live entries as `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Rehash into a doubled array. Tombstones are not carried over, so
    /// the count is recomputed from live entries.
    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let mut entries = vec![EMPTY; capacity];
        let mut count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = find_entry(&entries, key, entry.hash);
                entries[dest] = Entry {
                    key: Some(key),
                    hash: entry.hash,
                    value: entry.value,
                };
                count += 1;
            }
        }
        self.entries = entries;
        self.count = count;
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear probe for `key`, or for the slot where it would go. Prefers
/// the first tombstone passed so deleted slots get reused.
fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
    let capacity = entries.len();
    let mut index = hash as usize % capacity;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if matches!(entry.value, Value::Nil) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(existing) => {
                if existing == key {
                    return index;
                }
            }
        }
        index = (index + 1) % capacity;
    }
}
