//! String-keyed hash table.
//!
//! Open addressing with linear probing, tombstones, and a 0.75 maximum
//! load factor. Keys are interned string objects, so lookup is a pointer
//! comparison; the one exception is [`Table::find_string`], which the
//! intern table uses to probe by (hash, length, bytes) before an identity
//! exists.
//!
//! Used for globals, dictionaries, and the heap's intern table.

use crate::object::RawObj;
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    /// Null marks an empty slot or (with a non-nil value) a tombstone.
    key: RawObj,
    value: Value,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: std::ptr::null_mut(),
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !self.value.is_nil()
    }
}

pub struct Table {
    /// Live entries plus tombstones; capped by the load factor.
    count: usize,
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.key.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    pub fn get(&self, key: RawObj) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key)];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: RawObj, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_null();
        // Tombstones are already counted; only fresh slots bump the count.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    /// Replace the entry with a tombstone. Returns false if absent.
    pub fn delete(&mut self, key: RawObj) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(key);
        let entry = &mut self.entries[slot];
        if entry.key.is_null() {
            return false;
        }
        entry.key = std::ptr::null_mut();
        entry.value = Value::Bool(true);
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for (key, value) in from.iter() {
            self.set(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawObj, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_null())
            .map(|e| (e.key, e.value))
    }

    /// Deep-equality probe for interning: find an existing key with these
    /// bytes. Pointer comparison cannot be used because the candidate
    /// string has no heap identity yet.
    pub fn find_string(&self, text: &str, hash: u32) -> Option<RawObj> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else {
                let key = unsafe { (*entry.key).string() };
                if key.hash == hash && key.as_str() == text {
                    return Some(entry.key);
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drop every entry whose key does not carry the current mark. The
    /// intern table holds its strings weakly; the collector calls this
    /// between tracing and sweeping.
    pub(crate) fn remove_unmarked(&mut self, current_mark: bool) {
        for entry in &mut self.entries {
            if !entry.key.is_null() && unsafe { (*entry.key).marked } != current_mark {
                entry.key = std::ptr::null_mut();
                entry.value = Value::Bool(true);
            }
        }
    }

    fn find_slot(&self, key: RawObj) -> usize {
        let capacity = self.entries.len();
        let hash = unsafe { (*key).string().hash };
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if entry.is_tombstone() {
                    tombstone.get_or_insert(index);
                } else {
                    return tombstone.unwrap_or(index);
                }
            } else if std::ptr::eq(entry.key, key) {
                return index;
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::vacant(); capacity]);
        // Re-insertion drops tombstones, so the count is rebuilt.
        self.count = 0;
        for entry in old {
            if entry.key.is_null() {
                continue;
            }
            let slot = self.find_slot(entry.key);
            self.entries[slot] = entry;
            self.count += 1;
        }
    }
}
