use crate::object::Obj;
use crate::value::{ObjRef, Value};

const MIN_CAPACITY: usize = 8;

// Both tables grow at 3/4 load. `count` includes tombstones so probe chains
// stay bounded; it is recomputed on rehash.
fn needs_grow(count: usize, capacity: usize) -> bool {
    (count + 1) * 4 > capacity * 3
}

/// Open-addressed table keyed by interned strings. Keys compare by handle
/// identity; the stored hash is kept for probing and rehashing, and lets
/// `find_string` reject mismatches before touching the bytes.
#[derive(Clone)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    // An empty slot is key-less with a nil value; a tombstone is key-less
    // with `Bool(true)` so probing walks past it.
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil };
    const TOMBSTONE: Entry = Entry { key: None, hash: 0, value: Value::Bool(true) };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: vec![] }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut idx = hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return tombstone.unwrap_or(idx);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Some(k) if k == key => return idx,
                Some(_) => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let idx = Self::find_slot(&self.entries, key, hash);
        let entry = &self.entries[idx];
        entry.key.map(|_| entry.value)
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Returns true when `key` was not present before.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if needs_grow(self.count, self.capacity()) {
            self.grow();
        }
        let idx = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    /// Installs a tombstone so later probes keep walking the chain.
    pub fn remove(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = Self::find_slot(&self.entries, key, hash);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry::TOMBSTONE;
        true
    }

    /// The interning probe: compares bytes, not handles. `objects` is the
    /// heap arena the stored handles point into.
    pub fn find_string(&self, objects: &[Obj], text: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut idx = hash as usize & mask;
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(k) => {
                    if entry.hash == hash {
                        if let Obj::Str(s) = &objects[k] {
                            if s.text == text {
                                return Some(k);
                            }
                        }
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let idx = Self::find_slot(&self.entries, key, entry.hash);
                self.entries[idx] = entry;
                self.count += 1;
            }
        }
    }
}

/// Open-addressed table keyed by raw 64-bit patterns: number keys enter by
/// bit pattern, map-literal elements by index. Probing mixes the raw key
/// down to 32 bits.
#[derive(Clone)]
pub struct RawHash {
    count: usize,
    entries: Vec<RawEntry>,
}

#[derive(Clone, Copy)]
struct RawEntry {
    key: Option<u64>,
    value: Value,
}

impl RawEntry {
    const EMPTY: RawEntry = RawEntry { key: None, value: Value::Nil };
    const TOMBSTONE: RawEntry = RawEntry { key: None, value: Value::Bool(true) };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

fn mix(mut key: u64) -> u32 {
    key ^= key >> 33;
    key = key.wrapping_mul(0xff51_afd7_ed55_8ccd);
    key ^= key >> 33;
    key = key.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    key ^= key >> 33;
    key as u32
}

impl Default for RawHash {
    fn default() -> Self {
        Self::new()
    }
}

impl RawHash {
    pub fn new() -> Self {
        Self { count: 0, entries: vec![] }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[RawEntry], key: u64) -> usize {
        let mask = entries.len() - 1;
        let mut idx = mix(key) as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return tombstone.unwrap_or(idx);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Some(k) if k == key => return idx,
                Some(_) => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, key: u64) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let idx = Self::find_slot(&self.entries, key);
        let entry = &self.entries[idx];
        entry.key.map(|_| entry.value)
    }

    pub fn set(&mut self, key: u64, value: Value) -> bool {
        if needs_grow(self.count, self.capacity()) {
            self.grow();
        }
        let idx = Self::find_slot(&self.entries, key);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = RawEntry { key: Some(key), value };
        is_new
    }

    pub fn remove(&mut self, key: u64) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = Self::find_slot(&self.entries, key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = RawEntry::TOMBSTONE;
        true
    }

    fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![RawEntry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let idx = Self::find_slot(&self.entries, key);
                self.entries[idx] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn set_reports_first_insert() {
        let mut t = Table::new();
        assert!(t.set(1, 0x11, Value::Number(1.0)));
        assert!(!t.set(1, 0x11, Value::Number(2.0)));
        assert_eq!(t.get(1, 0x11), Some(Value::Number(2.0)));
    }

    #[test]
    fn remove_then_reinsert() {
        let mut t = Table::new();
        t.set(7, 0x7, Value::Bool(true));
        assert!(t.remove(7, 0x7));
        assert!(!t.remove(7, 0x7));
        assert_eq!(t.get(7, 0x7), None);
        assert!(t.set(7, 0x7, Value::Nil));
        assert_eq!(t.get(7, 0x7), Some(Value::Nil));
    }

    #[test]
    fn probe_chain_survives_removal() {
        // Same hash forces the second key into the first one's chain.
        let mut t = Table::new();
        t.set(1, 0x40, Value::Number(1.0));
        t.set(2, 0x40, Value::Number(2.0));
        assert!(t.remove(1, 0x40));
        assert_eq!(t.get(2, 0x40), Some(Value::Number(2.0)));
        // The tombstone slot is reused for a fresh insert.
        assert!(t.set(3, 0x40, Value::Number(3.0)));
        assert_eq!(t.get(2, 0x40), Some(Value::Number(2.0)));
        assert_eq!(t.get(3, 0x40), Some(Value::Number(3.0)));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut t = Table::new();
        for k in 0..100usize {
            t.set(k, k as u32, Value::Number(k as f64));
        }
        for k in 0..100usize {
            assert_eq!(t.get(k, k as u32), Some(Value::Number(k as f64)));
        }
    }

    #[test]
    fn raw_hash_keys_on_bit_patterns() {
        let mut h = RawHash::new();
        h.set(1.0f64.to_bits(), Value::Bool(true));
        assert_eq!(h.get(1.0f64.to_bits()), Some(Value::Bool(true)));
        assert_eq!(h.get(2.0f64.to_bits()), None);
        // 0.0 and -0.0 are distinct raw keys.
        h.set(0.0f64.to_bits(), Value::Number(1.0));
        assert_eq!(h.get((-0.0f64).to_bits()), None);
    }

    proptest! {
        #[test]
        fn raw_hash_matches_model(ops in proptest::collection::vec((0u64..32, any::<bool>(), -100.0f64..100.0), 0..200)) {
            let mut h = RawHash::new();
            let mut model: HashMap<u64, Value> = HashMap::new();
            for (key, insert, n) in ops {
                if insert {
                    let expect_new = !model.contains_key(&key);
                    prop_assert_eq!(h.set(key, Value::Number(n)), expect_new);
                    model.insert(key, Value::Number(n));
                } else {
                    prop_assert_eq!(h.remove(key), model.remove(&key).is_some());
                }
                for (k, v) in &model {
                    prop_assert_eq!(h.get(*k), Some(*v));
                }
            }
        }

        #[test]
        fn table_matches_model(ops in proptest::collection::vec((0usize..24, any::<bool>(), -100.0f64..100.0), 0..200)) {
            // Handle k hashes to k * 3 to exercise clustered probe chains.
            let mut t = Table::new();
            let mut model: HashMap<usize, Value> = HashMap::new();
            for (key, insert, n) in ops {
                let hash = (key * 3) as u32;
                if insert {
                    let expect_new = !model.contains_key(&key);
                    prop_assert_eq!(t.set(key, hash, Value::Number(n)), expect_new);
                    model.insert(key, Value::Number(n));
                } else {
                    prop_assert_eq!(t.remove(key, hash), model.remove(&key).is_some());
                }
                for (k, v) in &model {
                    prop_assert_eq!(t.get(*k, (*k * 3) as u32), Some(*v));
                }
            }
        }
    }
}
