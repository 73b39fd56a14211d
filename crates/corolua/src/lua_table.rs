// Hybrid array+hash table.
//
// The array part holds the dense 1-based integer prefix; everything else
// goes to the hash part. Keys must be concrete values (the VM resolves
// ropes and substrings before they get here). A `flags` byte caches which
// fast metamethods are known to be absent from the metatable.

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::GcHeader;
use crate::lua_value::{LuaValue, TablePtr};

/// Hash/Eq adapter: numbers by value bits (-0.0 folded to 0.0), strings by
/// content (interning makes identity and content agree for short strings),
/// other objects by address.
#[derive(Clone, Copy)]
pub struct TableKey(pub LuaValue);

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let v = &self.0;
        if v.is_number() {
            let n = v.as_number();
            let n = if n == 0.0 { 0.0 } else { n };
            state.write_u8(1);
            state.write_u64(n.to_bits());
        } else if let Some(s) = v.as_string() {
            state.write_u8(2);
            state.write(s.as_ref().bytes());
        } else if v.is_boolean() {
            state.write_u8(3);
            state.write_u8(v.as_boolean() as u8);
        } else {
            state.write_u8(4);
            state.write_usize(v.as_pointer() as usize);
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_equal(&other.0)
    }
}
impl Eq for TableKey {}

#[repr(C)]
pub struct LuaTable {
    pub header: GcHeader,
    array: Vec<LuaValue>,
    hash: HashMap<TableKey, LuaValue, RandomState>,
    pub metatable: Option<TablePtr>,
    /// Bit `1 << tm` set means "metatable has no such fast metamethod".
    pub flags: u8,
}

impl LuaTable {
    pub fn new(header: GcHeader, narray: usize, nhash: usize) -> Self {
        LuaTable {
            header,
            array: Vec::with_capacity(narray),
            hash: HashMap::with_capacity_and_hasher(nhash, RandomState::new()),
            metatable: None,
            flags: 0,
        }
    }

    /// Array index for a numeric key, if it lands in the array part.
    #[inline]
    fn array_index(&self, key: &LuaValue) -> Option<usize> {
        if !key.is_number() {
            return None;
        }
        let n = key.as_number();
        if n.fract() != 0.0 || n < 1.0 || n > self.array.len() as f64 {
            return None;
        }
        Some(n as usize - 1)
    }

    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        if let Some(i) = self.array_index(key) {
            return self.array[i];
        }
        if key.is_nil() {
            return LuaValue::nil();
        }
        self.hash
            .get(&TableKey(*key))
            .copied()
            .unwrap_or(LuaValue::nil())
    }

    pub fn raw_geti(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1];
        }
        self.hash
            .get(&TableKey(LuaValue::number(i as f64)))
            .copied()
            .unwrap_or(LuaValue::nil())
    }

    /// Primitive assignment; the caller has rejected nil/NaN keys and run
    /// the write barrier.
    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) {
        if let Some(i) = self.array_index(&key) {
            self.array[i] = value;
            return;
        }
        // append extends the array part and migrates any queued successors
        if key.is_number() {
            let n = key.as_number();
            if n.fract() == 0.0 && n == (self.array.len() + 1) as f64 {
                if value.is_nil() {
                    self.hash.remove(&TableKey(key));
                    return;
                }
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        if value.is_nil() {
            self.hash.remove(&TableKey(key));
        } else {
            self.hash.insert(TableKey(key), value);
        }
    }

    pub fn raw_seti(&mut self, i: i64, value: LuaValue) {
        self.raw_set(LuaValue::number(i as f64), value);
    }

    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = TableKey(LuaValue::number((self.array.len() + 1) as f64));
            match self.hash.remove(&next_key) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Pre-size the array part (SETLIST bulk stores).
    pub fn resize_array(&mut self, size: usize) {
        while self.array.len() < size {
            let idx = (self.array.len() + 1) as i64;
            let migrated = self
                .hash
                .remove(&TableKey(LuaValue::number(idx as f64)))
                .unwrap_or(LuaValue::nil());
            self.array.push(migrated);
        }
    }

    /// A border: `t[n]` non-nil and `t[n+1]` nil. Binary search over the
    /// array part, then probe the hash part for a continued sequence.
    pub fn len(&self) -> usize {
        let mut n = self.array.len();
        if n > 0 && self.array[n - 1].is_nil() {
            // binary search for the border inside the array part
            let (mut lo, mut hi) = (0usize, n);
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.hash.is_empty() {
            return n;
        }
        // sequence may continue in the hash part
        while !self.raw_geti(n as i64 + 1).is_nil() {
            n += 1;
        }
        n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.array.iter().all(|v| v.is_nil()) && self.hash.is_empty()
    }

    /// Stateless iteration for `next`: nil starts, any existing key
    /// resumes. Returns `None` when exhausted.
    pub fn next(&self, key: &LuaValue) -> Option<(LuaValue, LuaValue)> {
        let start = if key.is_nil() {
            0
        } else if let Some(i) = self.array_index(key) {
            i + 1
        } else {
            usize::MAX // hash part
        };
        if start != usize::MAX {
            for i in start..self.array.len() {
                if !self.array[i].is_nil() {
                    return Some((LuaValue::number((i + 1) as f64), self.array[i]));
                }
            }
            return self.hash.iter().next().map(|(k, v)| (k.0, *v));
        }
        let mut it = self.hash.iter();
        for (k, _) in it.by_ref() {
            if k.0.raw_equal(key) {
                break;
            }
        }
        it.next().map(|(k, v)| (k.0, *v))
    }

    /// All live entries, for the GC tracer.
    pub fn iter_entries(&self) -> impl Iterator<Item = (LuaValue, LuaValue)> + '_ {
        self.array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (LuaValue::number((i + 1) as f64), *v))
            .chain(self.hash.iter().map(|(k, v)| (k.0, *v)))
    }

    /// Invalidate the fast-metamethod cache (after metatable mutation).
    #[inline]
    pub fn invalidate_flags(&mut self) {
        self.flags = 0;
    }
}
