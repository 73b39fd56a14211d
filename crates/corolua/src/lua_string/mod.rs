// String engine: interned short strings, content-compared long strings,
// lazy rope concatenation and substring views, with rope/substring nodes
// slab-allocated in clusters.

mod cluster;
mod strtab;

pub use cluster::{CLUSTER_SLOTS, Cluster, ClusterSet};
pub use strtab::StringTable;

use crate::gc::{GcHeader, GcPtr, object_size};
use crate::lua_value::{LuaValue, RopePtr, StrPtr, SubStrPtr, TLNGSTR, TROPE, TSHRSTR, TSUBSTR};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Interning threshold: anything at or below is deduplicated globally.
pub const SHORT_STR_LIMIT: usize = 40;

/// Results at or above this size get their own heap buffer instead of the
/// shared scratch buffer.
pub const ROPE_ALLOC_MIN_SIZE: usize = 32 * 1024;

/// Hard cap so rope length arithmetic cannot overflow.
pub const MAX_STR_LEN: usize = isize::MAX as usize / 2;

const EXTRA_HASHED: u8 = 1 << 0;

/// A concrete string (short interned or long). Bytes are immutable after
/// creation.
#[repr(C)]
pub struct GcStr {
    pub header: GcHeader,
    /// Flag bits; long strings note here whether `hash` is filled in.
    pub extra: u8,
    pub hash: u32,
    bytes: Box<[u8]>,
}

impl GcStr {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline(always)]
    pub fn is_short(&self) -> bool {
        self.header.tt == TSHRSTR
    }
}

/// Lazy concatenation node. `len` caches the total length; `res` caches
/// the materialized string once `build` has run, at which point the
/// children are released.
#[repr(C)]
pub struct GcRope {
    pub header: GcHeader,
    pub len: usize,
    pub left: *mut GcHeader,
    pub right: *mut GcHeader,
    pub res: *mut GcStr,
}

/// A `(parent, offset, len)` view into a concrete string. The parent must
/// outlive the view; the collector keeps it alive through the back
/// reference.
#[repr(C)]
pub struct GcSubStr {
    pub header: GcHeader,
    pub parent: StrPtr,
    pub offset: usize,
    pub len: usize,
}

impl GcSubStr {
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.parent.as_ref().bytes()[self.offset..self.offset + self.len]
    }
}

/// Seeded sampling hash: long inputs are sampled with stride
/// `(len >> 5) + 1` so hashing stays O(32) regardless of length.
pub fn hash_bytes(seed: u32, bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = seed ^ len as u32;
    let step = (len >> 5) + 1;
    let mut l1 = len;
    while l1 >= step {
        h ^= h
            .wrapping_shl(5)
            .wrapping_add(h.wrapping_shr(2))
            .wrapping_add(bytes[l1 - 1] as u32);
        l1 -= step;
    }
    h
}

/// Content equality for concrete strings; identity short-circuits the
/// interned case.
pub fn str_equal(a: StrPtr, b: StrPtr) -> bool {
    if a == b {
        return true;
    }
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.is_short() && b.is_short() {
        return false; // interned: identity is equality
    }
    a.len() == b.len() && a.bytes() == b.bytes()
}

/// Byte-wise ordering. Embedded NULs participate like any other byte,
/// which matches the tie-breaking behaviour of the segment-by-segment
/// `strcoll` loop under the C locale.
pub fn str_cmp(a: StrPtr, b: StrPtr) -> std::cmp::Ordering {
    a.as_ref().bytes().cmp(b.as_ref().bytes())
}

/// Effective length of any string-family node.
pub fn node_len(node: *mut GcHeader) -> usize {
    unsafe {
        match (*node).tt {
            TSHRSTR | TLNGSTR => (*(node as *const GcStr)).len(),
            TSUBSTR => (*(node as *const GcSubStr)).len,
            TROPE => (*(node as *const GcRope)).len,
            _ => unreachable!("non-string node in rope"),
        }
    }
}

/// A node whose bytes are directly available: a concrete string, a
/// substring, or an already-resolved rope.
fn is_leaf(node: *mut GcHeader) -> bool {
    unsafe {
        match (*node).tt {
            TSHRSTR | TLNGSTR | TSUBSTR => true,
            TROPE => !(*(node as *const GcRope)).res.is_null(),
            _ => false,
        }
    }
}

fn copy_leaf(node: *mut GcHeader, out: &mut Vec<u8>) {
    unsafe {
        match (*node).tt {
            TSHRSTR | TLNGSTR => out.extend_from_slice((*(node as *const GcStr)).bytes()),
            TSUBSTR => out.extend_from_slice((*(node as *const GcSubStr)).bytes()),
            TROPE => {
                let res = (*(node as *const GcRope)).res;
                debug_assert!(!res.is_null());
                out.extend_from_slice((*res).bytes());
            }
            _ => unreachable!(),
        }
    }
}

impl LuaVM {
    /// Intern or allocate a string for `bytes`. Short strings are unique
    /// per content; a dead-but-unswept match is resurrected in place.
    pub fn new_lstr(&mut self, bytes: &[u8]) -> StrPtr {
        if bytes.len() > SHORT_STR_LIMIT {
            return self.new_long_str(bytes);
        }
        let hash = hash_bytes(self.str_seed, bytes);
        if let Some(found) = self.strt.find(hash, bytes) {
            let header = &mut found.as_mut().header;
            if header.is_dead(self.gc.other_white()) {
                header.change_white();
            }
            return found;
        }
        let s = GcPtr::from_box(Box::new(GcStr {
            header: GcHeader::new(TSHRSTR, self.gc.current_white),
            extra: EXTRA_HASHED,
            hash,
            bytes: bytes.into(),
        }));
        self.gc.total_bytes += object_size(TSHRSTR, bytes.len());
        self.strt.insert(s);
        if self.strt.too_crowded() && !self.gc.sweeping_strings {
            let new_size = self.strt.size() * 2;
            self.strt.resize(new_size);
        }
        s
    }

    pub fn new_str(&mut self, s: &str) -> StrPtr {
        self.new_lstr(s.as_bytes())
    }

    fn new_long_str(&mut self, bytes: &[u8]) -> StrPtr {
        let s = GcPtr::from_box(Box::new(GcStr {
            header: GcHeader::new(TLNGSTR, self.gc.current_white),
            extra: 0,
            hash: 0,
            bytes: bytes.into(),
        }));
        self.gc.link(
            s.as_raw() as *mut GcHeader,
            object_size(TLNGSTR, bytes.len()),
        );
        s
    }

    /// Hash of a concrete string, computed on first use for long strings
    /// (at concat or table-key time).
    pub fn str_hash(&self, s: StrPtr) -> u32 {
        let sr = s.as_mut();
        if sr.extra & EXTRA_HASHED == 0 {
            sr.hash = hash_bytes(self.str_seed, sr.bytes());
            sr.extra |= EXTRA_HASHED;
        }
        sr.hash
    }

    /// O(1) lazy concatenation: a cluster-allocated rope node. No byte is
    /// copied here.
    pub fn concat_str(&mut self, l: LuaValue, r: LuaValue) -> LuaResult<RopePtr> {
        debug_assert!(l.is_string_like() && r.is_string_like());
        let left = l.as_gc_header().unwrap();
        let right = r.as_gc_header().unwrap();
        let len = node_len(left)
            .checked_add(node_len(right))
            .filter(|l| *l < MAX_STR_LEN)
            .ok_or(LuaError::Mem)?;
        let node = self.ropes.alloc(GcRope {
            header: GcHeader::new(TROPE, self.gc.current_white),
            len,
            left,
            right,
            res: std::ptr::null_mut(),
        });
        self.gc.link(node as *mut GcHeader, object_size(TROPE, 0));
        Ok(RopePtr::from_raw(node))
    }

    /// Materialize a rope. Idempotent: a second call returns the cached
    /// result. Children are released once the result is cached, and the
    /// result is forced black so an in-flight collection cannot reclaim it
    /// before the caller stores it somewhere reachable.
    pub fn build_str(&mut self, rope: RopePtr) -> LuaResult<StrPtr> {
        let root = rope.as_mut();
        if !root.res.is_null() {
            return Ok(StrPtr::from_raw(root.res));
        }
        if root.len >= MAX_STR_LEN {
            return Err(LuaError::Mem);
        }

        let mut out = if root.len >= ROPE_ALLOC_MIN_SIZE {
            Vec::with_capacity(root.len)
        } else {
            let mut scratch = std::mem::take(&mut self.scratch);
            scratch.clear();
            scratch.reserve(root.len);
            scratch
        };
        let mut stack = std::mem::take(&mut self.rope_stack);
        stack.clear();

        // Iterative in-order walk: descend the left spine pushing internal
        // nodes, emit the leaf, then emit right-hand leaves while popping.
        let mut cur: *mut GcRope = rope.as_raw();
        'walk: loop {
            unsafe {
                while !is_leaf((*cur).left) {
                    stack.push(cur);
                    cur = (*cur).left as *mut GcRope;
                }
                copy_leaf((*cur).left, &mut out);
                while is_leaf((*cur).right) {
                    copy_leaf((*cur).right, &mut out);
                    match stack.pop() {
                        Some(parent) => cur = parent,
                        None => break 'walk,
                    }
                }
                cur = (*cur).right as *mut GcRope;
            }
        }

        debug_assert_eq!(out.len(), root.len);
        let s = self.new_lstr(&out);

        if root.len < ROPE_ALLOC_MIN_SIZE {
            self.scratch = out;
        }
        self.rope_stack = stack;

        let root = rope.as_mut();
        root.res = s.as_raw();
        root.left = std::ptr::null_mut(); // release children for the sweep
        root.right = std::ptr::null_mut();
        s.as_mut().header.make_black();
        self.try_gc_step();
        Ok(s)
    }

    /// Substring view. A rope parent is built first so views always hang
    /// off concrete strings.
    pub fn substr(&mut self, parent: LuaValue, offset: usize, len: usize) -> LuaResult<SubStrPtr> {
        let parent = self.resolve_str_value(parent)?;
        debug_assert!(offset + len <= parent.as_ref().len());
        let node = self.substrs.alloc(GcSubStr {
            header: GcHeader::new(TSUBSTR, self.gc.current_white),
            parent,
            offset,
            len,
        });
        self.gc.link(node as *mut GcHeader, object_size(TSUBSTR, 0));
        Ok(SubStrPtr::from_raw(node))
    }

    /// Force any string-family value down to a concrete string.
    pub fn resolve_str_value(&mut self, v: LuaValue) -> LuaResult<StrPtr> {
        debug_assert!(v.is_string_like());
        match v.tt() {
            TROPE => self.build_str(v.as_rope().unwrap()),
            TSUBSTR => {
                let ss = v.as_substring().unwrap();
                let bytes: Vec<u8> = ss.as_ref().bytes().to_vec();
                Ok(self.new_lstr(&bytes))
            }
            _ => Ok(v.as_string().unwrap()),
        }
    }

    /// Sweep hook: return a dead rope node to its cluster.
    pub(crate) fn free_rope(&mut self, node: *mut GcRope) {
        self.ropes.free(node);
        self.gc.total_bytes = self.gc.total_bytes.saturating_sub(object_size(TROPE, 0));
    }

    /// Sweep hook: return a dead substring node to its cluster.
    pub(crate) fn free_substr(&mut self, node: *mut GcSubStr) {
        self.substrs.free(node);
        self.gc.total_bytes = self.gc.total_bytes.saturating_sub(object_size(TSUBSTR, 0));
    }

    /// Release empty clusters after a sweep.
    pub(crate) fn free_clusters(&mut self) {
        self.ropes.sweep();
        self.substrs.sweep();
    }
}

/// Bytes of a concrete string value already known to be resolved.
pub fn concrete_bytes<'a>(v: &LuaValue) -> Option<&'a [u8]> {
    v.as_string().map(|s| s.as_ref().bytes())
}
