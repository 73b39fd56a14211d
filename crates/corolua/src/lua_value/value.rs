// Tagged value representation.
//
// A value is an 8-byte payload union plus a one-byte tag. String variants
// share the base tag TSTRING with the variant in bits 4-5, so `novariant`
// collapses short/long strings, ropes and substrings into one user-visible
// type.

use crate::gc::{GcHeader, GcPtr};
use crate::lua_string::{GcRope, GcStr, GcSubStr};
use crate::lua_table::LuaTable;
use crate::lua_value::closure::{GcClosure, GcUpval};
use crate::lua_value::userdata::GcUserdata;
use crate::lua_vm::LuaState;

// ============ Base type tags (bits 0-3) ============
pub const TNIL: u8 = 0;
pub const TBOOLEAN: u8 = 1;
pub const TLIGHTUSERDATA: u8 = 2;
pub const TNUMBER: u8 = 3;
pub const TSTRING: u8 = 4;
pub const TTABLE: u8 = 5;
pub const TFUNCTION: u8 = 6;
pub const TUSERDATA: u8 = 7;
pub const TTHREAD: u8 = 8;
/// Internal: upvalue cells (never on the value stack).
pub const TUPVAL: u8 = 9;

// ============ Variant tags (bits 4-5) ============
// makevariant(t, v) = t | v << 4
pub const TSHRSTR: u8 = TSTRING; // interned, equality by identity
pub const TLNGSTR: u8 = TSTRING | 1 << 4; // not interned, equality by content
pub const TROPE: u8 = TSTRING | 2 << 4; // lazy concatenation node
pub const TSUBSTR: u8 = TSTRING | 3 << 4; // (parent, offset, len) view

pub const TLUACL: u8 = TFUNCTION; // scripted closure
pub const TNATCL: u8 = TFUNCTION | 1 << 4; // native closure

#[inline(always)]
pub const fn novariant(tt: u8) -> u8 {
    tt & 0x0F
}

pub type StrPtr = GcPtr<GcStr>;
pub type RopePtr = GcPtr<GcRope>;
pub type SubStrPtr = GcPtr<GcSubStr>;
pub type TablePtr = GcPtr<LuaTable>;
pub type ClosurePtr = GcPtr<GcClosure>;
pub type UpvalPtr = GcPtr<GcUpval>;
pub type UserdataPtr = GcPtr<GcUserdata>;
pub type ThreadPtr = GcPtr<crate::lua_vm::GcThread>;

/// 8-byte payload union (`union Value` in the classic layout).
#[derive(Clone, Copy)]
#[repr(C)]
pub union Value {
    pub b: bool,
    pub p: *mut std::ffi::c_void,
    pub n: f64,
    pub gc: *mut GcHeader,
}

/// A tagged value slot.
#[derive(Clone, Copy)]
pub struct LuaValue {
    value: Value,
    tt: u8,
}

impl LuaValue {
    #[inline(always)]
    pub const fn nil() -> Self {
        LuaValue {
            value: Value {
                p: std::ptr::null_mut(),
            },
            tt: TNIL,
        }
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        LuaValue {
            value: Value { b },
            tt: TBOOLEAN,
        }
    }

    #[inline(always)]
    pub fn number(n: f64) -> Self {
        LuaValue {
            value: Value { n },
            tt: TNUMBER,
        }
    }

    #[inline(always)]
    pub fn light_userdata(p: *mut std::ffi::c_void) -> Self {
        LuaValue {
            value: Value { p },
            tt: TLIGHTUSERDATA,
        }
    }

    /// Wrap any string-family node; the tag is read back from its header.
    #[inline(always)]
    pub fn from_str_node(header: *mut GcHeader) -> Self {
        let tt = unsafe { (*header).tt };
        debug_assert!(novariant(tt) == TSTRING);
        LuaValue {
            value: Value { gc: header },
            tt,
        }
    }

    #[inline(always)]
    pub fn string(s: StrPtr) -> Self {
        LuaValue {
            value: Value {
                gc: s.as_raw() as *mut GcHeader,
            },
            tt: s.as_ref().header.tt,
        }
    }

    #[inline(always)]
    pub fn rope(r: RopePtr) -> Self {
        LuaValue {
            value: Value {
                gc: r.as_raw() as *mut GcHeader,
            },
            tt: TROPE,
        }
    }

    #[inline(always)]
    pub fn substring(s: SubStrPtr) -> Self {
        LuaValue {
            value: Value {
                gc: s.as_raw() as *mut GcHeader,
            },
            tt: TSUBSTR,
        }
    }

    #[inline(always)]
    pub fn table(t: TablePtr) -> Self {
        LuaValue {
            value: Value {
                gc: t.as_raw() as *mut GcHeader,
            },
            tt: TTABLE,
        }
    }

    #[inline(always)]
    pub fn closure(c: ClosurePtr) -> Self {
        LuaValue {
            value: Value {
                gc: c.as_raw() as *mut GcHeader,
            },
            tt: c.as_ref().header.tt,
        }
    }

    #[inline(always)]
    pub fn userdata(u: UserdataPtr) -> Self {
        LuaValue {
            value: Value {
                gc: u.as_raw() as *mut GcHeader,
            },
            tt: TUSERDATA,
        }
    }

    #[inline(always)]
    pub fn thread(t: ThreadPtr) -> Self {
        LuaValue {
            value: Value {
                gc: t.as_raw() as *mut GcHeader,
            },
            tt: TTHREAD,
        }
    }

    // ============ Tag queries ============

    #[inline(always)]
    pub fn tt(&self) -> u8 {
        self.tt
    }

    /// User-visible base type (string variants collapse).
    #[inline(always)]
    pub fn base_type(&self) -> u8 {
        novariant(self.tt)
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        self.tt == TNIL
    }

    #[inline(always)]
    pub fn is_boolean(&self) -> bool {
        self.tt == TBOOLEAN
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        self.tt == TNUMBER
    }

    /// Any string-family value, including unresolved ropes and substrings.
    #[inline(always)]
    pub fn is_string_like(&self) -> bool {
        novariant(self.tt) == TSTRING
    }

    /// A concrete (short or long) string.
    #[inline(always)]
    pub fn is_string(&self) -> bool {
        self.tt == TSHRSTR || self.tt == TLNGSTR
    }

    #[inline(always)]
    pub fn is_rope(&self) -> bool {
        self.tt == TROPE
    }

    #[inline(always)]
    pub fn is_substring(&self) -> bool {
        self.tt == TSUBSTR
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        self.tt == TTABLE
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        novariant(self.tt) == TFUNCTION
    }

    #[inline(always)]
    pub fn is_native_closure(&self) -> bool {
        self.tt == TNATCL
    }

    #[inline(always)]
    pub fn is_thread(&self) -> bool {
        self.tt == TTHREAD
    }

    #[inline(always)]
    pub fn is_userdata(&self) -> bool {
        self.tt == TUSERDATA
    }

    #[inline(always)]
    pub fn is_light_userdata(&self) -> bool {
        self.tt == TLIGHTUSERDATA
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        matches!(
            novariant(self.tt),
            TSTRING | TTABLE | TFUNCTION | TUSERDATA | TTHREAD
        )
    }

    /// Only nil and false fail a test.
    #[inline(always)]
    pub fn is_false(&self) -> bool {
        self.tt == TNIL || (self.tt == TBOOLEAN && !unsafe { self.value.b })
    }

    // ============ Payload accessors ============

    #[inline(always)]
    pub fn as_boolean(&self) -> bool {
        debug_assert!(self.is_boolean());
        unsafe { self.value.b }
    }

    #[inline(always)]
    pub fn as_number(&self) -> f64 {
        debug_assert!(self.is_number());
        unsafe { self.value.n }
    }

    #[inline(always)]
    pub fn as_pointer(&self) -> *mut std::ffi::c_void {
        unsafe { self.value.p }
    }

    #[inline(always)]
    pub fn as_gc_header(&self) -> Option<*mut GcHeader> {
        if self.is_collectable() {
            Some(unsafe { self.value.gc })
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_string(&self) -> Option<StrPtr> {
        if self.is_string() {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut GcStr))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_rope(&self) -> Option<RopePtr> {
        if self.tt == TROPE {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut GcRope))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_substring(&self) -> Option<SubStrPtr> {
        if self.tt == TSUBSTR {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut GcSubStr))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_table(&self) -> Option<TablePtr> {
        if self.tt == TTABLE {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut LuaTable))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_closure(&self) -> Option<ClosurePtr> {
        if self.is_function() {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut GcClosure))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_userdata(&self) -> Option<UserdataPtr> {
        if self.tt == TUSERDATA {
            Some(GcPtr::from_raw(unsafe { self.value.gc } as *mut GcUserdata))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_thread(&self) -> Option<ThreadPtr> {
        if self.tt == TTHREAD {
            Some(GcPtr::from_raw(
                unsafe { self.value.gc } as *mut crate::lua_vm::GcThread
            ))
        } else {
            None
        }
    }

    /// The cached length of any string-family value. Ropes and substrings
    /// report their cached lengths without materializing.
    pub fn string_len(&self) -> Option<usize> {
        match self.tt {
            TSHRSTR | TLNGSTR => Some(self.as_string().unwrap().as_ref().len()),
            TROPE => Some(self.as_rope().unwrap().as_ref().len),
            TSUBSTR => Some(self.as_substring().unwrap().as_ref().len),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        type_name_of(novariant(self.tt))
    }

    /// Primitive equality: no metamethods, no rope resolution. Short
    /// strings compare by identity, long strings by content; everything
    /// else compares payloads.
    pub fn raw_equal(&self, other: &LuaValue) -> bool {
        if novariant(self.tt) != novariant(other.tt) {
            return false;
        }
        match self.tt {
            TNIL => true,
            TBOOLEAN => self.as_boolean() == other.as_boolean(),
            TNUMBER => other.is_number() && self.as_number() == other.as_number(),
            TLIGHTUSERDATA => unsafe { self.value.p == other.value.p },
            TSHRSTR | TLNGSTR => match (self.as_string(), other.as_string()) {
                (Some(a), Some(b)) => crate::lua_string::str_equal(a, b),
                _ => unsafe { self.value.gc == other.value.gc },
            },
            _ => unsafe { self.value.gc == other.value.gc },
        }
    }
}

impl Default for LuaValue {
    fn default() -> Self {
        LuaValue::nil()
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tt {
            TNIL => write!(f, "nil"),
            TBOOLEAN => write!(f, "{}", self.as_boolean()),
            TNUMBER => write!(f, "{}", self.as_number()),
            TSHRSTR | TLNGSTR => {
                let s = self.as_string().unwrap();
                write!(f, "{:?}", String::from_utf8_lossy(s.as_ref().bytes()))
            }
            TROPE => write!(f, "<rope len={}>", self.string_len().unwrap_or(0)),
            TSUBSTR => write!(f, "<substr len={}>", self.string_len().unwrap_or(0)),
            _ => write!(f, "<{}: {:p}>", self.type_name(), unsafe { self.value.p }),
        }
    }
}

pub fn type_name_of(base: u8) -> &'static str {
    match base {
        TNIL => "nil",
        TBOOLEAN => "boolean",
        TLIGHTUSERDATA => "userdata",
        TNUMBER => "number",
        TSTRING => "string",
        TTABLE => "table",
        TFUNCTION => "function",
        TUSERDATA => "userdata",
        TTHREAD => "thread",
        _ => "proto",
    }
}

/// Native function signature. Results are returned on the stack; the
/// return value counts them. Yielding propagates as `Err(LuaError::Yield)`
/// through the native frame (the non-local jump of the original runtime).
pub type CFunction = fn(&mut LuaState) -> crate::lua_vm::LuaResult<i32>;
