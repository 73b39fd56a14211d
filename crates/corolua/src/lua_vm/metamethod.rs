// Metamethod (tag method) lookup.

use crate::lua_value::{LuaValue, TablePtr};
use crate::lua_vm::LuaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
    Metatable,
}

impl TmKind {
    pub const COUNT: usize = 16;

    pub fn event_name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Len => "__len",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
            TmKind::Metatable => "__metatable",
        }
    }

    /// Events cheap enough to cache their absence in the table flags byte.
    #[inline(always)]
    pub fn fast_cacheable(self) -> bool {
        (self as u8) < 8
    }
}

/// Raw metatable of a value (tables and userdata carry their own; other
/// types have none in this core).
pub fn get_metatable(v: &LuaValue) -> Option<TablePtr> {
    if let Some(t) = v.as_table() {
        t.as_ref().metatable
    } else if let Some(u) = v.as_userdata() {
        u.as_ref().metatable
    } else {
        None
    }
}

/// Metamethod lookup with the absent-event cache: a set flag bit means
/// "known missing", skipping the table probe entirely.
pub fn fast_tm(l: &mut LuaState, mt: Option<TablePtr>, event: TmKind) -> Option<LuaValue> {
    let mt = mt?;
    let table = mt.as_ref();
    if event.fast_cacheable() && table.flags & (1 << event as u8) != 0 {
        return None;
    }
    let key = l.vm_mut().tm_name(event);
    let v = table.raw_get(&LuaValue::string(key));
    if v.is_nil() {
        if event.fast_cacheable() {
            mt.as_mut().flags |= 1 << event as u8;
        }
        None
    } else {
        Some(v)
    }
}

/// `luaT_gettmbyobj`: metamethod for a value's type.
pub fn get_tm_by_obj(l: &mut LuaState, v: &LuaValue, event: TmKind) -> Option<LuaValue> {
    fast_tm(l, get_metatable(v), event)
}
