// Function objects: prototypes, scripted and native closures, upvalues.

use std::rc::Rc;

use crate::gc::GcHeader;
use crate::lua_value::value::{CFunction, LuaValue, TablePtr, UpvalPtr};
use crate::lua_vm::Instruction;

/// Compiled function prototype. Produced by the (external) compiler or
/// hand-assembled; shared by every closure instantiated from it.
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub nups: u8,
    /// Chunk name, as produced by the loader ("@file", "=stdin", ...).
    pub source: String,
    /// One entry per instruction; 0 = no line information.
    pub line_info: Vec<u32>,
}

impl Proto {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Chunk id for error messages, clipped the way `luaO_chunkid` clips.
    pub fn chunk_id(&self) -> String {
        const IDSIZE: usize = 60;
        let src = &self.source;
        match src.as_bytes().first() {
            Some(b'=') => src[1..].chars().take(IDSIZE).collect(),
            Some(b'@') => {
                let name = &src[1..];
                if name.len() <= IDSIZE {
                    name.to_string()
                } else {
                    format!("...{}", &name[name.len() - IDSIZE..])
                }
            }
            _ => {
                let line = src.lines().next().unwrap_or("");
                format!("[string \"{}\"]", line.chars().take(IDSIZE).collect::<String>())
            }
        }
    }
}

/// Scripted closure: prototype + environment + captured upvalues.
pub struct LClosure {
    pub proto: Rc<Proto>,
    pub env: TablePtr,
    pub upvals: Vec<UpvalPtr>,
}

/// Native closure: a function pointer plus a fixed upvalue array of plain
/// values.
pub struct CClosure {
    pub f: CFunction,
    pub env: TablePtr,
    pub upvals: Vec<LuaValue>,
}

pub enum ClosureKind {
    Lua(LClosure),
    Native(CClosure),
}

#[repr(C)]
pub struct GcClosure {
    pub header: GcHeader,
    pub kind: ClosureKind,
}

impl GcClosure {
    #[inline(always)]
    pub fn is_native(&self) -> bool {
        matches!(self.kind, ClosureKind::Native(_))
    }

    #[inline(always)]
    pub fn as_lua(&self) -> Option<&LClosure> {
        match &self.kind {
            ClosureKind::Lua(l) => Some(l),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_lua_mut(&mut self) -> Option<&mut LClosure> {
        match &mut self.kind {
            ClosureKind::Lua(l) => Some(l),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_native(&self) -> Option<&CClosure> {
        match &self.kind {
            ClosureKind::Native(c) => Some(c),
            _ => None,
        }
    }

    pub fn env(&self) -> TablePtr {
        match &self.kind {
            ClosureKind::Lua(l) => l.env,
            ClosureKind::Native(c) => c.env,
        }
    }
}

/// An upvalue cell: open while its variable still lives on a thread stack,
/// closed once the stack slot is about to disappear.
pub enum UpvalState {
    /// Absolute index into the owning thread's value stack.
    Open(usize),
    /// Owned cell; the value moved here when the upvalue closed.
    Closed(LuaValue),
}

#[repr(C)]
pub struct GcUpval {
    pub header: GcHeader,
    pub v: UpvalState,
}

impl GcUpval {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self.v, UpvalState::Open(_))
    }

    #[inline(always)]
    pub fn stack_index(&self) -> Option<usize> {
        match self.v {
            UpvalState::Open(i) => Some(i),
            UpvalState::Closed(_) => None,
        }
    }
}
