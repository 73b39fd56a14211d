// Per-thread execution state: value stack, frame stack, open upvalues,
// status and the packed call counter. Everything that points into the
// value stack is an index, so growth is a plain reallocation with no
// pointer fixup beyond the vector itself.

use bitflags::bitflags;

use crate::lua_value::{LuaValue, UpvalPtr, UpvalState};
use crate::lua_vm::{
    CallInfo, LuaError, LuaResult, LuaVM, MAXCALLS, NCcalls, ThreadStatus, do_call,
};

/// Headroom past the nominal stack ceiling, kept for error-handling stubs.
pub const EXTRA_STACK: usize = 5;
pub const BASIC_STACK_SIZE: usize = 40;
/// Hard limit on usable stack slots.
pub const MAXSTACK: usize = 250_000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookMask: u8 {
        const CALL = 1 << 0;
        const RET = 1 << 1;
        const LINE = 1 << 2;
        const COUNT = 1 << 3;
        const TAILRET = 1 << 4;
        const ERROR = 1 << 5;
        const YIELD = 1 << 6;
        const RESUME = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Ret,
    TailRet,
    Line(u32),
    Count,
    Error,
    Yield,
    Resume,
}

/// Debug hook. May raise and — for line/count events — may yield.
pub type Hook = fn(&mut LuaState, HookEvent) -> LuaResult<()>;

pub struct LuaState {
    pub(crate) vm: *mut LuaVM,
    pub(crate) stack: Vec<LuaValue>,
    /// First free slot.
    pub(crate) top: usize,
    /// Base of the current frame (mirror of the current CallInfo).
    pub(crate) base: usize,
    pub(crate) ci: Vec<CallInfo>,
    /// Index of the current frame; 0 is the host pseudo frame.
    pub(crate) ci_idx: usize,
    /// Open upvalues, sorted by descending stack index.
    pub(crate) open_upvals: Vec<UpvalPtr>,
    pub(crate) status: ThreadStatus,
    /// Current native resume context (0 = none).
    pub(crate) ctx: u32,
    pub(crate) nccalls: NCcalls,
    /// Call-depth watermark taken at coroutine entry.
    pub(crate) base_ccalls: NCcalls,
    pub(crate) hook: Option<Hook>,
    pub(crate) hookmask: HookMask,
    pub(crate) hookcount: u32,
    pub(crate) base_hookcount: u32,
    pub(crate) is_main: bool,
}

impl LuaState {
    pub fn new(vm: *mut LuaVM, is_main: bool) -> Self {
        LuaState {
            vm,
            stack: vec![LuaValue::nil(); BASIC_STACK_SIZE + EXTRA_STACK],
            top: 0,
            base: 0,
            ci: vec![CallInfo::host()],
            ci_idx: 0,
            open_upvals: Vec::new(),
            status: ThreadStatus::Ok,
            ctx: 0,
            nccalls: NCcalls::empty_count(),
            base_ccalls: NCcalls::empty_count(),
            hook: None,
            hookmask: HookMask::empty(),
            hookcount: 0,
            base_hookcount: 0,
            is_main,
        }
    }

    #[inline(always)]
    pub fn vm(&self) -> &LuaVM {
        unsafe { &*self.vm }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn vm_mut(&self) -> &mut LuaVM {
        unsafe { &mut *self.vm }
    }

    #[inline(always)]
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    #[inline(always)]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    // ============ Value stack ============

    #[inline(always)]
    fn usable_size(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    /// Ensure room for `n` more slots above the current top.
    pub fn check_stack(&mut self, n: usize) -> LuaResult<()> {
        if self.top + n <= self.usable_size() {
            return Ok(());
        }
        self.grow_stack(n)
    }

    /// Double the stack, or add exactly `n` when doubling is not enough.
    /// Indices stay valid; only the backing vector moves.
    pub fn grow_stack(&mut self, n: usize) -> LuaResult<()> {
        let needed = self.top + n;
        if needed > MAXSTACK {
            // leave the extra headroom usable for the error machinery
            if self.stack.len() < MAXSTACK + EXTRA_STACK {
                self.stack.resize(MAXSTACK + EXTRA_STACK, LuaValue::nil());
            }
            return Err(do_call::throw_runtime(self, "stack overflow".to_string()));
        }
        let mut new_size = (self.usable_size() * 2).max(needed);
        new_size = new_size.min(MAXSTACK);
        self.stack.resize(new_size + EXTRA_STACK, LuaValue::nil());
        Ok(())
    }

    #[inline(always)]
    pub fn stack_get(&self, idx: usize) -> LuaValue {
        self.stack[idx]
    }

    #[inline(always)]
    pub fn stack_set(&mut self, idx: usize, v: LuaValue) {
        self.stack[idx] = v;
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    pub fn set_top(&mut self, new_top: usize) -> LuaResult<()> {
        if new_top > self.usable_size() {
            self.grow_stack(new_top - self.top)?;
        }
        // clear abandoned slots so stale references do not pin objects
        for i in new_top..self.top {
            self.stack[i] = LuaValue::nil();
        }
        for i in self.top..new_top {
            self.stack[i] = LuaValue::nil();
        }
        self.top = new_top;
        Ok(())
    }

    pub fn push_value(&mut self, v: LuaValue) -> LuaResult<()> {
        self.check_stack(1)?;
        self.stack[self.top] = v;
        self.top += 1;
        Ok(())
    }

    pub fn pop_value(&mut self) -> LuaValue {
        debug_assert!(self.top > 0);
        self.top -= 1;
        let v = self.stack[self.top];
        self.stack[self.top] = LuaValue::nil();
        v
    }

    // ============ Frames ============

    #[inline(always)]
    pub fn ci(&self) -> &CallInfo {
        &self.ci[self.ci_idx]
    }

    #[inline(always)]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        &mut self.ci[self.ci_idx]
    }

    #[inline(always)]
    pub fn ci_depth(&self) -> usize {
        self.ci_idx
    }

    #[inline(always)]
    pub fn frame(&self, idx: usize) -> &CallInfo {
        &self.ci[idx]
    }

    #[inline(always)]
    pub fn frame_mut(&mut self, idx: usize) -> &mut CallInfo {
        &mut self.ci[idx]
    }

    /// Enter a new frame. Growth doubles the frame array; overflowing the
    /// hard limit while already over it is an error in error handling.
    pub(crate) fn push_ci(&mut self, frame: CallInfo) -> LuaResult<()> {
        if self.ci_idx + 1 >= self.ci.len() {
            if self.ci.len() > MAXCALLS {
                // overflow while handling overflow
                return Err(LuaError::ErrErr);
            }
            let new_size = (self.ci.len() * 2).min(MAXCALLS + 8);
            self.ci.resize(new_size, CallInfo::host());
            if self.ci.len() > MAXCALLS {
                return Err(do_call::throw_runtime(self, "stack overflow".to_string()));
            }
        }
        self.ci_idx += 1;
        self.ci[self.ci_idx] = frame;
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn pop_ci(&mut self) {
        debug_assert!(self.ci_idx > 0);
        self.ci_idx -= 1;
        self.base = self.ci[self.ci_idx].base;
    }

    /// Undo a frame-array overflow once enough frames have returned.
    pub(crate) fn restore_ci_limit(&mut self) {
        if self.ci.len() > MAXCALLS && self.ci_idx + 1 < MAXCALLS {
            self.ci.truncate(MAXCALLS);
        }
    }

    // ============ Open upvalues ============

    /// Find or create the upvalue for a stack slot; the open list stays
    /// sorted by descending index.
    pub fn find_upval(&mut self, idx: usize) -> UpvalPtr {
        let mut insert_at = self.open_upvals.len();
        for (i, uv) in self.open_upvals.iter().enumerate() {
            match uv.as_ref().stack_index() {
                Some(j) if j == idx => return *uv,
                Some(j) if j < idx => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let uv = self.vm_mut().new_upvalue_open(idx);
        self.open_upvals.insert(insert_at, uv);
        uv
    }

    /// Close every open upvalue at or above `level`: move the stack value
    /// into the cell and unlink it from the open list.
    pub fn close_upvals(&mut self, level: usize) {
        while let Some(first) = self.open_upvals.first().copied() {
            let Some(idx) = first.as_ref().stack_index() else {
                self.open_upvals.remove(0);
                continue;
            };
            if idx < level {
                break;
            }
            first.as_mut().v = UpvalState::Closed(self.stack[idx]);
            self.open_upvals.remove(0);
        }
    }

    #[inline]
    pub fn upval_get(&self, uv: UpvalPtr) -> LuaValue {
        match &uv.as_ref().v {
            UpvalState::Open(idx) => self.stack[*idx],
            UpvalState::Closed(v) => *v,
        }
    }

    #[inline]
    pub fn upval_set(&mut self, uv: UpvalPtr, value: LuaValue) {
        match &mut uv.as_mut().v {
            UpvalState::Open(idx) => self.stack[*idx] = value,
            UpvalState::Closed(v) => *v = value,
        }
    }

    // ============ Native-function view of the frame ============

    /// Number of arguments the running native function received.
    #[inline(always)]
    pub fn arg_count(&self) -> usize {
        self.top - self.base
    }

    /// 1-based argument access.
    #[inline(always)]
    pub fn get_arg(&self, n: usize) -> Option<LuaValue> {
        debug_assert!(n >= 1);
        let idx = self.base + n - 1;
        if idx < self.top {
            Some(self.stack[idx])
        } else {
            None
        }
    }

    pub fn check_any(&mut self, n: usize) -> LuaResult<LuaValue> {
        match self.get_arg(n) {
            Some(v) => Ok(v),
            None => Err(self.runtime_error(format!("bad argument #{} (value expected)", n))),
        }
    }

    /// Resume context of the running native frame; 0 on first entry.
    #[inline(always)]
    pub fn get_ctx(&self) -> u32 {
        self.ctx
    }

    #[inline(always)]
    pub fn set_ctx(&mut self, ctx: u32) {
        self.ctx = ctx;
    }

    // ============ Errors ============

    /// "chunkid:line: " for the frame `level` levels below the current
    /// one; empty when there is no scripted frame there.
    pub fn where_str(&self, level: usize) -> String {
        if level > self.ci_idx {
            return String::new();
        }
        let frame = &self.ci[self.ci_idx - level];
        if !frame.is_lua {
            return String::new();
        }
        let func = self.stack[frame.func];
        let Some(cl) = func.as_closure() else {
            return String::new();
        };
        let Some(lcl) = cl.as_ref().as_lua() else {
            return String::new();
        };
        let pc = frame.saved_pc.saturating_sub(1) as usize;
        let line = lcl.proto.line_at(pc);
        if line == 0 {
            return String::new();
        }
        format!("{}:{}: ", lcl.proto.chunk_id(), line)
    }

    /// Raise a runtime error positioned at the caller of the running
    /// native function (the usual surface for library errors).
    pub fn runtime_error(&mut self, msg: impl Into<String>) -> LuaError {
        do_call::throw_runtime(self, format!("{}{}", self.where_str(1), msg.into()))
    }

    /// Raise a runtime error positioned at the current frame (interpreter
    /// and call-machinery errors).
    pub fn vm_error(&mut self, msg: impl Into<String>) -> LuaError {
        do_call::throw_runtime(self, format!("{}{}", self.where_str(0), msg.into()))
    }

    pub fn type_error(&mut self, v: &LuaValue, op: &str) -> LuaError {
        let tname = v.type_name();
        self.runtime_error(format!("attempt to {} a {} value", op, tname))
    }

    pub fn order_error(&mut self, a: &LuaValue, b: &LuaValue) -> LuaError {
        let (t1, t2) = (a.type_name(), b.type_name());
        if t1 == t2 {
            self.runtime_error(format!("attempt to compare two {} values", t1))
        } else {
            self.runtime_error(format!("attempt to compare {} with {}", t1, t2))
        }
    }

    pub fn arith_error(&mut self, a: &LuaValue, b: &LuaValue) -> LuaError {
        let bad = if crate::lua_vm::execute::coerce_number(self, a).is_some() {
            b
        } else {
            a
        };
        let bad = *bad;
        self.type_error(&bad, "perform arithmetic on")
    }

    pub fn concat_error(&mut self, a: &LuaValue, b: &LuaValue) -> LuaError {
        let bad = if a.is_string_like() || a.is_number() { b } else { a };
        let bad = *bad;
        self.type_error(&bad, "concatenate")
    }

    // ============ Hooks ============

    pub fn set_hook(&mut self, hook: Option<Hook>, mask: HookMask, count: u32) {
        self.hook = hook;
        self.hookmask = if hook.is_some() {
            mask
        } else {
            HookMask::empty()
        };
        self.base_hookcount = count;
        self.hookcount = count;
    }

    // ============ Convenience constructors (delegate to the VM) ============

    pub fn new_str_value(&mut self, s: &str) -> LuaValue {
        LuaValue::string(self.vm_mut().new_str(s))
    }

    pub fn push_str(&mut self, s: &str) -> LuaResult<()> {
        let v = self.new_str_value(s);
        self.push_value(v)
    }

    pub fn push_number(&mut self, n: f64) -> LuaResult<()> {
        self.push_value(LuaValue::number(n))
    }

    pub fn push_boolean(&mut self, b: bool) -> LuaResult<()> {
        self.push_value(LuaValue::boolean(b))
    }

    pub fn push_nil(&mut self) -> LuaResult<()> {
        self.push_value(LuaValue::nil())
    }

    /// The thread value wrapping this state. States are only ever
    /// embedded in `GcThread` objects, so the container is recovered from
    /// the field offset.
    pub fn as_thread_value(&self) -> LuaValue {
        let offset = std::mem::offset_of!(crate::lua_vm::GcThread, state);
        let thread =
            (self as *const LuaState as *const u8).wrapping_sub(offset) as *mut crate::lua_vm::GcThread;
        LuaValue::thread(crate::gc::GcPtr::from_raw(thread))
    }

    /// Move the top `n` values from this thread onto `other` (coroutine
    /// argument/result transfer).
    pub fn xmove(&mut self, other: &mut LuaState, n: usize) -> LuaResult<()> {
        debug_assert!(self.arg_count() >= n || self.top >= n);
        other.check_stack(n)?;
        for i in 0..n {
            other.stack[other.top + i] = self.stack[self.top - n + i];
            self.stack[self.top - n + i] = LuaValue::nil();
        }
        other.top += n;
        self.top -= n;
        Ok(())
    }
}
