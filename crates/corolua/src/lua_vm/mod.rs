// Global runtime state and the embedding surface.

mod call_info;
pub mod do_call;
pub mod execute;
mod lua_state;
mod metamethod;
mod opcode;
mod whitelist;

use std::rc::Rc;

use bitflags::bitflags;

pub use call_info::{CallInfo, ERRFUNC_INHERIT, ERRFUNC_NONE, errfunc_handler};
pub use lua_state::{Hook, HookEvent, HookMask, LuaState};
pub use metamethod::{TmKind, fast_tm, get_metatable, get_tm_by_obj};
pub use opcode::{BITRK, FIELDS_PER_FLUSH, Instruction, MAXARG_SBX, OpCode};
pub use whitelist::Whitelist;

pub use crate::lua_value::CFunction;

use crate::gc::{Gc, GcHeader, GcPtr, object_size};
use crate::lock::HostLock;
use crate::lua_string::{ClusterSet, GcRope, GcSubStr, StringTable};
use crate::lua_table::LuaTable;
use crate::lua_value::{
    CClosure, ClosureKind, GcClosure, GcUpval, GcUserdata, LClosure, LuaValue, Proto, StrPtr,
    TLUACL, TNATCL, TTABLE, TTHREAD, TUPVAL, TUSERDATA, TablePtr, ThreadPtr, UpvalState, UpvalPtr,
};

/// Thread status codes; yields travel on the same channel as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    /// Error while handling an error; terminal for the current catch.
    ErrErr = 5,
    /// Host panic crossing the boundary.
    ErrExc = 6,
}

impl ThreadStatus {
    #[inline(always)]
    pub fn is_error(self) -> bool {
        self as u8 >= ThreadStatus::ErrRun as u8
    }
}

/// Lightweight error channel; the error object itself lives on the thread
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    Yield,
    Run,
    Syntax,
    Mem,
    /// "error in error handling"
    ErrErr,
    /// unhandled host panic
    Exc,
}

impl LuaError {
    #[inline(always)]
    pub fn status(self) -> ThreadStatus {
        match self {
            LuaError::Yield => ThreadStatus::Yield,
            LuaError::Run => ThreadStatus::ErrRun,
            LuaError::Syntax => ThreadStatus::ErrSyntax,
            LuaError::Mem => ThreadStatus::ErrMem,
            LuaError::ErrErr => ThreadStatus::ErrErr,
            LuaError::Exc => ThreadStatus::ErrExc,
        }
    }

    pub fn from_status(status: ThreadStatus) -> Option<Self> {
        match status {
            ThreadStatus::Ok => None,
            ThreadStatus::Yield => Some(LuaError::Yield),
            ThreadStatus::ErrRun => Some(LuaError::Run),
            ThreadStatus::ErrSyntax => Some(LuaError::Syntax),
            ThreadStatus::ErrMem => Some(LuaError::Mem),
            ThreadStatus::ErrErr => Some(LuaError::ErrErr),
            ThreadStatus::ErrExc => Some(LuaError::Exc),
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Yield => write!(f, "yield"),
            LuaError::Run => write!(f, "runtime error"),
            LuaError::Syntax => write!(f, "syntax error"),
            LuaError::Mem => write!(f, "not enough memory"),
            LuaError::ErrErr => write!(f, "error in error handling"),
            LuaError::Exc => write!(f, "unhandled exception in host function"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

bitflags! {
    /// Restriction bits carried in the low nybble of the packed call
    /// counter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u32 {
        /// A yield attempt becomes a runtime error.
        const NOYIELD = 1 << 0;
        /// Virtual (catch-and-continue) pcall frames are not allowed.
        const NOVPCALL = 1 << 1;
        /// Debug hooks are suppressed.
        const NOHOOKS = 1 << 2;
        /// Error handlers must not run (prevents handler recursion).
        const NOERRFUNC = 1 << 3;
    }
}

/// Packed call-depth word: nesting count in bits >= 4, restriction flags
/// in the low nybble. The count never decreases across a matched
/// entry/exit pair, on any path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NCcalls(pub u32);

pub const NCCALLS_STEP: u32 = 16;

impl NCcalls {
    #[inline(always)]
    pub const fn empty_count() -> Self {
        NCcalls(0)
    }

    #[inline(always)]
    pub fn count(self) -> u32 {
        self.0 >> 4
    }

    #[inline(always)]
    pub fn flags(self) -> CallFlags {
        CallFlags::from_bits_truncate(self.0 & 0xF)
    }

    #[inline(always)]
    pub fn has(self, f: CallFlags) -> bool {
        self.flags().contains(f)
    }

    #[inline(always)]
    pub fn enter(self, extra: CallFlags) -> Self {
        NCcalls((self.0 + NCCALLS_STEP) | extra.bits())
    }

    #[inline(always)]
    pub fn with(self, extra: CallFlags) -> Self {
        NCcalls(self.0 | extra.bits())
    }

    #[inline(always)]
    pub fn masked(self, mask: u32) -> Self {
        NCcalls(self.0 & mask)
    }
}

/// Maximum native-call nesting before "C stack overflow".
pub const MAXCCALLS: u32 = 200;
/// Maximum call frames per thread.
pub const MAXCALLS: usize = 20000;

pub type PanicFn = fn(&mut LuaState);
/// Host-supplied chunk loaders: text parser and binary undumper.
pub type LoaderFn = fn(&mut LuaVM, &[u8], &str) -> Result<Rc<Proto>, String>;

/// Binary chunk signature: ESC "Lua".
pub const CHUNK_SIGNATURE: &[u8; 4] = b"\x1bLua";

/// Cooperative halt modes.
pub const HALT_NONE: u8 = 0;
pub const HALT_SILENT: u8 = 1;
pub const HALT_ERROR: u8 = 2;

/// Process-wide state shared by every thread of one runtime instance
/// (the `global_State`). One per top-level state, not per process.
pub struct LuaVM {
    pub(crate) gc: Gc,
    pub(crate) strt: StringTable,
    pub(crate) ropes: ClusterSet<GcRope>,
    pub(crate) substrs: ClusterSet<GcSubStr>,
    /// Shared work stack for rope materialization.
    pub(crate) rope_stack: Vec<*mut GcRope>,
    /// Shared scratch buffer for small rope results.
    pub(crate) scratch: Vec<u8>,
    pub(crate) whitelist: Whitelist,
    pub(crate) str_seed: u32,
    pub(crate) globals: LuaValue,
    pub(crate) registry: LuaValue,
    pub(crate) main: ThreadPtr,
    /// Threads currently being driven by `resume`; they may be reachable
    /// from host locals only, so the collector treats them as roots.
    pub(crate) resume_roots: Vec<ThreadPtr>,
    pub(crate) tm_names: Vec<StrPtr>,
    pub(crate) memerrmsg: LuaValue,
    pub(crate) panic: Option<PanicFn>,
    pub lock: HostLock,
    /// Cooperative halt latch, observed at the top of every instruction.
    pub(crate) haltstate: u8,
    pub(crate) haltmessage: Option<String>,
    pub(crate) text_loader: Option<LoaderFn>,
    pub(crate) binary_loader: Option<LoaderFn>,
}

impl LuaVM {
    pub fn new() -> Box<Self> {
        let mut vm = Box::new(LuaVM {
            gc: Gc::new(),
            strt: StringTable::new(),
            ropes: ClusterSet::new(),
            substrs: ClusterSet::new(),
            rope_stack: Vec::with_capacity(32),
            scratch: Vec::with_capacity(256),
            whitelist: Whitelist::new(),
            str_seed: rand::random::<u32>() | 1,
            globals: LuaValue::nil(),
            registry: LuaValue::nil(),
            main: ThreadPtr::from_raw(std::ptr::NonNull::<GcThread>::dangling().as_ptr()),
            resume_roots: Vec::new(),
            tm_names: Vec::new(),
            memerrmsg: LuaValue::nil(),
            panic: None,
            lock: HostLock::new(),
            haltstate: HALT_NONE,
            haltmessage: None,
            text_loader: None,
            binary_loader: None,
        });

        let vm_ptr: *mut LuaVM = vm.as_mut();

        // main thread
        let thread = GcPtr::from_box(Box::new(GcThread {
            header: GcHeader::new(TTHREAD, vm.gc.current_white),
            state: LuaState::new(vm_ptr, true),
        }));
        thread.as_mut().header.set_fixed();
        vm.gc
            .link(thread.as_raw() as *mut GcHeader, object_size(TTHREAD, 0));
        vm.main = thread;

        vm.globals = vm.new_table(0, 20);
        vm.registry = vm.new_table(0, 8);
        vm.globals.as_table().unwrap().as_mut().header.set_fixed();
        vm.registry.as_table().unwrap().as_mut().header.set_fixed();

        // fixed strings the error paths rely on
        let mem = vm.new_str("not enough memory");
        mem.as_mut().header.set_fixed();
        vm.memerrmsg = LuaValue::string(mem);
        vm.tm_names = (0..TmKind::COUNT)
            .map(|i| {
                let kind: TmKind = unsafe { std::mem::transmute(i as u8) };
                let s = vm.new_str(kind.event_name());
                s.as_mut().header.set_fixed();
                s
            })
            .collect();

        vm
    }

    #[inline(always)]
    pub fn main_state(&mut self) -> &mut LuaState {
        &mut self.main.as_mut().state
    }

    #[inline(always)]
    pub(crate) fn tm_name(&self, event: TmKind) -> StrPtr {
        self.tm_names[event as usize]
    }

    pub fn globals(&self) -> LuaValue {
        self.globals
    }

    pub fn registry(&self) -> LuaValue {
        self.registry
    }

    pub fn set_panic(&mut self, panic: Option<PanicFn>) {
        self.panic = panic;
    }

    pub fn set_loaders(&mut self, text: Option<LoaderFn>, binary: Option<LoaderFn>) {
        self.text_loader = text;
        self.binary_loader = binary;
    }

    // ============ Object constructors ============

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> LuaValue {
        let t = GcPtr::from_box(Box::new(LuaTable::new(
            GcHeader::new(TTABLE, self.gc.current_white),
            narray,
            nhash,
        )));
        self.gc.link(
            t.as_raw() as *mut GcHeader,
            object_size(TTABLE, narray * 16 + nhash * 32),
        );
        LuaValue::table(t)
    }

    pub fn new_lclosure(&mut self, proto: Rc<Proto>, env: TablePtr, upvals: Vec<UpvalPtr>) -> LuaValue {
        let c = GcPtr::from_box(Box::new(GcClosure {
            header: GcHeader::new(TLUACL, self.gc.current_white),
            kind: ClosureKind::Lua(LClosure { proto, env, upvals }),
        }));
        self.gc
            .link(c.as_raw() as *mut GcHeader, object_size(TLUACL, 0));
        LuaValue::closure(c)
    }

    /// Native closure. The pointer still has to be whitelisted before
    /// scripted code may call it; `register_native` does both.
    pub fn new_cclosure(&mut self, f: CFunction, upvals: Vec<LuaValue>) -> LuaValue {
        let env = self.globals.as_table().unwrap();
        let c = GcPtr::from_box(Box::new(GcClosure {
            header: GcHeader::new(TNATCL, self.gc.current_white),
            kind: ClosureKind::Native(CClosure { f, env, upvals }),
        }));
        self.gc
            .link(c.as_raw() as *mut GcHeader, object_size(TNATCL, 0));
        LuaValue::closure(c)
    }

    /// Create a native closure, whitelist its pointer and bind it to a
    /// global name.
    pub fn register_native(&mut self, name: &str, f: CFunction) -> LuaValue {
        self.whitelist.add(f);
        let v = self.new_cclosure(f, Vec::new());
        self.set_global(name, v);
        v
    }

    pub fn whitelist_native(&mut self, f: CFunction) {
        self.whitelist.add(f);
    }

    pub fn unwhitelist_native(&mut self, f: CFunction) {
        self.whitelist.remove(f);
    }

    pub fn new_upvalue_closed(&mut self, value: LuaValue) -> UpvalPtr {
        let u = GcPtr::from_box(Box::new(GcUpval {
            header: GcHeader::new(TUPVAL, self.gc.current_white),
            v: UpvalState::Closed(value),
        }));
        self.gc
            .link(u.as_raw() as *mut GcHeader, object_size(TUPVAL, 0));
        u
    }

    pub fn new_upvalue_open(&mut self, stack_index: usize) -> UpvalPtr {
        let u = GcPtr::from_box(Box::new(GcUpval {
            header: GcHeader::new(TUPVAL, self.gc.current_white),
            v: UpvalState::Open(stack_index),
        }));
        self.gc
            .link(u.as_raw() as *mut GcHeader, object_size(TUPVAL, 0));
        u
    }

    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> LuaValue {
        let u = GcPtr::from_box(Box::new(GcUserdata {
            header: GcHeader::new(TUSERDATA, self.gc.current_white),
            data,
            metatable: None,
            env: None,
        }));
        self.gc
            .link(u.as_raw() as *mut GcHeader, object_size(TUSERDATA, 0));
        LuaValue::userdata(u)
    }

    /// A fresh coroutine with `func` parked at the bottom of its stack,
    /// waiting for the first resume.
    pub fn new_thread(&mut self, func: LuaValue) -> LuaValue {
        let vm_ptr: *mut LuaVM = self;
        let t = GcPtr::from_box(Box::new(GcThread {
            header: GcHeader::new(TTHREAD, self.gc.current_white),
            state: LuaState::new(vm_ptr, false),
        }));
        self.gc
            .link(t.as_raw() as *mut GcHeader, object_size(TTHREAD, 0));
        t.as_mut().state.push_value(func).expect("fresh stack");
        LuaValue::thread(t)
    }

    // ============ Host call surface ============

    /// Protected call on the main thread: returns the results, or the
    /// status and error object.
    pub fn pcall_values(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
    ) -> Result<Vec<LuaValue>, (ThreadStatus, LuaValue)> {
        let l = self.main_state();
        let func_idx = l.top;
        if l.check_stack(args.len() + 1).is_err() {
            l.top = func_idx;
            let mem = l.vm().memerrmsg;
            return Err((ThreadStatus::ErrMem, mem));
        }
        l.stack[l.top] = func;
        l.top += 1;
        for a in args {
            l.stack[l.top] = *a;
            l.top += 1;
        }
        let status = l.pcall(args.len(), do_call::MULTRET, ERRFUNC_NONE);
        if status == ThreadStatus::Ok {
            let mut results = Vec::with_capacity(l.top - func_idx);
            for i in func_idx..l.top {
                results.push(l.stack[i]);
                l.stack[i] = LuaValue::nil();
            }
            l.top = func_idx;
            Ok(results)
        } else {
            let err = if l.top > func_idx {
                l.stack[func_idx]
            } else {
                LuaValue::nil()
            };
            for i in func_idx..l.top {
                l.stack[i] = LuaValue::nil();
            }
            l.top = func_idx;
            Err((status, err))
        }
    }

    /// Resume a coroutine value with `args`; returns the status plus the
    /// transferred values (yielded values, results, or the error object).
    pub fn resume_values(
        &mut self,
        thread: LuaValue,
        args: &[LuaValue],
    ) -> (ThreadStatus, Vec<LuaValue>) {
        let Some(t) = thread.as_thread() else {
            return (ThreadStatus::ErrRun, Vec::new());
        };
        let co = &mut t.as_mut().state;
        if co.check_stack(args.len()).is_err() {
            return (ThreadStatus::ErrMem, Vec::new());
        }
        for a in args {
            co.stack[co.top] = *a;
            co.top += 1;
        }
        let status = do_call::resume(co, args.len());
        let first = match status {
            ThreadStatus::Ok | ThreadStatus::Yield => co.base,
            _ => co.top.saturating_sub(1),
        };
        let mut out = Vec::with_capacity(co.top - first);
        for i in first..co.top {
            out.push(co.stack[i]);
            co.stack[i] = LuaValue::nil();
        }
        co.top = first;
        (status, out)
    }

    // ============ Globals and registry ============

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = LuaValue::string(self.new_str(name));
        let t = self.globals.as_table().unwrap();
        t.as_mut().raw_set(key, value);
        self.gc.barrier_back(t.as_raw() as *mut GcHeader);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = LuaValue::string(self.new_str(name));
        self.globals.as_table().unwrap().as_ref().raw_get(&key)
    }

    pub fn registry_set(&mut self, name: &str, value: LuaValue) {
        let key = LuaValue::string(self.new_str(name));
        let t = self.registry.as_table().unwrap();
        t.as_mut().raw_set(key, value);
        self.gc.barrier_back(t.as_raw() as *mut GcHeader);
    }

    pub fn registry_get(&mut self, name: &str) -> LuaValue {
        let key = LuaValue::string(self.new_str(name));
        self.registry.as_table().unwrap().as_ref().raw_get(&key)
    }

    // ============ Halt control ============

    /// Cooperative abort: 1 stops silently, 2 raises a runtime error with
    /// `message` at the next instruction boundary.
    pub fn halt(&mut self, state: u8, message: Option<&str>) {
        debug_assert!(state <= HALT_ERROR);
        self.haltstate = state;
        self.haltmessage = message.map(|m| m.to_string());
    }

    pub fn clear_halt(&mut self) {
        self.haltstate = HALT_NONE;
        self.haltmessage = None;
    }

    pub fn haltstate(&self) -> u8 {
        self.haltstate
    }

    // ============ Chunk loading ============

    /// Load a chunk through the host-supplied loaders, checking the
    /// binary signature against the mode string ("b", "t" or "bt").
    pub fn load_chunk(
        &mut self,
        bytes: &[u8],
        name: &str,
        mode: &str,
    ) -> Result<LuaValue, (ThreadStatus, String)> {
        let is_binary = bytes.first() == Some(&CHUNK_SIGNATURE[0]);
        let kind = if is_binary { "b" } else { "t" };
        if !mode.contains(kind) {
            let what = if is_binary { "binary" } else { "text" };
            return Err((
                ThreadStatus::ErrSyntax,
                format!("attempt to load a {} chunk (mode is '{}')", what, mode),
            ));
        }
        let loader = if is_binary {
            self.binary_loader
        } else {
            self.text_loader
        };
        let Some(loader) = loader else {
            return Err((
                ThreadStatus::ErrSyntax,
                format!("no loader for {} chunks", kind),
            ));
        };
        let proto = loader(self, bytes, name).map_err(|e| (ThreadStatus::ErrSyntax, e))?;
        let env = self.globals.as_table().unwrap();
        let upvals: Vec<UpvalPtr> = (0..proto.nups)
            .map(|_| self.new_upvalue_closed(LuaValue::nil()))
            .collect();
        Ok(self.new_lclosure(proto, env, upvals))
    }

    // ============ GC surface ============

    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    pub fn gc_restart(&mut self) {
        self.gc.running = true;
        self.gc.rearm();
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc.running
    }

    pub fn gc_count_bytes(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_collect(&mut self) {
        crate::gc::collect(self);
    }

    /// One collection step; with a stop-world collector a step is a full
    /// cycle, entered only when the debt demands it.
    pub fn gc_step(&mut self) -> bool {
        if self.gc.debt_exceeded() {
            crate::gc::collect(self);
            true
        } else {
            false
        }
    }

    pub(crate) fn try_gc_step(&mut self) {
        if self.gc.debt_exceeded() {
            crate::gc::collect(self);
        }
    }

    pub fn gc_set_pause(&mut self, pause: u32) -> u32 {
        self.gc.set_pause(pause)
    }

    pub fn gc_set_stepmul(&mut self, stepmul: u32) -> u32 {
        self.gc.set_stepmul(stepmul)
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        crate::gc::free_all(self);
    }
}

/// A thread object: GC header plus the execution state.
#[repr(C)]
pub struct GcThread {
    pub header: GcHeader,
    pub state: LuaState,
}
