// Per-call frame record (the CallInfo of the original runtime).

use crate::lua_vm::NCcalls;

/// `errfunc` encoding: 0 = not a catch frame, 1 = catch without a handler
/// ("inherit"), `2 + slot` = handler lives at `base + slot`.
pub const ERRFUNC_NONE: u32 = 0;
pub const ERRFUNC_INHERIT: u32 = 1;

#[inline(always)]
pub const fn errfunc_handler(slot: u32) -> u32 {
    2 + slot
}

#[derive(Clone)]
pub struct CallInfo {
    /// Stack index of the function value.
    pub func: usize,
    /// First register of the frame.
    pub base: usize,
    /// Frame ceiling (one past the last usable register).
    pub top: usize,
    /// Expected results; -1 = multiple.
    pub nresults: i32,
    /// Tail calls folded into this frame (lost for tracebacks).
    pub tailcalls: u32,
    /// Saved program counter for scripted frames.
    pub saved_pc: u32,
    /// Catch/handler slot, see the `ERRFUNC_*` encoding.
    pub errfunc: u32,
    /// Resume context saved for native frames (0 = none).
    pub ctx: u32,
    /// True while a hook runs in this frame.
    pub ishook: bool,
    pub allowhook: bool,
    /// Hooks already fired for the current instruction.
    pub hook_called_mask: u8,
    /// nCcalls saved across a hook invocation.
    pub hook_old_nccalls: NCcalls,
    pub hook_top: usize,
    pub hook_ci_top: usize,
    /// Scripted frame (has bytecode) vs native frame.
    pub is_lua: bool,
}

impl CallInfo {
    pub fn new(func: usize, base: usize, top: usize, nresults: i32, is_lua: bool) -> Self {
        CallInfo {
            func,
            base,
            top,
            nresults,
            tailcalls: 0,
            saved_pc: 0,
            errfunc: ERRFUNC_NONE,
            ctx: 0,
            ishook: false,
            allowhook: true,
            hook_called_mask: 0,
            hook_old_nccalls: NCcalls::empty_count(),
            hook_top: 0,
            hook_ci_top: 0,
            is_lua,
        }
    }

    /// The pseudo frame at the bottom of every thread.
    pub fn host() -> Self {
        CallInfo::new(0, 0, 0, -1, false)
    }
}
