// Call and protected-call machinery.
//
// Errors and yields travel as `Err` values through every Rust frame — the
// moral equivalent of the longjmp chain — and are caught by the
// `run_protected` match inside `do_pcall`/`resume`. The unwind-then-
// continue loop is what lets a yield cross native frames: unwinding stops
// at the innermost catch frame, and `f_continue` re-enters the remaining
// frames top-down, re-invoking native functions with their saved resume
// context.

use crate::lua_value::{ClosureKind, LuaValue, Proto, CFunction};
use crate::lua_vm::execute;
use crate::lua_vm::lua_state::{HookEvent, HookMask, LuaState};
use crate::lua_vm::{
    CallFlags, CallInfo, ERRFUNC_NONE, HALT_NONE, LuaError, LuaResult, MAXCCALLS, NCcalls,
    ThreadStatus,
};

/// Minimum stack room guaranteed to a native function.
pub const MINSTACK: usize = 20;

pub const MULTRET: i32 = -1;

/// Resume-context values at or above this encode an unwind status
/// delivered to a catch-and-continue frame.
pub const ERRCTX_BASE: u32 = 0x100;

#[inline(always)]
pub fn ctx_of_status(status: ThreadStatus) -> u32 {
    ERRCTX_BASE + status as u32
}

/// Decode a context back into the status it carries, if it is one.
pub fn status_of_ctx(ctx: u32) -> Option<ThreadStatus> {
    match ctx.checked_sub(ERRCTX_BASE)? {
        0 => Some(ThreadStatus::Ok),
        1 => Some(ThreadStatus::Yield),
        2 => Some(ThreadStatus::ErrRun),
        3 => Some(ThreadStatus::ErrSyntax),
        4 => Some(ThreadStatus::ErrMem),
        5 => Some(ThreadStatus::ErrErr),
        6 => Some(ThreadStatus::ErrExc),
        _ => None,
    }
}

/// Place the error object for `status` at `oldtop` and trim the stack to
/// one past it.
pub fn set_error_obj(l: &mut LuaState, status: ThreadStatus, oldtop: usize) {
    let v = match status {
        ThreadStatus::ErrMem => l.vm().memerrmsg,
        ThreadStatus::ErrErr => l.new_str_value("error in error handling"),
        ThreadStatus::ErrExc => l.new_str_value("unhandled exception in host function"),
        ThreadStatus::ErrSyntax | ThreadStatus::ErrRun => {
            if l.top > 0 {
                l.stack[l.top - 1]
            } else {
                LuaValue::nil()
            }
        }
        _ => LuaValue::nil(),
    };
    l.stack[oldtop] = v;
    for i in (oldtop + 1)..l.top {
        l.stack[i] = LuaValue::nil();
    }
    l.top = oldtop + 1;
}

/// Search for the innermost frame with an error handler and run it over
/// the error object sitting at the stack top. `NOERRFUNC` and a
/// non-function handler both degrade to "error in error handling".
fn call_errfunc(l: &mut LuaState) -> LuaError {
    let mut i = l.ci_idx;
    while i > 0 && l.ci[i].errfunc == ERRFUNC_NONE {
        i -= 1;
    }
    let ef = l.ci[i].errfunc;
    if ef >= 2 {
        let slot = l.ci[i].base + (ef - 2) as usize;
        let handler = l.stack[slot];
        if !handler.is_function() || l.nccalls.has(CallFlags::NOERRFUNC) {
            return LuaError::ErrErr;
        }
        // move the error object up, slide the handler under it
        if l.check_stack(2).is_err() {
            return LuaError::ErrErr;
        }
        l.stack[l.top] = l.stack[l.top - 1];
        l.stack[l.top - 1] = handler;
        l.top += 1;
        let func_idx = l.top - 2;
        match do_call(
            l,
            func_idx,
            1,
            CallFlags::NOYIELD | CallFlags::NOVPCALL | CallFlags::NOERRFUNC,
        ) {
            Ok(()) => LuaError::Run,
            Err(e) => e,
        }
    } else {
        LuaError::Run
    }
}

/// The throw half of the non-local jump: run the error hook, give the
/// innermost error handler its shot, and hand back the error to
/// propagate.
pub fn throw(l: &mut LuaState, e: LuaError) -> LuaError {
    if e != LuaError::Yield && l.hookmask.contains(HookMask::ERROR) {
        let _ = call_hook(l, HookEvent::Error);
    }
    if e == LuaError::Run { call_errfunc(l) } else { e }
}

/// Raise a runtime error whose message is already fully formatted.
pub fn throw_runtime(l: &mut LuaState, msg: String) -> LuaError {
    let v = l.new_str_value(&msg);
    if l.push_value(v).is_err() {
        return LuaError::ErrErr;
    }
    throw(l, LuaError::Run)
}

/// The actions a catch point can drive.
#[derive(Clone, Copy)]
pub enum ProtectedOp {
    /// Plain call of the value at `func_idx`.
    Call {
        func_idx: usize,
        nresults: i32,
        flags: CallFlags,
    },
    /// First resume of a fresh coroutine; function below the args.
    CoStart { func_idx: usize },
    /// Resume of a suspended coroutine; args start at `arg_base`.
    CoResume { arg_base: usize },
    /// Re-enter suspended frames top-down, stopping above `stop_ci`.
    Continue { stop_ci: usize },
}

fn run_op(l: &mut LuaState, op: ProtectedOp) -> LuaResult<()> {
    match op {
        ProtectedOp::Call {
            func_idx,
            nresults,
            flags,
        } => do_call(l, func_idx, nresults, flags),
        ProtectedOp::CoStart { func_idx } => f_costart(l, func_idx),
        ProtectedOp::CoResume { arg_base } => f_coresume(l, arg_base),
        ProtectedOp::Continue { stop_ci } => f_continue(l, stop_ci),
    }
}

/// The nested catch point. Host panics crossing the boundary surface as
/// `ERR_EXC` instead of aborting the runtime.
fn run_protected(l: &mut LuaState, op: ProtectedOp) -> ThreadStatus {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_op(l, op)));
    match outcome {
        Ok(Ok(())) => ThreadStatus::Ok,
        Ok(Err(e)) => e.status(),
        Err(payload) => {
            drop(payload);
            ThreadStatus::ErrExc
        }
    }
}

enum Unwind {
    /// Nothing unwound; frames kept (dead coroutine tracebacks).
    None,
    /// Stopped at an inner catch frame; continue via `f_continue`.
    Stopped,
    /// Unwound all the way to the stop frame.
    Complete,
}

/// Walk frames from the top looking for a catch frame. On a hit, record
/// the status as the thread's resume context, close upvalues above the
/// landing spot and park the error object there.
fn unwind_frames(
    l: &mut LuaState,
    stop_ci: usize,
    old_top: Option<usize>,
    status: ThreadStatus,
) -> Unwind {
    let mut i = l.ci_idx;
    let mut found = None;
    while i > stop_ci {
        if l.ci[i].errfunc != ERRFUNC_NONE {
            l.ctx = ctx_of_status(status);
            let otop = if l.ci_idx > i {
                l.ci[i + 1].func
            } else {
                l.top.saturating_sub(1)
            };
            found = Some((i, otop));
            break;
        }
        i -= 1;
    }
    let (target, otop, outcome) = match found {
        Some((i, otop)) => (i, otop, Unwind::Stopped),
        None => match old_top {
            None => return Unwind::None,
            Some(t) => (stop_ci, t, Unwind::Complete),
        },
    };
    l.close_upvals(otop);
    set_error_obj(l, status, otop);
    l.ci_idx = target;
    l.base = l.ci[target].base;
    l.restore_ci_limit();
    if matches!(outcome, Unwind::Stopped) && target == stop_ci {
        Unwind::Complete
    } else {
        outcome
    }
}

/// Protected call: run `op` under a new catch point with error slot `ef`
/// (see the `ERRFUNC_*` encoding) and the given restriction mask applied
/// to the packed call counter. On failure the frames are unwound; when
/// unwinding stops at an inner catch-and-continue frame the loop swaps to
/// `f_continue`, which is how yields and caught errors re-emerge through
/// intermediate native frames.
pub fn do_pcall(
    l: &mut LuaState,
    mut op: ProtectedOp,
    old_top: usize,
    ef: u32,
    flagmask: u32,
) -> ThreadStatus {
    let stop_ci = l.ci_idx;
    let old_nccalls = l.nccalls;
    l.ci_mut().errfunc = ef;
    let status = loop {
        l.nccalls = old_nccalls.masked(flagmask);
        let status = run_protected(l, op);
        if status == ThreadStatus::Ok || status == ThreadStatus::Yield {
            break status;
        }
        match unwind_frames(l, stop_ci, Some(old_top), status) {
            Unwind::Stopped => {
                op = ProtectedOp::Continue { stop_ci };
            }
            _ => break status,
        }
    };
    if status == ThreadStatus::Ok && l.ci_idx != stop_ci {
        // a silent halt abandoned the frames mid-run; land back on the
        // catch point with an empty result list
        l.ci_idx = stop_ci;
        l.base = l.ci[stop_ci].base;
        l.close_upvals(old_top);
        for i in old_top..l.top {
            l.stack[i] = LuaValue::nil();
        }
        l.top = old_top;
    }
    debug_assert!(l.ci_idx == stop_ci || status == ThreadStatus::Yield);
    l.ci[stop_ci].errfunc = ERRFUNC_NONE;
    l.nccalls = old_nccalls;
    status
}

/// Re-enter suspended frames from the current one down to `stop_ci`.
/// Native frames are re-invoked with the saved context and may yield
/// again; scripted frames first patch up the interrupted opcode, then
/// re-enter the interpreter. A raised halt flag stops the walk.
fn f_continue(l: &mut LuaState, stop_ci: usize) -> LuaResult<()> {
    while l.ci_idx > stop_ci && l.vm().haltstate == HALT_NONE {
        l.ci_mut().errfunc = ERRFUNC_NONE;
        if !l.ci().is_lua {
            if l.top > l.ci().top {
                let top = l.top;
                l.ci_mut().top = top;
            }
            let func = l.stack[l.ci().func];
            let f = native_of(&func).expect("native frame without native function");
            let n = call_native(l, f)?;
            let first_result = l.top - n;
            poscall(l, first_result)?;
        } else {
            execute::finish_resume(l)?;
            if execute::execute(l)? {
                return Err(LuaError::Yield);
            }
        }
    }
    Ok(())
}

/// Second and later resumes. Distinguishes a tail yield from native code
/// (no context: finish the native call with the resume arguments as its
/// results), a yield from inside a hook (scripted frame: restore and
/// re-execute the interrupted instruction) and a resumable native yield
/// (slide the resume arguments down over the parked results).
fn f_coresume(l: &mut LuaState, arg_base: usize) -> LuaResult<()> {
    if l.ci().is_lua {
        debug_assert!(l.ci().ishook);
        execute::finish_resume(l)?;
        if execute::execute(l)? {
            return Err(LuaError::Yield);
        }
    } else if l.ctx == 0 {
        poscall(l, arg_base)?;
    } else {
        let rbase = l.base;
        if rbase < arg_base {
            let n = l.top - arg_base;
            for i in 0..n {
                l.stack[rbase + i] = l.stack[arg_base + i];
            }
            for i in (rbase + n)..l.top {
                l.stack[i] = LuaValue::nil();
            }
            l.top = rbase + n;
        }
        l.base = l.ci().base;
    }
    f_continue(l, 0)
}

/// First resume of a fresh coroutine.
fn f_costart(l: &mut LuaState, func_idx: usize) -> LuaResult<()> {
    match precall(l, func_idx, MULTRET)? {
        Precall::Lua => {
            if execute::execute(l)? {
                return Err(LuaError::Yield);
            }
            Ok(())
        }
        Precall::Native => Ok(()),
        Precall::NativeYield => Err(LuaError::Yield),
    }
}

fn resume_error(l: &mut LuaState, msg: &str) -> ThreadStatus {
    l.top = l.ci().base;
    let v = l.new_str_value(msg);
    let _ = l.push_value(v);
    ThreadStatus::ErrRun
}

/// Resume a coroutine whose arguments are already on its stack. Only
/// fresh (`Ok`, no frames) and suspended (`Yield`) threads may run; the
/// drive loop re-enters via `f_continue` whenever an error was caught
/// short of the bottom frame.
pub fn resume(l: &mut LuaState, nargs: usize) -> ThreadStatus {
    if l.nccalls.count() >= MAXCCALLS {
        return resume_error(l, "C stack overflow");
    }
    if l.status == ThreadStatus::Ok && l.ci_idx != 0 {
        return resume_error(l, "cannot resume non-suspended coroutine");
    }
    if l.status != ThreadStatus::Yield
        && (l.status != ThreadStatus::Ok || (l.ci_idx == 0 && l.top == nargs))
    {
        // finished or errored; a fresh thread still has its body parked
        // below the arguments
        return resume_error(l, "cannot resume dead coroutine");
    }
    if l.hookmask.contains(HookMask::RESUME) {
        let saved = l.status;
        l.status = ThreadStatus::Ok;
        let _ = call_hook(l, HookEvent::Resume);
        l.status = saved;
    }
    // the driven thread may be reachable from host locals only; keep it
    // (and everything on its stack) alive across collection steps
    if let Some(t) = l.as_thread_value().as_thread() {
        l.vm_mut().resume_roots.push(t);
    }
    let mut op = match l.status {
        ThreadStatus::Yield => {
            l.status = ThreadStatus::Ok;
            ProtectedOp::CoResume {
                arg_base: l.top - nargs,
            }
        }
        _ => ProtectedOp::CoStart {
            func_idx: l.top - nargs - 1,
        },
    };
    let old_nccalls = l.nccalls;
    let status = loop {
        // fresh watermark: one call level, restriction flags cleared
        l.nccalls = NCcalls((old_nccalls.0 & !0xF) + crate::lua_vm::NCCALLS_STEP);
        if !l.ci().allowhook {
            l.nccalls = l.nccalls.with(CallFlags::NOHOOKS);
        }
        l.base_ccalls = l.nccalls;
        let status = run_protected(l, op);
        if status == ThreadStatus::Ok || status == ThreadStatus::Yield {
            break status;
        }
        match unwind_frames(l, 0, None, status) {
            Unwind::Stopped => {
                op = ProtectedOp::Continue { stop_ci: 0 };
            }
            _ => {
                // dead: keep frames for the traceback, error object on top
                let top = l.top;
                if top < l.stack.len() {
                    set_error_obj(l, status, top);
                }
                break status;
            }
        }
    };
    if status == ThreadStatus::Ok && l.ci_idx != 0 {
        // silent halt: abandon the coroutine's frames entirely
        l.ci_idx = 0;
        l.base = l.ci[0].base;
        l.close_upvals(0);
        for i in 0..l.top {
            l.stack[i] = LuaValue::nil();
        }
        l.top = 0;
    }
    l.vm_mut().resume_roots.pop();
    l.nccalls = NCcalls((old_nccalls.0 & !0xF) | (CallFlags::NOYIELD | CallFlags::NOVPCALL).bits());
    l.base_ccalls = l.nccalls;
    l.status = status;
    status
}

/// Yield the current thread. Native callers propagate the returned error;
/// the `ctx` is handed back to the same function on resume (0 = tail
/// yield, never re-invoked). Refused with a runtime error under
/// `NOYIELD`.
pub fn vyield(l: &mut LuaState, nresults: usize, ctx: u32) -> LuaError {
    if l.nccalls.has(CallFlags::NOYIELD) {
        return l.vm_error("attempt to yield across non-resumable call boundary");
    }
    debug_assert!(l.ci_idx > 0);
    if !l.ci().is_lua {
        l.ctx = ctx;
        // park: results live at base..top, no longer in sync with ci.base
        l.base = l.top - nresults;
    }
    if l.hookmask.contains(HookMask::YIELD) {
        let _ = call_hook(l, HookEvent::Yield);
    }
    l.status = ThreadStatus::Yield;
    LuaError::Yield
}

// ============ precall / poscall / call ============

pub enum Precall {
    /// Scripted frame pushed; caller enters the interpreter.
    Lua,
    /// Native function ran to completion; results already placed.
    Native,
    /// Native function yielded.
    NativeYield,
}

#[inline]
fn native_of(v: &LuaValue) -> Option<CFunction> {
    match &v.as_closure()?.as_ref().kind {
        ClosureKind::Native(c) => Some(c.f),
        ClosureKind::Lua(_) => None,
    }
}

fn call_native(l: &mut LuaState, f: CFunction) -> LuaResult<usize> {
    l.vm_mut().lock.unlock();
    let r = f(l);
    l.vm_mut().lock.lock();
    Ok(r?.max(0) as usize)
}

/// `__call` resolution: open a hole at `func_idx` and slide the original
/// value in as the first argument.
fn try_func_tm(l: &mut LuaState, func_idx: usize) -> LuaResult<usize> {
    let func = l.stack[func_idx];
    let Some(tm) = crate::lua_vm::get_tm_by_obj(l, &func, crate::lua_vm::TmKind::Call) else {
        return Err(l.type_error(&func, "call"));
    };
    if !tm.is_function() {
        return Err(l.type_error(&func, "call"));
    }
    l.check_stack(1)?;
    let mut p = l.top;
    while p > func_idx {
        l.stack[p] = l.stack[p - 1];
        p -= 1;
    }
    l.top += 1;
    l.stack[func_idx] = tm;
    Ok(func_idx)
}

/// 5.1-style vararg frame setup: missing fixed parameters become nil,
/// then the fixed parameters move above the extra arguments so the frame
/// base lands past everything the function received.
fn adjust_varargs(l: &mut LuaState, proto: &Proto, actual: usize) -> LuaResult<usize> {
    let nfix = proto.num_params as usize;
    for _ in actual..nfix {
        l.push_value(LuaValue::nil())?;
    }
    let actual = actual.max(nfix);
    let fixed = l.top - actual;
    let base = l.top;
    for i in 0..nfix {
        let v = l.stack[fixed + i];
        l.push_value(v)?;
        l.stack[fixed + i] = LuaValue::nil();
    }
    Ok(base)
}

/// Prepare a call to the value at `func_idx`. Scripted callees get a
/// frame and return to the interpreter; native callees are checked
/// against the whitelist, invoked in place, and may yield.
pub fn precall(l: &mut LuaState, mut func_idx: usize, nresults: i32) -> LuaResult<Precall> {
    if !l.stack[func_idx].is_function() {
        func_idx = try_func_tm(l, func_idx)?;
    }
    // save the caller's resume context; poscall restores it
    let ctx = l.ctx;
    l.ci_mut().ctx = ctx;
    let cl = l.stack[func_idx].as_closure().unwrap();
    match &cl.as_ref().kind {
        ClosureKind::Lua(lcl) => {
            let proto = lcl.proto.clone();
            l.check_stack(proto.max_stack_size as usize + MINSTACK)?;
            let base = if !proto.is_vararg {
                let b = func_idx + 1;
                let limit = b + proto.num_params as usize;
                if l.top > limit {
                    for i in limit..l.top {
                        l.stack[i] = LuaValue::nil();
                    }
                    l.top = limit;
                }
                while l.top < limit {
                    l.stack[l.top] = LuaValue::nil();
                    l.top += 1;
                }
                b
            } else {
                let nargs = l.top - func_idx - 1;
                adjust_varargs(l, &proto, nargs)?
            };
            let frame_top = base + proto.max_stack_size as usize;
            let mut ci = CallInfo::new(func_idx, base, frame_top, nresults, true);
            ci.allowhook = !l.nccalls.has(CallFlags::NOHOOKS);
            l.push_ci(ci)?;
            l.base = base;
            for i in l.top..frame_top {
                l.stack[i] = LuaValue::nil();
            }
            l.top = frame_top;
            if l.hookmask.contains(HookMask::CALL) {
                call_hook(l, HookEvent::Call)?;
            }
            Ok(Precall::Lua)
        }
        ClosureKind::Native(ccl) => {
            let f = ccl.f;
            l.check_stack(MINSTACK)?;
            if !l.vm().whitelist.contains(f) {
                return Err(l.vm_error("attempt to call invalid C function"));
            }
            let base = func_idx + 1;
            let mut ci = CallInfo::new(func_idx, base, l.top + MINSTACK, nresults, false);
            ci.allowhook = !l.nccalls.has(CallFlags::NOHOOKS);
            l.push_ci(ci)?;
            l.base = base;
            l.ctx = 0; // fresh resume context
            if l.hookmask.contains(HookMask::CALL) {
                call_hook(l, HookEvent::Call)?;
            }
            l.vm_mut().lock.unlock();
            let outcome = f(l);
            l.vm_mut().lock.lock();
            match outcome {
                Ok(n) => {
                    let n = n.max(0) as usize;
                    let first_result = l.top - n;
                    poscall(l, first_result)?;
                    Ok(Precall::Native)
                }
                Err(LuaError::Yield) => Ok(Precall::NativeYield),
                Err(e) => Err(e),
            }
        }
    }
}

/// Leave the current frame: move results into the caller's slots, restore
/// base and the caller's resume context. Returns false when the caller
/// asked for multiple results (top marks the result count).
pub fn poscall(l: &mut LuaState, mut first_result: usize) -> LuaResult<bool> {
    if l.hookmask.contains(HookMask::RET) {
        first_result = call_ret_hooks(l, first_result)?;
    }
    let (func, wanted) = {
        let ci = l.ci();
        (ci.func, ci.nresults)
    };
    l.pop_ci();
    l.ctx = l.ci().ctx;
    let mut res = func;
    let mut i = wanted;
    while i != 0 && first_result < l.top {
        l.stack[res] = l.stack[first_result];
        res += 1;
        first_result += 1;
        i -= 1;
    }
    while i > 0 {
        l.stack[res] = LuaValue::nil();
        res += 1;
        i -= 1;
    }
    for j in res..l.top {
        l.stack[j] = LuaValue::nil();
    }
    l.top = res;
    Ok(wanted != MULTRET)
}

fn call_ret_hooks(l: &mut LuaState, first_result: usize) -> LuaResult<usize> {
    let offset = l.top - first_result;
    call_hook(l, HookEvent::Ret)?;
    if l.ci().is_lua {
        while l.hookmask.contains(HookMask::TAILRET) && l.ci().tailcalls > 0 {
            l.ci_mut().tailcalls -= 1;
            call_hook(l, HookEvent::TailRet)?;
        }
    }
    Ok(l.top - offset)
}

/// Call a function with `nresults` expected. Bumps the packed call
/// counter (never decremented on the error path; the enclosing catch
/// point restores it) and rethrows a yield that has to cross this native
/// boundary.
pub fn do_call(
    l: &mut LuaState,
    func_idx: usize,
    nresults: i32,
    callflags: CallFlags,
) -> LuaResult<()> {
    let ishook = l.ci().is_lua && l.ci().ishook;
    let old_nccalls = l.nccalls;
    let mut flags = callflags;
    if l.nccalls.has(CallFlags::NOHOOKS) {
        flags |= CallFlags::NOHOOKS;
    }
    l.nccalls = old_nccalls.enter(flags);
    if l.nccalls.count() >= MAXCCALLS {
        if l.nccalls.count() < MAXCCALLS + 1 {
            return Err(l.vm_error("C stack overflow"));
        } else if l.nccalls.count() >= MAXCCALLS + (MAXCCALLS >> 4) {
            // error while handling stack error
            return Err(throw(l, LuaError::ErrErr));
        }
    }
    let yielded = match precall(l, func_idx, nresults)? {
        Precall::Lua => execute::execute(l)?,
        Precall::Native => false,
        Precall::NativeYield => true,
    };
    if yielded && !ishook {
        // break the native call boundary
        return Err(LuaError::Yield);
    }
    l.vm_mut().try_gc_step();
    l.nccalls = old_nccalls;
    Ok(())
}

// ============ Hooks ============

/// Invoke the debug hook for `event` with the frame parked. Line and
/// count hooks may yield: the saved pc backs up one instruction so the
/// interrupted opcode re-executes on resume.
pub fn call_hook(l: &mut LuaState, event: HookEvent) -> LuaResult<()> {
    let Some(hook) = l.hook else {
        return Ok(());
    };
    if l.nccalls.has(CallFlags::NOHOOKS) && event != HookEvent::Error {
        return Ok(());
    }
    let ci_idx = l.ci_idx;
    let old_pc = l.ci[ci_idx].saved_pc;
    l.ci[ci_idx].hook_top = l.top;
    l.ci[ci_idx].hook_ci_top = l.ci[ci_idx].top;
    l.check_stack(MINSTACK)?;
    l.ci[ci_idx].top = l.top + MINSTACK;
    l.ci[ci_idx].hook_old_nccalls = l.nccalls;
    let restrict = match event {
        // line and count hooks may yield
        HookEvent::Line(_) | HookEvent::Count => CallFlags::NOVPCALL | CallFlags::NOHOOKS,
        _ => CallFlags::NOVPCALL | CallFlags::NOHOOKS | CallFlags::NOYIELD,
    };
    l.nccalls = l.nccalls.with(restrict);
    l.ci[ci_idx].ishook = true;
    l.ci[ci_idx].allowhook = false;
    l.vm_mut().lock.unlock();
    let result = hook(l, event);
    l.vm_mut().lock.lock();
    match result {
        Err(LuaError::Yield) => {}
        Err(e) => return Err(e),
        Ok(()) => {}
    }
    if l.status == ThreadStatus::Yield {
        // handle the hook yield here, after the hook returned
        if l.ci_idx == ci_idx {
            l.base = l.top; // protect the scripted frame
            l.ci[ci_idx].saved_pc = old_pc.wrapping_sub(1);
        }
        return Err(LuaError::Yield);
    }
    l.ci[ci_idx].ishook = false;
    l.ci[ci_idx].allowhook = true;
    l.nccalls = l.ci[ci_idx].hook_old_nccalls;
    l.ci[ci_idx].top = l.ci[ci_idx].hook_ci_top;
    let hook_top = l.ci[ci_idx].hook_top;
    for i in hook_top..l.top {
        l.stack[i] = LuaValue::nil();
    }
    l.top = hook_top;
    l.ci[ci_idx].saved_pc = old_pc;
    Ok(())
}

// ============ Host entry points ============

impl LuaState {
    /// Unprotected call. If an error escapes here there is no enclosing
    /// catch point: the panic callback gets one look, then the process
    /// aborts — same contract as the original runtime.
    pub fn call(&mut self, func_idx: usize, nresults: i32) -> LuaResult<()> {
        match do_call(self, func_idx, nresults, CallFlags::empty()) {
            Ok(()) => Ok(()),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(_) => {
                if let Some(panic) = self.vm().panic {
                    panic(self);
                }
                std::process::abort();
            }
        }
    }

    /// Protected call over `nargs` arguments already pushed above the
    /// function. A yield with no coroutine boundary in between surfaces
    /// as the `Yield` status.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: u32) -> ThreadStatus {
        let func_idx = self.top - nargs - 1;
        do_pcall(
            self,
            ProtectedOp::Call {
                func_idx,
                nresults,
                flags: CallFlags::empty(),
            },
            func_idx,
            if errfunc == 0 { ERRFUNC_NONE } else { errfunc },
            !0,
        )
    }

    /// Scripted-facing protected call: the current native frame becomes a
    /// catch-and-continue frame (so the body may yield through it), and
    /// the body is invoked with the restriction flags inherited.
    pub fn vpcall(&mut self, func_idx: usize, nresults: i32, ef: u32) -> LuaResult<()> {
        if self.nccalls.has(CallFlags::NOVPCALL) {
            return Err(self.vm_error("attempt to use a non-resumable protected call"));
        }
        self.ci_mut().errfunc = ef;
        do_call(self, func_idx, nresults, CallFlags::empty())
    }

    /// Yield with a resume context; see `vyield`.
    pub fn do_yield(&mut self, nresults: usize, ctx: u32) -> LuaError {
        vyield(self, nresults, ctx)
    }
}
