// Coroutine library: thin wrappers over the core resume/yield machinery.

use crate::lua_value::{ClosureKind, LuaValue, ThreadPtr};
use crate::lua_vm::do_call;
use crate::lua_vm::{LuaError, LuaResult, LuaState, LuaVM, ThreadStatus};

pub fn open(vm: &mut LuaVM) {
    let lib = vm.new_table(0, 8);
    let entries: &[(&str, crate::lua_vm::CFunction)] = &[
        ("create", co_create),
        ("resume", co_resume),
        ("yield", co_yield),
        ("status", co_status),
        ("wrap", co_wrap),
        ("running", co_running),
        ("isyieldable", co_isyieldable),
    ];
    for (name, f) in entries {
        vm.whitelist.add(*f);
        let key = LuaValue::string(vm.new_str(name));
        let func = vm.new_cclosure(*f, Vec::new());
        lib.as_table().unwrap().as_mut().raw_set(key, func);
    }
    vm.whitelist.add(wrap_call);
    vm.set_global("coroutine", lib);
}

fn check_thread(l: &mut LuaState, n: usize) -> LuaResult<ThreadPtr> {
    match l.get_arg(n).and_then(|v| v.as_thread()) {
        Some(t) => Ok(t),
        None => Err(l.runtime_error(format!("bad argument #{} (coroutine expected)", n))),
    }
}

fn co_create(l: &mut LuaState) -> LuaResult<i32> {
    let func = l.check_any(1)?;
    if !func.is_function() {
        return Err(l.runtime_error("bad argument #1 to 'create' (function expected)"));
    }
    let t = l.vm_mut().new_thread(func);
    l.push_value(t)?;
    Ok(1)
}

/// Transfer `nargs` from the caller onto the coroutine, drive it, and
/// bring back either the yield values, the final results, or the error.
fn do_resume(l: &mut LuaState, co: ThreadPtr, first_arg: usize) -> LuaResult<i32> {
    if std::ptr::eq(&co.as_ref().state, l) {
        l.push_boolean(false)?;
        l.push_str("cannot resume non-suspended coroutine")?;
        return Ok(2);
    }
    let co_state = &mut co.as_mut().state;
    let nargs = l.top - first_arg;
    co_state.check_stack(nargs)?;
    for i in 0..nargs {
        let v = l.stack[first_arg + i];
        co_state.stack[co_state.top] = v;
        co_state.top += 1;
        l.stack[first_arg + i] = LuaValue::nil();
    }
    l.top = first_arg;

    let status = do_call::resume(co_state, nargs);

    match status {
        ThreadStatus::Ok | ThreadStatus::Yield => {
            let nres = co_state.top - co_state.base;
            l.check_stack(nres + 1)?;
            l.push_boolean(true)?;
            for i in 0..nres {
                let v = co_state.stack[co_state.base + i];
                l.push_value(v)?;
                co_state.stack[co_state.base + i] = LuaValue::nil();
            }
            co_state.top = co_state.base;
            Ok((nres + 1) as i32)
        }
        _ => {
            // error object on the coroutine's stack top
            let err = if co_state.top > 0 {
                co_state.stack[co_state.top - 1]
            } else {
                LuaValue::nil()
            };
            l.push_boolean(false)?;
            l.push_value(err)?;
            Ok(2)
        }
    }
}

fn co_resume(l: &mut LuaState) -> LuaResult<i32> {
    let co = check_thread(l, 1)?;
    let first_arg = l.base + 1;
    do_resume(l, co, first_arg)
}

/// coroutine.yield(...): a tail yield — the native frame is finished by
/// the next resume, whose arguments become this call's results.
fn co_yield(l: &mut LuaState) -> LuaResult<i32> {
    let nresults = l.arg_count();
    Err(l.do_yield(nresults, 0))
}

fn thread_status(l: &LuaState, co: ThreadPtr) -> &'static str {
    let co_state = &co.as_ref().state;
    if std::ptr::eq(co_state, l) {
        return "running";
    }
    match co_state.status() {
        ThreadStatus::Yield => "suspended",
        ThreadStatus::Ok => {
            if co_state.ci_depth() > 0 {
                "normal" // resumed somebody else
            } else if co_state.top > 0 {
                "suspended" // fresh: the function still parked
            } else {
                "dead"
            }
        }
        _ => "dead",
    }
}

fn co_status(l: &mut LuaState) -> LuaResult<i32> {
    let co = check_thread(l, 1)?;
    let s = thread_status(l, co);
    l.push_str(s)?;
    Ok(1)
}

fn co_wrap(l: &mut LuaState) -> LuaResult<i32> {
    let func = l.check_any(1)?;
    if !func.is_function() {
        return Err(l.runtime_error("bad argument #1 to 'wrap' (function expected)"));
    }
    let thread = l.vm_mut().new_thread(func);
    let wrapper = l.vm_mut().new_cclosure(wrap_call, vec![thread]);
    l.push_value(wrapper)?;
    Ok(1)
}

/// The closure produced by `wrap`: resumes the thread held in its
/// upvalue, propagating errors into the caller.
fn wrap_call(l: &mut LuaState) -> LuaResult<i32> {
    let func = l.stack[l.ci().func];
    let co = func
        .as_closure()
        .and_then(|c| match &c.as_ref().kind {
            ClosureKind::Native(n) => n.upvals.first().copied(),
            ClosureKind::Lua(_) => None,
        })
        .and_then(|v| v.as_thread());
    let Some(co) = co else {
        return Err(l.runtime_error("invalid wrapped coroutine"));
    };
    let first_arg = l.base;
    let n = do_resume(l, co, first_arg)?;
    // (ok, ...) -> ... or error
    let ok = l.stack[l.top - n as usize];
    if ok.is_false() {
        let err = l.stack[l.top - 1];
        l.push_value(err)?;
        return Err(do_call::throw(l, LuaError::Run));
    }
    // drop the status flag
    let results_start = l.top - n as usize + 1;
    for i in 0..(n as usize - 1) {
        l.stack[results_start - 1 + i] = l.stack[results_start + i];
    }
    l.top -= 1;
    l.stack[l.top] = LuaValue::nil();
    Ok(n - 1)
}

fn co_running(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.as_thread_value();
    l.push_value(v)?;
    l.push_boolean(l.is_main())?;
    Ok(2)
}

fn co_isyieldable(l: &mut LuaState) -> LuaResult<i32> {
    let yieldable = !l.is_main() && !l.nccalls.has(crate::lua_vm::CallFlags::NOYIELD);
    l.push_boolean(yieldable)?;
    Ok(1)
}
