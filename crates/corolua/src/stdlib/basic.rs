// Base library: the functions that sit on the protected-call machinery
// plus the small value-inspection surface.

use crate::lua_value::LuaValue;
use crate::lua_vm::do_call::{MULTRET, status_of_ctx};
use crate::lua_vm::execute::tostring_value;
use crate::lua_vm::{
    ERRFUNC_INHERIT, LuaError, LuaResult, LuaState, LuaVM, errfunc_handler, get_metatable,
};

/// Resume-context marker: "the protected body has been started".
const CTX_BODY: u32 = 1;

pub fn open(vm: &mut LuaVM) {
    vm.register_native("pcall", base_pcall);
    vm.register_native("xpcall", base_xpcall);
    vm.register_native("error", base_error);
    vm.register_native("assert", base_assert);
    vm.register_native("type", base_type);
    vm.register_native("tostring", base_tostring);
    vm.register_native("tonumber", base_tonumber);
    vm.register_native("select", base_select);
    vm.register_native("unpack", base_unpack);
    vm.register_native("rawget", base_rawget);
    vm.register_native("rawset", base_rawset);
    vm.register_native("rawequal", base_rawequal);
    vm.register_native("rawlen", base_rawlen);
    vm.register_native("next", base_next);
    vm.register_native("pairs", base_pairs);
    vm.register_native("ipairs", base_ipairs);
    vm.register_native("setmetatable", base_setmetatable);
    vm.register_native("getmetatable", base_getmetatable);
    vm.register_native("collectgarbage", base_collectgarbage);
    vm.register_native("print", base_print);
    let g = vm.globals();
    vm.set_global("_G", g);
}

fn finish_pcall(l: &mut LuaState, ok: bool) -> LuaResult<i32> {
    let base = l.base;
    if !ok {
        // normalize to exactly (false, err) wherever the unwinder parked
        // the error object
        let err = if l.top > base {
            l.stack[l.top - 1]
        } else {
            LuaValue::nil()
        };
        for i in (base + 2)..l.top {
            l.stack[i] = LuaValue::nil();
        }
        l.stack[base] = LuaValue::boolean(false);
        l.stack[base + 1] = err;
        l.top = base + 2;
        return Ok(2);
    }
    l.stack[base] = LuaValue::boolean(true);
    Ok((l.top - base) as i32)
}

/// Did a re-entry context report success? `CTX_BODY` means the body ran
/// to completion (possibly across yields); an encoded status means the
/// unwinder delivered an error here.
fn ctx_ok(ctx: u32) -> bool {
    match status_of_ctx(ctx) {
        Some(status) => !status.is_error(),
        None => ctx == CTX_BODY,
    }
}

/// pcall(f, ...) -> (true, results...) | (false, err)
///
/// Written as a resume-context state machine: the frame is re-invoked by
/// the continue loop after a caught error or a completed yield.
fn base_pcall(l: &mut LuaState) -> LuaResult<i32> {
    let ctx = l.get_ctx();
    if ctx != 0 {
        return finish_pcall(l, ctx_ok(ctx));
    }
    l.check_any(1)?;
    // open a slot under the function for the status result
    l.check_stack(1)?;
    let base = l.base;
    let mut p = l.top;
    while p > base {
        l.stack[p] = l.stack[p - 1];
        p -= 1;
    }
    l.stack[base] = LuaValue::nil();
    l.top += 1;
    l.set_ctx(CTX_BODY);
    l.vpcall(base + 1, MULTRET, ERRFUNC_INHERIT)?;
    finish_pcall(l, true)
}

/// xpcall(f, handler, ...) — like pcall with `handler` run at throw time.
fn base_xpcall(l: &mut LuaState) -> LuaResult<i32> {
    let ctx = l.get_ctx();
    if ctx != 0 {
        return finish_pcall(l, ctx_ok(ctx));
    }
    if l.arg_count() < 2 {
        return Err(l.runtime_error("bad argument #2 to 'xpcall' (value expected)"));
    }
    let base = l.base;
    // exchange function and handler: the handler doubles as the status
    // slot once the call finishes
    let f = l.stack[base];
    l.stack[base] = l.stack[base + 1];
    l.stack[base + 1] = f;
    l.set_ctx(CTX_BODY);
    l.vpcall(base + 1, MULTRET, errfunc_handler(0))?;
    finish_pcall(l, true)
}

/// error(msg, level): a string message gets "chunkid:line: " of the
/// `level`'th caller prefixed.
fn base_error(l: &mut LuaState) -> LuaResult<i32> {
    let level = match l.get_arg(2) {
        Some(v) if v.is_number() => v.as_number() as usize,
        _ => 1,
    };
    let mut v = l.get_arg(1).unwrap_or(LuaValue::nil());
    if v.is_string_like() && level > 0 {
        let s = l.vm_mut().resolve_str_value(v)?;
        let whre = l.where_str(level);
        if !whre.is_empty() {
            let mut msg = whre.into_bytes();
            msg.extend_from_slice(s.as_ref().bytes());
            let s = l.vm_mut().new_lstr(&msg);
            v = LuaValue::string(s);
        } else {
            v = LuaValue::string(s);
        }
    }
    l.push_value(v)?;
    Err(crate::lua_vm::do_call::throw(l, LuaError::Run))
}

fn base_assert(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    if v.is_false() {
        let msg = match l.get_arg(2) {
            Some(m) if m.is_string_like() => {
                let s = l.vm_mut().resolve_str_value(m)?;
                String::from_utf8_lossy(s.as_ref().bytes()).into_owned()
            }
            Some(_) => "assertion failed!".to_string(),
            None => "assertion failed!".to_string(),
        };
        return Err(l.runtime_error(msg));
    }
    Ok(l.arg_count() as i32)
}

fn base_type(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    l.push_str(v.type_name())?;
    Ok(1)
}

fn base_tostring(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    // __tostring takes precedence
    if let Some(mt) = get_metatable(&v) {
        let key = l.new_str_value("__tostring");
        let tm = mt.as_ref().raw_get(&key);
        if !tm.is_nil() {
            l.push_value(tm)?;
            l.push_value(v)?;
            crate::lua_vm::do_call::do_call(l, l.top - 2, 1, crate::lua_vm::CallFlags::empty())?;
            return Ok(1);
        }
    }
    let s = match tostring_value(l, v)? {
        Some(s) => s,
        None => {
            let text = match v.tt() {
                crate::lua_value::TNIL => "nil".to_string(),
                crate::lua_value::TBOOLEAN => {
                    if v.as_boolean() {
                        "true".to_string()
                    } else {
                        "false".to_string()
                    }
                }
                _ => format!("{}: {:p}", v.type_name(), v.as_pointer()),
            };
            l.new_str_value(&text)
        }
    };
    l.push_value(s)?;
    Ok(1)
}

fn base_tonumber(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    match l.get_arg(2) {
        None => match crate::lua_vm::execute::coerce_number(l, &v) {
            Some(n) => l.push_number(n)?,
            None => l.push_nil()?,
        },
        Some(b) => {
            if !b.is_number() {
                return Err(l.runtime_error("bad argument #2 to 'tonumber' (number expected)"));
            }
            let radix = b.as_number() as u32;
            if !(2..=36).contains(&radix) {
                return Err(l.runtime_error("bad argument #2 to 'tonumber' (base out of range)"));
            }
            let s = if v.is_string_like() {
                l.vm_mut().resolve_str_value(v)?
            } else {
                return Err(l.runtime_error("bad argument #1 to 'tonumber' (string expected)"));
            };
            let text = String::from_utf8_lossy(s.as_ref().bytes()).into_owned();
            let t = text.trim();
            let (neg, body) = match t.as_bytes().first() {
                Some(b'-') => (true, &t[1..]),
                Some(b'+') => (false, &t[1..]),
                _ => (false, t),
            };
            match i64::from_str_radix(body, radix) {
                Ok(n) => l.push_number(if neg { -(n as f64) } else { n as f64 })?,
                Err(_) => l.push_nil()?,
            }
        }
    }
    Ok(1)
}

fn base_select(l: &mut LuaState) -> LuaResult<i32> {
    let n = l.arg_count();
    let v = l.check_any(1)?;
    if v.is_string_like() {
        let s = l.vm_mut().resolve_str_value(v)?;
        if s.as_ref().bytes() == b"#" {
            l.push_number((n - 1) as f64)?;
            return Ok(1);
        }
    }
    if !v.is_number() {
        return Err(l.runtime_error("bad argument #1 to 'select' (number expected)"));
    }
    let mut i = v.as_number() as i64;
    if i < 0 {
        i += n as i64;
    } else if i > n as i64 {
        i = n as i64;
    }
    if i < 1 {
        return Err(l.runtime_error("bad argument #1 to 'select' (index out of range)"));
    }
    Ok((n as i64 - i) as i32)
}

/// unpack(t, i, j): push t[i..j].
fn base_unpack(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 to 'unpack' (table expected)"));
    };
    let i = match l.get_arg(2) {
        Some(v) if v.is_number() => v.as_number() as i64,
        _ => 1,
    };
    let j = match l.get_arg(3) {
        Some(v) if v.is_number() => v.as_number() as i64,
        _ => h.as_ref().len() as i64,
    };
    if i > j {
        return Ok(0);
    }
    let n = (j - i + 1) as usize;
    l.check_stack(n)?;
    for idx in i..=j {
        let v = h.as_ref().raw_geti(idx);
        l.push_value(v)?;
    }
    Ok(n as i32)
}

fn base_rawget(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let mut k = l.check_any(2)?;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 to 'rawget' (table expected)"));
    };
    if k.is_rope() || k.is_substring() {
        k = LuaValue::string(l.vm_mut().resolve_str_value(k)?);
    }
    let v = h.as_ref().raw_get(&k);
    l.push_value(v)?;
    Ok(1)
}

fn base_rawset(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let mut k = l.check_any(2)?;
    let v = l.check_any(3)?;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 to 'rawset' (table expected)"));
    };
    if k.is_nil() {
        return Err(l.runtime_error("table index is nil"));
    }
    if k.is_rope() || k.is_substring() {
        k = LuaValue::string(l.vm_mut().resolve_str_value(k)?);
    }
    h.as_mut().raw_set(k, v);
    l.vm_mut()
        .gc
        .barrier_back(h.as_raw() as *mut crate::gc::GcHeader);
    l.push_value(t)?;
    Ok(1)
}

fn base_rawequal(l: &mut LuaState) -> LuaResult<i32> {
    let mut a = l.check_any(1)?;
    let mut b = l.check_any(2)?;
    if a.is_rope() || a.is_substring() {
        a = LuaValue::string(l.vm_mut().resolve_str_value(a)?);
    }
    if b.is_rope() || b.is_substring() {
        b = LuaValue::string(l.vm_mut().resolve_str_value(b)?);
    }
    l.push_boolean(a.raw_equal(&b))?;
    Ok(1)
}

fn base_rawlen(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    if let Some(len) = v.string_len() {
        l.push_number(len as f64)?;
    } else if let Some(h) = v.as_table() {
        l.push_number(h.as_ref().len() as f64)?;
    } else {
        return Err(l.runtime_error("table or string expected"));
    }
    Ok(1)
}

fn base_next(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 to 'next' (table expected)"));
    };
    let key = l.get_arg(2).unwrap_or(LuaValue::nil());
    match h.as_ref().next(&key) {
        Some((k, v)) => {
            l.push_value(k)?;
            l.push_value(v)?;
            Ok(2)
        }
        None => {
            l.push_nil()?;
            Ok(1)
        }
    }
}

fn base_pairs(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    if t.as_table().is_none() {
        return Err(l.runtime_error("bad argument #1 to 'pairs' (table expected)"));
    }
    let iter = l.vm_mut().new_cclosure(base_next, Vec::new());
    l.push_value(iter)?;
    l.push_value(t)?;
    l.push_nil()?;
    Ok(3)
}

fn ipairs_aux(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let i = l.check_any(2)?.as_number() as i64 + 1;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 (table expected)"));
    };
    let v = h.as_ref().raw_geti(i);
    if v.is_nil() {
        return Ok(0);
    }
    l.push_number(i as f64)?;
    l.push_value(v)?;
    Ok(2)
}

fn base_ipairs(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    if t.as_table().is_none() {
        return Err(l.runtime_error("bad argument #1 to 'ipairs' (table expected)"));
    }
    let iter = l.vm_mut().new_cclosure(ipairs_aux, Vec::new());
    l.push_value(iter)?;
    l.push_value(t)?;
    l.push_number(0.0)?;
    Ok(3)
}

fn base_setmetatable(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.check_any(1)?;
    let mt = l.check_any(2)?;
    let Some(h) = t.as_table() else {
        return Err(l.runtime_error("bad argument #1 to 'setmetatable' (table expected)"));
    };
    if !mt.is_nil() && mt.as_table().is_none() {
        return Err(l.runtime_error("bad argument #2 to 'setmetatable' (nil or table expected)"));
    }
    if let Some(old) = h.as_ref().metatable {
        let key = l.new_str_value("__metatable");
        if !old.as_ref().raw_get(&key).is_nil() {
            return Err(l.runtime_error("cannot change a protected metatable"));
        }
    }
    h.as_mut().metatable = mt.as_table();
    h.as_mut().invalidate_flags();
    l.vm_mut()
        .gc
        .barrier_back(h.as_raw() as *mut crate::gc::GcHeader);
    l.push_value(t)?;
    Ok(1)
}

fn base_getmetatable(l: &mut LuaState) -> LuaResult<i32> {
    let v = l.check_any(1)?;
    match get_metatable(&v) {
        None => l.push_nil()?,
        Some(mt) => {
            let key = l.new_str_value("__metatable");
            let protected = mt.as_ref().raw_get(&key);
            if !protected.is_nil() {
                l.push_value(protected)?;
            } else {
                l.push_value(LuaValue::table(mt))?;
            }
        }
    }
    Ok(1)
}

/// collectgarbage(opt, arg) with the classic option set.
fn base_collectgarbage(l: &mut LuaState) -> LuaResult<i32> {
    let opt = match l.get_arg(1) {
        Some(v) if v.is_string_like() => {
            let s = l.vm_mut().resolve_str_value(v)?;
            String::from_utf8_lossy(s.as_ref().bytes()).into_owned()
        }
        _ => "collect".to_string(),
    };
    let arg = match l.get_arg(2) {
        Some(v) if v.is_number() => v.as_number() as u32,
        _ => 0,
    };
    match opt.as_str() {
        "stop" => {
            l.vm_mut().gc_stop();
            l.push_number(0.0)?;
            Ok(1)
        }
        "restart" => {
            l.vm_mut().gc_restart();
            l.push_number(0.0)?;
            Ok(1)
        }
        "collect" => {
            l.vm_mut().gc_collect();
            l.push_number(0.0)?;
            Ok(1)
        }
        "count" => {
            let bytes = l.vm().gc_count_bytes();
            l.push_number(bytes as f64 / 1024.0)?;
            l.push_number((bytes % 1024) as f64)?;
            Ok(2)
        }
        "step" => {
            let did = l.vm_mut().gc_step();
            l.push_boolean(did)?;
            Ok(1)
        }
        "setpause" => {
            let old = l.vm_mut().gc_set_pause(arg);
            l.push_number(old as f64)?;
            Ok(1)
        }
        "setstepmul" => {
            let old = l.vm_mut().gc_set_stepmul(arg);
            l.push_number(old as f64)?;
            Ok(1)
        }
        "isrunning" => {
            let running = l.vm().gc_is_running();
            l.push_boolean(running)?;
            Ok(1)
        }
        // accepted for compatibility; the collector has a single mode
        "setmajorinc" | "generational" | "incremental" => {
            l.push_number(0.0)?;
            Ok(1)
        }
        _ => Err(l.runtime_error(format!("bad argument #1 to 'collectgarbage' (invalid option '{}')", opt))),
    }
}

fn base_print(l: &mut LuaState) -> LuaResult<i32> {
    use std::io::Write;
    let n = l.arg_count();
    let mut out = Vec::new();
    for i in 1..=n {
        let v = l.get_arg(i).unwrap_or(LuaValue::nil());
        let s = match tostring_value(l, v)? {
            Some(s) => {
                let sp = s.as_string().unwrap();
                String::from_utf8_lossy(sp.as_ref().bytes()).into_owned()
            }
            None => match v.tt() {
                crate::lua_value::TNIL => "nil".to_string(),
                crate::lua_value::TBOOLEAN => {
                    if v.as_boolean() { "true" } else { "false" }.to_string()
                }
                _ => format!("{}: {:p}", v.type_name(), v.as_pointer()),
            },
        };
        if i > 1 {
            out.push(b'\t');
        }
        out.extend_from_slice(s.as_bytes());
    }
    out.push(b'\n');
    let _ = std::io::stdout().write_all(&out);
    Ok(0)
}
