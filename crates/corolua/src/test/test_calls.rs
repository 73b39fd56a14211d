// Protected calls, error objects, handlers, the whitelist, stack limits.

use crate::lua_value::LuaValue;
use crate::lua_vm::OpCode::*;
use crate::lua_vm::do_call;
use crate::lua_vm::{CallFlags, LuaResult, LuaState, ThreadStatus};
use crate::test::helpers::*;

#[test]
fn pcall_returns_true_and_results() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let k = p.k_num(11.0);
    p.abx(LoadK, 0, k);
    p.abc(Return, 0, 3, 0); // two results: r0, r1(nil)
    let body = closure_of(&mut vm, p.build());
    let pcall = vm.get_global("pcall");
    let r = vm.pcall_values(pcall, &[body]).unwrap();
    assert!(r[0].as_boolean());
    assert_eq!(r[1].as_number(), 11.0);
    assert!(r[2].is_nil());
}

fn raise_table_error(l: &mut LuaState) -> LuaResult<i32> {
    let t = l.vm_mut().new_table(0, 1);
    let key = l.new_str_value("code");
    t.as_table()
        .unwrap()
        .as_mut()
        .raw_set(key, LuaValue::number(42.0));
    l.push_value(t)?;
    Err(do_call::throw(l, crate::lua_vm::LuaError::Run))
}

#[test]
fn pcall_preserves_non_string_error_objects() {
    let mut vm = new_vm();
    vm.register_native("boom", raise_table_error);
    let body = vm.get_global("boom");
    let pcall = vm.get_global("pcall");
    let r = vm.pcall_values(pcall, &[body]).unwrap();
    assert!(!r[0].as_boolean());
    let err = r[1].as_table().expect("error object is the table");
    let key = LuaValue::string(vm.new_str("code"));
    assert_eq!(err.as_ref().raw_get(&key).as_number(), 42.0);
}

fn prefixing_handler(l: &mut LuaState) -> LuaResult<i32> {
    let e = l.get_arg(1).unwrap_or(LuaValue::nil());
    let text = if e.is_string_like() {
        let s = l.vm_mut().resolve_str_value(e)?;
        String::from_utf8_lossy(s.as_ref().bytes()).into_owned()
    } else {
        "?".to_string()
    };
    l.push_str(&format!("caught:{}", text))?;
    Ok(1)
}

#[test]
fn xpcall_runs_the_handler_at_throw_time() {
    let mut vm = new_vm();
    vm.register_native("handler", prefixing_handler);

    // function() error("x") end
    let mut p = ProtoBuilder::new();
    let kerr = p.k_str(&mut vm, "error");
    let kx = p.k_str(&mut vm, "x");
    p.abx(GetGlobal, 0, kerr);
    p.abx(LoadK, 1, kx);
    p.abc(Call, 0, 2, 1);
    p.abc(Return, 0, 1, 0);
    let body = closure_of(&mut vm, p.build());

    let xpcall = vm.get_global("xpcall");
    let handler = vm.get_global("handler");
    let r = vm.pcall_values(xpcall, &[body, handler]).unwrap();
    assert!(!r[0].as_boolean());
    let msg = text_of(&mut vm, r[1]);
    assert!(msg.starts_with("caught:"), "got {:?}", msg);
    // error() prefixed the source position of its caller
    assert!(msg.contains("test:"), "got {:?}", msg);
    assert!(msg.ends_with(": x"), "got {:?}", msg);
}

fn broken_handler(l: &mut LuaState) -> LuaResult<i32> {
    Err(l.runtime_error("handler exploded"))
}

#[test]
fn error_inside_the_handler_is_terminal() {
    let mut vm = new_vm();
    vm.register_native("boom", raise_table_error);
    vm.register_native("bad_handler", broken_handler);
    let xpcall = vm.get_global("xpcall");
    let body = vm.get_global("boom");
    let handler = vm.get_global("bad_handler");
    let r = vm.pcall_values(xpcall, &[body, handler]).unwrap();
    assert!(!r[0].as_boolean());
    assert_eq!(text_of(&mut vm, r[1]), "error in error handling");
}

fn unregistered_native(l: &mut LuaState) -> LuaResult<i32> {
    l.push_number(1.0)?;
    Ok(1)
}

#[test]
fn unlisted_native_pointer_is_refused() {
    let mut vm = new_vm();
    // a closure around a pointer that never entered the whitelist
    let sneaky = vm.new_cclosure(unregistered_native, Vec::new());
    vm.set_global("sneaky", sneaky);

    let mut p = ProtoBuilder::new();
    let ks = p.k_str(&mut vm, "sneaky");
    p.abx(GetGlobal, 0, ks);
    p.abc(Call, 0, 1, 1);
    p.abc(Return, 0, 1, 0);
    let f = closure_of(&mut vm, p.build());

    let pcall = vm.get_global("pcall");
    let r = vm.pcall_values(pcall, &[f]).unwrap();
    assert!(!r[0].as_boolean());
    let msg = text_of(&mut vm, r[1]);
    assert!(
        msg.contains("attempt to call invalid C function"),
        "got {:?}",
        msg
    );
    // whitelisting fixes it
    vm.whitelist_native(unregistered_native);
    let f2 = vm.get_global("sneaky");
    let r = vm.pcall_values(f2, &[]).unwrap();
    assert_eq!(r[0].as_number(), 1.0);
}

#[test]
fn runaway_recursion_overflows_the_frame_stack() {
    let mut vm = new_vm();
    // function f() return 1 + f() end  (not a tail call)
    let mut p = ProtoBuilder::new();
    let kf = p.k_str(&mut vm, "f");
    let k1 = p.k_num(1.0);
    p.abx(GetGlobal, 0, kf);
    p.abc(Call, 0, 1, 2);
    let rk1 = crate::lua_vm::Instruction::rk(k1);
    p.abc(Add, 0, 0, rk1);
    p.abc(Return, 0, 2, 0);
    let f = closure_of(&mut vm, p.build());
    vm.set_global("f", f);

    let pcall = vm.get_global("pcall");
    let r = vm.pcall_values(pcall, &[f]).unwrap();
    assert!(!r[0].as_boolean());
    let msg = text_of(&mut vm, r[1]);
    assert!(msg.contains("stack overflow"), "got {:?}", msg);
}

#[test]
fn call_counter_is_restored_on_error_paths() {
    let mut vm = new_vm();
    vm.register_native("boom", raise_table_error);
    let before = vm.main_state().nccalls;
    let boom = vm.get_global("boom");
    let err = vm.pcall_values(boom, &[]);
    assert!(err.is_err());
    assert_eq!(vm.main_state().nccalls, before);
    let pcall = vm.get_global("pcall");
    let boom = vm.get_global("boom");
    let _ = vm.pcall_values(pcall, &[boom]).unwrap();
    assert_eq!(vm.main_state().nccalls, before);
}

#[test]
fn host_pcall_reports_status_and_error_object() {
    let mut vm = new_vm();
    vm.register_native("boom", raise_table_error);
    let boom = vm.get_global("boom");
    let (status, err) = vm.pcall_values(boom, &[]).unwrap_err();
    assert_eq!(status, ThreadStatus::ErrRun);
    assert!(err.is_table());
}

#[test]
fn noyield_turns_a_yield_attempt_into_an_error() {
    fn try_yield(l: &mut LuaState) -> LuaResult<i32> {
        Err(l.do_yield(0, 0))
    }
    let mut vm = new_vm();
    vm.register_native("try_yield", try_yield);
    let f = vm.get_global("try_yield");
    let dummy = vm.new_cclosure(try_yield, Vec::new());
    let co = vm.new_thread(dummy);
    let l = &mut co.as_thread().unwrap().as_mut().state;
    l.top = 0; // drop the parked body; drive the call by hand
    l.push_value(f).unwrap();
    let err = do_call::do_call(l, 0, 0, CallFlags::NOYIELD);
    assert_eq!(err, Err(crate::lua_vm::LuaError::Run));
    let msg_val = l.stack[l.top - 1];
    let msg = text_of(&mut vm, msg_val);
    assert!(
        msg.contains("attempt to yield across non-resumable call boundary"),
        "got {:?}",
        msg
    );
}
