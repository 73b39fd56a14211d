// Embedding surface: chunk loading modes, collectgarbage options, number
// round-trips, the host lock.

use std::rc::Rc;

use crate::lua_value::{LuaValue, Proto, num_to_buf, str_to_num};
use crate::lua_vm::{LuaVM, ThreadStatus};
use crate::test::helpers::*;

fn trivial_loader(_vm: &mut LuaVM, _bytes: &[u8], name: &str) -> Result<Rc<Proto>, String> {
    let mut p = ProtoBuilder::new().source(&format!("@{}", name));
    let k = p.k_num(321.0);
    p.abx(crate::lua_vm::OpCode::LoadK, 0, k);
    p.abc(crate::lua_vm::OpCode::Return, 0, 2, 0);
    Ok(p.build())
}

#[test]
fn load_checks_the_signature_against_the_mode() {
    let mut vm = new_vm();
    vm.set_loaders(Some(trivial_loader), Some(trivial_loader));

    // binary chunk with a text-only mode
    let err = vm.load_chunk(b"\x1bLua\x51rest", "bin", "t").unwrap_err();
    assert_eq!(err.0, ThreadStatus::ErrSyntax);
    assert!(err.1.contains("attempt to load a binary chunk"), "{}", err.1);

    // text chunk with a binary-only mode
    let err = vm.load_chunk(b"return 1", "src", "b").unwrap_err();
    assert_eq!(err.0, ThreadStatus::ErrSyntax);
    assert!(err.1.contains("attempt to load a text chunk"), "{}", err.1);

    // permissive mode accepts both
    let f = vm.load_chunk(b"return 1", "src", "bt").unwrap();
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 321.0);
    let f = vm.load_chunk(b"\x1bLua\x51rest", "bin", "bt").unwrap();
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 321.0);
}

#[test]
fn collectgarbage_option_surface() {
    let mut vm = new_vm();
    let cg = vm.get_global("collectgarbage");

    let count_key = LuaValue::string(vm.new_str("count"));
    let r = vm.pcall_values(cg, &[count_key]).unwrap();
    assert_eq!(r.len(), 2);
    let kb = r[0].as_number();
    let bytes = r[1].as_number();
    assert!(kb > 0.0);
    assert!((0.0..1024.0).contains(&bytes));

    let stop_key = LuaValue::string(vm.new_str("stop"));
    let _ = vm.pcall_values(cg, &[stop_key]).unwrap();
    assert!(!vm.gc_is_running());
    let run_key = LuaValue::string(vm.new_str("isrunning"));
    let r = vm.pcall_values(cg, &[run_key]).unwrap();
    assert!(!r[0].as_boolean());
    let restart_key = LuaValue::string(vm.new_str("restart"));
    let _ = vm.pcall_values(cg, &[restart_key]).unwrap();
    assert!(vm.gc_is_running());

    let bad = LuaValue::string(vm.new_str("definitely-not-an-option"));
    assert!(vm.pcall_values(cg, &[bad]).is_err());
}

#[test]
fn collection_keeps_rooted_structures() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 4);
    let key = LuaValue::string(vm.new_str("deep"));
    let inner = vm.new_table(0, 1);
    inner.as_table().unwrap().as_mut().raw_seti(1, n(77.0));
    t.as_table().unwrap().as_mut().raw_set(key, inner);
    vm.set_global("keep", t);
    // some garbage
    for i in 0..500 {
        let s = format!("garbage-{}", i);
        let _ = vm.new_str(&s);
        let _ = vm.new_table(4, 4);
    }
    vm.gc_collect();
    vm.gc_collect();
    let t = vm.get_global("keep");
    let inner = t.as_table().unwrap().as_ref().raw_get(&key);
    assert_eq!(inner.as_table().unwrap().as_ref().raw_geti(1).as_number(), 77.0);
}

#[test]
fn number_text_roundtrips() {
    for n in [0.0, 1.0, -1.0, 0.5, 1e15, 123456.789, -7.25] {
        let text = num_to_buf(n);
        let back = str_to_num(text.as_bytes()).expect(&text);
        assert_eq!(back, n, "roundtrip of {}", text);
    }
    assert_eq!(str_to_num(b"  0x10  "), Some(16.0));
    assert_eq!(str_to_num(b"1e3"), Some(1000.0));
    assert_eq!(str_to_num(b"not a number"), None);
    assert_eq!(str_to_num(b"12trailing"), None);
    // non-numeral float spellings are rejected, not parsed
    assert_eq!(str_to_num(b"nan"), None);
    assert_eq!(str_to_num(b"inf"), None);
    assert_eq!(str_to_num(b"-inf"), None);
    assert_eq!(str_to_num(b"Infinity"), None);
    assert_eq!(num_to_buf(3.0), "3");
    assert_eq!(num_to_buf(-0.0), "-0");
}

#[test]
fn host_lock_tolerates_nested_unlocks() {
    let mut vm = LuaVM::new();
    vm.lock.lock();
    assert!(vm.lock.is_locked());
    vm.lock.lock(); // second acquire is a no-op
    vm.lock.unlock();
    assert!(!vm.lock.is_locked());
    vm.lock.unlock(); // second release is ignored
    assert!(!vm.lock.is_locked());
    vm.lock.lock();
    assert!(vm.lock.is_locked());
    vm.lock.unlock();
}

#[test]
fn tostring_and_tonumber_cooperate() {
    let mut vm = new_vm();
    let tostring = vm.get_global("tostring");
    let tonumber = vm.get_global("tonumber");
    let r = vm.pcall_values(tostring, &[n(42.5)]).unwrap();
    assert_eq!(text_of(&mut vm, r[0]), "42.5");
    let r = vm.pcall_values(tonumber, &[r[0]]).unwrap();
    assert_eq!(r[0].as_number(), 42.5);
    // base conversion
    let ff = LuaValue::string(vm.new_str("ff"));
    let r = vm.pcall_values(tonumber, &[ff, n(16.0)]).unwrap();
    assert_eq!(r[0].as_number(), 255.0);
}
