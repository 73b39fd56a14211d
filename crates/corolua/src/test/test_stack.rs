// Stack growth and upvalue lifecycles.

use crate::lua_value::{LuaValue, UpvalState};
use crate::lua_vm::OpCode::*;
use crate::test::helpers::*;

#[test]
fn growth_keeps_open_upvalue_indices_valid() {
    let mut vm = new_vm();
    let l = vm.main_state();
    l.push_value(n(7.0)).unwrap();
    let uv = l.find_upval(0);
    assert_eq!(uv.as_ref().stack_index(), Some(0));
    // force several reallocations
    for i in 0..10_000 {
        l.push_value(n(i as f64)).unwrap();
    }
    assert_eq!(l.upval_get(uv).as_number(), 7.0);
    l.close_upvals(0);
    assert!(matches!(uv.as_ref().v, UpvalState::Closed(_)));
    assert_eq!(l.upval_get(uv).as_number(), 7.0);
    // cleanup
    l.top = 0;
}

#[test]
fn close_unlinks_in_descending_order() {
    let mut vm = new_vm();
    let l = vm.main_state();
    for i in 0..5 {
        l.push_value(n(i as f64)).unwrap();
    }
    let u1 = l.find_upval(1);
    let u3 = l.find_upval(3);
    let u4 = l.find_upval(4);
    assert_eq!(l.open_upvals.len(), 3);
    // list is sorted by descending stack index
    assert_eq!(l.open_upvals[0].as_ref().stack_index(), Some(4));
    l.close_upvals(3);
    assert!(!u3.as_ref().is_open());
    assert!(!u4.as_ref().is_open());
    assert!(u1.as_ref().is_open());
    assert_eq!(l.open_upvals.len(), 1);
    l.close_upvals(0);
    assert_eq!(l.upval_get(u1).as_number(), 1.0);
    l.top = 0;
}

#[test]
fn error_unwind_closes_upvalues_above_the_handler() {
    // local x = 5
    // getter = function() return x end
    // error("boom")
    let mut vm = new_vm();
    let mut inner = ProtoBuilder::new().nups(1);
    inner.abc(GetUpval, 0, 0, 0);
    inner.abc(Return, 0, 2, 0);
    let inner = inner.build();

    let mut p = ProtoBuilder::new();
    let k5 = p.k_num(5.0);
    let kg = p.k_str(&mut vm, "getter");
    let ke = p.k_str(&mut vm, "error");
    let kb = p.k_str(&mut vm, "boom");
    let pidx = p.sub(inner);
    p.abx(LoadK, 0, k5);
    p.abx(Closure, 1, pidx);
    p.abc(Move, 0, 0, 0); // capture x
    p.abx(SetGlobal, 1, kg);
    p.abx(GetGlobal, 1, ke);
    p.abx(LoadK, 2, kb);
    p.abc(Call, 1, 2, 1);
    p.abc(Return, 0, 1, 0);
    let f = closure_of(&mut vm, p.build());

    let err = vm.pcall_values(f, &[]);
    assert!(err.is_err());

    // the upvalue was closed during the unwind; the captured value lives
    let getter = vm.get_global("getter");
    let r = vm.pcall_values(getter, &[]).unwrap();
    assert_eq!(r[0].as_number(), 5.0);
    // nothing remains open on the main thread
    assert!(vm.main_state().open_upvals.is_empty());
}

#[test]
fn same_slot_shares_one_upvalue_cell() {
    let mut vm = new_vm();
    let l = vm.main_state();
    l.push_value(n(1.0)).unwrap();
    let a = l.find_upval(0);
    let b = l.find_upval(0);
    assert_eq!(a, b);
    l.close_upvals(0);
    l.top = 0;
}
