// Interpreter: assembled prototypes exercising the opcode set.

use crate::lua_value::LuaValue;
use crate::lua_vm::OpCode::*;
use crate::lua_vm::{Instruction, TmKind, execute, get_metatable};
use crate::test::helpers::*;

#[test]
fn arithmetic_and_return() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let k1 = p.k_num(6.0);
    let k2 = p.k_num(7.0);
    p.abx(LoadK, 0, k1);
    p.abx(LoadK, 1, k2);
    p.abc(Mul, 2, 0, 1);
    p.abc(Return, 2, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].as_number(), 42.0);
}

#[test]
fn arith_coerces_numeric_strings() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let ks = p.k_str(&mut vm, "10");
    let kn = p.k_num(5.0);
    p.abx(LoadK, 0, ks);
    p.abx(LoadK, 1, kn);
    p.abc(Sub, 2, 0, 1);
    p.abc(Return, 2, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 5.0);
}

#[test]
fn numeric_for_loop_sums() {
    // local s = 0; for i = 1, 10 do s = s + i end; return s
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let k1 = p.k_num(1.0);
    let k10 = p.k_num(10.0);
    let k0 = p.k_num(0.0);
    p.abx(LoadK, 0, k1); // init
    p.abx(LoadK, 1, k10); // limit
    p.abx(LoadK, 2, k1); // step
    p.abx(LoadK, 4, k0); // acc
    p.asbx(ForPrep, 0, 1);
    p.abc(Add, 4, 4, 3); // acc = acc + i
    p.asbx(ForLoop, 0, -2);
    p.abc(Return, 4, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 55.0);
}

#[test]
fn concat_defers_to_a_rope() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let ka = p.k_str(&mut vm, "con");
    let kb = p.k_str(&mut vm, "cat");
    let kc = p.k_str(&mut vm, "enate");
    p.abx(LoadK, 0, ka);
    p.abx(LoadK, 1, kb);
    p.abx(LoadK, 2, kc);
    p.abc(Concat, 0, 0, 2);
    p.abc(Return, 0, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    // materialization is deferred until a consumer needs the bytes
    assert!(r[0].is_rope());
    assert_eq!(r[0].string_len(), Some(11));
    assert_eq!(text_of(&mut vm, r[0]), "concatenate");
}

#[test]
fn comparisons_resolve_ropes() {
    let mut vm = new_vm();
    vm.gc_stop();
    let a = LuaValue::string(vm.new_str("ab"));
    let b = LuaValue::string(vm.new_str("cd"));
    let rope = vm.concat_str(a, b).unwrap();
    let whole = LuaValue::string(vm.new_str("abcd"));
    let l = vm.main_state();
    let eq = execute::equal_obj(l, LuaValue::rope(rope), whole).unwrap();
    assert!(eq);
}

#[test]
fn closures_capture_open_upvalues() {
    // local x = 10; local f = function() x = 42 end; f(); return x
    let mut vm = new_vm();
    let mut inner = ProtoBuilder::new().nups(1);
    let k42 = inner.k_num(42.0);
    inner.abx(LoadK, 0, k42);
    inner.abc(SetUpval, 0, 0, 0);
    inner.abc(Return, 0, 1, 0);
    let inner = inner.build();

    let mut outer = ProtoBuilder::new();
    let k10 = outer.k_num(10.0);
    let pidx = outer.sub(inner);
    outer.abx(LoadK, 0, k10);
    outer.abx(Closure, 1, pidx);
    outer.abc(Move, 0, 0, 0); // capture local 0
    outer.abc(Move, 2, 1, 0);
    outer.abc(Call, 2, 1, 1);
    outer.abc(Return, 0, 2, 0);
    let f = closure_of(&mut vm, outer.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 42.0);
}

#[test]
fn globals_roundtrip() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let kname = p.k_str(&mut vm, "answer");
    let kv = p.k_num(41.0);
    let k1 = p.k_num(1.0);
    p.abx(LoadK, 0, kv);
    p.abx(SetGlobal, 0, kname);
    p.abx(GetGlobal, 1, kname);
    let rk1 = Instruction::rk(k1);
    p.abc(Add, 1, 1, rk1);
    p.abc(Return, 1, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 42.0);
    assert_eq!(vm.get_global("answer").as_number(), 41.0);
}

#[test]
fn generic_for_over_next() {
    // local s = 0; for k in next, t do s = s + k end; return s
    let mut vm = new_vm();
    let t = vm.new_table(3, 0);
    for i in 1..=3 {
        t.as_table().unwrap().as_mut().raw_seti(i, n(100.0));
    }
    vm.set_global("t", t);

    let mut p = ProtoBuilder::new();
    let k0 = p.k_num(0.0);
    let knext = p.k_str(&mut vm, "next");
    let kt = p.k_str(&mut vm, "t");
    p.abx(LoadK, 5, k0); // acc
    p.abx(GetGlobal, 0, knext);
    p.abx(GetGlobal, 1, kt);
    p.abc(LoadNil, 2, 2, 0);
    p.asbx(Jmp, 0, 1); // into TForLoop
    p.abc(Add, 5, 5, 3); // acc += key
    p.abc(TForLoop, 0, 0, 2);
    p.asbx(Jmp, 0, -3); // loop back to the body
    p.abc(Return, 5, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 6.0); // 1 + 2 + 3
}

#[test]
fn setlist_bulk_assigns() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new();
    let ka = p.k_num(7.0);
    let kb = p.k_num(8.0);
    let kc = p.k_num(9.0);
    p.abc(NewTable, 0, 0, 0);
    p.abx(LoadK, 1, ka);
    p.abx(LoadK, 2, kb);
    p.abx(LoadK, 3, kc);
    p.abc(SetList, 0, 3, 1);
    p.abc(Len, 1, 0, 0);
    p.abc(Return, 1, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 3.0);
}

#[test]
fn vararg_copies_extra_arguments() {
    let mut vm = new_vm();
    let mut p = ProtoBuilder::new().vararg();
    p.abc(Vararg, 0, 0, 0); // multret
    p.abc(Return, 0, 0, 0); // return all
    let f = closure_of(&mut vm, p.build());
    let r = vm
        .pcall_values(f, &[n(1.0), n(2.0), n(3.0)])
        .unwrap();
    assert_eq!(r.len(), 3);
    assert_eq!(r[2].as_number(), 3.0);
}

#[test]
fn tailcall_replaces_the_frame() {
    let mut vm = new_vm();
    let mut callee = ProtoBuilder::new();
    let k7 = callee.k_num(7.0);
    callee.abx(LoadK, 0, k7);
    callee.abc(Return, 0, 2, 0);
    let callee = closure_of(&mut vm, callee.build());
    vm.set_global("callee", callee);

    let mut p = ProtoBuilder::new();
    let kc = p.k_str(&mut vm, "callee");
    p.abx(GetGlobal, 0, kc);
    p.abc(TailCall, 0, 1, 0);
    p.abc(Return, 0, 0, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].as_number(), 7.0);
}

#[test]
fn metamethod_arithmetic_dispatch() {
    fn mm_add(l: &mut crate::LuaState) -> crate::LuaResult<i32> {
        l.push_number(99.0)?;
        Ok(1)
    }
    let mut vm = new_vm();
    let t = vm.new_table(0, 0);
    let mt = vm.new_table(0, 1);
    let add_fn = vm.new_cclosure(mm_add, Vec::new());
    vm.whitelist_native(mm_add);
    let key = LuaValue::string(vm.new_str("__add"));
    mt.as_table().unwrap().as_mut().raw_set(key, add_fn);
    t.as_table().unwrap().as_mut().metatable = mt.as_table();
    vm.set_global("t", t);

    let mut p = ProtoBuilder::new();
    let kt = p.k_str(&mut vm, "t");
    p.abx(GetGlobal, 0, kt);
    p.abx(GetGlobal, 1, kt);
    p.abc(Add, 2, 0, 1);
    p.abc(Return, 2, 2, 0);
    let f = closure_of(&mut vm, p.build());
    let r = vm.pcall_values(f, &[]).unwrap();
    assert_eq!(r[0].as_number(), 99.0);
}

#[test]
fn index_chain_is_bounded() {
    let mut vm = new_vm();
    // two tables whose __index chains point at each other
    let t1 = vm.new_table(0, 0);
    let t2 = vm.new_table(0, 0);
    let mt1 = vm.new_table(0, 1);
    let mt2 = vm.new_table(0, 1);
    let key = LuaValue::string(vm.new_str("__index"));
    mt1.as_table().unwrap().as_mut().raw_set(key, t2);
    mt2.as_table().unwrap().as_mut().raw_set(key, t1);
    t1.as_table().unwrap().as_mut().metatable = mt1.as_table();
    t2.as_table().unwrap().as_mut().metatable = mt2.as_table();

    let l = vm.main_state();
    let missing = l.new_str_value("missing");
    let dest = l.top;
    l.push_nil().unwrap();
    let err = execute::get_table(l, t1, missing, dest);
    assert!(err.is_err());
}

#[test]
fn index_chain_finds_inherited_fields() {
    let mut vm = new_vm();
    let base_tbl = vm.new_table(0, 1);
    let derived = vm.new_table(0, 0);
    let mt = vm.new_table(0, 1);
    let kidx = LuaValue::string(vm.new_str("__index"));
    let kfield = LuaValue::string(vm.new_str("field"));
    base_tbl.as_table().unwrap().as_mut().raw_set(kfield, n(123.0));
    mt.as_table().unwrap().as_mut().raw_set(kidx, base_tbl);
    derived.as_table().unwrap().as_mut().metatable = mt.as_table();
    assert!(get_metatable(&derived).is_some());

    let l = vm.main_state();
    let dest = l.top;
    l.push_nil().unwrap();
    execute::get_table(l, derived, kfield, dest).unwrap();
    assert_eq!(l.stack[dest].as_number(), 123.0);
    l.pop_value();

    // the absent-metamethod cache fills in for misses
    let l = vm.main_state();
    assert!(crate::lua_vm::fast_tm(l, derived.as_table().unwrap().as_ref().metatable, TmKind::NewIndex).is_none());
}
