// Table collaborator: borders, iteration, unpack law.

use crate::lua_value::LuaValue;
use crate::test::helpers::*;

#[test]
fn sequence_border_and_len() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 0);
    let h = t.as_table().unwrap();
    for i in 1..=5 {
        h.as_mut().raw_seti(i, n(i as f64 * 10.0));
    }
    assert_eq!(h.as_ref().len(), 5);
    // a hole at the end lowers the border
    h.as_mut().raw_seti(5, LuaValue::nil());
    assert_eq!(h.as_ref().len(), 4);
}

#[test]
fn hash_part_continues_the_sequence() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 0);
    let h = t.as_table().unwrap();
    // out-of-order inserts migrate into the array part on append
    h.as_mut().raw_seti(2, n(2.0));
    h.as_mut().raw_seti(1, n(1.0));
    h.as_mut().raw_seti(3, n(3.0));
    assert_eq!(h.as_ref().len(), 3);
    assert!(h.as_ref().raw_geti(2).raw_equal(&n(2.0)));
}

#[test]
fn string_keys_by_content() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 4);
    let h = t.as_table().unwrap();
    let k1 = LuaValue::string(vm.new_str("key"));
    h.as_mut().raw_set(k1, n(1.0));
    let k2 = LuaValue::string(vm.new_str("key"));
    assert!(h.as_ref().raw_get(&k2).raw_equal(&n(1.0)));
}

#[test]
fn next_visits_every_entry_once() {
    let mut vm = new_vm();
    let t = vm.new_table(0, 0);
    let h = t.as_table().unwrap();
    for i in 1..=3 {
        h.as_mut().raw_seti(i, n(i as f64));
    }
    let k = LuaValue::string(vm.new_str("name"));
    h.as_mut().raw_set(k, n(99.0));
    let mut seen = 0;
    let mut sum = 0.0;
    let mut key = LuaValue::nil();
    while let Some((next_key, v)) = h.as_ref().next(&key) {
        seen += 1;
        sum += v.as_number();
        key = next_key;
    }
    assert_eq!(seen, 4);
    assert_eq!(sum, 1.0 + 2.0 + 3.0 + 99.0);
}

#[test]
fn unpack_yields_the_sequence_in_order() {
    let mut vm = new_vm();
    let t = vm.new_table(4, 0);
    let h = t.as_table().unwrap();
    for i in 1..=4 {
        h.as_mut().raw_seti(i, n(i as f64 * 2.0));
    }
    let unpack = vm.get_global("unpack");
    let results = vm.pcall_values(unpack, &[t]).expect("unpack");
    assert_eq!(results.len(), 4);
    for (i, v) in results.iter().enumerate() {
        assert_eq!(v.as_number(), (i as f64 + 1.0) * 2.0);
    }
}
