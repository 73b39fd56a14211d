// Library modules that sit directly on the core machinery.

pub mod basic;
pub mod coroutine;

use crate::lua_vm::LuaVM;

/// Open every bundled library into the globals table, whitelisting each
/// native entry point.
pub fn open_libs(vm: &mut LuaVM) {
    basic::open(vm);
    coroutine::open(vm);
}
