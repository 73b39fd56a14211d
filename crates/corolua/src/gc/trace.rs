// Stop-the-world mark-and-sweep over the all-objects list.
//
// Short strings live in the string table and are swept there; rope and
// substring nodes are unlinked here but their memory goes back to the
// cluster bitmaps, with empty clusters released at the end of the sweep.

use crate::gc::{GcHeader, object_size};
use crate::lua_string::{GcRope, GcStr, GcSubStr};
use crate::lua_table::LuaTable;
use crate::lua_value::{
    ClosureKind, GcClosure, GcUpval, GcUserdata, LuaValue, Proto, TLNGSTR, TLUACL, TNATCL, TROPE,
    TSHRSTR, TSUBSTR, TTABLE, TTHREAD, TUPVAL, TUSERDATA, UpvalState,
};
use crate::lua_vm::{GcThread, LuaVM};

/// Run a full collection cycle.
pub fn collect(vm: &mut LuaVM) {
    // flip whites: everything existing now carries the dead white
    vm.gc.current_white ^= 1;
    let mut worklist: Vec<*mut GcHeader> = Vec::with_capacity(128);

    mark_value(&vm.globals, &mut worklist);
    mark_value(&vm.registry, &mut worklist);
    mark_value(&vm.memerrmsg, &mut worklist);
    for s in &vm.tm_names {
        mark_header(s.as_raw() as *mut GcHeader, &mut worklist);
    }
    mark_header(vm.main.as_raw() as *mut GcHeader, &mut worklist);
    for t in &vm.resume_roots {
        mark_header(t.as_raw() as *mut GcHeader, &mut worklist);
    }

    while let Some(h) = worklist.pop() {
        traverse(h, &mut worklist);
    }

    sweep(vm);
    vm.gc.rearm();
}

#[inline]
fn mark_value(v: &LuaValue, worklist: &mut Vec<*mut GcHeader>) {
    if let Some(h) = v.as_gc_header() {
        mark_header(h, worklist);
    }
}

#[inline]
fn mark_header(h: *mut GcHeader, worklist: &mut Vec<*mut GcHeader>) {
    let header = unsafe { &mut *h };
    if header.is_white() {
        header.make_black();
        worklist.push(h);
    }
}

fn traverse(h: *mut GcHeader, wl: &mut Vec<*mut GcHeader>) {
    let tt = unsafe { (*h).tt };
    match tt {
        TSHRSTR | TLNGSTR => {}
        TROPE => {
            let r = unsafe { &*(h as *const GcRope) };
            if !r.left.is_null() {
                mark_header(r.left, wl);
            }
            if !r.right.is_null() {
                mark_header(r.right, wl);
            }
            if !r.res.is_null() {
                mark_header(r.res as *mut GcHeader, wl);
            }
        }
        TSUBSTR => {
            let s = unsafe { &*(h as *const GcSubStr) };
            mark_header(s.parent.as_raw() as *mut GcHeader, wl);
        }
        TTABLE => {
            let t = unsafe { &*(h as *const LuaTable) };
            for (k, v) in t.iter_entries() {
                mark_value(&k, wl);
                mark_value(&v, wl);
            }
            if let Some(mt) = t.metatable {
                mark_header(mt.as_raw() as *mut GcHeader, wl);
            }
        }
        TLUACL | TNATCL => {
            let c = unsafe { &*(h as *const GcClosure) };
            match &c.kind {
                ClosureKind::Lua(lcl) => {
                    mark_header(lcl.env.as_raw() as *mut GcHeader, wl);
                    for uv in &lcl.upvals {
                        mark_header(uv.as_raw() as *mut GcHeader, wl);
                    }
                    mark_proto(&lcl.proto, wl);
                }
                ClosureKind::Native(ccl) => {
                    mark_header(ccl.env.as_raw() as *mut GcHeader, wl);
                    for v in &ccl.upvals {
                        mark_value(v, wl);
                    }
                }
            }
        }
        TUSERDATA => {
            let u = unsafe { &*(h as *const GcUserdata) };
            if let Some(mt) = u.metatable {
                mark_header(mt.as_raw() as *mut GcHeader, wl);
            }
            if let Some(env) = u.env {
                mark_header(env.as_raw() as *mut GcHeader, wl);
            }
        }
        TTHREAD => {
            let t = unsafe { &*(h as *const GcThread) };
            let l = &t.state;
            // live registers extend to the deepest frame ceiling
            let mut limit = l.top;
            for i in 0..=l.ci_idx {
                limit = limit.max(l.ci[i].top).max(l.ci[i].func + 1);
            }
            let limit = limit.min(l.stack.len());
            for v in &l.stack[..limit] {
                mark_value(v, wl);
            }
            for uv in &l.open_upvals {
                mark_header(uv.as_raw() as *mut GcHeader, wl);
            }
        }
        TUPVAL => {
            let u = unsafe { &*(h as *const GcUpval) };
            if let UpvalState::Closed(v) = &u.v {
                mark_value(v, wl);
            }
        }
        _ => {}
    }
}

/// Prototypes are shared via `Rc` and not themselves collected, but their
/// constants and debug names pin interned strings.
fn mark_proto(p: &Proto, wl: &mut Vec<*mut GcHeader>) {
    for k in &p.constants {
        mark_value(k, wl);
    }
    for sub in &p.protos {
        mark_proto(sub, wl);
    }
}

fn sweep(vm: &mut LuaVM) {
    let other = vm.gc.other_white();
    let current = vm.gc.current_white;

    vm.gc.sweeping_strings = true;
    let freed_strings = vm.strt.sweep(other, current);
    vm.gc.total_bytes = vm
        .gc
        .total_bytes
        .saturating_sub(freed_strings * object_size(TSHRSTR, 16));
    vm.gc.sweeping_strings = false;

    let mut prev: *mut GcHeader = std::ptr::null_mut();
    let mut h = vm.gc.allgc;
    while !h.is_null() {
        let next = unsafe { (*h).next };
        let dead = unsafe { (*h).is_dead(other) };
        if dead {
            if prev.is_null() {
                vm.gc.allgc = next;
            } else {
                unsafe { (*prev).next = next };
            }
            free_object(vm, h);
        } else {
            unsafe { (*h).make_white(current) };
            prev = h;
        }
        h = next;
    }

    vm.free_clusters();
}

fn free_object(vm: &mut LuaVM, h: *mut GcHeader) {
    let tt = unsafe { (*h).tt };
    unsafe {
        match tt {
            TLNGSTR => {
                let len = (*(h as *const GcStr)).len();
                drop(Box::from_raw(h as *mut GcStr));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, len));
            }
            TROPE => vm.free_rope(h as *mut GcRope),
            TSUBSTR => vm.free_substr(h as *mut GcSubStr),
            TTABLE => {
                drop(Box::from_raw(h as *mut LuaTable));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, 0));
            }
            TLUACL | TNATCL => {
                drop(Box::from_raw(h as *mut GcClosure));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, 0));
            }
            TUSERDATA => {
                drop(Box::from_raw(h as *mut GcUserdata));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, 0));
            }
            TTHREAD => {
                drop(Box::from_raw(h as *mut GcThread));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, 0));
            }
            TUPVAL => {
                drop(Box::from_raw(h as *mut GcUpval));
                vm.gc.total_bytes = vm.gc.total_bytes.saturating_sub(object_size(tt, 0));
            }
            _ => {}
        }
    }
}

/// Teardown: release every object regardless of colour. Cluster slabs and
/// the string table free their own contents in their `Drop` impls.
pub(crate) fn free_all(vm: &mut LuaVM) {
    let mut h = vm.gc.allgc;
    vm.gc.allgc = std::ptr::null_mut();
    while !h.is_null() {
        let next = unsafe { (*h).next };
        let tt = unsafe { (*h).tt };
        if tt != TROPE && tt != TSUBSTR {
            free_object(vm, h);
        }
        h = next;
    }
}
