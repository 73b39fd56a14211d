// The bytecode interpreter and its value primitives: table access with
// metamethod chains, arithmetic and comparison dispatch, rope-based
// concatenation, and the opcode-finishing logic used when a suspended
// scripted frame is re-entered.

use std::rc::Rc;

use crate::lua_string::{MAX_STR_LEN, str_cmp};
use crate::lua_value::{LuaValue, Proto, num_to_buf, str_to_num, fb2int};
use crate::lua_vm::do_call::{self, MULTRET, Precall};
use crate::lua_vm::lua_state::{HookEvent, HookMask, LuaState};
use crate::lua_vm::{
    CallFlags, FIELDS_PER_FLUSH, HALT_ERROR, HALT_NONE, Instruction, LuaError, LuaResult, OpCode,
    TmKind, fast_tm, get_tm_by_obj,
};

/// Limit for metamethod chains in gettable/settable.
pub const MAXTAGLOOP: usize = 100;

#[inline]
fn current_proto(l: &LuaState) -> Rc<Proto> {
    let func = l.stack[l.ci().func];
    func.as_closure()
        .and_then(|c| c.as_ref().as_lua().map(|lc| lc.proto.clone()))
        .expect("scripted frame without prototype")
}

// ============ Coercions ============

/// Number coercion: numbers pass through, string-family values resolve
/// and parse.
pub fn coerce_number(l: &mut LuaState, v: &LuaValue) -> Option<f64> {
    if v.is_number() {
        return Some(v.as_number());
    }
    if v.is_string_like() {
        let s = l.vm_mut().resolve_str_value(*v).ok()?;
        return str_to_num(s.as_ref().bytes());
    }
    None
}

/// String coercion in place. Ropes and substrings stay lazy (they already
/// carry string semantics); numbers turn into their numeral.
fn coerce_tostring(l: &mut LuaState, idx: usize) -> bool {
    let v = l.stack[idx];
    if v.is_string_like() {
        return true;
    }
    if v.is_number() {
        let s = num_to_buf(v.as_number());
        l.stack[idx] = l.new_str_value(&s);
        return true;
    }
    false
}

/// `tostring` for the public surface: any string-family value becomes a
/// concrete string, numbers format.
pub fn tostring_value(l: &mut LuaState, v: LuaValue) -> LuaResult<Option<LuaValue>> {
    if v.is_string_like() {
        let s = l.vm_mut().resolve_str_value(v)?;
        return Ok(Some(LuaValue::string(s)));
    }
    if v.is_number() {
        let s = num_to_buf(v.as_number());
        return Ok(Some(l.new_str_value(&s)));
    }
    Ok(None)
}

fn resolve_value(l: &mut LuaState, v: LuaValue) -> LuaResult<LuaValue> {
    if v.is_rope() || v.is_substring() {
        let s = l.vm_mut().resolve_str_value(v)?;
        Ok(LuaValue::string(s))
    } else {
        Ok(v)
    }
}

// ============ Metamethod calls ============

/// Call metamethod `f(p1, p2)` and store its single result at `dest`.
pub fn call_tm_res(
    l: &mut LuaState,
    dest: usize,
    f: LuaValue,
    p1: LuaValue,
    p2: LuaValue,
) -> LuaResult<()> {
    l.check_stack(3)?;
    l.stack[l.top] = f;
    l.stack[l.top + 1] = p1;
    l.stack[l.top + 2] = p2;
    l.top += 3;
    do_call::do_call(l, l.top - 3, 1, CallFlags::empty())?;
    l.top -= 1;
    let result = l.stack[l.top];
    l.stack[l.top] = LuaValue::nil();
    l.stack[dest] = result;
    Ok(())
}

/// Call metamethod `f(p1, p2, p3)` discarding results.
fn call_tm(l: &mut LuaState, f: LuaValue, p1: LuaValue, p2: LuaValue, p3: LuaValue) -> LuaResult<()> {
    l.check_stack(4)?;
    l.stack[l.top] = f;
    l.stack[l.top + 1] = p1;
    l.stack[l.top + 2] = p2;
    l.stack[l.top + 3] = p3;
    l.top += 4;
    do_call::do_call(l, l.top - 4, 0, CallFlags::empty())
}

/// Binary metamethod on the first operand, falling back to the second.
fn call_bin_tm(
    l: &mut LuaState,
    p1: LuaValue,
    p2: LuaValue,
    dest: usize,
    event: TmKind,
) -> LuaResult<bool> {
    let tm = match get_tm_by_obj(l, &p1, event) {
        Some(tm) => tm,
        None => match get_tm_by_obj(l, &p2, event) {
            Some(tm) => tm,
            None => return Ok(false),
        },
    };
    call_tm_res(l, dest, tm, p1, p2)?;
    Ok(true)
}

/// Comparison metamethod shared by both operands' metatables.
fn get_comp_tm(l: &mut LuaState, a: &LuaValue, b: &LuaValue, event: TmKind) -> Option<LuaValue> {
    let mt1 = crate::lua_vm::get_metatable(a);
    let tm1 = fast_tm(l, mt1, event)?;
    let mt2 = crate::lua_vm::get_metatable(b);
    if mt1 == mt2 {
        return Some(tm1);
    }
    let tm2 = fast_tm(l, mt2, event)?;
    if tm1.raw_equal(&tm2) { Some(tm1) } else { None }
}

/// Order metamethod call; `None` when the operands do not share one.
fn call_order_tm(
    l: &mut LuaState,
    p1: LuaValue,
    p2: LuaValue,
    event: TmKind,
) -> LuaResult<Option<bool>> {
    let Some(tm1) = get_tm_by_obj(l, &p1, event) else {
        return Ok(None);
    };
    let tm2 = get_tm_by_obj(l, &p2, event);
    if !matches!(tm2, Some(t) if t.raw_equal(&tm1)) {
        return Ok(None);
    }
    l.check_stack(1)?;
    let res_idx = l.top;
    call_tm_res(l, res_idx, tm1, p1, p2)?;
    Ok(Some(!l.stack[res_idx].is_false()))
}

// ============ Table access ============

/// Indexing with the `__index` chain, bounded by MAXTAGLOOP.
pub fn get_table(l: &mut LuaState, t: LuaValue, key: LuaValue, dest: usize) -> LuaResult<()> {
    let key = resolve_value(l, key)?;
    let mut t = t;
    for _ in 0..MAXTAGLOOP {
        let tm;
        if let Some(h) = t.as_table() {
            let res = h.as_ref().raw_get(&key);
            if !res.is_nil() {
                l.stack[dest] = res;
                return Ok(());
            }
            match fast_tm(l, h.as_ref().metatable, TmKind::Index) {
                None => {
                    l.stack[dest] = LuaValue::nil();
                    return Ok(());
                }
                Some(m) => tm = m,
            }
        } else {
            match get_tm_by_obj(l, &t, TmKind::Index) {
                None => return Err(l.type_error(&t, "index")),
                Some(m) => tm = m,
            }
        }
        if tm.is_function() {
            return call_tm_res(l, dest, tm, t, key);
        }
        t = tm;
    }
    Err(l.vm_error("loop in gettable"))
}

/// Assignment with the `__newindex` chain.
pub fn set_table(l: &mut LuaState, t: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
    let key = resolve_value(l, key)?;
    let mut t = t;
    for _ in 0..MAXTAGLOOP {
        let tm;
        if let Some(h) = t.as_table() {
            let old = h.as_ref().raw_get(&key);
            let absent_tm = fast_tm(l, h.as_ref().metatable, TmKind::NewIndex).is_none();
            if !old.is_nil() || absent_tm {
                if key.is_nil() {
                    return Err(l.vm_error("table index is nil"));
                }
                if key.is_number() && key.as_number().is_nan() {
                    return Err(l.vm_error("table index is NaN"));
                }
                let ht = h.as_mut();
                ht.raw_set(key, value);
                ht.invalidate_flags();
                l.vm_mut()
                    .gc
                    .barrier_back(h.as_raw() as *mut crate::gc::GcHeader);
                return Ok(());
            }
            tm = fast_tm(l, h.as_ref().metatable, TmKind::NewIndex).unwrap();
        } else {
            match get_tm_by_obj(l, &t, TmKind::NewIndex) {
                None => return Err(l.type_error(&t, "index")),
                Some(m) => tm = m,
            }
        }
        if tm.is_function() {
            return call_tm(l, tm, t, key, value);
        }
        t = tm;
    }
    Err(l.vm_error("loop in settable"))
}

// ============ Comparison ============

/// Primitive equality after rope resolution, with `__eq` for tables and
/// userdata that share the metamethod.
pub fn equal_obj(l: &mut LuaState, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    let a = resolve_value(l, a)?;
    let b = resolve_value(l, b)?;
    if a.base_type() != b.base_type() {
        return Ok(false);
    }
    if a.raw_equal(&b) {
        return Ok(true);
    }
    if a.is_table() || a.is_userdata() {
        let Some(tm) = get_comp_tm(l, &a, &b, TmKind::Eq) else {
            return Ok(false);
        };
        l.check_stack(1)?;
        let res_idx = l.top;
        call_tm_res(l, res_idx, tm, a, b)?;
        return Ok(!l.stack[res_idx].is_false());
    }
    Ok(false)
}

pub fn less_than(l: &mut LuaState, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    let a = resolve_value(l, a)?;
    let b = resolve_value(l, b)?;
    if a.base_type() != b.base_type() {
        return Err(l.order_error(&a, &b));
    }
    if a.is_number() {
        return Ok(a.as_number() < b.as_number());
    }
    if a.is_string() {
        return Ok(str_cmp(a.as_string().unwrap(), b.as_string().unwrap()).is_lt());
    }
    match call_order_tm(l, a, b, TmKind::Lt)? {
        Some(r) => Ok(r),
        None => Err(l.order_error(&a, &b)),
    }
}

/// `<=`: numbers and strings directly, `__le`, then negated reversed
/// `__lt`.
pub fn less_equal(l: &mut LuaState, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    let a = resolve_value(l, a)?;
    let b = resolve_value(l, b)?;
    if a.base_type() != b.base_type() {
        return Err(l.order_error(&a, &b));
    }
    if a.is_number() {
        return Ok(a.as_number() <= b.as_number());
    }
    if a.is_string() {
        return Ok(str_cmp(a.as_string().unwrap(), b.as_string().unwrap()).is_le());
    }
    if let Some(r) = call_order_tm(l, a, b, TmKind::Le)? {
        return Ok(r);
    }
    match call_order_tm(l, b, a, TmKind::Lt)? {
        Some(r) => Ok(!r),
        None => Err(l.order_error(&a, &b)),
    }
}

// ============ Arithmetic ============

fn num_mod(a: f64, b: f64) -> f64 {
    let q = a % b;
    if q != 0.0 && (a < 0.0) != (b < 0.0) { q + b } else { q }
}

fn apply_arith(event: TmKind, a: f64, b: f64) -> f64 {
    match event {
        TmKind::Add => a + b,
        TmKind::Sub => a - b,
        TmKind::Mul => a * b,
        TmKind::Div => a / b,
        TmKind::Mod => num_mod(a, b),
        TmKind::Pow => a.powf(b),
        TmKind::Unm => -a,
        _ => unreachable!("non-arithmetic event"),
    }
}

/// Slow arithmetic path: string coercion, then the operator metamethod.
fn arith(
    l: &mut LuaState,
    dest: usize,
    rb: LuaValue,
    rc: LuaValue,
    event: TmKind,
) -> LuaResult<()> {
    let nb = coerce_number(l, &rb);
    let nc = coerce_number(l, &rc);
    if let (Some(nb), Some(nc)) = (nb, nc) {
        l.stack[dest] = LuaValue::number(apply_arith(event, nb, nc));
        return Ok(());
    }
    if !call_bin_tm(l, rb, rc, dest, event)? {
        return Err(l.arith_error(&rb, &rc));
    }
    Ok(())
}

// ============ Concatenation ============

/// Build a balanced rope tree over `len` string-family stack slots
/// starting at `start`, with 2/3 fanout at the leaves.
fn make_rope(l: &mut LuaState, start: usize, len: usize) -> LuaResult<LuaValue> {
    match len {
        1 => Ok(l.stack[start]),
        2 => {
            let r = l.vm_mut().concat_str(l.stack[start], l.stack[start + 1])?;
            Ok(LuaValue::rope(r))
        }
        3 => {
            let right = l
                .vm_mut()
                .concat_str(l.stack[start + 1], l.stack[start + 2])?;
            let r = l
                .vm_mut()
                .concat_str(l.stack[start], LuaValue::rope(right))?;
            Ok(LuaValue::rope(r))
        }
        _ => {
            let half = len / 2;
            let left = make_rope(l, start, half)?;
            let right = make_rope(l, start + half, len - half)?;
            // both halves are freshly built ropes; stash left while the
            // right half may have allocated
            let r = l.vm_mut().concat_str(left, right)?;
            Ok(LuaValue::rope(r))
        }
    }
}

/// Fold `total` values ending at register `last` into one value, creating
/// ropes for string runs and calling `__concat` elsewhere. The fold index
/// is parked on the stack as a light userdata before a metamethod call so
/// a yield inside it can resume the fold.
pub fn concat(l: &mut LuaState, mut total: usize, mut last: usize) -> LuaResult<()> {
    loop {
        let top = l.base + last + 1;
        let mut n = 2;
        let first_ok = {
            let v = l.stack[top - 2];
            v.is_string_like() || v.is_number()
        };
        if !first_ok || !coerce_tostring(l, top - 1) {
            // metamethod; park the fold position for a possible resume
            l.check_stack(1)?;
            l.stack[l.top] = LuaValue::light_userdata((last - 1) as *mut std::ffi::c_void);
            l.top += 1;
            let p1 = l.stack[top - 2];
            let p2 = l.stack[top - 1];
            if !call_bin_tm(l, p1, p2, top - 2, TmKind::Concat)? {
                return Err(l.concat_error(&p1, &p2));
            }
            l.top -= 1;
            l.stack[l.top] = LuaValue::nil();
        } else if l.stack[top - 1].string_len() == Some(0) {
            // second operand empty: result is the first operand as string
            coerce_tostring(l, top - 2);
        } else {
            // collect the run of stringable operands below and fold
            let mut tl = l.stack[top - 1].string_len().unwrap_or(0);
            n = 1;
            while n < total {
                let idx = top - n - 1;
                if !(l.stack[idx].is_string_like() || coerce_tostring(l, idx)) {
                    break;
                }
                let len = l.stack[idx].string_len().unwrap_or(0);
                if len >= MAX_STR_LEN - tl {
                    return Err(l.vm_error("string length overflow"));
                }
                tl += len;
                n += 1;
            }
            let rope = make_rope(l, top - n, n)?;
            l.stack[top - n] = rope;
        }
        total -= n - 1;
        last -= n - 1;
        if total <= 1 {
            return Ok(());
        }
    }
}

// ============ Length ============

fn length_of(l: &mut LuaState, rb: LuaValue, dest: usize) -> LuaResult<()> {
    if let Some(len) = rb.string_len() {
        l.stack[dest] = LuaValue::number(len as f64);
        return Ok(());
    }
    if rb.is_table() {
        if !call_bin_tm(l, rb, LuaValue::nil(), dest, TmKind::Len)? {
            let n = rb.as_table().unwrap().as_ref().len();
            l.stack[dest] = LuaValue::number(n as f64);
        }
        return Ok(());
    }
    if !call_bin_tm(l, rb, LuaValue::nil(), dest, TmKind::Len)? {
        return Err(l.type_error(&rb, "get length of"));
    }
    Ok(())
}

// ============ Halt ============

/// Mode-2 halt: synthesize "chunkid:line: message" and raise it as a
/// runtime error, clearing the latch.
fn halt_error(l: &mut LuaState) -> LuaError {
    let msg = l.vm_mut().haltmessage.take();
    l.vm_mut().haltstate = HALT_NONE;
    match msg {
        Some(m) => {
            let whre = l.where_str(0);
            let v = l.new_str_value(&format!("{}{}", whre, m));
            let _ = l.push_value(v);
        }
        None => {
            let _ = l.push_value(LuaValue::nil());
        }
    }
    do_call::throw(l, LuaError::Run)
}

// ============ Hooks ============

/// Count and line hooks, deduplicated per instruction through
/// `hook_called_mask` so a hook that yielded does not re-fire when the
/// instruction restarts.
fn traceexec(l: &mut LuaState, pc: usize, proto: &Proto) -> LuaResult<usize> {
    const CALLED_COUNT: u8 = 1;
    const CALLED_LINE: u8 = 2;
    let mask = l.hookmask;
    let old_pc = l.ci().saved_pc;
    l.ci_mut().saved_pc = (pc - 1) as u32;
    if mask.contains(HookMask::COUNT) && l.ci().hook_called_mask & CALLED_COUNT == 0 {
        if l.hookcount > 0 {
            l.hookcount -= 1;
        }
        if l.hookcount == 0 {
            l.hookcount = l.base_hookcount;
            l.ci_mut().hook_called_mask |= CALLED_COUNT;
            do_call::call_hook(l, HookEvent::Count)?;
        }
    }
    if mask.contains(HookMask::LINE) && l.ci().hook_called_mask & CALLED_LINE == 0 {
        let npc = pc - 1;
        let newline = proto.line_at(npc);
        // enter of a function, a backward jump, or a new line
        if npc == 0 || npc <= old_pc as usize || newline != proto.line_at(old_pc as usize) {
            l.ci_mut().hook_called_mask |= CALLED_LINE;
            do_call::call_hook(l, HookEvent::Line(newline))?;
        }
    }
    Ok(l.base)
}

// ============ The interpreter ============

#[inline(always)]
fn rk(l: &LuaState, base: usize, k: &[LuaValue], arg: u32) -> LuaValue {
    if Instruction::is_k(arg) {
        k[Instruction::index_k(arg)]
    } else {
        l.stack[base + arg as usize]
    }
}

/// Run scripted frames starting from the current one until it returns.
/// `Ok(true)` means the thread yielded out of a directly-dispatched call;
/// yields that must cross a native boundary propagate as
/// `Err(LuaError::Yield)` instead, exactly like the longjmp they replace.
pub fn execute(l: &mut LuaState) -> LuaResult<bool> {
    let mut nexeccalls = 1usize;
    'reentry: loop {
        debug_assert!(l.ci().is_lua);
        let proto = current_proto(l);
        let mut base = l.base;
        let mut pc = l.ci().saved_pc as usize;
        loop {
            let i = proto.code[pc];
            pc += 1;
            // cooperative halt, observed before every instruction
            let halt = l.vm().haltstate;
            if halt != HALT_NONE {
                if halt == HALT_ERROR {
                    l.ci_mut().saved_pc = pc as u32;
                    return Err(halt_error(l));
                }
                return Ok(false);
            }
            if l.hookmask.intersects(HookMask::LINE | HookMask::COUNT) {
                base = traceexec(l, pc, &proto)?;
            }
            l.ci_mut().hook_called_mask = 0;
            let ra = base + i.a() as usize;
            let k = &proto.constants;
            match i.opcode() {
                OpCode::Move => {
                    l.stack[ra] = l.stack[base + i.b() as usize];
                }
                OpCode::LoadK => {
                    l.stack[ra] = k[i.bx() as usize];
                }
                OpCode::LoadBool => {
                    l.stack[ra] = LuaValue::boolean(i.b() != 0);
                    if i.c() != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for r in ra..=base + i.b() as usize {
                        l.stack[r] = LuaValue::nil();
                    }
                }
                OpCode::GetUpval => {
                    let uv = closure_upval(l, i.b() as usize);
                    l.stack[ra] = l.upval_get(uv);
                }
                OpCode::SetUpval => {
                    let uv = closure_upval(l, i.b() as usize);
                    let v = l.stack[ra];
                    l.upval_set(uv, v);
                    if let Some(h) = v.as_gc_header() {
                        let owner = uv.as_raw() as *mut crate::gc::GcHeader;
                        l.vm_mut().gc.barrier(owner, h);
                    }
                }
                OpCode::GetGlobal => {
                    let env = LuaValue::table(current_env(l));
                    let key = k[i.bx() as usize];
                    debug_assert!(key.is_string());
                    l.ci_mut().saved_pc = pc as u32;
                    get_table(l, env, key, ra)?;
                    base = l.base;
                }
                OpCode::SetGlobal => {
                    let env = LuaValue::table(current_env(l));
                    let key = k[i.bx() as usize];
                    let v = l.stack[ra];
                    l.ci_mut().saved_pc = pc as u32;
                    set_table(l, env, key, v)?;
                    base = l.base;
                }
                OpCode::GetTable => {
                    let t = l.stack[base + i.b() as usize];
                    let key = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    get_table(l, t, key, ra)?;
                    base = l.base;
                }
                OpCode::SetTable => {
                    let t = l.stack[ra];
                    let key = rk(l, base, k, i.b());
                    let v = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    set_table(l, t, key, v)?;
                    base = l.base;
                }
                OpCode::NewTable => {
                    let narray = fb2int(i.b()) as usize;
                    let nhash = fb2int(i.c()) as usize;
                    l.stack[ra] = l.vm_mut().new_table(narray, nhash);
                    l.ci_mut().saved_pc = pc as u32;
                    l.vm_mut().try_gc_step();
                    base = l.base;
                }
                OpCode::SelfOp => {
                    let rb = l.stack[base + i.b() as usize];
                    l.stack[ra + 1] = rb;
                    let key = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    get_table(l, rb, key, ra)?;
                    base = l.base;
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let event = match i.opcode() {
                        OpCode::Add => TmKind::Add,
                        OpCode::Sub => TmKind::Sub,
                        OpCode::Mul => TmKind::Mul,
                        OpCode::Div => TmKind::Div,
                        OpCode::Mod => TmKind::Mod,
                        _ => TmKind::Pow,
                    };
                    let rb = rk(l, base, k, i.b());
                    let rc = rk(l, base, k, i.c());
                    if rb.is_number() && rc.is_number() {
                        l.stack[ra] =
                            LuaValue::number(apply_arith(event, rb.as_number(), rc.as_number()));
                    } else {
                        l.ci_mut().saved_pc = pc as u32;
                        arith(l, ra, rb, rc, event)?;
                        base = l.base;
                    }
                }
                OpCode::Unm => {
                    let rb = l.stack[base + i.b() as usize];
                    if rb.is_number() {
                        l.stack[ra] = LuaValue::number(-rb.as_number());
                    } else {
                        l.ci_mut().saved_pc = pc as u32;
                        arith(l, ra, rb, rb, TmKind::Unm)?;
                        base = l.base;
                    }
                }
                OpCode::Not => {
                    let res = l.stack[base + i.b() as usize].is_false();
                    l.stack[ra] = LuaValue::boolean(res);
                }
                OpCode::Len => {
                    let rb = l.stack[base + i.b() as usize];
                    l.ci_mut().saved_pc = pc as u32;
                    length_of(l, rb, ra)?;
                    base = l.base;
                }
                OpCode::Concat => {
                    let b = i.b() as usize;
                    let c = i.c() as usize;
                    l.ci_mut().saved_pc = pc as u32;
                    concat(l, c - b + 1, c)?;
                    l.vm_mut().try_gc_step();
                    base = l.base;
                    l.stack[base + i.a() as usize] = l.stack[base + b];
                }
                OpCode::Jmp => {
                    pc = (pc as i64 + i.sbx() as i64) as usize;
                }
                OpCode::Eq => {
                    let rb = rk(l, base, k, i.b());
                    let rc = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    let res = equal_obj(l, rb, rc)?;
                    base = l.base;
                    if res == (i.a() != 0) {
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::Lt => {
                    let rb = rk(l, base, k, i.b());
                    let rc = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    let res = less_than(l, rb, rc)?;
                    base = l.base;
                    if res == (i.a() != 0) {
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::Le => {
                    let rb = rk(l, base, k, i.b());
                    let rc = rk(l, base, k, i.c());
                    l.ci_mut().saved_pc = pc as u32;
                    let res = less_equal(l, rb, rc)?;
                    base = l.base;
                    if res == (i.a() != 0) {
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::Test => {
                    if l.stack[ra].is_false() != (i.c() != 0) {
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::TestSet => {
                    let rb = l.stack[base + i.b() as usize];
                    if rb.is_false() != (i.c() != 0) {
                        l.stack[ra] = rb;
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::Call => {
                    let b = i.b() as usize;
                    let nresults = i.c() as i32 - 1;
                    if b != 0 {
                        set_top_clearing(l, ra + b);
                    } // else the previous instruction set top
                    l.ci_mut().saved_pc = pc as u32;
                    match do_call::precall(l, ra, nresults)? {
                        Precall::Lua => {
                            nexeccalls += 1;
                            continue 'reentry;
                        }
                        Precall::Native => {
                            if nresults >= 0 {
                                let t = l.ci().top;
                                set_top_clearing(l, t);
                            }
                            base = l.base;
                        }
                        Precall::NativeYield => {
                            return Ok(true);
                        }
                    }
                }
                OpCode::TailCall => {
                    let b = i.b() as usize;
                    if b != 0 {
                        set_top_clearing(l, ra + b);
                    }
                    l.ci_mut().saved_pc = pc as u32;
                    debug_assert!(i.c() as i32 - 1 == MULTRET);
                    match do_call::precall(l, ra, MULTRET)? {
                        Precall::Lua => {
                            // fold the new frame into the caller's
                            tailcall_merge(l);
                            continue 'reentry;
                        }
                        Precall::Native => {
                            base = l.base;
                        }
                        Precall::NativeYield => {
                            return Ok(true);
                        }
                    }
                }
                OpCode::Return => {
                    let b = i.b() as usize;
                    if b != 0 {
                        set_top_clearing(l, ra + b - 1);
                    }
                    if !l.open_upvals.is_empty() {
                        l.close_upvals(base);
                    }
                    l.ci_mut().saved_pc = pc as u32;
                    let restore_top = do_call::poscall(l, ra)?;
                    nexeccalls -= 1;
                    if nexeccalls == 0 {
                        return Ok(false);
                    }
                    if restore_top {
                        let t = l.ci().top;
                        set_top_clearing(l, t);
                    }
                    continue 'reentry;
                }
                OpCode::ForLoop => {
                    let step = l.stack[ra + 2].as_number();
                    let idx = l.stack[ra].as_number() + step;
                    let limit = l.stack[ra + 1].as_number();
                    let continue_loop = if step > 0.0 { idx <= limit } else { limit <= idx };
                    if continue_loop {
                        pc = (pc as i64 + i.sbx() as i64) as usize;
                        l.stack[ra] = LuaValue::number(idx);
                        l.stack[ra + 3] = LuaValue::number(idx);
                    }
                }
                OpCode::ForPrep => {
                    l.ci_mut().saved_pc = pc as u32;
                    let init = l.stack[ra];
                    let limit = l.stack[ra + 1];
                    let step = l.stack[ra + 2];
                    let Some(init) = coerce_number(l, &init) else {
                        return Err(l.vm_error("'for' initial value must be a number"));
                    };
                    let Some(limit) = coerce_number(l, &limit) else {
                        return Err(l.vm_error("'for' limit must be a number"));
                    };
                    let Some(step) = coerce_number(l, &step) else {
                        return Err(l.vm_error("'for' step must be a number"));
                    };
                    l.stack[ra] = LuaValue::number(init - step);
                    l.stack[ra + 1] = LuaValue::number(limit);
                    l.stack[ra + 2] = LuaValue::number(step);
                    pc = (pc as i64 + i.sbx() as i64) as usize;
                }
                OpCode::TForLoop => {
                    let cb = ra + 3; // call base
                    l.stack[cb + 2] = l.stack[ra + 2];
                    l.stack[cb + 1] = l.stack[ra + 1];
                    l.stack[cb] = l.stack[ra];
                    set_top_clearing(l, cb + 3); // func + 2 args
                    l.ci_mut().saved_pc = pc as u32;
                    do_call::do_call(l, cb, i.c() as i32, CallFlags::empty())?;
                    base = l.base;
                    let t = l.ci().top;
                    set_top_clearing(l, t);
                    let cb = base + i.a() as usize + 3;
                    if !l.stack[cb].is_nil() {
                        l.stack[cb - 1] = l.stack[cb];
                        pc = (pc as i64 + proto.code[pc].sbx() as i64) as usize;
                    }
                    pc += 1;
                }
                OpCode::SetList => {
                    let mut n = i.b() as usize;
                    let mut c = i.c() as usize;
                    if n == 0 {
                        n = l.top - ra - 1;
                        let t = l.ci().top;
                        set_top_clearing(l, t);
                    }
                    if c == 0 {
                        c = proto.code[pc].0 as usize;
                        pc += 1;
                    }
                    let Some(h) = l.stack[ra].as_table() else {
                        return Err(l.vm_error("SETLIST target is not a table"));
                    };
                    let mut last = (c - 1) * FIELDS_PER_FLUSH as usize + n;
                    let ht = h.as_mut();
                    if last > ht.len() {
                        ht.resize_array(last);
                    }
                    while n > 0 {
                        let val = l.stack[ra + n];
                        ht.raw_seti(last as i64, val);
                        l.vm_mut()
                            .gc
                            .barrier_back(h.as_raw() as *mut crate::gc::GcHeader);
                        last -= 1;
                        n -= 1;
                    }
                }
                OpCode::Close => {
                    l.close_upvals(ra);
                }
                OpCode::Closure => {
                    let p = proto.protos[i.bx() as usize].clone();
                    let nup = p.nups as usize;
                    let env = current_env(l);
                    let mut upvals = Vec::with_capacity(nup);
                    for _ in 0..nup {
                        let pseudo = proto.code[pc];
                        pc += 1;
                        if pseudo.opcode() == OpCode::GetUpval {
                            upvals.push(closure_upval(l, pseudo.b() as usize));
                        } else {
                            debug_assert!(pseudo.opcode() == OpCode::Move);
                            upvals.push(l.find_upval(base + pseudo.b() as usize));
                        }
                    }
                    l.stack[ra] = l.vm_mut().new_lclosure(p, env, upvals);
                    l.ci_mut().saved_pc = pc as u32;
                    l.vm_mut().try_gc_step();
                    base = l.base;
                }
                OpCode::Vararg => {
                    let mut b = i.b() as i32 - 1;
                    let ci = l.ci();
                    let n = (ci.base - ci.func) as i32 - proto.num_params as i32 - 1;
                    let mut ra = ra;
                    if b == MULTRET {
                        l.ci_mut().saved_pc = pc as u32;
                        l.check_stack(n.max(0) as usize)?;
                        ra = l.base + i.a() as usize;
                        b = n;
                        set_top_clearing(l, ra + n.max(0) as usize);
                    }
                    for j in 0..b {
                        l.stack[ra + j as usize] = if j < n {
                            l.stack[base - n as usize + j as usize]
                        } else {
                            LuaValue::nil()
                        };
                    }
                }
            }
        }
    }
}

/// Move the stack top, clearing abandoned slots so they do not pin dead
/// objects.
#[inline]
fn set_top_clearing(l: &mut LuaState, new_top: usize) {
    for i in new_top..l.top {
        l.stack[i] = LuaValue::nil();
    }
    l.top = new_top;
}

#[inline]
fn current_env(l: &LuaState) -> crate::lua_value::TablePtr {
    l.stack[l.ci().func]
        .as_closure()
        .expect("scripted frame without closure")
        .as_ref()
        .env()
}

#[inline]
fn closure_upval(l: &LuaState, idx: usize) -> crate::lua_value::UpvalPtr {
    l.stack[l.ci().func]
        .as_closure()
        .and_then(|c| c.as_ref().as_lua().map(|lc| lc.upvals[idx]))
        .expect("upvalue access outside a scripted closure")
}

/// Fold the frame `precall` just pushed into the caller's frame (tail
/// call): close the caller's upvalues, slide the callee and its registers
/// down over the caller, and drop the extra frame.
fn tailcall_merge(l: &mut LuaState) {
    let new_idx = l.ci_idx;
    let prev_idx = new_idx - 1;
    let func = l.ci[prev_idx].func;
    let pfunc = l.ci[new_idx].func;
    if !l.open_upvals.is_empty() {
        let level = l.ci[prev_idx].base;
        l.close_upvals(level);
    }
    let base_offset = l.ci[new_idx].base - pfunc;
    l.ci[prev_idx].base = func + base_offset;
    let mut aux = 0;
    while pfunc + aux < l.top {
        l.stack[func + aux] = l.stack[pfunc + aux];
        aux += 1;
    }
    for i in (func + aux)..l.top {
        l.stack[i] = LuaValue::nil();
    }
    l.top = func + aux;
    l.ci[prev_idx].top = l.top;
    l.ci[prev_idx].saved_pc = 0;
    l.ci[prev_idx].is_lua = true;
    l.ci[prev_idx].ctx = l.ctx;
    l.ci[prev_idx].tailcalls += 1;
    l.ci_idx = prev_idx;
    l.base = l.ci[prev_idx].base;
}

// ============ Opcode finishing after a resume ============

/// Patch up the interpreter's transient state for a scripted frame that
/// suspended mid-opcode, before re-entering `execute`. Each suspendable
/// opcode leaves a known stack shape; the hook path restores the state a
/// line/count hook parked.
pub fn finish_resume(l: &mut LuaState) -> LuaResult<()> {
    let ci_idx = l.ci_idx;
    if l.ci[ci_idx].ishook {
        l.ci[ci_idx].ishook = false;
        l.ci[ci_idx].allowhook = true;
        l.nccalls = l.ci[ci_idx].hook_old_nccalls;
        l.ci[ci_idx].top = l.ci[ci_idx].hook_ci_top;
        let hook_top = l.ci[ci_idx].hook_top;
        set_top_clearing(l, hook_top);
        l.ci[ci_idx].saved_pc = l.ci[ci_idx].saved_pc.wrapping_add(1);
        l.base = l.ci[ci_idx].base;
        return Ok(());
    }
    let proto = current_proto(l);
    let mut pc = l.ci().saved_pc as usize;
    let i = proto.code[pc - 1];
    let base = l.ci().base;
    l.base = base;
    match i.opcode() {
        OpCode::Call => {
            if i.c() != 0 {
                let t = l.ci().top;
                set_top_clearing(l, t);
            }
        }
        OpCode::SetGlobal | OpCode::SetTable | OpCode::TailCall => {
            // nothing to place
        }
        OpCode::GetGlobal
        | OpCode::GetTable
        | OpCode::SelfOp
        | OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Unm
        | OpCode::Len => {
            // metamethod result on top goes to the destination register
            l.top -= 1;
            let v = l.stack[l.top];
            l.stack[l.top] = LuaValue::nil();
            l.stack[base + i.a() as usize] = v;
        }
        OpCode::Eq | OpCode::Lt => {
            l.top -= 1;
            let res = !l.stack[l.top].is_false();
            l.stack[l.top] = LuaValue::nil();
            if res != (i.a() != 0) {
                pc += 1;
            } else {
                pc = (pc as i64 + proto.code[pc].sbx() as i64 + 1) as usize;
            }
            l.ci_mut().saved_pc = pc as u32;
        }
        OpCode::Le => {
            let rb = rk(l, base, &proto.constants, i.b());
            l.top -= 1;
            let raw = !l.stack[l.top].is_false();
            l.stack[l.top] = LuaValue::nil();
            // __le may have been emulated with a negated __lt
            let ok = if get_tm_by_obj(l, &rb, TmKind::Le).is_none() {
                !raw
            } else {
                raw
            };
            if ok != (i.a() != 0) {
                pc += 1;
            } else {
                pc = (pc as i64 + proto.code[pc].sbx() as i64 + 1) as usize;
            }
            l.ci_mut().saved_pc = pc as u32;
        }
        OpCode::TForLoop => {
            let t = l.ci().top;
            set_top_clearing(l, t);
            let cb = base + i.a() as usize + 3;
            if l.stack[cb].is_nil() {
                pc += 1; // break the loop
            } else {
                l.stack[cb - 1] = l.stack[cb];
                pc = (pc as i64 + proto.code[pc].sbx() as i64 + 1) as usize;
            }
            l.ci_mut().saved_pc = pc as u32;
        }
        OpCode::Concat => {
            l.top -= 2;
            let c = l.stack[l.top].as_pointer() as usize;
            let tm_result = l.stack[l.top + 1];
            l.stack[l.top] = LuaValue::nil();
            l.stack[l.top + 1] = LuaValue::nil();
            l.stack[base + c] = tm_result;
            let b = i.b() as usize;
            if c > b {
                concat(l, c - b + 1, c)?;
            }
            l.vm_mut().try_gc_step();
            l.stack[base + i.a() as usize] = l.stack[base + b];
        }
        _ => {
            return Err(l.vm_error(format!(
                "return to non-resumable opcode {:?}",
                i.opcode()
            )));
        }
    }
    Ok(())
}
