// Shared test plumbing: a VM with the bundled libraries open, and a small
// assembler for hand-built prototypes (the compiler lives outside this
// crate).

use std::rc::Rc;

use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::{Instruction, LuaVM, OpCode};

pub fn new_vm() -> Box<LuaVM> {
    let mut vm = LuaVM::new();
    crate::stdlib::open_libs(&mut vm);
    vm
}

pub struct ProtoBuilder {
    code: Vec<Instruction>,
    constants: Vec<LuaValue>,
    protos: Vec<Rc<Proto>>,
    num_params: u8,
    is_vararg: bool,
    max_stack_size: u8,
    nups: u8,
    source: String,
}

impl ProtoBuilder {
    pub fn new() -> Self {
        ProtoBuilder {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 20,
            nups: 0,
            source: "=test".to_string(),
        }
    }

    pub fn nups(mut self, n: u8) -> Self {
        self.nups = n;
        self
    }

    pub fn params(mut self, n: u8) -> Self {
        self.num_params = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn source(mut self, src: &str) -> Self {
        self.source = src.to_string();
        self
    }

    pub fn k(&mut self, v: LuaValue) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn k_num(&mut self, n: f64) -> u32 {
        self.k(LuaValue::number(n))
    }

    pub fn k_str(&mut self, vm: &mut LuaVM, s: &str) -> u32 {
        let v = LuaValue::string(vm.new_str(s));
        self.k(v)
    }

    pub fn sub(&mut self, p: Rc<Proto>) -> u32 {
        self.protos.push(p);
        (self.protos.len() - 1) as u32
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.code.push(Instruction::iabc(op, a, b, c));
        self
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> &mut Self {
        self.code.push(Instruction::iabx(op, a, bx));
        self
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> &mut Self {
        self.code.push(Instruction::iasbx(op, a, sbx));
        self
    }

    /// Raw word (SETLIST's out-of-band C argument).
    pub fn raw(&mut self, word: u32) -> &mut Self {
        self.code.push(Instruction(word));
        self
    }

    pub fn build(self) -> Rc<Proto> {
        let line_info = (1..=self.code.len() as u32).collect();
        Rc::new(Proto {
            code: self.code,
            constants: self.constants,
            protos: self.protos,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            nups: self.nups,
            source: self.source,
            line_info,
        })
    }
}

pub fn closure_of(vm: &mut LuaVM, proto: Rc<Proto>) -> LuaValue {
    let env = vm.globals().as_table().unwrap();
    vm.new_lclosure(proto, env, Vec::new())
}

/// Concrete UTF-8 text of any string-family value.
pub fn text_of(vm: &mut LuaVM, v: LuaValue) -> String {
    let s = vm.resolve_str_value(v).expect("string value");
    String::from_utf8_lossy(s.as_ref().bytes()).into_owned()
}

pub fn n(v: f64) -> LuaValue {
    LuaValue::number(v)
}
