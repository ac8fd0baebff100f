// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The ahead-of-time engine's compile-on-first-call contract, exercised with
//! toy code generators.

mod common;

use common::*;

use skiff::core_compat::vec::Vec as AVec;
use skiff::exec::aot::{Aot, CodeBuf, CodeGen};
use skiff::exec::env::{Env, Store};
use skiff::exec::{CompileError, Error, FuncHandle, Stack, TrapKind, Value};
use skiff::types::{Imm, Opcode};
use skiff::{Global, Module};

fn stack() -> Stack<Global> {
    Stack::new_in(64, Global)
}

// A generator that declines every function, forcing the engine to fall back
// to interpretation while still exercising the dispatch-slot machinery.
struct DeclineAll {
    requests: usize,
}

impl CodeGen<Global> for DeclineAll {
    fn compile(
        &mut self,
        _module: &Module<Global>,
        _func_idx: u32,
    ) -> Result<Option<CodeBuf<Global>>, CompileError> {
        self.requests += 1;
        Ok(None)
    }
}

#[test]
fn declined_functions_fall_back_to_interpretation() {
    let bytes = basics_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = Env::new_in(Aot::new_in(DeclineAll { requests: 0 }, Global), Global);
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "basics", &module).unwrap();

    let func = env.find_func(handle, "if_else_true").unwrap();
    for _ in 0..3 {
        env.call(&mut stack, func).unwrap();
        assert_eq!(stack.pos(), 1);
        assert_eq!(stack.pop().unwrap().to_i32(), 321);
    }

    // Traps unwind identically through the fallback path.
    let trap = env.find_func(handle, "trap").unwrap();
    let err = env.call(&mut stack, trap).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::Unreachable));
    assert_eq!(stack.pos(), 0);

    // The generator was consulted once per function, not once per call.
    assert_eq!(env.engine().codegen().requests, 2);
}

// A generator for the degenerate "return a constant" function shape: a body
// of exactly [i32.const N, end] compiles into a four-byte code buffer
// holding N; anything else is declined.
struct ConstCompiler {
    compiled: usize,
    declined: usize,
}

fn const_entry(
    code: &[u8],
    _store: &mut Store<'_, Global>,
    stack: &mut Stack<Global>,
    _func: FuncHandle,
) -> Result<(), TrapKind> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&code[..4]);
    stack.push(Value::from_i32(i32::from_le_bytes(buf)))
}

impl CodeGen<Global> for ConstCompiler {
    fn compile(
        &mut self,
        module: &Module<Global>,
        func_idx: u32,
    ) -> Result<Option<CodeBuf<Global>>, CompileError> {
        let func = &module.funcs()[func_idx as usize];
        let body = module.view_instrs(func.expr);
        if let [first, last] = body
            && first.op == Opcode::I32Const
            && last.op == Opcode::End
            && let Imm::I32(value) = first.imm
        {
            let mut code = AVec::new_in(Global);
            for byte in value.to_le_bytes() {
                code.push(byte);
            }
            self.compiled += 1;
            return Ok(Some(CodeBuf::new(code.into_boxed_slice(), const_entry)));
        }
        self.declined += 1;
        Ok(None)
    }
}

// Two constant-returning functions and one the toy generator cannot handle.
fn consts_module() -> Vec<u8> {
    let types = vec_of(1, &[0x60, 0x00, 0x01, 0x7f]);
    let funcs = vec_of(3, &[0x00, 0x00, 0x00]);
    let exports = vec_of(
        3,
        &cat(&[
            &export("forty_two", 0x00, 0),
            &export("seven", 0x00, 1),
            &export("sum", 0x00, 2),
        ]),
    );
    let code = vec_of(
        3,
        &cat(&[
            &func_body(&[0x00, 0x41, 0x2a, 0x0b]),
            &func_body(&[0x00, 0x41, 0x07, 0x0b]),
            &func_body(&[0x00, 0x41, 0x03, 0x41, 0x04, 0x6a, 0x0b]),
        ]),
    );
    module(&[
        section(1, &types),
        section(3, &funcs),
        section(7, &exports),
        section(10, &code),
    ])
}

#[test]
fn compiles_on_first_call_and_dispatches_to_code() {
    let bytes = consts_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let engine = Aot::new_in(
        ConstCompiler {
            compiled: 0,
            declined: 0,
        },
        Global,
    );
    let mut env = Env::new_in(engine, Global);
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "consts", &module).unwrap();

    let forty_two = env.find_func(handle, "forty_two").unwrap();
    let seven = env.find_func(handle, "seven").unwrap();
    let sum = env.find_func(handle, "sum").unwrap();

    // Repeated calls dispatch through the (single) compiled buffer.
    for _ in 0..3 {
        env.call(&mut stack, forty_two).unwrap();
        assert_eq!(stack.pos(), 1);
        assert_eq!(stack.pop().unwrap().to_i32(), 42);
    }

    env.call(&mut stack, seven).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 7);

    // The generator declines `sum`, which interprets instead.
    env.call(&mut stack, sum).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 7);

    assert_eq!(env.engine().codegen().compiled, 2);
    assert_eq!(env.engine().codegen().declined, 1);
}
