// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end execution scenarios through the interpreter.

mod common;

use common::*;

use skiff::exec::env::Env;
use skiff::exec::interp::Interp;
use skiff::exec::native::{NativeFunc, NativeMod};
use skiff::exec::{Error, Stack, TrapKind, Value};
use skiff::types::{ExternKind, GlobalType, Mutability, ValType};
use skiff::{Global, Module};

type TestEnv<'m> = Env<'m, Interp<Global>, Global>;

fn env<'m>() -> TestEnv<'m> {
    Env::new_in(Interp::new_in(Global), Global)
}

fn stack() -> Stack<Global> {
    Stack::new_in(64, Global)
}

#[test]
fn pythag() {
    let module = Module::from_bytes(PYTHAG, Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "pythag", &module).unwrap();
    assert_eq!(stack.pos(), 0);

    let f32_func = env.find_func(handle, "f32").unwrap();
    stack.push(Value::from_f32(3.0)).unwrap();
    stack.push(Value::from_f32(4.0)).unwrap();
    env.call(&mut stack, f32_func).unwrap();
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.pop().unwrap().to_f32(), 5.0);

    let f64_func = env.find_func(handle, "f64").unwrap();
    stack.push(Value::from_f64(5.0)).unwrap();
    stack.push(Value::from_f64(6.0)).unwrap();
    env.call(&mut stack, f64_func).unwrap();
    assert_eq!(stack.pos(), 1);
    let hypot = stack.pop().unwrap().to_f64();
    assert!((hypot - 7.810_249_675_906_654).abs() < 1e-12);
}

#[test]
fn fib_recursion() {
    let module = Module::from_bytes(FIB, Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "fib", &module).unwrap();

    for (func_name, arg, expected) in [
        ("fib_recurse", 3, 3),
        ("fib_recurse", 4, 5),
        ("fib_iterate", 3, 3),
        ("fib_iterate", 4, 5),
        ("fib_recurse", 0, 1),
        ("fib_iterate", 1, 1),
        ("fib_recurse", 10, 89),
        ("fib_iterate", 10, 89),
    ] {
        let func = env.find_func(handle, func_name).unwrap();
        stack.push(Value::from_i32(arg)).unwrap();
        env.call(&mut stack, func).unwrap();
        assert_eq!(stack.pos(), 1, "{func_name}({arg})");
        assert_eq!(stack.pop().unwrap().to_i32(), expected, "{func_name}({arg})");
    }
}

#[test]
fn branching_and_selection() {
    let bytes = basics_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "basics", &module).unwrap();

    for (func_name, expected) in [
        ("add_i32s", 579),
        ("if_else_true", 321),
        ("if_else_false", 45),
        ("br_outer", 1234),
        ("br_inner", 5678),
    ] {
        let func = env.find_func(handle, func_name).unwrap();
        env.call(&mut stack, func).unwrap();
        assert_eq!(stack.pos(), 1, "{func_name}");
        assert_eq!(stack.pop().unwrap().to_i32(), expected, "{func_name}");
    }

    let sub = env.find_func(handle, "sub").unwrap();
    stack.push(Value::from_i32(579)).unwrap();
    stack.push(Value::from_i32(123)).unwrap();
    env.call(&mut stack, sub).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 456);

    let is_99 = env.find_func(handle, "is_99").unwrap();
    for (arg, expected) in [(99, 1), (3, 0), (-99, 0)] {
        stack.push(Value::from_i32(arg)).unwrap();
        env.call(&mut stack, is_99).unwrap();
        assert_eq!(stack.pos(), 1);
        assert_eq!(stack.pop().unwrap().to_i32(), expected, "is_99({arg})");
    }
}

#[test]
fn trap_isolation() {
    let bytes = basics_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "basics", &module).unwrap();

    // Leave an unrelated value on the stack to verify position restoration.
    stack.push(Value::from_i32(7)).unwrap();

    let trap = env.find_func(handle, "trap").unwrap();
    let err = env.call(&mut stack, trap).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::Unreachable));
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.peek(0).unwrap().to_i32(), 7);

    // The environment stays valid for unrelated calls.
    let ok = env.find_func(handle, "if_else_true").unwrap();
    env.call(&mut stack, ok).unwrap();
    assert_eq!(stack.pos(), 2);
    assert_eq!(stack.pop().unwrap().to_i32(), 321);
}

#[test]
fn native_interop() {
    fn add_one(stack: &mut Stack<Global>) -> Result<(), TrapKind> {
        let top = stack.peek_mut(0)?;
        *top = Value::from_i32(top.to_i32() + 1);
        Ok(())
    }

    fn mul_two(stack: &mut Stack<Global>) -> Result<(), TrapKind> {
        let b = stack.pop()?.to_i32();
        let a = stack.pop()?.to_i32();
        stack.push(Value::from_i32(a.wrapping_mul(b)))
    }

    const I32: &[ValType] = &[ValType::I32];
    const I32_PAIR: &[ValType] = &[ValType::I32, ValType::I32];
    let native = NativeMod {
        funcs: &[
            NativeFunc {
                name: "add_one",
                func: add_one,
                params: I32,
                results: I32,
            },
            NativeFunc {
                name: "mul_two",
                func: mul_two,
                params: I32_PAIR,
                results: I32,
            },
        ],
        ..Default::default()
    };

    let mut env = env();
    let mut stack = stack();
    let handle = env.add_native("native", &native).unwrap();

    let add_one = env.find_func(handle, "add_one").unwrap();
    stack.push(Value::from_i32(3)).unwrap();
    env.call(&mut stack, add_one).unwrap();
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.pop().unwrap().to_i32(), 4);

    let mul_two = env.find_func(handle, "mul_two").unwrap();
    stack.push(Value::from_i32(3)).unwrap();
    stack.push(Value::from_i32(4)).unwrap();
    env.call(&mut stack, mul_two).unwrap();
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.pop().unwrap().to_i32(), 12);

    assert!(env.find_func(handle, "missing").is_none());
    assert!(env.find_mod("native").is_some());
    assert!(env.find_mod("other").is_none());
}

// Builds a module exercising linear memory: size/grow, byte loads and
// stores, and an active data segment writing "hi" at offset 16.
fn memory_module() -> Vec<u8> {
    let types = vec_of(
        3,
        &cat(&[
            &[0x60, 0x00, 0x01, 0x7f],             // () -> i32
            &[0x60, 0x01, 0x7f, 0x01, 0x7f],       // (i32) -> i32
            &[0x60, 0x02, 0x7f, 0x7f, 0x00],       // (i32, i32) -> ()
        ]),
    );
    let funcs = vec_of(4, &[0x00, 0x01, 0x01, 0x02]);
    let mems = vec_of(1, &[0x01, 0x01, 0x02]); // min 1, max 2
    let exports = vec_of(
        5,
        &cat(&[
            &export("size", 0x00, 0),
            &export("grow", 0x00, 1),
            &export("peek8", 0x00, 2),
            &export("poke8", 0x00, 3),
            &export("mem", 0x02, 0),
        ]),
    );
    let code = vec_of(
        4,
        &cat(&[
            &func_body(&[0x00, 0x3f, 0x00, 0x0b]),
            &func_body(&[0x00, 0x20, 0x00, 0x40, 0x00, 0x0b]),
            &func_body(&[0x00, 0x20, 0x00, 0x2d, 0x00, 0x00, 0x0b]),
            &func_body(&[0x00, 0x20, 0x00, 0x20, 0x01, 0x3a, 0x00, 0x00, 0x0b]),
        ]),
    );
    let data = cat(&[
        &leb(1),
        &[0x00, 0x41, 0x10, 0x0b], // memory 0, offset 16
        &vec_of(2, b"hi"),
    ]);
    module(&[
        section(1, &types),
        section(3, &funcs),
        section(5, &mems),
        section(7, &exports),
        section(10, &code),
        section(11, &data),
    ])
}

#[test]
fn memory_operations() {
    let bytes = memory_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "mem", &module).unwrap();

    let size = env.find_func(handle, "size").unwrap();
    let grow = env.find_func(handle, "grow").unwrap();
    let peek8 = env.find_func(handle, "peek8").unwrap();
    let poke8 = env.find_func(handle, "poke8").unwrap();

    let call1 = |env: &mut TestEnv<'_>, stack: &mut Stack<Global>, func, arg: i32| {
        stack.push(Value::from_i32(arg)).unwrap();
        env.call(stack, func).unwrap();
        stack.pop().unwrap().to_i32()
    };

    // The data segment landed at offset 16.
    assert_eq!(call1(&mut env, &mut stack, peek8, 16), i32::from(b'h'));
    assert_eq!(call1(&mut env, &mut stack, peek8, 17), i32::from(b'i'));
    assert_eq!(call1(&mut env, &mut stack, peek8, 18), 0);

    // Store then load a byte.
    stack.push(Value::from_i32(100)).unwrap();
    stack.push(Value::from_i32(0xab)).unwrap();
    env.call(&mut stack, poke8).unwrap();
    assert_eq!(stack.pos(), 0);
    assert_eq!(call1(&mut env, &mut stack, peek8, 100), 0xab);

    // memory.grow returns the old size and extends zero-filled pages.
    env.call(&mut stack, size).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 1);
    assert_eq!(call1(&mut env, &mut stack, grow, 1), 1);
    env.call(&mut stack, size).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 2);
    assert_eq!(call1(&mut env, &mut stack, peek8, 65537), 0);

    // Growing past the declared maximum fails with -1 and leaves the size
    // unchanged.
    assert_eq!(call1(&mut env, &mut stack, grow, 1), -1);
    env.call(&mut stack, size).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 2);

    // Out-of-bounds access traps and restores the stack to its pre-call
    // position, argument included.
    stack.push(Value::from_i32(200_000)).unwrap();
    let err = env.call(&mut stack, peek8).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::MemoryOutOfBounds));
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.peek(0).unwrap().to_i32(), 200_000);
    stack.clear();

    // The exported memory is reachable through the environment API too.
    let mem = env.find_mem(handle, "mem").unwrap();
    assert_eq!(env.mem_size(mem).unwrap(), 2);
    let mut two = [0u8; 2];
    env.mem_read(mem, 16, &mut two).unwrap();
    assert_eq!(&two, b"hi");
    env.mem_write(mem, 16, b"yo").unwrap();
    env.mem_read(mem, 16, &mut two).unwrap();
    assert_eq!(&two, b"yo");
}

// Builds a module with a three-slot table, two element-segment entries, and
// a `call_indirect` dispatcher.
fn table_module() -> Vec<u8> {
    let types = vec_of(
        2,
        &cat(&[
            &[0x60, 0x00, 0x01, 0x7f],       // () -> i32
            &[0x60, 0x01, 0x7f, 0x01, 0x7f], // (i32) -> i32
        ]),
    );
    let funcs = vec_of(3, &[0x00, 0x00, 0x01]);
    let tables = vec_of(1, &[0x70, 0x00, 0x03]);
    let exports = vec_of(
        2,
        &cat(&[&export("pick", 0x00, 2), &export("t", 0x01, 0)]),
    );
    let elems = cat(&[
        &leb(1),
        &[0x00, 0x41, 0x00, 0x0b], // table 0, offset 0
        &vec_of(2, &[0x00, 0x01]),
    ]);
    let code = vec_of(
        3,
        &cat(&[
            &func_body(&[0x00, 0x41, 0x0b, 0x0b]), // 11
            &func_body(&[0x00, 0x41, 0x16, 0x0b]), // 22
            &func_body(&[0x00, 0x20, 0x00, 0x11, 0x00, 0x00, 0x0b]),
        ]),
    );
    module(&[
        section(1, &types),
        section(3, &funcs),
        section(4, &tables),
        section(7, &exports),
        section(9, &elems),
        section(10, &code),
    ])
}

#[test]
fn indirect_calls() {
    let bytes = table_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "tab", &module).unwrap();
    let pick = env.find_func(handle, "pick").unwrap();

    for (slot, expected) in [(0, 11), (1, 22)] {
        stack.push(Value::from_i32(slot)).unwrap();
        env.call(&mut stack, pick).unwrap();
        assert_eq!(stack.pos(), 1);
        assert_eq!(stack.pop().unwrap().to_i32(), expected);
    }

    // Slot 2 exists but was never initialized. The trap restores the stack
    // to its pre-call position, argument included.
    stack.push(Value::from_i32(2)).unwrap();
    let err = env.call(&mut stack, pick).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::NullFunction));
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.peek(0).unwrap().to_i32(), 2);
    stack.clear();

    // Slot 5 is outside the table.
    stack.push(Value::from_i32(5)).unwrap();
    let err = env.call(&mut stack, pick).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::TableOutOfBounds));
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.peek(0).unwrap().to_i32(), 5);
    stack.clear();

    // Table slots are reachable through the environment API, and the
    // handles they hold are callable.
    let table = env.find_table(handle, "t").unwrap();
    let second = env.get_elem(table, 1).unwrap().unwrap();
    env.call(&mut stack, second).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), 22);
    assert_eq!(env.get_elem(table, 2).unwrap(), None);
    assert_eq!(
        env.get_elem(table, 9).unwrap_err(),
        Error::Trap(TrapKind::TableOutOfBounds)
    );
}

// Builds the provider and consumer halves of the linking scenario. The
// provider exports an immutable global `g = 7` and `seven() -> i32`; the
// consumer imports both, initializes its own global from the imported one,
// and exports `sum() = seven() + h`.
fn provider_module() -> Vec<u8> {
    let types = vec_of(1, &[0x60, 0x00, 0x01, 0x7f]);
    let funcs = vec_of(1, &[0x00]);
    let globals = vec_of(1, &[0x7f, 0x00, 0x41, 0x07, 0x0b]);
    let exports = vec_of(
        2,
        &cat(&[&export("g", 0x03, 0), &export("seven", 0x00, 0)]),
    );
    let code = vec_of(1, &func_body(&[0x00, 0x23, 0x00, 0x0b]));
    module(&[
        section(1, &types),
        section(3, &funcs),
        section(6, &globals),
        section(7, &exports),
        section(10, &code),
    ])
}

fn consumer_module() -> Vec<u8> {
    let types = vec_of(1, &[0x60, 0x00, 0x01, 0x7f]);
    let imports = vec_of(
        2,
        &cat(&[
            &cat(&[&name("a"), &name("g"), &[0x03, 0x7f, 0x00][..]]),
            &cat(&[&name("a"), &name("seven"), &[0x00, 0x00][..]]),
        ]),
    );
    let funcs = vec_of(1, &[0x00]);
    let globals = vec_of(1, &[0x7f, 0x00, 0x23, 0x00, 0x0b]);
    let exports = vec_of(
        2,
        &cat(&[&export("sum", 0x00, 1), &export("h", 0x03, 1)]),
    );
    let code = vec_of(
        1,
        &func_body(&[0x00, 0x10, 0x00, 0x23, 0x01, 0x6a, 0x0b]),
    );
    module(&[
        section(1, &types),
        section(2, &imports),
        section(3, &funcs),
        section(6, &globals),
        section(7, &exports),
        section(10, &code),
    ])
}

#[test]
fn linking_resolves_imports_by_name() {
    let provider_bytes = provider_module();
    let consumer_bytes = consumer_module();
    let provider = Module::from_bytes(provider_bytes.as_slice(), Global).unwrap();
    let consumer = Module::from_bytes(consumer_bytes.as_slice(), Global).unwrap();

    assert_eq!(consumer.num_imports(ExternKind::Func), 1);
    assert_eq!(consumer.num_imports(ExternKind::Global), 1);

    let mut env = env();
    let mut stack = stack();
    env.add_mod(&mut stack, "a", &provider).unwrap();
    let b = env.add_mod(&mut stack, "b", &consumer).unwrap();

    let sum = env.find_func(b, "sum").unwrap();
    env.call(&mut stack, sum).unwrap();
    assert_eq!(stack.pos(), 1);
    assert_eq!(stack.pop().unwrap().to_i32(), 14);

    // The consumer's own global was initialized from the imported one.
    let h = env.find_global(b, "h").unwrap();
    assert_eq!(env.get_global(h).unwrap().to_i32(), 7);

    // The import itself resolves to the provider's global.
    let imported = env.find_import(b, ExternKind::Global, "g").unwrap();
    let skiff::exec::Extern::Global(g) = imported else {
        panic!("wrong extern kind");
    };
    assert_eq!(env.get_global(g).unwrap().to_i32(), 7);

    // Host-side global mutation is visible to executing code.
    env.set_global(g, Value::from_i32(10)).unwrap();
    env.call(&mut stack, sum).unwrap();
    // seven() now reads 10, while the consumer's own global still holds 7.
    assert_eq!(stack.pop().unwrap().to_i32(), 17);
}

#[test]
fn linking_failures() {
    let provider_bytes = provider_module();
    let provider = Module::from_bytes(provider_bytes.as_slice(), Global).unwrap();
    let consumer_bytes = consumer_module();
    let consumer = Module::from_bytes(consumer_bytes.as_slice(), Global).unwrap();

    // Nothing registered under the imported module name.
    let mut e = env();
    let mut s = stack();
    let err = e.add_mod(&mut s, "b", &consumer).unwrap_err();
    assert!(matches!(
        err,
        Error::Link(skiff::exec::LinkError::NotFound { index: 0 })
    ));
    assert!(e.find_mod("b").is_none());

    // A consumer importing the global with the wrong mutability.
    let bad_global = {
        let types = vec_of(1, &[0x60, 0x00, 0x01, 0x7f]);
        let imports = vec_of(
            1,
            &cat(&[&name("a"), &name("g"), &[0x03, 0x7f, 0x01][..]]),
        );
        module(&[section(1, &types), section(2, &imports)])
    };
    let bad = Module::from_bytes(bad_global.as_slice(), Global).unwrap();

    // A consumer importing the function with the wrong signature.
    let bad_func = {
        let types = vec_of(1, &[0x60, 0x01, 0x7f, 0x01, 0x7f]);
        let imports = vec_of(
            1,
            &cat(&[&name("a"), &name("seven"), &[0x00, 0x00][..]]),
        );
        module(&[section(1, &types), section(2, &imports)])
    };
    let bad2 = Module::from_bytes(bad_func.as_slice(), Global).unwrap();

    let mut e = env();
    let mut s = stack();
    e.add_mod(&mut s, "a", &provider).unwrap();
    let err = e.add_mod(&mut s, "bad", &bad).unwrap_err();
    assert!(matches!(
        err,
        Error::Link(skiff::exec::LinkError::GlobalMismatch { index: 0 })
    ));

    let err = e.add_mod(&mut s, "worse", &bad2).unwrap_err();
    assert!(matches!(
        err,
        Error::Link(skiff::exec::LinkError::FuncMismatch { index: 0 })
    ));
    assert!(e.find_mod("worse").is_none());
}

#[test]
fn start_function_trap_rolls_back_registration() {
    // types: () -> (); one function (unreachable); start = 0.
    let bytes = module(&[
        section(1, &vec_of(1, &[0x60, 0x00, 0x00])),
        section(3, &vec_of(1, &[0x00])),
        section(8, &leb(0)),
        section(10, &vec_of(1, &func_body(&[0x00, 0x00, 0x0b]))),
    ]);
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let err = env.add_mod(&mut stack, "doomed", &module).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::Unreachable));
    assert!(env.find_mod("doomed").is_none());
    assert_eq!(stack.pos(), 0);
}

#[test]
fn element_segment_out_of_bounds_fails_registration() {
    // A one-slot table with an element segment writing at offset 5.
    let types = vec_of(1, &[0x60, 0x00, 0x01, 0x7f]);
    let funcs = vec_of(1, &[0x00]);
    let tables = vec_of(1, &[0x70, 0x00, 0x01]);
    let elems = cat(&[&leb(1), &[0x00, 0x41, 0x05, 0x0b], &vec_of(1, &[0x00])]);
    let code = vec_of(1, &func_body(&[0x00, 0x41, 0x01, 0x0b]));
    let bytes = module(&[
        section(1, &types),
        section(3, &funcs),
        section(4, &tables),
        section(9, &elems),
        section(10, &code),
    ]);
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let err = env.add_mod(&mut stack, "oob", &module).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::TableOutOfBounds));
    assert!(env.find_mod("oob").is_none());
}

// Builds a module exposing raw i32 arithmetic for the numeric-semantics
// checks.
fn arith_module() -> Vec<u8> {
    let types = vec_of(1, &[0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f]);
    let funcs = vec_of(3, &[0x00, 0x00, 0x00]);
    let exports = vec_of(
        3,
        &cat(&[
            &export("div_s", 0x00, 0),
            &export("div_u", 0x00, 1),
            &export("add", 0x00, 2),
        ]),
    );
    let code = vec_of(
        3,
        &cat(&[
            &func_body(&[0x00, 0x20, 0x00, 0x20, 0x01, 0x6d, 0x0b]),
            &func_body(&[0x00, 0x20, 0x00, 0x20, 0x01, 0x6e, 0x0b]),
            &func_body(&[0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b]),
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
fn integer_semantics() {
    let bytes = arith_module();
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "arith", &module).unwrap();

    let div_s = env.find_func(handle, "div_s").unwrap();
    let div_u = env.find_func(handle, "div_u").unwrap();
    let add = env.find_func(handle, "add").unwrap();

    // i32.div_s(i32::MIN, -1) traps with integer overflow.
    stack.push(Value::from_i32(i32::MIN)).unwrap();
    stack.push(Value::from_i32(-1)).unwrap();
    let err = env.call(&mut stack, div_s).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::IntegerOverflow));
    assert_eq!(stack.pos(), 2);
    stack.clear();

    // i32.div_u(x, 0) traps with divide-by-zero.
    stack.push(Value::from_i32(17)).unwrap();
    stack.push(Value::from_i32(0)).unwrap();
    let err = env.call(&mut stack, div_u).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::DivideByZero));
    stack.clear();

    // i32.add wraps modulo 2^32.
    stack.push(Value::from_i32(i32::MAX)).unwrap();
    stack.push(Value::from_i32(1)).unwrap();
    env.call(&mut stack, add).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), i32::MIN);

    // Ordinary division still works afterwards.
    stack.push(Value::from_i32(-7)).unwrap();
    stack.push(Value::from_i32(2)).unwrap();
    env.call(&mut stack, div_s).unwrap();
    assert_eq!(stack.pop().unwrap().to_i32(), -3);
}

#[test]
fn call_depth_is_bounded() {
    // f() calls itself unconditionally.
    let bytes = module(&[
        section(1, &vec_of(1, &[0x60, 0x00, 0x00])),
        section(3, &vec_of(1, &[0x00])),
        section(7, &vec_of(1, &export("loop_forever", 0x00, 0))),
        section(10, &vec_of(1, &func_body(&[0x00, 0x10, 0x00, 0x0b]))),
    ]);
    let module = Module::from_bytes(bytes.as_slice(), Global).unwrap();
    let mut env = env();
    let mut stack = stack();
    let handle = env.add_mod(&mut stack, "rec", &module).unwrap();
    let func = env.find_func(handle, "loop_forever").unwrap();
    let err = env.call(&mut stack, func).unwrap_err();
    assert_eq!(err, Error::Trap(TrapKind::CallStackExhausted));
    assert_eq!(stack.pos(), 0);
}

#[test]
fn native_globals_and_memories() {
    let native = NativeMod::<Global> {
        globals: &[skiff::exec::native::NativeGlobal {
            name: "answer",
            ty: GlobalType {
                value: ValType::I32,
                mutability: Mutability::Const,
            },
            val: Value::from_i32(42),
        }],
        mems: &[skiff::exec::native::NativeMem {
            name: "scratch",
            mem: skiff::types::MemType::new(skiff::types::Limits {
                min: 1,
                max: Some(1),
            }),
            data: b"abc",
        }],
        ..Default::default()
    };

    let mut env = env();
    let handle = env.add_native("host", &native).unwrap();

    let answer = env.find_global(handle, "answer").unwrap();
    assert_eq!(env.get_global(answer).unwrap().to_i32(), 42);

    let scratch = env.find_mem(handle, "scratch").unwrap();
    assert_eq!(env.mem_size(scratch).unwrap(), 1);
    let mut out = [0u8; 3];
    env.mem_read(scratch, 0, &mut out).unwrap();
    assert_eq!(&out, b"abc");
}
