// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The stack-machine interpreter.
//!
//! Calls recurse through [`Engine::call`]; the Rust call stack is the frame
//! stack, bounded by an explicit depth limit. Locals of all live frames are
//! spilled into one shared vector indexed from per-frame bases, and open
//! structured-control labels live in a second shared vector the same way.
//! Branch targets are resolved by forward scans over the instruction arena,
//! counting block openers against `end`s.

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::module::Module;
use crate::types::{BlockType, Func, Imm, Instr, MemImm, Opcode};

use super::env::{MemInst, ResolvedFunc, Store};
use super::{Engine, Error, FuncHandle, Stack, TrapKind, Value};

// Upper bound on interpreter recursion (wasm call nesting).
const MAX_CALL_DEPTH: u32 = 512;

#[derive(Clone, Copy)]
enum LabelKind {
    Block,
    // A branch to a loop label jumps back to the `loop` instruction itself.
    Loop { start: usize },
}

// An open structured-control construct.
#[derive(Clone, Copy)]
struct Label {
    // Operand-stack position at entry to the block.
    base: usize,
    // Number of values a branch to this label carries.
    arity: u32,
    kind: LabelKind,
}

// Where control goes after a branch.
enum Branch {
    Jump(usize),
    Return,
}

/// The interpreter execution engine.
pub struct Interp<A: Allocator> {
    locals: Vec<Value, A>,
    labels: Vec<Label, A>,
    depth: u32,
}

impl<A: Allocator + Clone> Interp<A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            locals: Vec::new_in(alloc.clone()),
            labels: Vec::new_in(alloc),
            depth: 0,
        }
    }
}

impl<A: Allocator + Clone> Engine<A> for Interp<A> {
    fn call(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error> {
        self.invoke(store, stack, func)
    }
}

impl<A: Allocator + Clone> Interp<A> {
    fn invoke(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::Trap(TrapKind::CallStackExhausted));
        }
        self.depth += 1;
        let result = self.run(store, stack, func);
        self.depth -= 1;
        result
    }

    // Invokes a function of either kind from within executing code.
    fn call_any(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error> {
        match store.resolve(func).ok_or(Error::InvalidHandle)? {
            ResolvedFunc::Native(native) => native(stack).map_err(Error::Trap),
            ResolvedFunc::Wasm(_) => self.invoke(store, stack, func),
        }
    }

    // Sets up a frame (locals spilled from the operand stack, zeroes for the
    // declared locals), executes the body, and tears the frame down again.
    fn run(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error> {
        let module = store.wasm_module(func.inst).ok_or(Error::InvalidHandle)?;
        let f = *module
            .funcs()
            .get(func.idx as usize)
            .ok_or(Error::InvalidHandle)?;
        let ty = module.func_type(f.type_idx);
        let num_params = ty.params.len as usize;
        let return_arity = ty.results.len as usize;

        let locals_base = self.locals.len();
        let labels_base = self.labels.len();

        // The first `num_params` locals are the parameters, copied (not
        // popped) off the operand stack; the rest are zero-initialized. The
        // parameters stay in place underneath the body's operands so that a
        // trap leaves the stack position exactly where the caller put it; a
        // successful return collapses them away along with the rest of the
        // frame's operands.
        {
            let params = stack.top(num_params)?;
            self.locals.try_reserve(f.frame_size as usize)?;
            for &param in params {
                self.locals.push(param);
            }
        }
        for _ in num_params..(f.frame_size as usize) {
            self.locals.push(Value::ZERO);
        }

        // Where the results land: the position the parameters occupy.
        let base = stack.pos() - num_params;
        let result = self.exec(store, stack, module, &f, func.inst, locals_base, base, return_arity);

        self.locals.truncate(locals_base);
        self.labels.truncate(labels_base);
        result
    }

    fn push_label(&mut self, label: Label) -> Result<(), Error> {
        self.labels.try_reserve(1)?;
        self.labels.push(label);
        Ok(())
    }

    // Executes a branch to the label `depth` levels up. `depth` equal to the
    // number of open labels addresses the function's root (a return).
    #[allow(clippy::too_many_arguments)]
    fn branch(
        &mut self,
        stack: &mut Stack<A>,
        insts: &[Instr],
        labels_base: usize,
        pc: usize,
        depth: u32,
        base: usize,
        return_arity: usize,
    ) -> Result<Branch, Error> {
        let open = self.labels.len() - labels_base;
        if (depth as usize) >= open {
            stack.collapse(base, return_arity)?;
            return Ok(Branch::Return);
        }

        let target = self.labels.len() - 1 - (depth as usize);
        let label = self.labels[target];
        match label.kind {
            LabelKind::Loop { start } => {
                // Values accumulated in the body are discarded; the `loop`
                // instruction re-pushes its label on re-entry.
                stack.truncate(label.base);
                self.labels.truncate(target);
                Ok(Branch::Jump(start))
            }
            LabelKind::Block => {
                stack.collapse(label.base, label.arity as usize)?;
                self.labels.truncate(target);
                let end = matching_end(insts, pc, depth + 1);
                Ok(Branch::Jump(end + 1))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        module: &Module<A>,
        f: &Func,
        inst_idx: u32,
        locals_base: usize,
        base: usize,
        return_arity: usize,
    ) -> Result<(), Error> {
        let insts = module.view_instrs(f.expr);
        let labels_base = self.labels.len();
        let mut pc = 0usize;

        macro_rules! take_branch {
            ($depth:expr) => {
                match self.branch(stack, insts, labels_base, pc, $depth, base, return_arity)? {
                    Branch::Jump(target) => {
                        pc = target;
                        continue;
                    }
                    Branch::Return => return Ok(()),
                }
            };
        }

        loop {
            let Instr { op, imm } = insts[pc];
            match op {
                // Control.
                Opcode::Unreachable => return Err(Error::Trap(TrapKind::Unreachable)),
                Opcode::Nop => {}
                Opcode::Block => {
                    self.push_label(Label {
                        base: stack.pos(),
                        arity: imm_block(imm).arity(),
                        kind: LabelKind::Block,
                    })?;
                }
                Opcode::Loop => {
                    self.push_label(Label {
                        base: stack.pos(),
                        arity: 0,
                        kind: LabelKind::Loop { start: pc },
                    })?;
                }
                Opcode::If => {
                    let block = imm_block(imm);
                    let cond = stack.pop()?.to_i32();
                    if cond != 0 {
                        self.push_label(Label {
                            base: stack.pos(),
                            arity: block.arity(),
                            kind: LabelKind::Block,
                        })?;
                    } else {
                        match else_or_end(insts, pc) {
                            ElseOrEnd::Else(else_pc) => {
                                self.push_label(Label {
                                    base: stack.pos(),
                                    arity: block.arity(),
                                    kind: LabelKind::Block,
                                })?;
                                pc = else_pc + 1;
                                continue;
                            }
                            ElseOrEnd::End(end_pc) => {
                                pc = end_pc + 1;
                                continue;
                            }
                        }
                    }
                }
                Opcode::Else => {
                    // The then-arm fell through: skip to the if's `end`,
                    // which pops the label and keeps the produced values.
                    pc = matching_end(insts, pc, 1);
                    continue;
                }
                Opcode::End => {
                    if self.labels.len() == labels_base {
                        // Function end.
                        stack.collapse(base, return_arity)?;
                        return Ok(());
                    }
                    self.labels.pop();
                }
                Opcode::Br => take_branch!(imm_index(imm)),
                Opcode::BrIf => {
                    if stack.pop()?.to_i32() != 0 {
                        take_branch!(imm_index(imm));
                    }
                }
                Opcode::BrTable => {
                    let Imm::BrTable { labels, default } = imm else {
                        unreachable!("br_table without operands")
                    };
                    let targets = module.view_u32s(labels);
                    let idx = stack.pop()?.to_u32() as usize;
                    let depth = targets.get(idx).copied().unwrap_or(default);
                    take_branch!(depth);
                }
                Opcode::Return => {
                    stack.collapse(base, return_arity)?;
                    return Ok(());
                }
                Opcode::Call => {
                    let callee = store
                        .func_by_index(inst_idx, imm_index(imm))
                        .ok_or(Error::InvalidHandle)?;
                    self.call_any(store, stack, callee)?;
                }
                Opcode::CallIndirect => {
                    let Imm::CallIndirect { type_idx } = imm else {
                        unreachable!("call_indirect without a type index")
                    };
                    let table = store
                        .table_by_index(inst_idx, 0)
                        .ok_or(Error::Trap(TrapKind::TableOutOfBounds))?;
                    let slot = stack.pop()?.to_u32();
                    let callee = store
                        .table(table)
                        .ok_or(Error::InvalidHandle)?
                        .get(slot)
                        .map_err(Error::Trap)?
                        .ok_or(Error::Trap(TrapKind::NullFunction))?;

                    // Dynamic signature check against the declared type.
                    let ty = module.func_type(type_idx);
                    let wanted = (
                        module.view_valtypes(ty.params),
                        module.view_valtypes(ty.results),
                    );
                    let provided = store.func_sig(callee).ok_or(Error::InvalidHandle)?;
                    if wanted != provided {
                        return Err(Error::Trap(TrapKind::SignatureMismatch));
                    }
                    self.call_any(store, stack, callee)?;
                }

                // Parametric.
                Opcode::Drop => {
                    stack.pop()?;
                }
                Opcode::Select => {
                    let cond = stack.pop()?.to_i32();
                    let on_false = stack.pop()?;
                    let on_true = stack.pop()?;
                    stack.push(if cond != 0 { on_true } else { on_false })?;
                }

                // Variables.
                Opcode::LocalGet => {
                    let val = self.locals[locals_base + imm_index(imm) as usize];
                    stack.push(val)?;
                }
                Opcode::LocalSet => {
                    let val = stack.pop()?;
                    self.locals[locals_base + imm_index(imm) as usize] = val;
                }
                Opcode::LocalTee => {
                    let val = stack.peek(0)?;
                    self.locals[locals_base + imm_index(imm) as usize] = val;
                }
                Opcode::GlobalGet => {
                    let handle = store
                        .global_by_index(inst_idx, imm_index(imm))
                        .ok_or(Error::InvalidHandle)?;
                    let val = store.global(handle).ok_or(Error::InvalidHandle)?.val;
                    stack.push(val)?;
                }
                Opcode::GlobalSet => {
                    let handle = store
                        .global_by_index(inst_idx, imm_index(imm))
                        .ok_or(Error::InvalidHandle)?;
                    let val = stack.pop()?;
                    store.global_mut(handle).ok_or(Error::InvalidHandle)?.val = val;
                }

                // Memory loads.
                Opcode::I32Load => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load32(mem, addr, arg.offset)?;
                    stack.push(Value::from_u32(val))?;
                }
                Opcode::I64Load => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load64(mem, addr, arg.offset)?;
                    stack.push(Value::from_u64(val))?;
                }
                Opcode::F32Load => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load32(mem, addr, arg.offset)?;
                    stack.push(Value::from_f32(f32::from_bits(val)))?;
                }
                Opcode::F64Load => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load64(mem, addr, arg.offset)?;
                    stack.push(Value::from_f64(f64::from_bits(val)))?;
                }
                Opcode::I32Load8S => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load8(mem, addr, arg.offset)? as i8;
                    stack.push(Value::from_i32(i32::from(val)))?;
                }
                Opcode::I32Load8U => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load8(mem, addr, arg.offset)?;
                    stack.push(Value::from_u32(u32::from(val)))?;
                }
                Opcode::I32Load16S => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load16(mem, addr, arg.offset)? as i16;
                    stack.push(Value::from_i32(i32::from(val)))?;
                }
                Opcode::I32Load16U => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load16(mem, addr, arg.offset)?;
                    stack.push(Value::from_u32(u32::from(val)))?;
                }
                Opcode::I64Load8S => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load8(mem, addr, arg.offset)? as i8;
                    stack.push(Value::from_i64(i64::from(val)))?;
                }
                Opcode::I64Load8U => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load8(mem, addr, arg.offset)?;
                    stack.push(Value::from_u64(u64::from(val)))?;
                }
                Opcode::I64Load16S => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load16(mem, addr, arg.offset)? as i16;
                    stack.push(Value::from_i64(i64::from(val)))?;
                }
                Opcode::I64Load16U => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load16(mem, addr, arg.offset)?;
                    stack.push(Value::from_u64(u64::from(val)))?;
                }
                Opcode::I64Load32S => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load32(mem, addr, arg.offset)? as i32;
                    stack.push(Value::from_i64(i64::from(val)))?;
                }
                Opcode::I64Load32U => {
                    let (mem, arg) = (mem_of(store, inst_idx)?, imm_mem(imm));
                    let addr = stack.pop()?.to_u32();
                    let val = load32(mem, addr, arg.offset)?;
                    stack.push(Value::from_u64(u64::from(val)))?;
                }

                // Memory stores.
                Opcode::I32Store => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u32();
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::I64Store => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u64();
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::F32Store => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_f32();
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::F64Store => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_f64();
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::I32Store8 => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u32() as u8;
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &[val])?;
                }
                Opcode::I32Store16 => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u32() as u16;
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::I64Store8 => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u64() as u8;
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &[val])?;
                }
                Opcode::I64Store16 => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u64() as u16;
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::I64Store32 => {
                    let arg = imm_mem(imm);
                    let val = stack.pop()?.to_u64() as u32;
                    let addr = stack.pop()?.to_u32();
                    store_bytes(store, inst_idx, addr, arg.offset, &val.to_le_bytes())?;
                }
                Opcode::MemorySize => {
                    let mem = mem_of(store, inst_idx)?;
                    stack.push(Value::from_u32(mem.size()))?;
                }
                Opcode::MemoryGrow => {
                    let delta = stack.pop()?.to_u32();
                    let handle = store
                        .mem_by_index(inst_idx, 0)
                        .ok_or(Error::Trap(TrapKind::MemoryOutOfBounds))?;
                    let old = store
                        .mem_mut(handle)
                        .ok_or(Error::InvalidHandle)?
                        .grow(delta);
                    stack.push(Value::from_u32(old))?;
                }

                // Constants.
                Opcode::I32Const => {
                    let Imm::I32(v) = imm else {
                        unreachable!("i32.const without an immediate")
                    };
                    stack.push(Value::from_i32(v))?;
                }
                Opcode::I64Const => {
                    let Imm::I64(v) = imm else {
                        unreachable!("i64.const without an immediate")
                    };
                    stack.push(Value::from_i64(v))?;
                }
                Opcode::F32Const => {
                    let Imm::F32(v) = imm else {
                        unreachable!("f32.const without an immediate")
                    };
                    stack.push(Value::from_f32(v))?;
                }
                Opcode::F64Const => {
                    let Imm::F64(v) = imm else {
                        unreachable!("f64.const without an immediate")
                    };
                    stack.push(Value::from_f64(v))?;
                }

                // i32 comparisons.
                Opcode::I32Eqz => {
                    let a = stack.pop()?.to_i32();
                    stack.push(Value::from_i32(i32::from(a == 0)))?;
                }
                Opcode::I32Eq => cmp_i32(stack, |a, b| a == b)?,
                Opcode::I32Ne => cmp_i32(stack, |a, b| a != b)?,
                Opcode::I32LtS => cmp_i32(stack, |a, b| a < b)?,
                Opcode::I32LtU => cmp_u32(stack, |a, b| a < b)?,
                Opcode::I32GtS => cmp_i32(stack, |a, b| a > b)?,
                Opcode::I32GtU => cmp_u32(stack, |a, b| a > b)?,
                Opcode::I32LeS => cmp_i32(stack, |a, b| a <= b)?,
                Opcode::I32LeU => cmp_u32(stack, |a, b| a <= b)?,
                Opcode::I32GeS => cmp_i32(stack, |a, b| a >= b)?,
                Opcode::I32GeU => cmp_u32(stack, |a, b| a >= b)?,

                // i64 comparisons.
                Opcode::I64Eqz => {
                    let a = stack.pop()?.to_i64();
                    stack.push(Value::from_i32(i32::from(a == 0)))?;
                }
                Opcode::I64Eq => cmp_i64(stack, |a, b| a == b)?,
                Opcode::I64Ne => cmp_i64(stack, |a, b| a != b)?,
                Opcode::I64LtS => cmp_i64(stack, |a, b| a < b)?,
                Opcode::I64LtU => cmp_u64(stack, |a, b| a < b)?,
                Opcode::I64GtS => cmp_i64(stack, |a, b| a > b)?,
                Opcode::I64GtU => cmp_u64(stack, |a, b| a > b)?,
                Opcode::I64LeS => cmp_i64(stack, |a, b| a <= b)?,
                Opcode::I64LeU => cmp_u64(stack, |a, b| a <= b)?,
                Opcode::I64GeS => cmp_i64(stack, |a, b| a >= b)?,
                Opcode::I64GeU => cmp_u64(stack, |a, b| a >= b)?,

                // Float comparisons (NaN compares false, except ne).
                Opcode::F32Eq => cmp_f32(stack, |a, b| a == b)?,
                Opcode::F32Ne => cmp_f32(stack, |a, b| a != b)?,
                Opcode::F32Lt => cmp_f32(stack, |a, b| a < b)?,
                Opcode::F32Gt => cmp_f32(stack, |a, b| a > b)?,
                Opcode::F32Le => cmp_f32(stack, |a, b| a <= b)?,
                Opcode::F32Ge => cmp_f32(stack, |a, b| a >= b)?,
                Opcode::F64Eq => cmp_f64(stack, |a, b| a == b)?,
                Opcode::F64Ne => cmp_f64(stack, |a, b| a != b)?,
                Opcode::F64Lt => cmp_f64(stack, |a, b| a < b)?,
                Opcode::F64Gt => cmp_f64(stack, |a, b| a > b)?,
                Opcode::F64Le => cmp_f64(stack, |a, b| a <= b)?,
                Opcode::F64Ge => cmp_f64(stack, |a, b| a >= b)?,

                // i32 arithmetic.
                Opcode::I32Clz => unop_i32(stack, |a| a.leading_zeros() as i32)?,
                Opcode::I32Ctz => unop_i32(stack, |a| a.trailing_zeros() as i32)?,
                Opcode::I32Popcnt => unop_i32(stack, |a| a.count_ones() as i32)?,
                Opcode::I32Add => binop_i32(stack, i32::wrapping_add)?,
                Opcode::I32Sub => binop_i32(stack, i32::wrapping_sub)?,
                Opcode::I32Mul => binop_i32(stack, i32::wrapping_mul)?,
                Opcode::I32DivS => binop_i32_checked(stack, div_s_32)?,
                Opcode::I32DivU => binop_u32_checked(stack, div_u_32)?,
                Opcode::I32RemS => binop_i32_checked(stack, rem_s_32)?,
                Opcode::I32RemU => binop_u32_checked(stack, rem_u_32)?,
                Opcode::I32And => binop_i32(stack, |a, b| a & b)?,
                Opcode::I32Or => binop_i32(stack, |a, b| a | b)?,
                Opcode::I32Xor => binop_i32(stack, |a, b| a ^ b)?,
                Opcode::I32Shl => binop_i32(stack, |a, b| a.wrapping_shl(b as u32))?,
                Opcode::I32ShrS => binop_i32(stack, |a, b| a.wrapping_shr(b as u32))?,
                Opcode::I32ShrU => binop_u32(stack, |a, b| a.wrapping_shr(b))?,
                Opcode::I32Rotl => binop_u32(stack, u32::rotate_left)?,
                Opcode::I32Rotr => binop_u32(stack, u32::rotate_right)?,

                // i64 arithmetic.
                Opcode::I64Clz => unop_i64(stack, |a| i64::from(a.leading_zeros()))?,
                Opcode::I64Ctz => unop_i64(stack, |a| i64::from(a.trailing_zeros()))?,
                Opcode::I64Popcnt => unop_i64(stack, |a| i64::from(a.count_ones()))?,
                Opcode::I64Add => binop_i64(stack, i64::wrapping_add)?,
                Opcode::I64Sub => binop_i64(stack, i64::wrapping_sub)?,
                Opcode::I64Mul => binop_i64(stack, i64::wrapping_mul)?,
                Opcode::I64DivS => binop_i64_checked(stack, div_s_64)?,
                Opcode::I64DivU => binop_u64_checked(stack, div_u_64)?,
                Opcode::I64RemS => binop_i64_checked(stack, rem_s_64)?,
                Opcode::I64RemU => binop_u64_checked(stack, rem_u_64)?,
                Opcode::I64And => binop_i64(stack, |a, b| a & b)?,
                Opcode::I64Or => binop_i64(stack, |a, b| a | b)?,
                Opcode::I64Xor => binop_i64(stack, |a, b| a ^ b)?,
                Opcode::I64Shl => binop_i64(stack, |a, b| a.wrapping_shl(b as u32))?,
                Opcode::I64ShrS => binop_i64(stack, |a, b| a.wrapping_shr(b as u32))?,
                Opcode::I64ShrU => binop_u64(stack, |a, b| a.wrapping_shr(b as u32))?,
                Opcode::I64Rotl => binop_u64(stack, |a, b| a.rotate_left(b as u32))?,
                Opcode::I64Rotr => binop_u64(stack, |a, b| a.rotate_right(b as u32))?,

                // f32 arithmetic.
                Opcode::F32Abs => unop_f32(stack, libm::fabsf)?,
                Opcode::F32Neg => unop_f32(stack, |a| -a)?,
                Opcode::F32Ceil => unop_f32(stack, libm::ceilf)?,
                Opcode::F32Floor => unop_f32(stack, libm::floorf)?,
                Opcode::F32Trunc => unop_f32(stack, libm::truncf)?,
                Opcode::F32Nearest => unop_f32(stack, libm::rintf)?,
                Opcode::F32Sqrt => unop_f32(stack, libm::sqrtf)?,
                Opcode::F32Add => binop_f32(stack, |a, b| a + b)?,
                Opcode::F32Sub => binop_f32(stack, |a, b| a - b)?,
                Opcode::F32Mul => binop_f32(stack, |a, b| a * b)?,
                Opcode::F32Div => binop_f32(stack, |a, b| a / b)?,
                Opcode::F32Min => binop_f32(stack, fmin_32)?,
                Opcode::F32Max => binop_f32(stack, fmax_32)?,
                Opcode::F32Copysign => binop_f32(stack, libm::copysignf)?,

                // f64 arithmetic.
                Opcode::F64Abs => unop_f64(stack, libm::fabs)?,
                Opcode::F64Neg => unop_f64(stack, |a| -a)?,
                Opcode::F64Ceil => unop_f64(stack, libm::ceil)?,
                Opcode::F64Floor => unop_f64(stack, libm::floor)?,
                Opcode::F64Trunc => unop_f64(stack, libm::trunc)?,
                Opcode::F64Nearest => unop_f64(stack, libm::rint)?,
                Opcode::F64Sqrt => unop_f64(stack, libm::sqrt)?,
                Opcode::F64Add => binop_f64(stack, |a, b| a + b)?,
                Opcode::F64Sub => binop_f64(stack, |a, b| a - b)?,
                Opcode::F64Mul => binop_f64(stack, |a, b| a * b)?,
                Opcode::F64Div => binop_f64(stack, |a, b| a / b)?,
                Opcode::F64Min => binop_f64(stack, fmin_64)?,
                Opcode::F64Max => binop_f64(stack, fmax_64)?,
                Opcode::F64Copysign => binop_f64(stack, libm::copysign)?,

                // Conversions. Truncations trap on NaN and out-of-range
                // inputs (the MVP has no saturating forms).
                Opcode::I32WrapI64 => {
                    let v = stack.pop()?.to_i64();
                    stack.push(Value::from_i32(v as i32))?;
                }
                Opcode::I32TruncF32S => {
                    let v = stack.pop()?.to_f32();
                    stack.push(Value::from_i32(trunc_to_i32_s(f64::from(v))?))?;
                }
                Opcode::I32TruncF32U => {
                    let v = stack.pop()?.to_f32();
                    stack.push(Value::from_u32(trunc_to_i32_u(f64::from(v))?))?;
                }
                Opcode::I32TruncF64S => {
                    let v = stack.pop()?.to_f64();
                    stack.push(Value::from_i32(trunc_to_i32_s(v)?))?;
                }
                Opcode::I32TruncF64U => {
                    let v = stack.pop()?.to_f64();
                    stack.push(Value::from_u32(trunc_to_i32_u(v)?))?;
                }
                Opcode::I64ExtendI32S => {
                    let v = stack.pop()?.to_i32();
                    stack.push(Value::from_i64(i64::from(v)))?;
                }
                Opcode::I64ExtendI32U => {
                    let v = stack.pop()?.to_u32();
                    stack.push(Value::from_u64(u64::from(v)))?;
                }
                Opcode::I64TruncF32S => {
                    let v = stack.pop()?.to_f32();
                    stack.push(Value::from_i64(trunc_to_i64_s(f64::from(v))?))?;
                }
                Opcode::I64TruncF32U => {
                    let v = stack.pop()?.to_f32();
                    stack.push(Value::from_u64(trunc_to_i64_u(f64::from(v))?))?;
                }
                Opcode::I64TruncF64S => {
                    let v = stack.pop()?.to_f64();
                    stack.push(Value::from_i64(trunc_to_i64_s(v)?))?;
                }
                Opcode::I64TruncF64U => {
                    let v = stack.pop()?.to_f64();
                    stack.push(Value::from_u64(trunc_to_i64_u(v)?))?;
                }
                Opcode::F32ConvertI32S => {
                    let v = stack.pop()?.to_i32();
                    stack.push(Value::from_f32(v as f32))?;
                }
                Opcode::F32ConvertI32U => {
                    let v = stack.pop()?.to_u32();
                    stack.push(Value::from_f32(v as f32))?;
                }
                Opcode::F32ConvertI64S => {
                    let v = stack.pop()?.to_i64();
                    stack.push(Value::from_f32(v as f32))?;
                }
                Opcode::F32ConvertI64U => {
                    let v = stack.pop()?.to_u64();
                    stack.push(Value::from_f32(v as f32))?;
                }
                Opcode::F32DemoteF64 => {
                    let v = stack.pop()?.to_f64();
                    stack.push(Value::from_f32(v as f32))?;
                }
                Opcode::F64ConvertI32S => {
                    let v = stack.pop()?.to_i32();
                    stack.push(Value::from_f64(f64::from(v)))?;
                }
                Opcode::F64ConvertI32U => {
                    let v = stack.pop()?.to_u32();
                    stack.push(Value::from_f64(f64::from(v)))?;
                }
                Opcode::F64ConvertI64S => {
                    let v = stack.pop()?.to_i64();
                    stack.push(Value::from_f64(v as f64))?;
                }
                Opcode::F64ConvertI64U => {
                    let v = stack.pop()?.to_u64();
                    stack.push(Value::from_f64(v as f64))?;
                }
                Opcode::F64PromoteF32 => {
                    let v = stack.pop()?.to_f32();
                    stack.push(Value::from_f64(f64::from(v)))?;
                }

                // Reinterpretations are identities on the untagged cell.
                Opcode::I32ReinterpretF32
                | Opcode::I64ReinterpretF64
                | Opcode::F32ReinterpretI32
                | Opcode::F64ReinterpretI64 => {}
            }
            pc += 1;
        }
    }
}

// Immediate projections. The parser guarantees the pairing of opcode and
// immediate, so a mismatch is an internal bug rather than a runtime error.

fn imm_index(imm: Imm) -> u32 {
    match imm {
        Imm::Index(idx) => idx,
        _ => unreachable!("opcode missing its index immediate"),
    }
}

fn imm_mem(imm: Imm) -> MemImm {
    match imm {
        Imm::Mem(arg) => arg,
        _ => unreachable!("opcode missing its memory immediate"),
    }
}

fn imm_block(imm: Imm) -> BlockType {
    match imm {
        Imm::Block(block) => block,
        _ => unreachable!("opcode missing its block type"),
    }
}

// Scans forward from `from` until `open` unmatched block structures have
// been closed, returning the index of the closing `end`.
fn matching_end(insts: &[Instr], from: usize, mut open: u32) -> usize {
    let mut i = from;
    loop {
        i += 1;
        match insts[i].op {
            Opcode::Block | Opcode::Loop | Opcode::If => open += 1,
            Opcode::End => {
                open -= 1;
                if open == 0 {
                    return i;
                }
            }
            _ => {}
        }
    }
}

enum ElseOrEnd {
    Else(usize),
    End(usize),
}

// Scans forward from an `if` for its `else` arm, or its `end` if it has
// none.
fn else_or_end(insts: &[Instr], from: usize) -> ElseOrEnd {
    let mut open = 1u32;
    let mut i = from;
    loop {
        i += 1;
        match insts[i].op {
            Opcode::Block | Opcode::Loop | Opcode::If => open += 1,
            Opcode::Else if open == 1 => return ElseOrEnd::Else(i),
            Opcode::End => {
                open -= 1;
                if open == 0 {
                    return ElseOrEnd::End(i);
                }
            }
            _ => {}
        }
    }
}

// The instance's memory (the MVP has at most one). A missing memory reads
// as an out-of-bounds access.
fn mem_of<'s, A: Allocator>(
    store: &'s Store<'_, A>,
    inst: u32,
) -> Result<&'s MemInst<A>, Error> {
    let handle = store
        .mem_by_index(inst, 0)
        .ok_or(Error::Trap(TrapKind::MemoryOutOfBounds))?;
    store.mem(handle).ok_or(Error::InvalidHandle)
}

fn store_bytes<A: Allocator>(
    store: &mut Store<'_, A>,
    inst: u32,
    addr: u32,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    let handle = store
        .mem_by_index(inst, 0)
        .ok_or(Error::Trap(TrapKind::MemoryOutOfBounds))?;
    store
        .mem_mut(handle)
        .ok_or(Error::InvalidHandle)?
        .store(addr, offset, bytes)
        .map_err(Error::Trap)
}

fn load8<A: Allocator>(mem: &MemInst<A>, addr: u32, offset: u32) -> Result<u8, TrapKind> {
    Ok(mem.load(addr, offset, 1)?[0])
}

fn load16<A: Allocator>(mem: &MemInst<A>, addr: u32, offset: u32) -> Result<u16, TrapKind> {
    let bytes = mem.load(addr, offset, 2)?;
    let mut buf = [0u8; 2];
    buf.copy_from_slice(bytes);
    Ok(u16::from_le_bytes(buf))
}

fn load32<A: Allocator>(mem: &MemInst<A>, addr: u32, offset: u32) -> Result<u32, TrapKind> {
    let bytes = mem.load(addr, offset, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf))
}

fn load64<A: Allocator>(mem: &MemInst<A>, addr: u32, offset: u32) -> Result<u64, TrapKind> {
    let bytes = mem.load(addr, offset, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

// Operator templates over the operand stack.

fn binop_i32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i32, i32) -> i32,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i32();
    let a = stack.pop()?.to_i32();
    stack.push(Value::from_i32(f(a, b)))
}

fn binop_i32_checked<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i32, i32) -> Result<i32, TrapKind>,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i32();
    let a = stack.pop()?.to_i32();
    stack.push(Value::from_i32(f(a, b)?))
}

fn binop_u32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u32, u32) -> u32,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u32();
    let a = stack.pop()?.to_u32();
    stack.push(Value::from_u32(f(a, b)))
}

fn binop_u32_checked<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u32, u32) -> Result<u32, TrapKind>,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u32();
    let a = stack.pop()?.to_u32();
    stack.push(Value::from_u32(f(a, b)?))
}

fn binop_i64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i64, i64) -> i64,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i64();
    let a = stack.pop()?.to_i64();
    stack.push(Value::from_i64(f(a, b)))
}

fn binop_i64_checked<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i64, i64) -> Result<i64, TrapKind>,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i64();
    let a = stack.pop()?.to_i64();
    stack.push(Value::from_i64(f(a, b)?))
}

fn binop_u64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u64, u64) -> u64,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u64();
    let a = stack.pop()?.to_u64();
    stack.push(Value::from_u64(f(a, b)))
}

fn binop_u64_checked<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u64, u64) -> Result<u64, TrapKind>,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u64();
    let a = stack.pop()?.to_u64();
    stack.push(Value::from_u64(f(a, b)?))
}

fn binop_f32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f32, f32) -> f32,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_f32();
    let a = stack.pop()?.to_f32();
    stack.push(Value::from_f32(f(a, b)))
}

fn binop_f64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f64, f64) -> f64,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_f64();
    let a = stack.pop()?.to_f64();
    stack.push(Value::from_f64(f(a, b)))
}

fn unop_i32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i32) -> i32,
) -> Result<(), TrapKind> {
    let a = stack.pop()?.to_i32();
    stack.push(Value::from_i32(f(a)))
}

fn unop_i64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i64) -> i64,
) -> Result<(), TrapKind> {
    let a = stack.pop()?.to_i64();
    stack.push(Value::from_i64(f(a)))
}

fn unop_f32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f32) -> f32,
) -> Result<(), TrapKind> {
    let a = stack.pop()?.to_f32();
    stack.push(Value::from_f32(f(a)))
}

fn unop_f64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f64) -> f64,
) -> Result<(), TrapKind> {
    let a = stack.pop()?.to_f64();
    stack.push(Value::from_f64(f(a)))
}

fn cmp_i32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i32, i32) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i32();
    let a = stack.pop()?.to_i32();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

fn cmp_u32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u32, u32) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u32();
    let a = stack.pop()?.to_u32();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

fn cmp_i64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(i64, i64) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_i64();
    let a = stack.pop()?.to_i64();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

fn cmp_u64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(u64, u64) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_u64();
    let a = stack.pop()?.to_u64();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

fn cmp_f32<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f32, f32) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_f32();
    let a = stack.pop()?.to_f32();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

fn cmp_f64<A: Allocator>(
    stack: &mut Stack<A>,
    f: impl FnOnce(f64, f64) -> bool,
) -> Result<(), TrapKind> {
    let b = stack.pop()?.to_f64();
    let a = stack.pop()?.to_f64();
    stack.push(Value::from_i32(i32::from(f(a, b))))
}

// Integer division and remainder, per WebAssembly semantics.

fn div_s_32(a: i32, b: i32) -> Result<i32, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    a.checked_div(b).ok_or(TrapKind::IntegerOverflow)
}

fn div_u_32(a: u32, b: u32) -> Result<u32, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(a / b)
}

fn rem_s_32(a: i32, b: i32) -> Result<i32, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    // i32::MIN % -1 is 0 (it does not trap, unlike division).
    Ok(a.wrapping_rem(b))
}

fn rem_u_32(a: u32, b: u32) -> Result<u32, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(a % b)
}

fn div_s_64(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    a.checked_div(b).ok_or(TrapKind::IntegerOverflow)
}

fn div_u_64(a: u64, b: u64) -> Result<u64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(a / b)
}

fn rem_s_64(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

fn rem_u_64(a: u64, b: u64) -> Result<u64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(a % b)
}

// Float min/max, per WebAssembly semantics: NaN propagates as the canonical
// NaN, and -0 orders below +0.

fn fmin_32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    if a < b { a } else { b }
}

fn fmax_32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { b } else { a };
    }
    if a > b { a } else { b }
}

fn fmin_64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    if a < b { a } else { b }
}

fn fmax_64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { b } else { a };
    }
    if a > b { a } else { b }
}

// Trapping float-to-integer truncation. Inputs are widened to f64 (exactly)
// so each target type needs only one routine.

fn trunc_to_i32_s(x: f64) -> Result<i32, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversion);
    }
    let t = libm::trunc(x);
    if t >= 2_147_483_648.0 || t < -2_147_483_648.0 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(t as i32)
}

fn trunc_to_i32_u(x: f64) -> Result<u32, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversion);
    }
    let t = libm::trunc(x);
    if t >= 4_294_967_296.0 || t < 0.0 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(t as u32)
}

fn trunc_to_i64_s(x: f64) -> Result<i64, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversion);
    }
    let t = libm::trunc(x);
    if t >= 9_223_372_036_854_775_808.0 || t < -9_223_372_036_854_775_808.0 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(t as i64)
}

fn trunc_to_i64_u(x: f64) -> Result<u64, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversion);
    }
    let t = libm::trunc(x);
    if t >= 18_446_744_073_709_551_616.0 || t < 0.0 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(t as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_traps() {
        assert_eq!(div_s_32(i32::MIN, -1), Err(TrapKind::IntegerOverflow));
        assert_eq!(div_s_32(7, 0), Err(TrapKind::DivideByZero));
        assert_eq!(div_s_32(-7, 2), Ok(-3));
        assert_eq!(div_u_32(7, 0), Err(TrapKind::DivideByZero));
        assert_eq!(rem_s_32(i32::MIN, -1), Ok(0));
        assert_eq!(rem_s_32(7, 0), Err(TrapKind::DivideByZero));
        assert_eq!(div_s_64(i64::MIN, -1), Err(TrapKind::IntegerOverflow));
        assert_eq!(rem_s_64(i64::MIN, -1), Ok(0));
        assert_eq!(rem_u_64(7, 4), Ok(3));
    }

    #[test]
    fn float_min_max_follow_wasm_semantics() {
        assert!(fmin_32(f32::NAN, 1.0).is_nan());
        assert!(fmax_64(1.0, f64::NAN).is_nan());
        assert_eq!(fmin_32(-0.0, 0.0).to_bits(), (-0.0f32).to_bits());
        assert_eq!(fmax_32(-0.0, 0.0).to_bits(), 0.0f32.to_bits());
        assert_eq!(fmin_64(1.0, 2.0), 1.0);
        assert_eq!(fmax_64(1.0, 2.0), 2.0);
    }

    #[test]
    fn trapping_truncation_bounds() {
        assert_eq!(trunc_to_i32_s(f64::NAN), Err(TrapKind::InvalidConversion));
        assert_eq!(trunc_to_i32_s(2_147_483_648.0), Err(TrapKind::IntegerOverflow));
        assert_eq!(trunc_to_i32_s(2_147_483_647.9), Ok(i32::MAX));
        assert_eq!(trunc_to_i32_s(-2_147_483_648.9), Ok(i32::MIN));
        assert_eq!(trunc_to_i32_s(-2_147_483_649.0), Err(TrapKind::IntegerOverflow));
        assert_eq!(trunc_to_i32_u(-0.9), Ok(0));
        assert_eq!(trunc_to_i32_u(-1.0), Err(TrapKind::IntegerOverflow));
        assert_eq!(trunc_to_i32_u(4_294_967_295.5), Ok(u32::MAX));
        assert_eq!(trunc_to_i64_u(-0.5), Ok(0));
        assert_eq!(
            trunc_to_i64_s(9_223_372_036_854_775_808.0),
            Err(TrapKind::IntegerOverflow)
        );
    }
}
