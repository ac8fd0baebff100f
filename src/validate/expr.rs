// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Expression validation: constant expressions and function bodies.

use crate::Allocator;
use crate::Module;
use crate::arena::Slice;
use crate::core_compat::vec::Vec;
use crate::types::{
    BlockType, ExternKind, Func, Imm, Instr, Mutability, Opcode, SectionId, ValType,
};

use super::{Error, imported_global};

// Checks that a constant expression (already restricted to the constant
// opcode subset during parsing) terminates with exactly one value of the
// declared type, and that any global it reads is an imported immutable one.
pub(super) fn validate_const_expr<A: Allocator>(
    module: &Module<A>,
    expr: Slice,
    expected: ValType,
) -> Result<(), Error> {
    let mut count: u32 = 0;
    let mut last = None;
    for instr in module.view_instrs(expr) {
        let ty = match (instr.op, instr.imm) {
            (Opcode::I32Const, _) => ValType::I32,
            (Opcode::I64Const, _) => ValType::I64,
            (Opcode::F32Const, _) => ValType::F32,
            (Opcode::F64Const, _) => ValType::F64,
            (Opcode::GlobalGet, Imm::Index(idx)) => {
                let Some(global) = imported_global(module, idx) else {
                    return Err(Error::ConstExprGlobal { index: idx });
                };
                if global.mutability != Mutability::Const {
                    return Err(Error::ConstExprGlobal { index: idx });
                }
                global.value
            }
            (Opcode::End, _) => break,
            // The parser admits nothing else into a constant expression.
            _ => unreachable!("non-constant instruction survived parsing: {:?}", instr.op),
        };
        count += 1;
        last = Some(ty);
    }

    if count != 1 {
        return Err(Error::ConstExprArity { count });
    }
    let found = last.expect("count is exactly one");
    if found != expected {
        return Err(Error::ConstExprType { expected, found });
    }
    Ok(())
}

// One open structured-control construct during the body scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Else,
}

#[derive(Clone, Copy, Debug)]
struct Frame {
    kind: FrameKind,
    arity: u32,
}

// The arity of a branch to the label `depth` levels up, where `frames.len()`
// itself addresses the function's root label.
fn branch_arity<A: Allocator>(
    module: &Module<A>,
    func: &Func,
    frames: &[Frame],
    label: u32,
) -> u32 {
    if (label as usize) == frames.len() {
        return module.func_type(func.type_idx).results.len;
    }
    let frame = frames[frames.len() - 1 - (label as usize)];
    match frame.kind {
        // A branch to a loop re-enters it and so carries no values.
        FrameKind::Loop => 0,
        _ => frame.arity,
    }
}

// Scans one function body linearly, tracking structured-control depth:
// block/loop/if push, end pops, else swaps. Along the way, checks branch
// label depths, br_table arity agreement, call/global/local indices, and
// memory access alignment.
pub(super) fn validate_body<A: Allocator + Clone>(
    module: &Module<A>,
    func: &Func,
    func_idx: u32,
) -> Result<(), Error> {
    let mut frames: Vec<Frame, A> = Vec::new_in(module.alloc().clone());

    let check_label = |frames: &Vec<Frame, A>, label: u32| -> Result<(), Error> {
        if (label as usize) > frames.len() {
            return Err(Error::LabelOutOfBounds {
                func: func_idx,
                label,
                depth: frames.len() as u32,
            });
        }
        Ok(())
    };

    for instr in module.view_instrs(func.expr) {
        let Instr { op, imm } = *instr;
        match op {
            Opcode::Block | Opcode::Loop | Opcode::If => {
                let arity = match imm {
                    Imm::Block(bt) => bt.arity(),
                    _ => BlockType::Void.arity(),
                };
                let kind = match op {
                    Opcode::Block => FrameKind::Block,
                    Opcode::Loop => FrameKind::Loop,
                    _ => FrameKind::If,
                };
                frames.push(Frame { kind, arity });
            }
            Opcode::Else => {
                let Some(frame) = frames.last_mut() else {
                    return Err(Error::MisplacedElse { func: func_idx });
                };
                if frame.kind != FrameKind::If {
                    return Err(Error::MisplacedElse { func: func_idx });
                }
                frame.kind = FrameKind::Else;
            }
            Opcode::End => {
                // The end that empties the stack is the function's final
                // instruction; the parser stopped the expression there.
                frames.pop();
            }
            Opcode::Br | Opcode::BrIf => {
                let Imm::Index(label) = imm else {
                    unreachable!("branch without a label immediate")
                };
                check_label(&frames, label)?;
            }
            Opcode::BrTable => {
                let Imm::BrTable { labels, default } = imm else {
                    unreachable!("br_table without operands")
                };
                check_label(&frames, default)?;
                let expected = branch_arity(module, func, &frames, default);
                for &label in module.view_u32s(labels) {
                    check_label(&frames, label)?;
                    if branch_arity(module, func, &frames, label) != expected {
                        return Err(Error::BrTableArityMismatch { func: func_idx });
                    }
                }
            }
            Opcode::Call => {
                let Imm::Index(callee) = imm else {
                    unreachable!("call without a function index")
                };
                let capacity = module.index_space(ExternKind::Func);
                if callee >= capacity {
                    return Err(Error::IndexOutOfBounds {
                        id: SectionId::Function,
                        index: callee,
                        capacity,
                    });
                }
            }
            Opcode::CallIndirect => {
                let Imm::CallIndirect { type_idx } = imm else {
                    unreachable!("call_indirect without a type index")
                };
                let capacity = module.types().len() as u32;
                if *type_idx >= capacity {
                    return Err(Error::IndexOutOfBounds {
                        id: SectionId::Type,
                        index: *type_idx,
                        capacity,
                    });
                }
                if module.index_space(ExternKind::Table) == 0 {
                    return Err(Error::MissingTable { func: func_idx });
                }
            }
            Opcode::LocalGet | Opcode::LocalSet | Opcode::LocalTee => {
                let Imm::Index(index) = imm else {
                    unreachable!("local access without an index")
                };
                if index >= func.frame_size {
                    return Err(Error::LocalIndexOutOfBounds {
                        func: func_idx,
                        index,
                        capacity: func.frame_size,
                    });
                }
            }
            Opcode::GlobalGet | Opcode::GlobalSet => {
                let Imm::Index(index) = imm else {
                    unreachable!("global access without an index")
                };
                let capacity = module.index_space(ExternKind::Global);
                if index >= capacity {
                    return Err(Error::IndexOutOfBounds {
                        id: SectionId::Global,
                        index,
                        capacity,
                    });
                }
            }
            _ => {
                if let (Some(width), Imm::Mem(mem)) = (op.access_width(), imm) {
                    // The alignment hint may not exceed the access width.
                    if mem.align >= 32 || (1u32 << mem.align) > width {
                        return Err(Error::InvalidAlignment {
                            func: func_idx,
                            align: mem.align,
                        });
                    }
                }
            }
        }
    }

    Ok(())
}
