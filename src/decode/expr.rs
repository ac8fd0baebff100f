// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Expression and instruction decoding.
//!
//! An expression is decoded one instruction at a time into the builder's
//! flat instruction pool, tracking structured-control depth so that the
//! terminating `end` (the one that returns the depth to zero) closes the
//! expression. Constant expressions (global initializers and segment
//! offsets) additionally restrict which opcodes may appear.

use crate::Allocator;
use crate::arena::{self, Slice};
use crate::module::Builder;
use crate::storage::Stream;
use crate::types::{Imm, ImmKind, Instr, Opcode, TypeIdx};

use super::{ContextId, ContextStack, Error, Parser};

/// Decodes one expression into the instruction pool, returning its span.
///
/// With `const_only` set, any instruction outside the constant subset
/// (`*.const`, `global.get`, `end`) is rejected.
pub(crate) fn parse_expr<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
    const_only: bool,
) -> Result<Slice, Error<Storage>> {
    parser.with_context(context, ContextId::Expr, |parser, context| {
        let start = builder.instrs.len() as u32;
        let mut depth = 0u32;
        loop {
            let instr = parse_instr(parser, context, builder)?;
            if const_only && !instr.op.info().const_ok {
                return Err(Error::NonConstInstruction(instr.op));
            }
            arena::push_one(&mut builder.instrs, instr)?;

            match instr.op {
                Opcode::Block | Opcode::Loop | Opcode::If => depth += 1,
                Opcode::End => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        Ok(Slice::new(start, builder.instrs.len() as u32 - start))
    })
}

/// Decodes a single instruction: one opcode byte, then its immediate per the
/// opcode metadata table.
pub(crate) fn parse_instr<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<Instr, Error<Storage>> {
    parser.with_context(context, ContextId::Instr, |parser, context| {
        let byte = parser.read_byte_raw()?;
        let op = Opcode::try_from(byte).map_err(|_| Error::InvalidOpcode(byte))?;

        let imm = match op.info().imm {
            ImmKind::None => Imm::None,
            ImmKind::Block => Imm::Block(parser.read(context)?),
            ImmKind::Index => Imm::Index(parser.read_leb128_raw()?),
            ImmKind::Mem => Imm::Mem(parser.read(context)?),
            ImmKind::I32 => Imm::I32(parser.read(context)?),
            ImmKind::I64 => Imm::I64(parser.read(context)?),
            ImmKind::F32 => Imm::F32(parser.read(context)?),
            ImmKind::F64 => Imm::F64(parser.read(context)?),
            ImmKind::CallIndirect => {
                // A type index, then the reserved table-index byte (zero in
                // the MVP).
                let type_idx: u32 = parser.read_leb128_raw()?;
                parser.read_zero_byte(context)?;
                Imm::CallIndirect {
                    type_idx: TypeIdx::new(type_idx),
                }
            }
            ImmKind::ReservedZero => {
                parser.read_zero_byte(context)?;
                Imm::None
            }
            ImmKind::BrTable => {
                parser.with_context(context, ContextId::BrTable, |parser, _| {
                    let count: u32 = parser.read_leb128_raw()?;
                    let start = builder.u32s.len() as u32;
                    builder.u32s.try_reserve(count as usize)?;
                    for _ in 0..count {
                        let label: u32 = parser.read_leb128_raw()?;
                        builder.u32s.push(label);
                    }
                    let default: u32 = parser.read_leb128_raw()?;
                    Ok(Imm::BrTable {
                        labels: Slice::new(start, count),
                        default,
                    })
                })?
            }
        };
        Ok(Instr { op, imm })
    })
}
