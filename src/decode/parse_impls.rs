// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Parse trait implementations and per-section parsing routines.

use core::str;

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::arena::{self, Slice};
use crate::module::Builder;
use crate::storage::Stream;
use crate::types::{
    BlockType, CustomSection, Elem, ElemKind, Export, ExternKind, Func, FuncIdx, FuncType, Global,
    GlobalType, Import, ImportDesc, Limits, LocalGroup, MemImm, MemType, Mutability, SectionId,
    Segment, TableType, TypeIdx, ValType, Version,
};

use super::expr::parse_expr;
use super::{ContextId, ContextStack, Contextual, Error, Magic, Parse, Parser};

/// Maximum number of local slots per function (parameters included). It
/// serves to give a reasonable static upper bound, as the spec only gives an
/// upper bound of 2^32 - 1 (unrealistically large) and slots for every local
/// must be allocated upfront on each call.
const MAX_LOCALS_PER_FUNCTION: usize = 2000;

macro_rules! impl_contextual {
    ($type:ty, $id:path) => {
        impl Contextual for $type {
            const ID: ContextId = $id;
        }
    };
}

macro_rules! impl_parse_for_u8_enum {
    ($type:ty, $make_err:expr) => {
        impl Parse for $type {
            fn parse<Storage: Stream>(
                parser: &mut Parser<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let byte = parser.read_byte_raw()?;
                Self::try_from(byte).map_err(|_| $make_err(byte))
            }
        }
    };
}

macro_rules! impl_parse_for_le_u32_enum {
    ($type:ty, $make_err:expr) => {
        impl Parse for $type {
            fn parse<Storage: Stream>(
                parser: &mut Parser<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let mut buf = [0u8; 4];
                parser.read_exact_raw(&mut buf)?;
                let val = u32::from_le_bytes(buf);
                Self::try_from(val).map_err(|_| $make_err(val))
            }
        }
    };
}

impl_contextual!(u8, ContextId::Byte);
impl_contextual!(u32, ContextId::U32);
impl_contextual!(i32, ContextId::I32);
impl_contextual!(i64, ContextId::I64);
impl_contextual!(f32, ContextId::F32);
impl_contextual!(f64, ContextId::F64);
impl_contextual!(Magic, ContextId::Magic);
impl_contextual!(Version, ContextId::Version);
impl_contextual!(SectionId, ContextId::SectionId);
impl_contextual!(ValType, ContextId::ValType);
impl_contextual!(Mutability, ContextId::Mut);
impl_contextual!(ElemKind, ContextId::ElemKind);
impl_contextual!(ExternKind, ContextId::ExternKind);
impl_contextual!(Limits, ContextId::Limits);
impl_contextual!(MemType, ContextId::MemType);
impl_contextual!(TableType, ContextId::TableType);
impl_contextual!(GlobalType, ContextId::GlobalType);
impl_contextual!(BlockType, ContextId::BlockType);
impl_contextual!(MemImm, ContextId::MemArg);

impl_parse_for_u8_enum!(SectionId, Error::InvalidToken);
impl_parse_for_u8_enum!(ValType, Error::InvalidValType);
impl_parse_for_u8_enum!(Mutability, Error::InvalidToken);
impl_parse_for_u8_enum!(ElemKind, Error::InvalidToken);
impl_parse_for_u8_enum!(ExternKind, Error::InvalidToken);

impl_parse_for_le_u32_enum!(Magic, Error::InvalidMagic);
impl_parse_for_le_u32_enum!(Version, Error::UnknownVersion);

impl Parse for u8 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        parser.read_byte_raw()
    }
}

impl Parse for u32 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        parser.read_leb128_raw()
    }
}

impl Parse for i32 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        parser.read_leb128_raw()
    }
}

impl Parse for i64 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        parser.read_leb128_raw()
    }
}

impl Parse for f32 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 4];
        parser.read_exact_raw(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
}

impl Parse for f64 {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 8];
        parser.read_exact_raw(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
enum LimitsToken {
    WithoutMax = 0x00,
    WithMax = 0x01,
}

impl Parse for Limits {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let byte = parser.read_byte_raw()?;
        let token = LimitsToken::try_from(byte).map_err(|_| Error::InvalidToken(byte))?;
        let min: u32 = parser.read_leb128_raw()?;
        let max = match token {
            LimitsToken::WithoutMax => None,
            LimitsToken::WithMax => Some(parser.read_leb128_raw()?),
        };
        Ok(Self { min, max })
    }
}

impl Parse for MemType {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self::new(parser.read(context)?))
    }
}

impl Parse for TableType {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            elem: parser.read(context)?,
            limits: parser.read(context)?,
        })
    }
}

impl Parse for GlobalType {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            value: parser.read(context)?,
            mutability: parser.read(context)?,
        })
    }
}

impl Parse for BlockType {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        // The MVP encodes a block type in one byte: 0x40 for no result, or a
        // value type.
        let byte = parser.read_byte_raw()?;
        if byte == BlockType::VOID_TOKEN {
            Ok(BlockType::Void)
        } else {
            match ValType::try_from(byte) {
                Ok(valtype) => Ok(BlockType::Value(valtype)),
                Err(_) => Err(Error::InvalidValType(byte)),
            }
        }
    }
}

impl Parse for MemImm {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            align: parser.read_leb128_raw()?,
            offset: parser.read_leb128_raw()?,
        })
    }
}

// Reads a length-prefixed UTF-8 name into the byte pool.
fn parse_name<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<Slice, Error<Storage>> {
    parser.with_context(context, ContextId::Name, |parser, context| {
        let len: u32 = parser.read_leb128_raw()?;
        let slice = read_bytes_into_pool(parser, context, builder, len as usize)?;
        str::from_utf8(&builder.bytes[slice.range()]).map_err(|_| Error::InvalidUtf8)?;
        Ok(slice)
    })
}

// Reads `count` raw bytes from the stream into the byte pool.
fn read_bytes_into_pool<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
    count: usize,
) -> Result<Slice, Error<Storage>> {
    let start = builder.bytes.len();
    builder.bytes.try_reserve(count)?;
    builder.bytes.resize(start + count, 0);
    parser.read_exact(context, &mut builder.bytes[start..])?;
    Ok(Slice::new(start as u32, count as u32))
}

// Reads a vector of value types into the value-type pool.
fn parse_valtype_vec<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    builder: &mut Builder<A>,
) -> Result<Slice, Error<Storage>> {
    let count: u32 = parser.read_leb128_raw()?;
    let start = builder.valtypes.len() as u32;
    builder.valtypes.try_reserve(count as usize)?;
    for _ in 0..count {
        let byte = parser.read_byte_raw()?;
        let valtype = ValType::try_from(byte).map_err(|_| Error::InvalidValType(byte))?;
        builder.valtypes.push(valtype);
    }
    Ok(Slice::new(start, count))
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, TryFromPrimitive)]
enum FuncTypeToken {
    Value = 0x60,
}

pub(super) fn type_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::TypeSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.types.try_reserve(count as usize)?;
        for _ in 0..count {
            let ty = parser.with_context(context, ContextId::FuncType, |parser, _| {
                let byte = parser.read_byte_raw()?;
                FuncTypeToken::try_from(byte).map_err(|_| Error::InvalidToken(byte))?;
                let params = parse_valtype_vec(parser, builder)?;
                let results = parse_valtype_vec(parser, builder)?;
                Ok(FuncType { params, results })
            })?;
            builder.types.push(ty);
        }
        Ok(())
    })
}

pub(super) fn import_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::ImportSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.imports.try_reserve(count as usize)?;
        for _ in 0..count {
            let import = parser.with_context(context, ContextId::Import, |parser, context| {
                let module = parse_name(parser, context, builder)?;
                let name = parse_name(parser, context, builder)?;
                let kind: ExternKind = parser.read(context)?;
                let desc = match kind {
                    ExternKind::Func => {
                        ImportDesc::Func(TypeIdx::new(parser.read_leb128_raw()?))
                    }
                    ExternKind::Table => ImportDesc::Table(parser.read(context)?),
                    ExternKind::Mem => ImportDesc::Mem(parser.read(context)?),
                    ExternKind::Global => ImportDesc::Global(parser.read(context)?),
                };
                Ok(Import { module, name, desc })
            })?;
            builder.num_imports[import.desc.kind() as usize] += 1;
            builder.imports.push(import);
        }
        Ok(())
    })
}

pub(super) fn function_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::FuncSec, |parser, _| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.funcs.try_reserve(count as usize)?;
        for _ in 0..count {
            let type_idx = TypeIdx::new(parser.read_leb128_raw()?);
            // The body half arrives with the code section.
            builder.funcs.push(Func {
                type_idx,
                locals: Slice::EMPTY,
                max_locals: 0,
                frame_size: 0,
                expr: Slice::EMPTY,
            });
        }
        Ok(())
    })
}

pub(super) fn table_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::TableSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.tables.try_reserve(count as usize)?;
        for _ in 0..count {
            let table: TableType = parser.read(context)?;
            builder.tables.push(table);
        }
        Ok(())
    })
}

pub(super) fn memory_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::MemSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.mems.try_reserve(count as usize)?;
        for _ in 0..count {
            let mem: MemType = parser.read(context)?;
            builder.mems.push(mem);
        }
        Ok(())
    })
}

pub(super) fn global_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::GlobalSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.globals.try_reserve(count as usize)?;
        for _ in 0..count {
            let global = parser.with_context(context, ContextId::Global, |parser, context| {
                let ty: GlobalType = parser.read(context)?;
                let expr = parse_expr(parser, context, builder, true)?;
                Ok(Global { ty, expr })
            })?;
            builder.globals.push(global);
        }
        Ok(())
    })
}

pub(super) fn export_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::ExportSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.exports.try_reserve(count as usize)?;
        for _ in 0..count {
            let export = parser.with_context(context, ContextId::Export, |parser, context| {
                let name = parse_name(parser, context, builder)?;
                let kind: ExternKind = parser.read(context)?;
                let idx: u32 = parser.read_leb128_raw()?;
                Ok(Export { name, kind, idx })
            })?;
            builder.exports.push(export);
        }
        Ok(())
    })
}

pub(super) fn start_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::StartSec, |parser, _| {
        builder.start = Some(FuncIdx::new(parser.read_leb128_raw()?));
        Ok(())
    })
}

pub(super) fn element_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::ElemSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.elems.try_reserve(count as usize)?;
        for _ in 0..count {
            let elem = parser.with_context(context, ContextId::Elem, |parser, context| {
                let table_idx: u32 = parser.read_leb128_raw()?;
                let expr = parse_expr(parser, context, builder, true)?;

                let num_funcs: u32 = parser.read_leb128_raw()?;
                let start = builder.u32s.len() as u32;
                builder.u32s.try_reserve(num_funcs as usize)?;
                for _ in 0..num_funcs {
                    let func_idx: u32 = parser.read_leb128_raw()?;
                    builder.u32s.push(func_idx);
                }
                Ok(Elem {
                    table_idx,
                    expr,
                    funcs: Slice::new(start, num_funcs),
                })
            })?;
            builder.elems.push(elem);
        }
        Ok(())
    })
}

pub(super) fn code_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::CodeSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        if (count as usize) > builder.funcs.len() {
            return Err(Error::FunctionCodeCountMismatch {
                funcs: builder.funcs.len() as u32,
                codes: count,
            });
        }
        for i in 0..count {
            parser.with_context(context, ContextId::Func, |parser, context| {
                let expected_size: u32 = parser.read_leb128_raw()?;
                let body_start = parser.offset();

                let (locals, max_locals) = parse_locals(parser, context, builder)?;

                // Parameters occupy the low local slots.
                let type_idx = builder.funcs[i as usize].type_idx;
                let num_params = builder
                    .types
                    .get(*type_idx as usize)
                    .map_or(0, |ty| ty.params.len);
                let frame_size = (num_params as usize) + (max_locals as usize);
                if frame_size > MAX_LOCALS_PER_FUNCTION {
                    return Err(Error::TooManyLocals(frame_size));
                }

                let expr = parse_expr(parser, context, builder, false)?;

                let actual_size = (parser.offset() - body_start) as u32;
                if expected_size != actual_size {
                    return Err(Error::InvalidFunctionLength {
                        expected: expected_size,
                        actual: actual_size,
                    });
                }

                let func = &mut builder.funcs[i as usize];
                func.locals = locals;
                func.max_locals = max_locals;
                func.frame_size = frame_size as u32;
                func.expr = expr;
                Ok(())
            })?;
            builder.num_codes += 1;
        }
        Ok(())
    })
}

// Parses a function body's local declarations into the local-group pool,
// returning the span and the total number of slots declared.
fn parse_locals<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(Slice, u32), Error<Storage>> {
    parser.with_context(context, ContextId::Locals, |parser, _| {
        let num_groups: u32 = parser.read_leb128_raw()?;
        let start = builder.locals.len() as u32;
        builder.locals.try_reserve(num_groups as usize)?;
        let mut total: usize = 0;
        for _ in 0..num_groups {
            let count: u32 = parser.read_leb128_raw()?;
            let byte = parser.read_byte_raw()?;
            let ty = ValType::try_from(byte).map_err(|_| Error::InvalidValType(byte))?;
            total += count as usize;
            if total > MAX_LOCALS_PER_FUNCTION {
                return Err(Error::TooManyLocals(total));
            }
            builder.locals.push(LocalGroup { count, ty });
        }
        Ok((Slice::new(start, num_groups), total as u32))
    })
}

pub(super) fn data_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::DataSec, |parser, context| {
        let count: u32 = parser.read_leb128_raw()?;
        builder.segments.try_reserve(count as usize)?;
        for _ in 0..count {
            let segment = parser.with_context(context, ContextId::Segment, |parser, context| {
                let mem_idx: u32 = parser.read_leb128_raw()?;
                let expr = parse_expr(parser, context, builder, true)?;
                let len: u32 = parser.read_leb128_raw()?;
                let data = read_bytes_into_pool(parser, context, builder, len as usize)?;
                Ok(Segment { mem_idx, expr, data })
            })?;
            builder.segments.push(segment);
        }
        Ok(())
    })
}

pub(super) fn custom_section<Storage: Stream, A: Allocator>(
    parser: &mut Parser<Storage>,
    context: &mut ContextStack,
    builder: &mut Builder<A>,
    len: usize,
) -> Result<(), Error<Storage>> {
    parser.with_context(context, ContextId::CustomSec, |parser, context| {
        let name_start = parser.offset();
        let name = parse_name(parser, context, builder)?;
        let consumed = parser.offset() - name_start;
        let Some(remaining) = len.checked_sub(consumed) else {
            return Err(Error::InvalidSectionLength {
                id: SectionId::Custom,
                expected: len as u32,
                actual: consumed as u32,
            });
        };
        let data = read_bytes_into_pool(parser, context, builder, remaining)?;
        arena::push_one(&mut builder.customs, CustomSection { name, data })?;
        Ok(())
    })
}
