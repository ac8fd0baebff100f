// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Module validation.
//!
//! Parsing establishes the purely structural invariants of the binary
//! format; validation establishes the cross-section ones: every index lands
//! in its space (imports counted first), entity counts respect MVP limits,
//! branch label depths stay within the active control structure, constant
//! expressions are actually constant and well-typed, and memory accesses do
//! not claim more alignment than their width.

mod expr;

use crate::Allocator;
use crate::Module;
use crate::types::{
    ExternKind, FuncType, GlobalType, ImportDesc, Limits, MemType, SectionId, ValType,
};

use expr::{validate_body, validate_const_expr};

/// Represents errors that can arise during module validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
pub enum Error {
    /// `br_table` arms must all target labels of the same arity.
    #[display(fmt = "br_table arms disagree in arity (func {func})")]
    BrTableArityMismatch { func: u32 },

    /// A constant expression must leave exactly one value.
    #[display(fmt = "constant expression leaves {count} values; expected exactly one")]
    ConstExprArity { count: u32 },

    /// A constant expression may only read imported immutable globals.
    #[display(fmt = "constant expression reads global {index}, which is not an imported immutable global")]
    ConstExprGlobal { index: u32 },

    /// A constant expression's value must match the declared type.
    #[display(fmt = "constant expression has type {found:?}; expected {expected:?}")]
    ConstExprType { expected: ValType, found: ValType },

    /// Export names must be unique within a module.
    #[display(fmt = "duplicate export name (export {index})")]
    DuplicateExportName { index: u32 },

    /// An index escapes its index space.
    #[display(fmt = "index {index} out of bounds for {id:?} (capacity {capacity})")]
    IndexOutOfBounds {
        id: SectionId,
        index: u32,
        capacity: u32,
    },

    /// A memory access claims an alignment wider than the access itself.
    #[display(fmt = "alignment 2^{align} exceeds the width of the access (func {func})")]
    InvalidAlignment { func: u32, align: u32 },

    /// Memory limits must satisfy `min <= max <= 65536` pages.
    #[display(fmt = "invalid memory limits ({limits:?})")]
    InvalidMemLimits { limits: Limits },

    /// Table limits must satisfy `min <= max`.
    #[display(fmt = "invalid table limits ({limits:?})")]
    InvalidTableLimits { limits: Limits },

    /// A branch label exceeds the control depth at its program point.
    #[display(fmt = "label {label} exceeds control depth {depth} (func {func})")]
    LabelOutOfBounds { func: u32, label: u32, depth: u32 },

    /// A local index exceeds the function's frame.
    #[display(fmt = "local {index} out of bounds (frame size {capacity}, func {func})")]
    LocalIndexOutOfBounds { func: u32, index: u32, capacity: u32 },

    /// `else` is only meaningful directly within an `if`.
    #[display(fmt = "misplaced else (func {func})")]
    MisplacedElse { func: u32 },

    /// `call_indirect` requires the module to have a table.
    #[display(fmt = "call_indirect requires a table (func {func})")]
    MissingTable { func: u32 },

    /// The MVP allows at most one memory.
    #[display(fmt = "module has {count} memories; the MVP allows at most one")]
    MultipleMemories { count: u32 },

    /// The MVP allows at most one result per function type.
    #[display(fmt = "type {type_idx} has {count} results; the MVP allows at most one")]
    MultipleResults { type_idx: u32, count: u32 },

    /// The MVP allows at most one table.
    #[display(fmt = "module has {count} tables; the MVP allows at most one")]
    MultipleTables { count: u32 },

    /// The start function must take and return nothing.
    #[display(fmt = "start function {index} must have type () -> ()")]
    StartFunctionSignature { index: u32 },
}

// Resolves the type of the idx'th global import, if it exists.
fn imported_global<A: Allocator>(module: &Module<A>, idx: u32) -> Option<GlobalType> {
    module
        .imports()
        .iter()
        .filter_map(|import| match import.desc {
            ImportDesc::Global(ty) => Some(ty),
            _ => None,
        })
        .nth(idx as usize)
}

// Resolves the signature of the idx'th function import, if it exists.
fn imported_func_type<A: Allocator>(module: &Module<A>, idx: u32) -> Option<&FuncType> {
    module
        .imports()
        .iter()
        .filter_map(|import| match import.desc {
            ImportDesc::Func(type_idx) => Some(module.func_type(type_idx)),
            _ => None,
        })
        .nth(idx as usize)
}

// Resolves a function signature by effective index (imports first).
fn func_type_by_index<A: Allocator>(module: &Module<A>, idx: u32) -> Option<&FuncType> {
    let num_imported = module.num_imports(ExternKind::Func);
    if idx < num_imported {
        imported_func_type(module, idx)
    } else {
        let func = module.funcs().get((idx - num_imported) as usize)?;
        Some(module.func_type(func.type_idx))
    }
}

fn check_index(id: SectionId, index: u32, capacity: u32) -> Result<(), Error> {
    if index < capacity {
        Ok(())
    } else {
        Err(Error::IndexOutOfBounds {
            id,
            index,
            capacity,
        })
    }
}

fn check_table_limits(limits: Limits) -> Result<(), Error> {
    if let Some(max) = limits.max
        && limits.min > max
    {
        return Err(Error::InvalidTableLimits { limits });
    }
    Ok(())
}

fn check_mem_limits(limits: Limits) -> Result<(), Error> {
    let max = limits.max.unwrap_or(MemType::MAX_PAGES);
    if limits.min > max || max > MemType::MAX_PAGES {
        return Err(Error::InvalidMemLimits { limits });
    }
    Ok(())
}

/// Validates a freshly parsed module.
pub(crate) fn validate_module<A: Allocator + Clone>(module: &Module<A>) -> Result<(), Error> {
    // Function types carry at most one result in the MVP.
    for (i, ty) in module.types().iter().enumerate() {
        if ty.results.len > 1 {
            return Err(Error::MultipleResults {
                type_idx: i as u32,
                count: ty.results.len,
            });
        }
    }

    // Imports: referenced types exist, declared limits are sane.
    for import in module.imports() {
        match import.desc {
            ImportDesc::Func(type_idx) => {
                check_index(SectionId::Type, *type_idx, module.types().len() as u32)?;
            }
            ImportDesc::Table(table) => check_table_limits(table.limits)?,
            ImportDesc::Mem(mem) => check_mem_limits(*mem)?,
            ImportDesc::Global(_) => {} // A global type is always valid.
        }
    }

    // Functions reference real signatures.
    for func in module.funcs() {
        check_index(SectionId::Type, *func.type_idx, module.types().len() as u32)?;
    }

    // MVP: at most one table and one memory, imports included.
    let num_tables = module.index_space(ExternKind::Table);
    if num_tables > 1 {
        return Err(Error::MultipleTables { count: num_tables });
    }
    let num_mems = module.index_space(ExternKind::Mem);
    if num_mems > 1 {
        return Err(Error::MultipleMemories { count: num_mems });
    }
    for table in module.tables() {
        check_table_limits(table.limits)?;
    }
    for mem in module.mems() {
        check_mem_limits(**mem)?;
    }

    // Globals have well-typed constant initializers.
    for global in module.globals() {
        validate_const_expr(module, global.expr, global.ty.value)?;
    }

    // Exports land in their index spaces and have unique names.
    let exports = module.exports();
    for (i, export) in exports.iter().enumerate() {
        let id = match export.kind {
            ExternKind::Func => SectionId::Function,
            ExternKind::Table => SectionId::Table,
            ExternKind::Mem => SectionId::Memory,
            ExternKind::Global => SectionId::Global,
        };
        check_index(id, export.idx, module.index_space(export.kind))?;

        for prior in &exports[..i] {
            if module.view_bytes(prior.name) == module.view_bytes(export.name) {
                return Err(Error::DuplicateExportName { index: i as u32 });
            }
        }
    }

    // The start function exists and has type () -> ().
    if let Some(start) = module.start() {
        check_index(
            SectionId::Function,
            *start,
            module.index_space(ExternKind::Func),
        )?;
        let ty = func_type_by_index(module, *start)
            .expect("index was just checked against the function space");
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(Error::StartFunctionSignature { index: *start });
        }
    }

    // Element segments: table and functions exist, offsets are constant i32s.
    for elem in module.elems() {
        check_index(SectionId::Table, elem.table_idx, num_tables)?;
        validate_const_expr(module, elem.expr, ValType::I32)?;
        for &func_idx in module.view_u32s(elem.funcs) {
            check_index(
                SectionId::Function,
                func_idx,
                module.index_space(ExternKind::Func),
            )?;
        }
    }

    // Data segments: memory exists, offsets are constant i32s.
    for segment in module.segments() {
        check_index(SectionId::Memory, segment.mem_idx, num_mems)?;
        validate_const_expr(module, segment.expr, ValType::I32)?;
    }

    // Function bodies: indices in range, labels within the control depth,
    // alignment hints within the access width.
    for (i, func) in module.funcs().iter().enumerate() {
        validate_body(module, func, i as u32)?;
    }

    Ok(())
}
