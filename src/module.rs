// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The parsed, frozen module representation.
//!
//! During parsing a [`Builder`] accumulates entities and their
//! variable-length payloads in growable arena pools. On success the builder
//! freezes into a [`Module`]: an immutable aggregate that exclusively owns
//! its pools and hands out borrowed views resolved through [`Slice`] spans.
//! The module records enough bookkeeping (per-kind import counts, the
//! section stream, bytes consumed) for embedders to compute effective
//! indices and re-derive the module's shape without re-parsing.

use core::fmt;
use core::str;

use crate::Allocator;
use crate::arena::{self, Slice};
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;
use crate::decode::{self, ErrorWithContext};
use crate::storage::{Buffer, Stream};
use crate::types::{
    CustomSection, Elem, Export, ExternKind, Func, FuncIdx, FuncType, Global, Import, Instr,
    LocalGroup, MemType, SectionEntry, Segment, TableType, TypeIdx, ValType, Version,
};
use crate::validate;

/// An error from module creation: either the binary couldn't be parsed, or
/// it parsed but failed validation.
pub enum Error<Storage: Stream> {
    Parse(ErrorWithContext<Storage>),
    Validate(validate::Error),
}

impl<Storage: Stream> fmt::Display for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(err) => write!(f, "{err}"),
            Error::Validate(err) => write!(f, "{err}"),
        }
    }
}

impl<Storage: Stream> fmt::Debug for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// Accumulates parsed entities and arena pools until the whole module has
// been consumed.
pub(crate) struct Builder<A: Allocator> {
    // Backing pools.
    pub(crate) valtypes: Vec<ValType, A>,
    pub(crate) u32s: Vec<u32, A>,
    pub(crate) bytes: Vec<u8, A>,
    pub(crate) instrs: Vec<Instr, A>,
    pub(crate) locals: Vec<LocalGroup, A>,

    // Entities.
    pub(crate) types: Vec<FuncType, A>,
    pub(crate) imports: Vec<Import, A>,
    pub(crate) funcs: Vec<Func, A>,
    pub(crate) tables: Vec<TableType, A>,
    pub(crate) mems: Vec<MemType, A>,
    pub(crate) globals: Vec<Global, A>,
    pub(crate) exports: Vec<Export, A>,
    pub(crate) elems: Vec<Elem, A>,
    pub(crate) segments: Vec<Segment, A>,
    pub(crate) customs: Vec<CustomSection, A>,

    // Bookkeeping.
    pub(crate) sections: Vec<SectionEntry, A>,
    pub(crate) num_imports: [u32; ExternKind::COUNT],
    pub(crate) start: Option<FuncIdx>,
    pub(crate) version: Version,
    pub(crate) num_codes: u32,
}

impl<A: Allocator + Clone> Builder<A> {
    pub(crate) fn new_in(alloc: A) -> Self {
        Self {
            valtypes: Vec::new_in(alloc.clone()),
            u32s: Vec::new_in(alloc.clone()),
            bytes: Vec::new_in(alloc.clone()),
            instrs: Vec::new_in(alloc.clone()),
            locals: Vec::new_in(alloc.clone()),
            types: Vec::new_in(alloc.clone()),
            imports: Vec::new_in(alloc.clone()),
            funcs: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            mems: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc.clone()),
            exports: Vec::new_in(alloc.clone()),
            elems: Vec::new_in(alloc.clone()),
            segments: Vec::new_in(alloc.clone()),
            customs: Vec::new_in(alloc.clone()),
            sections: Vec::new_in(alloc),
            num_imports: [0; ExternKind::COUNT],
            start: None,
            version: Version::V1,
            num_codes: 0,
        }
    }
}

impl<A: Allocator> Builder<A> {
    pub(crate) fn record_section(&mut self, entry: SectionEntry) -> Result<(), TryReserveError> {
        arena::push_one(&mut self.sections, entry)?;
        Ok(())
    }

    // Freezes the builder into an immutable module. `nbytes` is the total
    // number of input bytes consumed.
    pub(crate) fn freeze(self, nbytes: usize) -> Module<A> {
        Module {
            valtypes: self.valtypes.into_boxed_slice(),
            u32s: self.u32s.into_boxed_slice(),
            bytes: self.bytes.into_boxed_slice(),
            instrs: self.instrs.into_boxed_slice(),
            locals: self.locals.into_boxed_slice(),
            types: self.types.into_boxed_slice(),
            imports: self.imports.into_boxed_slice(),
            funcs: self.funcs.into_boxed_slice(),
            tables: self.tables.into_boxed_slice(),
            mems: self.mems.into_boxed_slice(),
            globals: self.globals.into_boxed_slice(),
            exports: self.exports.into_boxed_slice(),
            elems: self.elems.into_boxed_slice(),
            segments: self.segments.into_boxed_slice(),
            customs: self.customs.into_boxed_slice(),
            sections: self.sections.into_boxed_slice(),
            num_imports: self.num_imports,
            start: self.start,
            version: self.version,
            nbytes,
        }
    }
}

/// A parsed and validated WebAssembly module.
///
/// The module exclusively owns its arena pools; every view handed out
/// borrows from them. Entities reference variable-length data through
/// [`Slice`] spans whose pool is implied by the field (see the accessors
/// below).
pub struct Module<A: Allocator> {
    valtypes: Box<[ValType], A>,
    u32s: Box<[u32], A>,
    bytes: Box<[u8], A>,
    instrs: Box<[Instr], A>,
    locals: Box<[LocalGroup], A>,

    types: Box<[FuncType], A>,
    imports: Box<[Import], A>,
    funcs: Box<[Func], A>,
    tables: Box<[TableType], A>,
    mems: Box<[MemType], A>,
    globals: Box<[Global], A>,
    exports: Box<[Export], A>,
    elems: Box<[Elem], A>,
    segments: Box<[Segment], A>,
    customs: Box<[CustomSection], A>,

    sections: Box<[SectionEntry], A>,
    num_imports: [u32; ExternKind::COUNT],
    start: Option<FuncIdx>,
    version: Version,
    nbytes: usize,
}

impl<A: Allocator + Clone> Module<A> {
    /// Parses and validates a module read from the given storage.
    pub fn decode<Storage: Stream>(storage: Storage, alloc: A) -> Result<Self, Error<Storage>> {
        let module = decode::decode_module(storage, alloc).map_err(Error::Parse)?;
        validate::validate_module(&module).map_err(Error::Validate)?;
        Ok(module)
    }

    /// Parses and validates a module held in memory.
    pub fn from_bytes<Bytes: AsRef<[u8]>>(
        bytes: Bytes,
        alloc: A,
    ) -> Result<Self, Error<Buffer<Bytes>>> {
        Self::decode(Buffer::new(bytes), alloc)
    }
}

impl<A: Allocator> Module<A> {
    // The allocator the module's pools live in.
    pub(crate) fn alloc(&self) -> &A {
        Box::allocator(&self.bytes)
    }

    /// The module's binary format version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The total number of input bytes the module occupied.
    pub fn bytes_consumed(&self) -> usize {
        self.nbytes
    }

    /// The recorded section stream: every section that appeared, in order,
    /// with its declared length.
    pub fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    /// Custom sections, in order of appearance.
    pub fn custom_sections(&self) -> &[CustomSection] {
        &self.customs
    }

    /// Function signatures (the type section).
    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    /// Import declarations, in order of appearance.
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Module-defined functions. Indices here are *defined* indices; add
    /// the function import count to obtain effective index-space positions.
    pub fn funcs(&self) -> &[Func] {
        &self.funcs
    }

    /// Module-defined tables.
    pub fn tables(&self) -> &[TableType] {
        &self.tables
    }

    /// Module-defined memories.
    pub fn mems(&self) -> &[MemType] {
        &self.mems
    }

    /// Module-defined globals.
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Export declarations.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Element segments.
    pub fn elems(&self) -> &[Elem] {
        &self.elems
    }

    /// Data segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The u32 backing pool (branch-table labels, element function indices).
    pub fn u32s(&self) -> &[u32] {
        &self.u32s
    }

    /// The byte backing pool (names, data segment payloads, custom section
    /// content).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The instruction backing pool (all decoded expressions).
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// The local-group backing pool.
    pub fn local_groups(&self) -> &[LocalGroup] {
        &self.locals
    }

    /// The value-type backing pool (function signature params/results).
    pub fn valtypes(&self) -> &[ValType] {
        &self.valtypes
    }

    /// Resolves a span of the u32 pool.
    pub fn view_u32s(&self, slice: Slice) -> &[u32] {
        &self.u32s[slice.range()]
    }

    /// Resolves a span of the byte pool.
    pub fn view_bytes(&self, slice: Slice) -> &[u8] {
        &self.bytes[slice.range()]
    }

    /// Resolves a span of the instruction pool.
    pub fn view_instrs(&self, slice: Slice) -> &[Instr] {
        &self.instrs[slice.range()]
    }

    /// Resolves a span of the local-group pool.
    pub fn view_locals(&self, slice: Slice) -> &[LocalGroup] {
        &self.locals[slice.range()]
    }

    /// Resolves a span of the value-type pool.
    pub fn view_valtypes(&self, slice: Slice) -> &[ValType] {
        &self.valtypes[slice.range()]
    }

    /// Resolves a name span as UTF-8. Returns None if the span does not hold
    /// valid UTF-8 (never the case for spans the parser produced as names).
    pub fn name(&self, slice: Slice) -> Option<&str> {
        str::from_utf8(self.view_bytes(slice)).ok()
    }

    /// Resolves a function signature by type index.
    pub fn func_type(&self, type_idx: TypeIdx) -> &FuncType {
        &self.types[*type_idx as usize]
    }

    /// The number of imports of the given kind. Imports occupy the low range
    /// of each index space.
    pub fn num_imports(&self, kind: ExternKind) -> u32 {
        self.num_imports[kind as usize]
    }

    /// The total size of the given kind's index space: imports counted
    /// first, then module-defined entities.
    pub fn index_space(&self, kind: ExternKind) -> u32 {
        let defined = match kind {
            ExternKind::Func => self.funcs.len(),
            ExternKind::Table => self.tables.len(),
            ExternKind::Mem => self.mems.len(),
            ExternKind::Global => self.globals.len(),
        };
        self.num_imports[kind as usize] + (defined as u32)
    }

    /// The start function, if the module declares one.
    pub fn start(&self) -> Option<FuncIdx> {
        self.start
    }

    /// Looks up an export by name and kind, returning the index of the
    /// entity within its kind's index space.
    pub fn find_export(&self, name: &str, kind: ExternKind) -> Option<u32> {
        self.exports
            .iter()
            .find(|export| export.kind == kind && self.view_bytes(export.name) == name.as_bytes())
            .map(|export| export.idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Global as GlobalAlloc;

    #[test]
    fn builder_freezes_into_empty_module() {
        let builder = Builder::new_in(GlobalAlloc);
        let module = builder.freeze(8);
        assert_eq!(module.bytes_consumed(), 8);
        assert!(module.types().is_empty());
        assert!(module.funcs().is_empty());
        assert!(module.sections().is_empty());
        assert_eq!(module.index_space(ExternKind::Func), 0);
        assert_eq!(module.start(), None);
    }
}
