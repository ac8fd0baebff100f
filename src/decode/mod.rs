// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format parsing.
//!
//! [`decode_module`] walks the section stream of a binary module and fills
//! the arena pools of a [`Builder`], which freezes into a [`Module`] once the
//! whole input has been consumed. Parsing enforces the purely structural
//! invariants of the format (magic/version, section ordering and uniqueness,
//! declared lengths, balanced expressions, reserved bytes); everything that
//! requires cross-section knowledge is left to [`crate::validate`].

mod expr;
mod leb128;
mod parse_impls;

use core::fmt;

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::module::{Builder, Module};
use crate::storage::Stream;
use crate::types::{Opcode, SectionEntry, SectionId, Version};

use leb128::Leb128;

// The maximum parsing depth of this implementation: the deepest legitimate
// context nesting is a branch-table operand within an instruction within an
// expression within a function within the code section.
const MAX_DEPTH: usize = 8;

// We represent this as an enum with one value to leverage the existing
// "decode this u32 enum" machinery to check for a valid magic value.
#[derive(Clone, Copy, Debug, TryFromPrimitive)]
#[repr(u32)]
enum Magic {
    Value = 0x6d_73_61_00, // '\0asm'
}

// Represents parsing context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
enum ContextId {
    #[default]
    Invalid,
    BlockType,
    BrTable,
    Byte,
    CodeSec,
    CustomSec,
    DataSec,
    Elem,
    ElemKind,
    ElemSec,
    Export,
    ExportSec,
    Expr,
    ExternKind,
    F32,
    F64,
    Func,
    FuncSec,
    FuncType,
    Global,
    GlobalSec,
    GlobalType,
    I32,
    I64,
    Import,
    ImportSec,
    Instr,
    Limits,
    Locals,
    Magic,
    MemArg,
    MemSec,
    MemType,
    Mut,
    Name,
    Opcode,
    ReadingBytes,
    SectionId,
    Segment,
    SkippingBytes,
    StartSec,
    TableSec,
    TableType,
    TypeSec,
    U32,
    ValType,
    Version,
}

impl From<ContextId> for &'static str {
    fn from(id: ContextId) -> Self {
        match id {
            ContextId::Invalid => unreachable!("invalid context somehow reached!?"),
            ContextId::BlockType => "blocktype",
            ContextId::BrTable => "br_table operands",
            ContextId::Byte => "byte",
            ContextId::CodeSec => "codesec",
            ContextId::CustomSec => "customsec",
            ContextId::DataSec => "datasec",
            ContextId::Elem => "elem",
            ContextId::ElemKind => "elemkind",
            ContextId::ElemSec => "elemsec",
            ContextId::Export => "export",
            ContextId::ExportSec => "exportsec",
            ContextId::Expr => "expr",
            ContextId::ExternKind => "extern kind",
            ContextId::F32 => "f32",
            ContextId::F64 => "f64",
            ContextId::Func => "func",
            ContextId::FuncSec => "funcsec",
            ContextId::FuncType => "functype",
            ContextId::Global => "global",
            ContextId::GlobalSec => "globalsec",
            ContextId::GlobalType => "globaltype",
            ContextId::I32 => "i32",
            ContextId::I64 => "i64",
            ContextId::Import => "import",
            ContextId::ImportSec => "importsec",
            ContextId::Instr => "instr",
            ContextId::Limits => "limits",
            ContextId::Locals => "locals",
            ContextId::Magic => "magic",
            ContextId::MemArg => "memarg",
            ContextId::MemSec => "memsec",
            ContextId::MemType => "memtype",
            ContextId::Mut => "mut",
            ContextId::Name => "name",
            ContextId::Opcode => "opcode",
            ContextId::ReadingBytes => "reading bytes",
            ContextId::SectionId => "section ID",
            ContextId::Segment => "data segment",
            ContextId::SkippingBytes => "skipping bytes",
            ContextId::StartSec => "startsec",
            ContextId::TableSec => "tablesec",
            ContextId::TableType => "tabletype",
            ContextId::TypeSec => "typesec",
            ContextId::U32 => "u32",
            ContextId::ValType => "valtype",
            ContextId::Version => "version",
        }
    }
}

pub(crate) trait Contextual {
    const ID: ContextId;
}

// A frame of parsing context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ContextFrame {
    // A description of what is being parsed.
    context: &'static str,

    // Byte offset in the stream where this context was entered.
    offset: usize,
}

/// Stack for tracking parsing context during error reporting.
#[derive(Clone, Debug, Default)]
pub struct ContextStack {
    offsets: [usize; MAX_DEPTH],
    ids: [ContextId; MAX_DEPTH],
    depth: u8,
}

impl ContextStack {
    // Pushes a new context frame, returning true if successful.
    fn push(&mut self, id: ContextId, offset: usize) -> bool {
        let depth = self.depth as usize;
        if depth >= MAX_DEPTH {
            return false;
        }
        self.offsets[depth] = offset;
        self.ids[depth] = id;
        self.depth += 1;
        true
    }

    // Pop the top context frame.
    fn pop(&mut self) {
        debug_assert!(self.depth > 0, "{self:#?}");
        self.depth -= 1;
    }

    // Returns an iterator over frames in "pushed" order (outermost to
    // innermost).
    fn iter(&self) -> impl Iterator<Item = ContextFrame> + '_ {
        self.offsets
            .iter()
            .zip(&self.ids)
            .take(self.depth as usize)
            .map(|(&offset, &id)| ContextFrame {
                context: id.into(),
                offset,
            })
    }
}

/// A parsing error with additional context around what hierarchy of things
/// were being decoded at the time.
pub struct ErrorWithContext<Storage: Stream> {
    /// The underlying parsing error.
    pub error: Error<Storage>,
    context: ContextStack,
}

impl<Storage: Stream> fmt::Display for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        for (i, frame) in self.context.iter().enumerate() {
            write!(f, "\n{:#x}: ", frame.offset)?;
            for _ in 0..i {
                write!(f, "  ")?;
            }
            write!(f, "{}", frame.context)?;
        }
        Ok(())
    }
}

impl<Storage: Stream> fmt::Debug for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Represents errors that can arise during module parsing.
pub enum Error<Storage: Stream> {
    /// Failed memory allocation.
    AllocError,
    /// A given section appears more than once in the module.
    DuplicateSection(SectionId),
    /// Parser context stack exceeded its maximum depth.
    ExcessiveParsingDepth {
        context: &'static str,
        offset: usize,
    },
    /// The number of code-section entries does not match the number of
    /// function-section entries.
    FunctionCodeCountMismatch { funcs: u32, codes: u32 },
    /// Function body length doesn't match the declared length.
    InvalidFunctionLength { expected: u32, actual: u32 },
    /// Invalid LEB128 encoding encountered.
    InvalidLeb128,
    /// Invalid WebAssembly magic number.
    InvalidMagic(u32),
    /// A reserved or undefined opcode byte.
    InvalidOpcode(u8),
    /// Section length doesn't match the declared length.
    InvalidSectionLength {
        id: SectionId,
        expected: u32,
        actual: u32,
    },
    /// Invalid byte token encountered during parsing (including a non-zero
    /// reserved byte).
    InvalidToken(u8),
    /// Invalid UTF-8 encoding in a name field.
    InvalidUtf8,
    /// Invalid value type encoding encountered.
    InvalidValType(u8),
    /// An instruction not permitted in a constant expression.
    NonConstInstruction(Opcode),
    /// (Non-custom) sections appear in the wrong order.
    OutOfOrderSection { before: SectionId, after: SectionId },
    /// Error from the underlying storage.
    Storage(Storage::Error),
    /// Function declares too many local variables (exceeding an
    /// implementation-defined limit).
    TooManyLocals(usize),
    /// Unsupported WebAssembly version number.
    UnknownVersion(u32),
}

impl<Storage: Stream> fmt::Display for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::DuplicateSection(id) => write!(f, "duplicate of section ({id:?})"),
            Error::ExcessiveParsingDepth { context, offset } => {
                write!(f, "unexpected frame at {offset:#x}: {context}")
            }
            Error::FunctionCodeCountMismatch { funcs, codes } => write!(
                f,
                "function/code section mismatch: {funcs} function(s); {codes} bodie(s)"
            ),
            Error::InvalidFunctionLength { expected, actual } => write!(
                f,
                "invalid func length: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidLeb128 => write!(f, "invalid LEB128-encoding"),
            Error::InvalidMagic(magic) => write!(f, "invalid magic ({magic:#x})"),
            Error::InvalidOpcode(op) => write!(f, "invalid opcode ({op:#x})"),
            Error::InvalidSectionLength {
                id,
                expected,
                actual,
            } => write!(
                f,
                "invalid section length for {id:?}: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidToken(token) => write!(f, "invalid byte token ({token:#x})"),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8"),
            Error::InvalidValType(valtype) => write!(f, "invalid valtype ({valtype:#x})"),
            Error::NonConstInstruction(op) => {
                write!(f, "instruction not constant ({op:?})")
            }
            Error::OutOfOrderSection { before, after } => {
                write!(f, "out-of-order sections: {before:?} before {after:?}")
            }
            Error::Storage(err) => write!(f, "{err:?}"),
            Error::TooManyLocals(count) => {
                write!(f, "too many locals: at least {count} were specified")
            }
            Error::UnknownVersion(version) => write!(f, "unknown version ({version:#x})"),
        }
    }
}

impl<Storage: Stream> fmt::Debug for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<Storage: Stream> leb128::Error for Error<Storage> {
    fn invalid_leb128() -> Self {
        Error::InvalidLeb128
    }
}

impl<Storage: Stream> From<TryReserveError> for Error<Storage> {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

// Types that can be parsed from the stream without reference to the builder
// arenas.
pub(crate) trait Parse: Sized {
    fn parse<Storage: Stream>(
        parser: &mut Parser<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>>;
}

pub(crate) struct Parser<Storage: Stream> {
    stream: Storage,
}

impl<Storage: Stream> Parser<Storage> {
    fn new(stream: Storage) -> Self {
        Self { stream }
    }

    // Pushes a context frame before a call, popping it if successful.
    fn with_context<F, R>(
        &mut self,
        context: &mut ContextStack,
        id: ContextId,
        f: F,
    ) -> Result<R, Error<Storage>>
    where
        F: FnOnce(&mut Self, &mut ContextStack) -> Result<R, Error<Storage>>,
    {
        let offset = self.stream.offset();
        if !context.push(id, offset) {
            return Err(Error::ExcessiveParsingDepth {
                context: id.into(),
                offset,
            });
        }
        let val = f(self, context)?;
        context.pop();
        Ok(val)
    }

    fn offset(&mut self) -> usize {
        self.stream.offset()
    }

    fn read_byte_raw(&mut self) -> Result<u8, Error<Storage>> {
        self.stream.read_byte().map_err(Error::Storage)
    }

    fn read_leb128_raw<T: Leb128>(&mut self) -> Result<T, Error<Storage>> {
        leb128::read(|| self.read_byte_raw())
    }

    fn read_zero_byte(&mut self, context: &mut ContextStack) -> Result<(), Error<Storage>> {
        self.with_context(context, ContextId::Byte, |parser, _| {
            let byte = parser.read_byte_raw()?;
            if byte == 0 {
                Ok(())
            } else {
                Err(Error::InvalidToken(byte))
            }
        })
    }

    fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<(), Error<Storage>> {
        self.stream.read_exact(buf).map_err(Error::Storage)
    }

    fn read_exact(
        &mut self,
        context: &mut ContextStack,
        buf: &mut [u8],
    ) -> Result<(), Error<Storage>> {
        self.with_context(context, ContextId::ReadingBytes, |parser, _| {
            parser.read_exact_raw(buf)
        })
    }

    fn read<T: Parse + Contextual>(
        &mut self,
        context: &mut ContextStack,
    ) -> Result<T, Error<Storage>> {
        self.with_context(context, T::ID, |parser, context| T::parse(parser, context))
    }
}

/// Parse a WebAssembly module from a storage stream into a frozen (but not
/// yet validated) module.
pub(crate) fn decode_module<Storage, A>(
    storage: Storage,
    alloc: A,
) -> Result<Module<A>, ErrorWithContext<Storage>>
where
    Storage: Stream,
    A: Allocator + Clone,
{
    let mut context = ContextStack::default();
    decode_module_inner(storage, &mut context, alloc)
        .map_err(|error| ErrorWithContext { error, context })
}

fn decode_module_inner<Storage, A>(
    storage: Storage,
    context: &mut ContextStack,
    alloc: A,
) -> Result<Module<A>, Error<Storage>>
where
    Storage: Stream,
    A: Allocator + Clone,
{
    let mut parser = Parser::new(storage);
    parser.read::<Magic>(context)?;
    let version: Version = parser.read(context)?;

    let mut builder = Builder::new_in(alloc);
    builder.version = version;

    // The last non-custom section ID seen.
    let mut last_id = None;
    loop {
        // There is no in-band signal in the WASM format for the end of a
        // module. The best we can generically do is expect an EOF at a
        // section boundary.
        let id = parser.read::<SectionId>(context);
        if let Err(Error::Storage(ref err)) = id
            && Storage::is_eof(err)
        {
            break;
        }
        let id = id?;

        // Apart from custom sections, which can appear anywhere in the
        // format, sections must appear at most once and in order.
        if id != SectionId::Custom {
            if let Some(last) = last_id {
                if id == last {
                    return Err(Error::DuplicateSection(id));
                }
                if id < last {
                    return Err(Error::OutOfOrderSection {
                        before: last,
                        after: id,
                    });
                }
            }
            last_id = Some(id);
        }

        let len: u32 = parser.read(context)?;
        builder.record_section(SectionEntry { id, len })?;

        let body_start = parser.offset();
        match id {
            SectionId::Custom => {
                parse_impls::custom_section(&mut parser, context, &mut builder, len as usize)?;
            }
            SectionId::Type => parse_impls::type_section(&mut parser, context, &mut builder)?,
            SectionId::Import => parse_impls::import_section(&mut parser, context, &mut builder)?,
            SectionId::Function => {
                parse_impls::function_section(&mut parser, context, &mut builder)?;
            }
            SectionId::Table => parse_impls::table_section(&mut parser, context, &mut builder)?,
            SectionId::Memory => parse_impls::memory_section(&mut parser, context, &mut builder)?,
            SectionId::Global => parse_impls::global_section(&mut parser, context, &mut builder)?,
            SectionId::Export => parse_impls::export_section(&mut parser, context, &mut builder)?,
            SectionId::Start => parse_impls::start_section(&mut parser, context, &mut builder)?,
            SectionId::Element => parse_impls::element_section(&mut parser, context, &mut builder)?,
            SectionId::Code => parse_impls::code_section(&mut parser, context, &mut builder)?,
            SectionId::Data => parse_impls::data_section(&mut parser, context, &mut builder)?,
        }

        let actual_section_len = parser.offset() - body_start;
        if actual_section_len != (len as usize) {
            return Err(Error::InvalidSectionLength {
                id,
                expected: len,
                actual: actual_section_len as u32,
            });
        }
    }

    // Every function must have received a body (and no body may be left
    // over): the two sections are index-aligned halves of one entity.
    if (builder.num_codes as usize) != builder.funcs.len() {
        return Err(Error::FunctionCodeCountMismatch {
            funcs: builder.funcs.len() as u32,
            codes: builder.num_codes,
        });
    }

    Ok(builder.freeze(parser.offset()))
}
