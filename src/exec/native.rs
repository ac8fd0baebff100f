// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Native (host) module descriptors.
//!
//! A [`NativeMod`] describes host functionality to register under a module
//! name: named functions with explicit signatures, plus tables, memories,
//! and globals with explicit initial contents. Registration copies the
//! descriptor's contents into the environment; the descriptor borrow ends
//! there. Native functions operate on the operand stack directly: arguments
//! are `peek`ed or popped off the top, and results left in their place.

use crate::Allocator;
use crate::types::{GlobalType, MemType, TableType, ValType};

use super::{Stack, TrapKind, Value};

/// A host function callback. Reads its arguments off the operand stack's
/// top and leaves its results there, per its declared signature.
pub type NativeFn<A> = fn(&mut Stack<A>) -> Result<(), TrapKind>;

/// One named host function.
#[derive(Clone, Copy)]
pub struct NativeFunc<'data, A: Allocator> {
    /// Export name.
    pub name: &'data str,
    /// The callback.
    pub func: NativeFn<A>,
    /// Parameter types, outermost first.
    pub params: &'data [ValType],
    /// Result types (at most one in the MVP).
    pub results: &'data [ValType],
}

/// A memory exported by a native module, with its initial contents copied
/// to offset zero at registration.
#[derive(Clone, Copy)]
pub struct NativeMem<'data> {
    /// Export name.
    pub name: &'data str,
    /// Declared limits, in pages.
    pub mem: MemType,
    /// Initial contents (must fit within the declared minimum size).
    pub data: &'data [u8],
}

/// A table exported by a native module (initially all-null).
#[derive(Clone, Copy)]
pub struct NativeTable<'data> {
    /// Export name.
    pub name: &'data str,
    /// Declared element kind and limits.
    pub table: TableType,
}

/// A global exported by a native module, with its explicit initial value.
#[derive(Clone, Copy)]
pub struct NativeGlobal<'data> {
    /// Export name.
    pub name: &'data str,
    /// Declared type and mutability.
    pub ty: GlobalType,
    /// Initial value.
    pub val: Value,
}

/// A native module descriptor.
#[derive(Clone, Copy)]
pub struct NativeMod<'data, A: Allocator> {
    pub funcs: &'data [NativeFunc<'data, A>],
    pub mems: &'data [NativeMem<'data>],
    pub tables: &'data [NativeTable<'data>],
    pub globals: &'data [NativeGlobal<'data>],
}

impl<A: Allocator> Default for NativeMod<'_, A> {
    fn default() -> Self {
        Self {
            funcs: &[],
            mems: &[],
            tables: &[],
            globals: &[],
        }
    }
}
