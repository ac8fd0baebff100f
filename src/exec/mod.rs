// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Module execution.
//!
//! An [`env::Env`] links validated modules (and [`native`] host modules)
//! together and runs their functions. The environment owns shared runtime
//! state (instances, linear memories, tables, globals) and an execution
//! strategy implementing [`Engine`]: either the stack-machine interpreter
//! ([`interp::Interp`]) or the ahead-of-time compilation shell
//! ([`aot::Aot`]). The operand [`Stack`] is owned by the caller and lent to
//! the environment for the duration of each call; parameters are popped from
//! its top and results pushed back.

pub mod aot;
pub mod env;
pub mod interp;
pub mod native;

use core::num::NonZeroU32;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::types::Opcode;

use env::Store;

/// A single operand-stack cell: the untagged 64-bit representation of any
/// WebAssembly MVP value. Typed views are bit-level reinterpretations, so
/// `i32.reinterpret_f32` and friends are identities on the cell.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Value(u64);

impl Value {
    /// The all-zeroes cell: the default value of every MVP type.
    pub const ZERO: Value = Value(0);

    pub const fn from_i32(v: i32) -> Self {
        Value(v as u32 as u64)
    }

    pub const fn from_u32(v: u32) -> Self {
        Value(v as u64)
    }

    pub const fn from_i64(v: i64) -> Self {
        Value(v as u64)
    }

    pub const fn from_u64(v: u64) -> Self {
        Value(v)
    }

    pub const fn from_f32(v: f32) -> Self {
        Value(v.to_bits() as u64)
    }

    pub const fn from_f64(v: f64) -> Self {
        Value(v.to_bits())
    }

    pub const fn to_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub const fn to_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn to_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub const fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::from_i32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::from_u32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::from_i64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::from_u64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::from_f32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::from_f64(v)
    }
}

/// A runtime trap: a failure that aborts the current call, unwinds the
/// operand stack to its position at call entry, and leaves the environment
/// otherwise valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
pub enum TrapKind {
    #[display(fmt = "call stack exhausted")]
    CallStackExhausted,
    #[display(fmt = "integer divide by zero")]
    DivideByZero,
    #[display(fmt = "integer overflow")]
    IntegerOverflow,
    #[display(fmt = "invalid conversion to integer")]
    InvalidConversion,
    #[display(fmt = "out-of-bounds memory access")]
    MemoryOutOfBounds,
    #[display(fmt = "null function reference in indirect call")]
    NullFunction,
    #[display(fmt = "indirect call signature mismatch")]
    SignatureMismatch,
    #[display(fmt = "operand stack overflow")]
    StackOverflow,
    #[display(fmt = "operand stack underflow")]
    StackUnderflow,
    #[display(fmt = "out-of-bounds table access")]
    TableOutOfBounds,
    #[display(fmt = "unreachable executed")]
    Unreachable,
}

/// A failure to link a module's imports during registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
pub enum LinkError {
    /// No registered module provides the imported entity.
    #[display(fmt = "import {index}: no module or export with the imported name")]
    NotFound { index: u32 },
    /// The provider exports an entity of a different kind.
    #[display(fmt = "import {index}: wrong kind of entity")]
    KindMismatch { index: u32 },
    /// Function signatures must match exactly.
    #[display(fmt = "import {index}: function signatures differ")]
    FuncMismatch { index: u32 },
    /// Global type and mutability must match exactly.
    #[display(fmt = "import {index}: global type or mutability differs")]
    GlobalMismatch { index: u32 },
    /// Table/memory limits must be compatible with what is provided.
    #[display(fmt = "import {index}: limits are incompatible")]
    LimitsMismatch { index: u32 },
}

/// A failure from an ahead-of-time code generator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
pub enum CompileError {
    #[display(fmt = "code generation failed")]
    Failed,
    #[display(fmt = "code generation hit unsupported opcode ({_0:?})")]
    Unsupported(Opcode),
}

/// Represents errors that can arise from environment operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
pub enum Error {
    /// Failed memory allocation.
    #[display(fmt = "allocation failure")]
    AllocError,
    /// Ahead-of-time compilation failed.
    #[display(fmt = "{_0}")]
    Compile(CompileError),
    /// A handle that does not name a live entity of this environment.
    #[display(fmt = "stale or foreign handle")]
    InvalidHandle,
    /// Linking failed during module registration.
    #[display(fmt = "link error: {_0}")]
    Link(LinkError),
    /// The call trapped.
    #[display(fmt = "trap: {_0}")]
    Trap(TrapKind),
}

impl From<TrapKind> for Error {
    fn from(trap: TrapKind) -> Self {
        Error::Trap(trap)
    }
}

impl From<LinkError> for Error {
    fn from(err: LinkError) -> Self {
        Error::Link(err)
    }
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        Error::Compile(err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

// Defines an opaque handle newtype over an environment-internal index. The
// underlying value is non-zero so that `Option<Handle>` stays word-sized and
// zero remains an unambiguous "not found".
macro_rules! handle {
    (
        $(#[$meta:meta])*
        pub struct $type:ident;
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub struct $type(NonZeroU32);

        impl $type {
            pub(crate) fn from_index(index: usize) -> Self {
                let value = (index as u32)
                    .checked_add(1)
                    .expect("environment index overflow");
                // A checked increment of an unsigned value cannot be zero.
                Self(NonZeroU32::new(value).expect("non-zero by construction"))
            }

            pub(crate) fn index(self) -> usize {
                (self.0.get() - 1) as usize
            }
        }
    };
}

handle!(
    /// Identifies a registered module (or native module) instance.
    pub struct ModHandle;
);

handle!(
    /// Identifies a linear memory within an environment.
    pub struct MemHandle;
);

handle!(
    /// Identifies a table within an environment.
    pub struct TableHandle;
);

handle!(
    /// Identifies a global within an environment.
    pub struct GlobalHandle;
);

/// Identifies a function within an environment: the instance that defines it
/// and the function's index among that instance's own definitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FuncHandle {
    pub(crate) inst: u32,
    pub(crate) idx: u32,
}

/// A resolved external entity, as returned by import lookups.
#[derive(Clone, Copy, Debug)]
pub enum Extern {
    Func(FuncHandle),
    Table(TableHandle),
    Mem(MemHandle),
    Global(GlobalHandle),
}

/// The caller-owned operand stack.
///
/// Parameters are passed by pushing them before a call; results are read off
/// the top afterwards. The capacity is fixed at construction: running out of
/// slots mid-execution is the [`TrapKind::StackOverflow`] trap.
pub struct Stack<A: Allocator> {
    vals: Vec<Value, A>,
    limit: usize,
}

impl<A: Allocator> Stack<A> {
    /// Creates a stack with a fixed capacity of `capacity` values.
    pub fn new_in(capacity: usize, alloc: A) -> Self {
        Self {
            vals: Vec::with_capacity_in(capacity, alloc),
            limit: capacity,
        }
    }

    /// The current stack position (number of live values).
    pub fn pos(&self) -> usize {
        self.vals.len()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub fn push(&mut self, val: Value) -> Result<(), TrapKind> {
        if self.vals.len() >= self.limit {
            return Err(TrapKind::StackOverflow);
        }
        self.vals.push(val);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, TrapKind> {
        self.vals.pop().ok_or(TrapKind::StackUnderflow)
    }

    /// Reads the value `depth` slots below the top (`peek(0)` is the top).
    pub fn peek(&self, depth: usize) -> Result<Value, TrapKind> {
        let len = self.vals.len();
        if depth < len {
            Ok(self.vals[len - 1 - depth])
        } else {
            Err(TrapKind::StackUnderflow)
        }
    }

    /// Writable access to the value `depth` slots below the top.
    pub fn peek_mut(&mut self, depth: usize) -> Result<&mut Value, TrapKind> {
        let len = self.vals.len();
        if depth < len {
            Ok(&mut self.vals[len - 1 - depth])
        } else {
            Err(TrapKind::StackUnderflow)
        }
    }

    /// Borrows the top `count` values, bottom-first.
    pub fn top(&self, count: usize) -> Result<&[Value], TrapKind> {
        let len = self.vals.len();
        if count <= len {
            Ok(&self.vals[len - count..])
        } else {
            Err(TrapKind::StackUnderflow)
        }
    }

    /// Drops values down to position `pos` (no-op if already below).
    pub fn truncate(&mut self, pos: usize) {
        self.vals.truncate(pos);
    }

    pub fn clear(&mut self) {
        self.vals.clear();
    }

    // Moves the top `arity` values down to position `base`, discarding
    // everything in between. This is the value shuffle of branches and
    // returns.
    pub(crate) fn collapse(&mut self, base: usize, arity: usize) -> Result<(), TrapKind> {
        let len = self.vals.len();
        if arity > len || len - arity < base {
            return Err(TrapKind::StackUnderflow);
        }
        let src = len - arity;
        if src != base {
            for i in 0..arity {
                self.vals[base + i] = self.vals[src + i];
            }
        }
        self.vals.truncate(base + arity);
        Ok(())
    }
}

/// The execution-strategy seam: how WebAssembly functions actually run.
///
/// Both the interpreter and the ahead-of-time engine implement this trait;
/// an environment owns one, chosen at construction. The contract mirrors the
/// environment's `call`: parameters are popped from the operand stack's top,
/// results are pushed on success, and a trap leaves the stack for the
/// environment to unwind to the caller's position.
pub trait Engine<A: Allocator> {
    /// Invokes the given (WebAssembly) function.
    fn call(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Global;

    #[test]
    fn value_views_are_bit_reinterpretations() {
        let v = Value::from_f32(5.0);
        assert_eq!(v.to_u32(), 5.0f32.to_bits());
        assert_eq!(v.to_f32(), 5.0);

        let v = Value::from_i32(-1);
        assert_eq!(v.to_i32(), -1);
        assert_eq!(v.to_u32(), u32::MAX);
        // The i32 is stored zero-extended, not sign-extended.
        assert_eq!(v.to_u64(), u64::from(u32::MAX));

        let v = Value::from_f64(-0.0);
        assert_eq!(v.to_u64(), (-0.0f64).to_bits());
        assert_eq!(Value::ZERO.to_i64(), 0);
    }

    #[test]
    fn stack_push_pop_peek() {
        let mut stack = Stack::new_in(3, Global);
        assert_eq!(stack.pos(), 0);
        stack.push(Value::from_i32(1)).unwrap();
        stack.push(Value::from_i32(2)).unwrap();
        assert_eq!(stack.peek(0).unwrap().to_i32(), 2);
        assert_eq!(stack.peek(1).unwrap().to_i32(), 1);
        assert_eq!(stack.peek(2), Err(TrapKind::StackUnderflow));

        stack.push(Value::from_i32(3)).unwrap();
        assert_eq!(stack.push(Value::ZERO), Err(TrapKind::StackOverflow));
        assert_eq!(stack.pop().unwrap().to_i32(), 3);
        assert_eq!(stack.top(2).unwrap().len(), 2);
        stack.clear();
        assert_eq!(stack.pop(), Err(TrapKind::StackUnderflow));
    }

    #[test]
    fn stack_collapse_shuffles_branch_values() {
        let mut stack = Stack::new_in(8, Global);
        for i in 0..5 {
            stack.push(Value::from_i32(i)).unwrap();
        }
        // Keep the top value, discarding positions 1..4.
        stack.collapse(1, 1).unwrap();
        assert_eq!(stack.pos(), 2);
        assert_eq!(stack.peek(0).unwrap().to_i32(), 4);
        assert_eq!(stack.peek(1).unwrap().to_i32(), 0);

        // Zero-arity collapse just truncates.
        stack.collapse(0, 0).unwrap();
        assert_eq!(stack.pos(), 0);

        assert_eq!(stack.collapse(1, 0), Err(TrapKind::StackUnderflow));
    }
}
