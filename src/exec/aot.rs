// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The ahead-of-time compilation engine.
//!
//! [`Aot`] wraps an external code generator behind the same [`Engine`]
//! contract the interpreter satisfies. No code is generated at registration;
//! the first call of a function invokes the generator and records the result
//! in a per-function dispatch slot, so subsequent calls jump straight to the
//! generated code. A generator may also *decline* a function (the original
//! generator declined everything), in which case the engine permanently
//! falls back to interpreting that function. Code buffers are owned by the
//! engine and released when it drops.
//!
//! Generated code must preserve the operand-stack contract exactly as the
//! interpreter does: parameters consumed only on success, results pushed,
//! and traps reported with the parameters still in place, so that the
//! environment's unwinding (which only drops values pushed above the entry
//! position) restores the stack to exactly where the caller left it.

use crate::Allocator;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;
use crate::debug_log;
use crate::module::Module;

use super::env::Store;
use super::interp::Interp;
use super::{CompileError, Engine, Error, FuncHandle, Stack, TrapKind};

/// Entry point of a compiled function. Receives the function's own code
/// buffer, the environment's store, and the operand stack: the same
/// environment contract the interpreter honors.
pub type CompiledEntry<A> =
    fn(code: &[u8], store: &mut Store<'_, A>, stack: &mut Stack<A>, func: FuncHandle) -> Result<(), TrapKind>;

/// An owned code buffer produced by a [`CodeGen`] for one function, plus the
/// entry point that runs it.
pub struct CodeBuf<A: Allocator> {
    code: Box<[u8], A>,
    entry: CompiledEntry<A>,
}

impl<A: Allocator> CodeBuf<A> {
    pub fn new(code: Box<[u8], A>, entry: CompiledEntry<A>) -> Self {
        Self { code, entry }
    }

    /// The generated code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// An external code generator: the architecture-specific half of
/// ahead-of-time compilation.
pub trait CodeGen<A: Allocator> {
    /// Compiles the module-defined function `func_idx` of `module`.
    ///
    /// `Ok(None)` declines the function: the engine will interpret it
    /// instead (and will not ask again). An error fails the call.
    fn compile(
        &mut self,
        module: &Module<A>,
        func_idx: u32,
    ) -> Result<Option<CodeBuf<A>>, CompileError>;
}

// The dispatch state of one function.
enum Slot<A: Allocator> {
    Compiled(CodeBuf<A>),
    Declined,
}

/// The ahead-of-time execution engine: compile on first call, then dispatch
/// to generated code.
pub struct Aot<G, A: Allocator> {
    codegen: G,
    interp: Interp<A>,
    slots: Vec<(FuncHandle, Slot<A>), A>,
}

impl<G, A: Allocator + Clone> Aot<G, A> {
    pub fn new_in(codegen: G, alloc: A) -> Self {
        Self {
            codegen,
            interp: Interp::new_in(alloc.clone()),
            slots: Vec::new_in(alloc),
        }
    }

    /// Read access to the wrapped code generator.
    pub fn codegen(&self) -> &G {
        &self.codegen
    }
}

impl<G: CodeGen<A>, A: Allocator + Clone> Engine<A> for Aot<G, A> {
    fn call(
        &mut self,
        store: &mut Store<'_, A>,
        stack: &mut Stack<A>,
        func: FuncHandle,
    ) -> Result<(), Error> {
        if let Some(position) = self.slots.iter().position(|(handle, _)| *handle == func) {
            return match &self.slots[position].1 {
                Slot::Compiled(buf) => {
                    (buf.entry)(&buf.code, store, stack, func).map_err(Error::Trap)
                }
                Slot::Declined => self.interp.call(store, stack, func),
            };
        }

        // First call: generate code (or record the generator's refusal) and
        // dispatch again through the fresh slot.
        let module = store.wasm_module(func.inst).ok_or(Error::InvalidHandle)?;
        let slot = match self.codegen.compile(module, func.idx).map_err(Error::Compile)? {
            Some(buf) => {
                debug_log!(
                    "compiled function {} of instance {} ({} bytes)",
                    func.idx,
                    func.inst,
                    buf.code().len()
                );
                Slot::Compiled(buf)
            }
            None => Slot::Declined,
        };
        self.slots.try_reserve(1)?;
        self.slots.push((func, slot));
        self.call(store, stack, func)
    }
}
