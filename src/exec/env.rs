// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The execution environment: shared runtime state, registration, linking,
//! and instantiation.
//!
//! A [`Store`] owns every allocated runtime entity (instances, linear
//! memories, tables, globals), addressed by opaque handles. Registering a
//! module resolves its imports against previously registered instances,
//! allocates its own entities, applies element and data segments, and runs
//! its start function; any failure rolls the store back to its state before
//! registration. The environment borrows each registered module for the
//! lifetime of the registration.

use crate::Allocator;
use crate::arena::Slice;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;
use crate::debug_log;
use crate::module::Module;
use crate::types::{
    ExternKind, GlobalType, Imm, ImportDesc, Limits, MemType, Opcode, TableType, ValType,
};

use super::native::{NativeFn, NativeMod};
use super::{
    Engine, Error, Extern, FuncHandle, GlobalHandle, LinkError, MemHandle, ModHandle, Stack,
    TableHandle, TrapKind, Value,
};

/// A linear memory instance: a zero-initialized, page-granular byte buffer.
pub struct MemInst<A: Allocator> {
    data: Vec<u8, A>,
    max: Option<u32>,
}

impl<A: Allocator> MemInst<A> {
    fn new_in(ty: MemType, alloc: A) -> Result<Self, Error> {
        let bytes = ty.min_size_bytes();
        let mut data = Vec::new_in(alloc);
        data.try_reserve_exact(bytes)?;
        data.resize(bytes, 0);
        Ok(Self {
            data,
            max: ty.max,
        })
    }

    /// The memory's current contents.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writable view of the memory's current contents.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The current size in pages.
    pub fn size(&self) -> u32 {
        (self.data.len() / MemType::PAGE_SIZE) as u32
    }

    /// The declared maximum size in pages, if any.
    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Grows the memory by `delta` pages, returning the previous size in
    /// pages, or `u32::MAX` on failure (including exceeding the maximum).
    pub fn grow(&mut self, delta: u32) -> u32 {
        let old = self.size();
        let Some(new) = old.checked_add(delta) else {
            return u32::MAX;
        };
        if new > self.max.unwrap_or(MemType::MAX_PAGES) || new > MemType::MAX_PAGES {
            return u32::MAX;
        }
        let new_len = (new as usize) * MemType::PAGE_SIZE;
        if self.data.try_reserve_exact(new_len - self.data.len()).is_err() {
            return u32::MAX;
        }
        self.data.resize(new_len, 0);
        old
    }

    /// Borrows `width` bytes at effective address `addr + offset`, bounds
    /// checked against the current size.
    pub fn load(&self, addr: u32, offset: u32, width: usize) -> Result<&[u8], TrapKind> {
        let ea = u64::from(addr) + u64::from(offset);
        let end = ea + (width as u64);
        if end > self.data.len() as u64 {
            return Err(TrapKind::MemoryOutOfBounds);
        }
        Ok(&self.data[ea as usize..end as usize])
    }

    /// Copies `bytes` to effective address `addr + offset`, bounds checked
    /// against the current size.
    pub fn store(&mut self, addr: u32, offset: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let ea = u64::from(addr) + u64::from(offset);
        let end = ea + (bytes.len() as u64);
        if end > self.data.len() as u64 {
            return Err(TrapKind::MemoryOutOfBounds);
        }
        self.data[ea as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

/// A table instance: a zero(null)-initialized array of function references.
pub struct TableInst<A: Allocator> {
    slots: Vec<Option<FuncHandle>, A>,
    max: Option<u32>,
}

impl<A: Allocator> TableInst<A> {
    fn new_in(ty: TableType, alloc: A) -> Result<Self, Error> {
        let mut slots = Vec::new_in(alloc);
        slots.try_reserve_exact(ty.limits.min as usize)?;
        slots.resize(ty.limits.min as usize, None);
        Ok(Self {
            slots,
            max: ty.limits.max,
        })
    }

    /// The current number of slots.
    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The declared maximum number of slots, if any.
    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Reads a slot; `None` is a null reference.
    pub fn get(&self, idx: u32) -> Result<Option<FuncHandle>, TrapKind> {
        self.slots
            .get(idx as usize)
            .copied()
            .ok_or(TrapKind::TableOutOfBounds)
    }

    /// Writes a slot.
    pub fn set(&mut self, idx: u32, func: Option<FuncHandle>) -> Result<(), TrapKind> {
        let slot = self
            .slots
            .get_mut(idx as usize)
            .ok_or(TrapKind::TableOutOfBounds)?;
        *slot = func;
        Ok(())
    }
}

/// A global variable instance.
#[derive(Clone, Copy, Debug)]
pub struct GlobalInst {
    pub(crate) ty: GlobalType,
    pub(crate) val: Value,
}

impl GlobalInst {
    /// The global's type.
    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    /// The global's current value.
    pub fn value(&self) -> Value {
        self.val
    }
}

// A registered native function, with its name and signature copied out of
// the descriptor.
struct NativeFuncInst<A: Allocator> {
    name: Box<[u8], A>,
    func: NativeFn<A>,
    params: Box<[ValType], A>,
    results: Box<[ValType], A>,
}

// The environment-owned realization of a native module: functions plus the
// exported names of its other entities, index-aligned with the instance's
// address vectors.
struct NativeInstance<A: Allocator> {
    funcs: Vec<NativeFuncInst<A>, A>,
    mem_names: Vec<Box<[u8], A>, A>,
    table_names: Vec<Box<[u8], A>, A>,
    global_names: Vec<Box<[u8], A>, A>,
}

// What a registered instance executes as.
enum InstanceKind<'m, A: Allocator> {
    Wasm(&'m Module<A>),
    Native(NativeInstance<A>),
}

// A registered module instance: per-kind effective index spaces (imports
// first, then the instance's own entities), resolved to store addresses.
struct Instance<'m, A: Allocator> {
    name: Box<[u8], A>,
    kind: InstanceKind<'m, A>,
    funcs: Vec<FuncHandle, A>,
    tables: Vec<TableHandle, A>,
    mems: Vec<MemHandle, A>,
    globals: Vec<GlobalHandle, A>,
}

// How a function handle resolves: to the module that defines it, or to a
// native callback.
pub(crate) enum ResolvedFunc<'m, A: Allocator> {
    Wasm(&'m Module<A>),
    Native(NativeFn<A>),
}

/// Shared runtime state: registered instances and every memory, table, and
/// global allocated on their behalf.
pub struct Store<'m, A: Allocator> {
    alloc: A,
    instances: Vec<Instance<'m, A>, A>,
    mems: Vec<MemInst<A>, A>,
    tables: Vec<TableInst<A>, A>,
    globals: Vec<GlobalInst, A>,
}

// Store sizes before a registration, for rollback.
#[derive(Clone, Copy)]
struct StoreMark {
    instances: usize,
    mems: usize,
    tables: usize,
    globals: usize,
}

impl<'m, A: Allocator + Clone> Store<'m, A> {
    fn new_in(alloc: A) -> Self {
        Self {
            instances: Vec::new_in(alloc.clone()),
            mems: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc.clone()),
            alloc,
        }
    }

    fn alloc_mem(&mut self, ty: MemType) -> Result<MemHandle, Error> {
        let mem = MemInst::new_in(ty, self.alloc.clone())?;
        self.mems.try_reserve(1)?;
        self.mems.push(mem);
        Ok(MemHandle::from_index(self.mems.len() - 1))
    }

    fn alloc_table(&mut self, ty: TableType) -> Result<TableHandle, Error> {
        let table = TableInst::new_in(ty, self.alloc.clone())?;
        self.tables.try_reserve(1)?;
        self.tables.push(table);
        Ok(TableHandle::from_index(self.tables.len() - 1))
    }

    fn alloc_global(&mut self, global: GlobalInst) -> Result<GlobalHandle, Error> {
        self.globals.try_reserve(1)?;
        self.globals.push(global);
        Ok(GlobalHandle::from_index(self.globals.len() - 1))
    }
}

impl<'m, A: Allocator> Store<'m, A> {
    fn mark(&self) -> StoreMark {
        StoreMark {
            instances: self.instances.len(),
            mems: self.mems.len(),
            tables: self.tables.len(),
            globals: self.globals.len(),
        }
    }

    fn rollback(&mut self, mark: StoreMark) {
        self.instances.truncate(mark.instances);
        self.mems.truncate(mark.mems);
        self.tables.truncate(mark.tables);
        self.globals.truncate(mark.globals);
    }

    /// Resolves a memory handle.
    pub fn mem(&self, handle: MemHandle) -> Option<&MemInst<A>> {
        self.mems.get(handle.index())
    }

    /// Resolves a memory handle, writable.
    pub fn mem_mut(&mut self, handle: MemHandle) -> Option<&mut MemInst<A>> {
        self.mems.get_mut(handle.index())
    }

    /// Resolves a table handle.
    pub fn table(&self, handle: TableHandle) -> Option<&TableInst<A>> {
        self.tables.get(handle.index())
    }

    /// Resolves a table handle, writable.
    pub fn table_mut(&mut self, handle: TableHandle) -> Option<&mut TableInst<A>> {
        self.tables.get_mut(handle.index())
    }

    /// Resolves a global handle.
    pub fn global(&self, handle: GlobalHandle) -> Option<&GlobalInst> {
        self.globals.get(handle.index())
    }

    /// Resolves a global handle, writable.
    pub fn global_mut(&mut self, handle: GlobalHandle) -> Option<&mut GlobalInst> {
        self.globals.get_mut(handle.index())
    }

    /// The module a (WebAssembly) function handle belongs to.
    pub fn wasm_module(&self, inst: u32) -> Option<&'m Module<A>> {
        match self.instances.get(inst as usize)?.kind {
            InstanceKind::Wasm(module) => Some(module),
            InstanceKind::Native(_) => None,
        }
    }

    /// A function's signature, as parameter and result value-type slices.
    pub fn func_sig(&self, func: FuncHandle) -> Option<(&[ValType], &[ValType])> {
        let inst = self.instances.get(func.inst as usize)?;
        match &inst.kind {
            InstanceKind::Wasm(module) => {
                let f = module.funcs().get(func.idx as usize)?;
                let ty = module.func_type(f.type_idx);
                Some((
                    module.view_valtypes(ty.params),
                    module.view_valtypes(ty.results),
                ))
            }
            InstanceKind::Native(native) => {
                let f = native.funcs.get(func.idx as usize)?;
                Some((&f.params, &f.results))
            }
        }
    }

    pub(crate) fn resolve(&self, func: FuncHandle) -> Option<ResolvedFunc<'m, A>> {
        let inst = self.instances.get(func.inst as usize)?;
        match &inst.kind {
            InstanceKind::Wasm(module) => {
                module.funcs().get(func.idx as usize)?;
                Some(ResolvedFunc::Wasm(*module))
            }
            InstanceKind::Native(native) => {
                Some(ResolvedFunc::Native(native.funcs.get(func.idx as usize)?.func))
            }
        }
    }

    // Effective index-space lookups for executing code.

    pub(crate) fn func_by_index(&self, inst: u32, idx: u32) -> Option<FuncHandle> {
        self.instances
            .get(inst as usize)?
            .funcs
            .get(idx as usize)
            .copied()
    }

    pub(crate) fn table_by_index(&self, inst: u32, idx: u32) -> Option<TableHandle> {
        self.instances
            .get(inst as usize)?
            .tables
            .get(idx as usize)
            .copied()
    }

    pub(crate) fn mem_by_index(&self, inst: u32, idx: u32) -> Option<MemHandle> {
        self.instances
            .get(inst as usize)?
            .mems
            .get(idx as usize)
            .copied()
    }

    pub(crate) fn global_by_index(&self, inst: u32, idx: u32) -> Option<GlobalHandle> {
        self.instances
            .get(inst as usize)?
            .globals
            .get(idx as usize)
            .copied()
    }

    // Looks up a registered instance by name.
    fn find_instance(&self, name: &[u8]) -> Option<u32> {
        self.instances
            .iter()
            .position(|inst| &*inst.name == name)
            .map(|idx| idx as u32)
    }

    // Resolves an export of the given kind and name within an instance.
    fn find_export(&self, inst_idx: u32, kind: ExternKind, name: &[u8]) -> Option<Extern> {
        let inst = self.instances.get(inst_idx as usize)?;
        let idx = match &inst.kind {
            InstanceKind::Wasm(module) => {
                let export = module
                    .exports()
                    .iter()
                    .find(|e| e.kind == kind && module.view_bytes(e.name) == name)?;
                export.idx
            }
            InstanceKind::Native(native) => {
                let position = |names: &Vec<Box<[u8], A>, A>| {
                    names.iter().position(|n| &**n == name).map(|i| i as u32)
                };
                match kind {
                    ExternKind::Func => {
                        native.funcs.iter().position(|f| &*f.name == name)? as u32
                    }
                    ExternKind::Table => position(&native.table_names)?,
                    ExternKind::Mem => position(&native.mem_names)?,
                    ExternKind::Global => position(&native.global_names)?,
                }
            }
        };
        let entity = match kind {
            ExternKind::Func => Extern::Func(*inst.funcs.get(idx as usize)?),
            ExternKind::Table => Extern::Table(*inst.tables.get(idx as usize)?),
            ExternKind::Mem => Extern::Mem(*inst.mems.get(idx as usize)?),
            ExternKind::Global => Extern::Global(*inst.globals.get(idx as usize)?),
        };
        Some(entity)
    }
}

// Evaluates a (validated) constant expression against an instance whose
// imported globals are already resolved.
fn eval_const_expr<A: Allocator>(
    store: &Store<'_, A>,
    module: &Module<A>,
    inst: &Instance<'_, A>,
    expr: Slice,
) -> Result<Value, Error> {
    let mut result = Value::ZERO;
    for instr in module.view_instrs(expr) {
        match (instr.op, instr.imm) {
            (Opcode::I32Const, Imm::I32(v)) => result = Value::from_i32(v),
            (Opcode::I64Const, Imm::I64(v)) => result = Value::from_i64(v),
            (Opcode::F32Const, Imm::F32(v)) => result = Value::from_f32(v),
            (Opcode::F64Const, Imm::F64(v)) => result = Value::from_f64(v),
            (Opcode::GlobalGet, Imm::Index(idx)) => {
                let handle = inst.globals.get(idx as usize).ok_or(Error::InvalidHandle)?;
                result = store.global(*handle).ok_or(Error::InvalidHandle)?.val;
            }
            (Opcode::End, _) => break,
            // Validation admits nothing else into a constant expression.
            _ => unreachable!("non-constant instruction survived validation"),
        }
    }
    Ok(result)
}

// Limits compatibility for imported tables and memories: the import's
// declared minimum must cover what the provider guarantees, and a declared
// maximum may not exceed the provider's.
fn limits_compatible(import: Limits, provided_min: u32, provided_max: Option<u32>) -> bool {
    if import.min < provided_min {
        return false;
    }
    match (import.max, provided_max) {
        (Some(import_max), Some(provided_max)) => import_max <= provided_max,
        _ => true,
    }
}

// Copies a slice into an allocator-backed box.
fn box_copy<T: Copy, A: Allocator>(items: &[T], alloc: A) -> Result<Box<[T], A>, Error> {
    let mut vec = Vec::new_in(alloc);
    vec.try_reserve_exact(items.len())?;
    for &item in items {
        vec.push(item);
    }
    Ok(vec.into_boxed_slice())
}

// Runs a function of any kind through the engine or directly for natives.
fn dispatch<E: Engine<A>, A: Allocator>(
    engine: &mut E,
    store: &mut Store<'_, A>,
    stack: &mut Stack<A>,
    func: FuncHandle,
) -> Result<(), Error> {
    match store.resolve(func).ok_or(Error::InvalidHandle)? {
        ResolvedFunc::Native(native) => native(stack).map_err(Error::Trap),
        ResolvedFunc::Wasm(_) => engine.call(store, stack, func),
    }
}

/// An execution environment: a [`Store`] plus the engine that runs
/// WebAssembly functions.
pub struct Env<'m, E, A: Allocator> {
    store: Store<'m, A>,
    engine: E,
}

impl<'m, E: Engine<A>, A: Allocator + Clone> Env<'m, E, A> {
    /// Creates an environment executing through the given engine.
    pub fn new_in(engine: E, alloc: A) -> Self {
        Self {
            store: Store::new_in(alloc),
            engine,
        }
    }

    /// Read access to the environment's store.
    pub fn store(&self) -> &Store<'m, A> {
        &self.store
    }

    /// Read access to the environment's engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Finds a registered module by name.
    pub fn find_mod(&self, name: &str) -> Option<ModHandle> {
        self.store
            .find_instance(name.as_bytes())
            .map(|idx| ModHandle::from_index(idx as usize))
    }

    /// Finds an exported function within a registered module.
    pub fn find_func(&self, module: ModHandle, name: &str) -> Option<FuncHandle> {
        match self.store
            .find_export(module.index() as u32, ExternKind::Func, name.as_bytes())?
        {
            Extern::Func(handle) => Some(handle),
            _ => None,
        }
    }

    /// Finds an exported memory within a registered module.
    pub fn find_mem(&self, module: ModHandle, name: &str) -> Option<MemHandle> {
        match self.store
            .find_export(module.index() as u32, ExternKind::Mem, name.as_bytes())?
        {
            Extern::Mem(handle) => Some(handle),
            _ => None,
        }
    }

    /// Finds an exported table within a registered module.
    pub fn find_table(&self, module: ModHandle, name: &str) -> Option<TableHandle> {
        match self.store
            .find_export(module.index() as u32, ExternKind::Table, name.as_bytes())?
        {
            Extern::Table(handle) => Some(handle),
            _ => None,
        }
    }

    /// Finds an exported global within a registered module.
    pub fn find_global(&self, module: ModHandle, name: &str) -> Option<GlobalHandle> {
        match self.store
            .find_export(module.index() as u32, ExternKind::Global, name.as_bytes())?
        {
            Extern::Global(handle) => Some(handle),
            _ => None,
        }
    }

    /// Resolves one of a registered module's *imports* by kind and name.
    pub fn find_import(&self, module: ModHandle, kind: ExternKind, name: &str) -> Option<Extern> {
        let inst = self.store.instances.get(module.index())?;
        let InstanceKind::Wasm(m) = &inst.kind else {
            return None;
        };
        let mut nth = 0usize;
        for import in m.imports() {
            if import.desc.kind() != kind {
                continue;
            }
            if m.view_bytes(import.name) == name.as_bytes() {
                return Some(match kind {
                    ExternKind::Func => Extern::Func(*inst.funcs.get(nth)?),
                    ExternKind::Table => Extern::Table(*inst.tables.get(nth)?),
                    ExternKind::Mem => Extern::Mem(*inst.mems.get(nth)?),
                    ExternKind::Global => Extern::Global(*inst.globals.get(nth)?),
                });
            }
            nth += 1;
        }
        None
    }

    /// Invokes a function: parameters are popped from the operand stack's
    /// top; on success, results are pushed. On a trap, the stack is restored
    /// to its position at entry and the environment remains valid.
    pub fn call(&mut self, stack: &mut Stack<A>, func: FuncHandle) -> Result<(), Error> {
        let entry = stack.pos();
        let result = dispatch(&mut self.engine, &mut self.store, stack, func);
        if result.is_err() {
            stack.truncate(entry);
        }
        result
    }

    /// Registers a module under `name`, linking its imports against
    /// previously registered instances and running its start function (via
    /// the engine, on the given stack). On failure every allocation made on
    /// the module's behalf is rolled back.
    pub fn add_mod(
        &mut self,
        stack: &mut Stack<A>,
        name: &str,
        module: &'m Module<A>,
    ) -> Result<ModHandle, Error> {
        let mark = self.store.mark();
        let result = self.add_mod_inner(stack, name, module);
        if result.is_err() {
            self.store.rollback(mark);
        }
        result
    }

    fn add_mod_inner(
        &mut self,
        stack: &mut Stack<A>,
        name: &str,
        module: &'m Module<A>,
    ) -> Result<ModHandle, Error> {
        let alloc = self.store.alloc.clone();
        let inst_idx = self.store.instances.len() as u32;
        let mut inst = Instance {
            name: box_copy(name.as_bytes(), alloc.clone())?,
            kind: InstanceKind::Wasm(module),
            funcs: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            mems: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc),
        };

        // Resolve imports; they occupy the low range of each index space.
        for (i, import) in module.imports().iter().enumerate() {
            let index = i as u32;
            let provider = self
                .store
                .find_instance(module.view_bytes(import.module))
                .ok_or(LinkError::NotFound { index })?;
            let entity = self
                .store
                .find_export(provider, import.desc.kind(), module.view_bytes(import.name))
                .ok_or(LinkError::NotFound { index })?;
            match (import.desc, entity) {
                (ImportDesc::Func(type_idx), Extern::Func(handle)) => {
                    let ty = module.func_type(type_idx);
                    let wanted = (
                        module.view_valtypes(ty.params),
                        module.view_valtypes(ty.results),
                    );
                    let provided = self
                        .store
                        .func_sig(handle)
                        .ok_or(Error::InvalidHandle)?;
                    if wanted != provided {
                        return Err(LinkError::FuncMismatch { index }.into());
                    }
                    inst.funcs.try_reserve(1)?;
                    inst.funcs.push(handle);
                }
                (ImportDesc::Table(ty), Extern::Table(handle)) => {
                    let table = self.store.table(handle).ok_or(Error::InvalidHandle)?;
                    if !limits_compatible(ty.limits, table.size(), table.max()) {
                        return Err(LinkError::LimitsMismatch { index }.into());
                    }
                    inst.tables.try_reserve(1)?;
                    inst.tables.push(handle);
                }
                (ImportDesc::Mem(ty), Extern::Mem(handle)) => {
                    let mem = self.store.mem(handle).ok_or(Error::InvalidHandle)?;
                    if !limits_compatible(*ty, mem.size(), mem.max()) {
                        return Err(LinkError::LimitsMismatch { index }.into());
                    }
                    inst.mems.try_reserve(1)?;
                    inst.mems.push(handle);
                }
                (ImportDesc::Global(ty), Extern::Global(handle)) => {
                    let global = self.store.global(handle).ok_or(Error::InvalidHandle)?;
                    if global.ty != ty {
                        return Err(LinkError::GlobalMismatch { index }.into());
                    }
                    inst.globals.try_reserve(1)?;
                    inst.globals.push(handle);
                }
                _ => return Err(LinkError::KindMismatch { index }.into()),
            }
        }

        // The module's own functions follow the imported ones.
        inst.funcs.try_reserve(module.funcs().len())?;
        for idx in 0..module.funcs().len() as u32 {
            inst.funcs.push(FuncHandle {
                inst: inst_idx,
                idx,
            });
        }

        // Allocate memories and tables at their declared minima.
        inst.mems.try_reserve(module.mems().len())?;
        for ty in module.mems() {
            let handle = self.store.alloc_mem(*ty)?;
            inst.mems.push(handle);
        }
        inst.tables.try_reserve(module.tables().len())?;
        for ty in module.tables() {
            let handle = self.store.alloc_table(*ty)?;
            inst.tables.push(handle);
        }

        // Create globals from their initializers, which may read the
        // imported globals resolved above.
        inst.globals.try_reserve(module.globals().len())?;
        for global in module.globals() {
            let val = eval_const_expr(&self.store, module, &inst, global.expr)?;
            let handle = self.store.alloc_global(GlobalInst {
                ty: global.ty,
                val,
            })?;
            inst.globals.push(handle);
        }

        // Apply element segments, trapping on out-of-bounds writes.
        for elem in module.elems() {
            let offset = eval_const_expr(&self.store, module, &inst, elem.expr)?.to_u32();
            let table_handle = *inst
                .tables
                .get(elem.table_idx as usize)
                .ok_or(Error::InvalidHandle)?;
            for (k, &func_idx) in module.view_u32s(elem.funcs).iter().enumerate() {
                let func = *inst
                    .funcs
                    .get(func_idx as usize)
                    .ok_or(Error::InvalidHandle)?;
                let slot = offset
                    .checked_add(k as u32)
                    .ok_or(Error::Trap(TrapKind::TableOutOfBounds))?;
                self.store
                    .table_mut(table_handle)
                    .ok_or(Error::InvalidHandle)?
                    .set(slot, Some(func))
                    .map_err(Error::Trap)?;
            }
        }

        // Apply data segments, trapping on out-of-bounds writes.
        for segment in module.segments() {
            let offset = eval_const_expr(&self.store, module, &inst, segment.expr)?.to_u32();
            let mem_handle = *inst
                .mems
                .get(segment.mem_idx as usize)
                .ok_or(Error::InvalidHandle)?;
            self.store
                .mem_mut(mem_handle)
                .ok_or(Error::InvalidHandle)?
                .store(offset, 0, module.view_bytes(segment.data))
                .map_err(Error::Trap)?;
        }

        self.store.instances.try_reserve(1)?;
        self.store.instances.push(inst);

        // Run the start function; a trap aborts the whole registration and
        // leaves the caller's stack position untouched.
        if let Some(start) = module.start() {
            let func = self
                .store
                .func_by_index(inst_idx, *start)
                .ok_or(Error::InvalidHandle)?;
            let entry = stack.pos();
            let result = dispatch(&mut self.engine, &mut self.store, stack, func);
            if result.is_err() {
                stack.truncate(entry);
            }
            result?;
        }

        debug_log!("registered module {name:?} as instance {inst_idx}");
        Ok(ModHandle::from_index(inst_idx as usize))
    }

    /// Registers a native (host) module under `name`. The descriptor's
    /// contents are copied into the environment; the borrow ends with this
    /// call.
    pub fn add_native(&mut self, name: &str, native: &NativeMod<'_, A>) -> Result<ModHandle, Error> {
        let mark = self.store.mark();
        let result = self.add_native_inner(name, native);
        if result.is_err() {
            self.store.rollback(mark);
        }
        result
    }

    fn add_native_inner(
        &mut self,
        name: &str,
        native: &NativeMod<'_, A>,
    ) -> Result<ModHandle, Error> {
        let alloc = self.store.alloc.clone();
        let inst_idx = self.store.instances.len() as u32;

        let mut funcs = Vec::new_in(alloc.clone());
        funcs.try_reserve_exact(native.funcs.len())?;
        for func in native.funcs {
            funcs.push(NativeFuncInst {
                name: box_copy(func.name.as_bytes(), alloc.clone())?,
                func: func.func,
                params: box_copy(func.params, alloc.clone())?,
                results: box_copy(func.results, alloc.clone())?,
            });
        }

        let mut inst = Instance {
            name: box_copy(name.as_bytes(), alloc.clone())?,
            kind: InstanceKind::Native(NativeInstance {
                funcs,
                mem_names: Vec::new_in(alloc.clone()),
                table_names: Vec::new_in(alloc.clone()),
                global_names: Vec::new_in(alloc.clone()),
            }),
            funcs: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            mems: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc.clone()),
        };

        inst.funcs.try_reserve_exact(native.funcs.len())?;
        for idx in 0..native.funcs.len() as u32 {
            inst.funcs.push(FuncHandle {
                inst: inst_idx,
                idx,
            });
        }

        let mut mem_names = Vec::new_in(alloc.clone());
        mem_names.try_reserve_exact(native.mems.len())?;
        inst.mems.try_reserve_exact(native.mems.len())?;
        for mem in native.mems {
            let handle = self.store.alloc_mem(mem.mem)?;
            if !mem.data.is_empty() {
                self.store
                    .mem_mut(handle)
                    .ok_or(Error::InvalidHandle)?
                    .store(0, 0, mem.data)
                    .map_err(Error::Trap)?;
            }
            inst.mems.push(handle);
            mem_names.push(box_copy(mem.name.as_bytes(), alloc.clone())?);
        }

        let mut table_names = Vec::new_in(alloc.clone());
        table_names.try_reserve_exact(native.tables.len())?;
        inst.tables.try_reserve_exact(native.tables.len())?;
        for table in native.tables {
            let handle = self.store.alloc_table(table.table)?;
            inst.tables.push(handle);
            table_names.push(box_copy(table.name.as_bytes(), alloc.clone())?);
        }

        let mut global_names = Vec::new_in(alloc.clone());
        global_names.try_reserve_exact(native.globals.len())?;
        inst.globals.try_reserve_exact(native.globals.len())?;
        for global in native.globals {
            let handle = self.store.alloc_global(GlobalInst {
                ty: global.ty,
                val: global.val,
            })?;
            inst.globals.push(handle);
            global_names.push(box_copy(global.name.as_bytes(), alloc.clone())?);
        }

        let InstanceKind::Native(ref mut native_inst) = inst.kind else {
            unreachable!("instance was just built as native");
        };
        native_inst.mem_names = mem_names;
        native_inst.table_names = table_names;
        native_inst.global_names = global_names;

        self.store.instances.try_reserve(1)?;
        self.store.instances.push(inst);

        debug_log!("registered native module {name:?} as instance {inst_idx}");
        Ok(ModHandle::from_index(inst_idx as usize))
    }

    /// The current size of a memory, in pages.
    pub fn mem_size(&self, mem: MemHandle) -> Result<u32, Error> {
        Ok(self.store.mem(mem).ok_or(Error::InvalidHandle)?.size())
    }

    /// Grows a memory by `delta` pages, returning the previous size in
    /// pages, or `u32::MAX` on failure.
    pub fn mem_grow(&mut self, mem: MemHandle, delta: u32) -> Result<u32, Error> {
        Ok(self
            .store
            .mem_mut(mem)
            .ok_or(Error::InvalidHandle)?
            .grow(delta))
    }

    /// Borrows a memory's current contents.
    pub fn mem_bytes(&self, mem: MemHandle) -> Result<&[u8], Error> {
        Ok(self.store.mem(mem).ok_or(Error::InvalidHandle)?.bytes())
    }

    /// Borrows a memory's current contents, writable.
    pub fn mem_bytes_mut(&mut self, mem: MemHandle) -> Result<&mut [u8], Error> {
        Ok(self
            .store
            .mem_mut(mem)
            .ok_or(Error::InvalidHandle)?
            .bytes_mut())
    }

    /// Reads `out.len()` bytes from a memory at `offset`.
    pub fn mem_read(&self, mem: MemHandle, offset: u32, out: &mut [u8]) -> Result<(), Error> {
        let mem = self.store.mem(mem).ok_or(Error::InvalidHandle)?;
        let bytes = mem.load(offset, 0, out.len()).map_err(Error::Trap)?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    /// Writes `bytes` into a memory at `offset`.
    pub fn mem_write(&mut self, mem: MemHandle, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.store
            .mem_mut(mem)
            .ok_or(Error::InvalidHandle)?
            .store(offset, 0, bytes)
            .map_err(Error::Trap)
    }

    /// Reads a global's value.
    pub fn get_global(&self, global: GlobalHandle) -> Result<Value, Error> {
        Ok(self.store.global(global).ok_or(Error::InvalidHandle)?.val)
    }

    /// Writes a global's value.
    pub fn set_global(&mut self, global: GlobalHandle, val: Value) -> Result<(), Error> {
        self.store
            .global_mut(global)
            .ok_or(Error::InvalidHandle)?
            .val = val;
        Ok(())
    }

    /// Reads a table slot; `None` is a null reference.
    pub fn get_elem(&self, table: TableHandle, idx: u32) -> Result<Option<FuncHandle>, Error> {
        self.store
            .table(table)
            .ok_or(Error::InvalidHandle)?
            .get(idx)
            .map_err(Error::Trap)
    }
}
