//! Shader Module Cache
//!
//! Compiled modules are cached per (stage, specialization key) and shared by
//! `Rc`: programs that keep a compatible slot map share one cache, so
//! rebinding a single stage never recompiles the others. The native module
//! handle is destroyed exactly once, when the last reference drops.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::device::{GpuDevice, ModuleHandle, ShaderCompiler};
use crate::error::Result;
use crate::hash::Hashed;
use crate::shader::{ShaderInfo, SpecKey, Stage};
use crate::slot_map::SlotMap;

/// A compiled shader module; destroys its native handle on last drop.
pub struct ShaderModule {
    stage: Stage,
    handle: ModuleHandle,
    device: Rc<dyn GpuDevice>,
}

impl ShaderModule {
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.handle);
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("stage", &self.stage)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Lookup key: one stage under one specialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub stage: Stage,
    pub key: SpecKey,
}

/// Cache of compiled modules, keyed by memoized-hash [`ModuleKey`].
#[derive(Debug, Default)]
pub struct ShaderModuleCache {
    modules: FxHashMap<Hashed<ModuleKey>, Rc<ShaderModule>>,
}

impl ShaderModuleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Returns the cached module for (`shader.stage`, `key`), compiling on
    /// miss. The second tuple element is true when this call inserted a new
    /// entry, so a failing program construction can remove its own
    /// insertions.
    ///
    /// Graphics compiles go through `slot_map`; the map must be the one the
    /// rest of the program was or will be compiled against.
    pub fn get_or_compile(
        &mut self,
        device: &Rc<dyn GpuDevice>,
        compiler: &dyn ShaderCompiler,
        shader: &ShaderInfo,
        key: SpecKey,
        slot_map: Option<&mut SlotMap>,
    ) -> Result<(Rc<ShaderModule>, bool)> {
        let hashed = Hashed::new(ModuleKey {
            stage: shader.stage,
            key,
        });
        if let Some(module) = self.modules.get(&hashed) {
            return Ok((module.clone(), false));
        }
        debug!(
            "module cache miss: shader {} ({:?}), compiling",
            shader.id, shader.stage
        );
        let handle = compiler.compile(shader, &hashed.key().key, slot_map)?;
        let module = Rc::new(ShaderModule {
            stage: shader.stage,
            handle,
            device: device.clone(),
        });
        self.modules.insert(hashed, module.clone());
        Ok((module, true))
    }

    /// Removes one entry; used to unwind sibling insertions when a later
    /// stage of the same construction attempt fails to compile.
    pub fn remove(&mut self, key: &ModuleKey) -> Option<Rc<ShaderModule>> {
        self.modules.remove(&Hashed::new(key.clone()))
    }
}

/// A program's handle on a module cache: either the cache it created, or a
/// refcounted share of a predecessor's. Both hold the same `Rc`, so the cache
/// (and its native modules) dies with the last program using it.
#[derive(Debug, Clone)]
pub enum ModuleCacheRef {
    Owned(Rc<RefCell<ShaderModuleCache>>),
    Shared(Rc<RefCell<ShaderModuleCache>>),
}

impl ModuleCacheRef {
    /// A brand-new cache, owned by the program being built.
    #[must_use]
    pub fn fresh() -> Self {
        Self::Owned(Rc::new(RefCell::new(ShaderModuleCache::new())))
    }

    /// A share of this cache for a successor program.
    #[must_use]
    pub fn share(&self) -> Self {
        Self::Shared(self.get().clone())
    }

    #[must_use]
    pub fn get(&self) -> &Rc<RefCell<ShaderModuleCache>> {
        match self {
            Self::Owned(cache) | Self::Shared(cache) => cache,
        }
    }
}
