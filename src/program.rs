//! Linked Programs
//!
//! A [`GfxProgram`] ties a bound stage set to everything derived from it:
//! compiled modules (through an owned or shared module cache), per-topology
//! pipeline tables, descriptor layouts/pools, and the aggregate pipeline
//! layout.
//!
//! Teardown is ordered by struct field declaration: the pipeline layout goes
//! first, then cached pipelines, then module references (natives die with
//! the last cache holding them), then descriptor tables and pools. Native
//! descriptor pools referenced by in-flight sets survive through the sets'
//! `PoolBacking` refs.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::batch::Batch;
use crate::descriptor::{
    AllocOutcome, DescriptorSet, DescriptorStateKey, DescriptorType, ProgramDescriptors,
};
use crate::device::{
    ComputePipelineDescriptor, GfxPipelineDescriptor, GpuDevice, ModuleHandle,
    PipelineHandle, PipelineLayoutHandle, ShaderCompiler,
};
use crate::error::Result;
use crate::hash::Hashed;
use crate::module_cache::{ModuleCacheRef, ModuleKey, ShaderModule, ShaderModuleCache};
use crate::pipeline::{
    ComputePipelineIdentity, ComputePipelineState, GfxPipelineIdentity, GfxPipelineState,
    Pipeline, PrimitiveTopology,
};
use crate::shader::{
    DrawKeyContext, GFX_STAGE_COUNT, GFX_STAGES, GfxStages, ShaderInfo, SpecKey, Stage,
    StageMask,
};
use crate::slot_map::{self, SlotMap, SlotMapPlan};

/// The aggregate pipeline layout; destroys its native handle on drop.
struct PipelineLayout {
    handle: PipelineLayoutHandle,
    device: Rc<dyn GpuDevice>,
}

impl PipelineLayout {
    fn handle(&self) -> PipelineLayoutHandle {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.handle);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module resolution
// ─────────────────────────────────────────────────────────────────────────────

type GfxModules = [Option<Rc<ShaderModule>>; GFX_STAGE_COUNT];

/// Resolves one module per bound stage, in pipeline order so downstream
/// stages observe upstream slot assignments. Non-dirty stages reuse
/// `prior_modules`; the rest go through the cache, recording fresh
/// insertions in `inserted` so a failing construction can unwind them.
fn resolve_modules(
    device: &Rc<dyn GpuDevice>,
    compiler: &dyn ShaderCompiler,
    cache: &RefCell<ShaderModuleCache>,
    slot_map: &mut SlotMap,
    stages: &GfxStages,
    prior_modules: Option<&GfxModules>,
    dirty: StageMask,
    key_ctx: &DrawKeyContext,
    inserted: &mut Vec<ModuleKey>,
) -> Result<GfxModules> {
    let mut modules: GfxModules = Default::default();
    for stage in GFX_STAGES {
        let i = stage.index();
        let Some(shader) = &stages[i] else { continue };
        if !dirty.contains(stage.mask()) {
            if let Some(prior) = prior_modules.and_then(|m| m[i].clone()) {
                modules[i] = Some(prior);
                continue;
            }
        }
        let key = SpecKey::for_stage(shader, stages, key_ctx);
        let (module, was_inserted) =
            cache
                .borrow_mut()
                .get_or_compile(device, compiler, shader, key, Some(slot_map))?;
        if was_inserted {
            inserted.push(ModuleKey { stage, key });
        }
        modules[i] = Some(module);
    }
    Ok(modules)
}

fn remove_inserted(cache: &RefCell<ShaderModuleCache>, inserted: &[ModuleKey]) {
    let mut cache = cache.borrow_mut();
    for key in inserted {
        cache.remove(key);
    }
}

fn modules_eq(a: &GfxModules, b: &GfxModules) -> bool {
    a.iter().zip(b).all(|(x, y)| match (x, y) {
        (None, None) => true,
        (Some(x), Some(y)) => Rc::ptr_eq(x, y),
        _ => false,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Graphics programs
// ─────────────────────────────────────────────────────────────────────────────

/// A linked graphics program. Field order encodes teardown order.
pub struct GfxProgram {
    layout: PipelineLayout,
    pipelines: [RefCell<FxHashMap<Hashed<GfxPipelineIdentity>, Pipeline>>;
        PrimitiveTopology::COUNT],
    modules: RefCell<GfxModules>,
    module_cache: ModuleCacheRef,
    slot_map: RefCell<SlotMap>,
    stages: GfxStages,
    stage_mask: StageMask,
    descriptors: ProgramDescriptors,
    device: Rc<dyn GpuDevice>,
}

impl GfxProgram {
    /// Links a program for the bound stage set.
    ///
    /// `prior` is the program being replaced, if any; surviving (non-dirty)
    /// stages reuse its modules, and a compatible slot map shares its module
    /// cache outright. Any collaborator failure unwinds, including removal
    /// of sibling modules inserted during this attempt.
    pub(crate) fn create(
        device: &Rc<dyn GpuDevice>,
        compiler: &dyn ShaderCompiler,
        prior: Option<&Rc<GfxProgram>>,
        stages: &GfxStages,
        dirty: StageMask,
        key_ctx: &DrawKeyContext,
    ) -> Result<Rc<Self>> {
        let mut stage_mask = StageMask::empty();
        for stage in GFX_STAGES {
            if stages[stage.index()].is_some() {
                stage_mask |= stage.mask();
            }
        }

        let plan = match prior {
            Some(p) => {
                let map = p.slot_map.borrow();
                slot_map::plan(Some((&map, p.stage_mask)), stages, dirty & StageMask::GFX)
            }
            None => SlotMapPlan::Fresh,
        };
        let (mut map, module_cache) = match (plan, prior) {
            (SlotMapPlan::Reuse, Some(p)) => {
                (p.slot_map.borrow().clone(), p.module_cache.share())
            }
            _ => (SlotMap::new(), ModuleCacheRef::fresh()),
        };

        let mut inserted = Vec::new();
        let prior_modules = prior.map(|p| p.modules.borrow().clone());
        let modules = resolve_modules(
            device,
            compiler,
            module_cache.get(),
            &mut map,
            stages,
            prior_modules.as_ref(),
            dirty,
            key_ctx,
            &mut inserted,
        )
        .inspect_err(|_| remove_inserted(module_cache.get(), &inserted))?;

        let shader_refs: SmallVec<[&ShaderInfo; GFX_STAGE_COUNT]> =
            stages.iter().flatten().map(Rc::as_ref).collect();
        let (descriptors, set_layouts) = ProgramDescriptors::build(device, &shader_refs)
            .inspect_err(|_| remove_inserted(module_cache.get(), &inserted))?;

        let layout_handle = device
            .create_pipeline_layout(&set_layouts)
            .inspect_err(|_| remove_inserted(module_cache.get(), &inserted))?;

        debug!(
            "linked gfx program for stages {:?} ({:?} slot map)",
            stage_mask, plan
        );
        Ok(Rc::new(Self {
            layout: PipelineLayout {
                handle: layout_handle,
                device: device.clone(),
            },
            pipelines: std::array::from_fn(|_| RefCell::new(FxHashMap::default())),
            modules: RefCell::new(modules),
            module_cache,
            slot_map: RefCell::new(map),
            stages: stages.clone(),
            stage_mask,
            descriptors,
            device: device.clone(),
        }))
    }

    /// Re-resolves modules for dirty stages against the program's own cache
    /// and slot map (specialization keys may have moved under an unchanged
    /// stage set). Returns true when any module changed.
    pub(crate) fn update_modules(
        &self,
        compiler: &dyn ShaderCompiler,
        stages: &GfxStages,
        dirty: StageMask,
        key_ctx: &DrawKeyContext,
    ) -> Result<bool> {
        if (dirty & self.stage_mask).is_empty() {
            return Ok(false);
        }
        let mut inserted = Vec::new();
        let prior = self.modules.borrow().clone();
        let resolved = {
            let mut map = self.slot_map.borrow_mut();
            resolve_modules(
                &self.device,
                compiler,
                self.module_cache.get(),
                &mut map,
                stages,
                Some(&prior),
                dirty,
                key_ctx,
                &mut inserted,
            )
        };
        match resolved {
            Ok(modules) => {
                let changed = !modules_eq(&prior, &modules);
                *self.modules.borrow_mut() = modules;
                Ok(changed)
            }
            Err(err) => {
                remove_inserted(self.module_cache.get(), &inserted);
                Err(err)
            }
        }
    }

    /// Looks up or bakes the pipeline for the current state under
    /// `topology`. Creation failures are returned and cache nothing.
    pub fn get_pipeline(
        &self,
        state: &mut GfxPipelineState,
        topology: PrimitiveTopology,
    ) -> Result<PipelineHandle> {
        state.refresh(self.module_handles());
        let key = state.hashed();
        let mut table = self.pipelines[topology.index()].borrow_mut();
        if let Some(pipeline) = table.get(&key) {
            return Ok(pipeline.handle());
        }
        debug!("gfx pipeline cache miss under {topology:?}");
        let desc = GfxPipelineDescriptor {
            ident: *state.ident(),
            topology,
            layout: self.layout.handle(),
        };
        let handle = self
            .device
            .create_pipeline(&desc)
            .inspect_err(|err| warn!("gfx pipeline creation failed: {err}"))?;
        table.insert(key, Pipeline::new(handle, self.device.clone()));
        Ok(handle)
    }

    /// One descriptor set allocation attempt; the context drives the
    /// flush-and-retry loop.
    pub(crate) fn allocate_desc_set(
        &self,
        ty: DescriptorType,
        key: DescriptorStateKey,
        batch: &mut Batch,
    ) -> Result<AllocOutcome> {
        self.descriptors.allocate(ty, key, batch)
    }

    /// Returns `set` to its recyclable table; no-op while batches still
    /// reference it.
    pub fn recycle_desc_set(&self, set: &Rc<DescriptorSet>) {
        self.descriptors.recycle(set);
    }

    /// Bindings of `ty` across this program's stages.
    #[must_use]
    pub fn descriptor_count(&self, ty: DescriptorType) -> usize {
        self.descriptors.descriptor_count(ty)
    }

    #[must_use]
    pub fn stage_mask(&self) -> StageMask {
        self.stage_mask
    }

    /// Shader ids per stage slot, 0 for unbound; the program cache key.
    #[must_use]
    pub fn stage_ids(&self) -> [u32; GFX_STAGE_COUNT] {
        std::array::from_fn(|i| self.stages[i].as_ref().map_or(0, |s| s.id))
    }

    /// The module currently resolved for `stage`.
    #[must_use]
    pub fn module(&self, stage: Stage) -> Option<Rc<ShaderModule>> {
        self.modules.borrow().get(stage.index()).cloned().flatten()
    }

    fn module_handles(&self) -> [ModuleHandle; GFX_STAGE_COUNT] {
        let modules = self.modules.borrow();
        std::array::from_fn(|i| modules[i].as_ref().map_or(ModuleHandle::NULL, |m| m.handle()))
    }

    /// Compacted locations assigned in this program's slot map.
    #[must_use]
    pub fn slot_reserved(&self) -> u8 {
        self.slot_map.borrow().reserved()
    }

    /// True when both programs resolve modules out of the same cache.
    #[must_use]
    pub fn shares_module_cache_with(&self, other: &GfxProgram) -> bool {
        Rc::ptr_eq(self.module_cache.get(), other.module_cache.get())
    }

    /// Entries in this program's module cache (shared entries included).
    #[must_use]
    pub fn cached_module_count(&self) -> usize {
        self.module_cache.get().borrow().len()
    }
}

impl Drop for GfxProgram {
    fn drop(&mut self) {
        debug!("destroying gfx program for stages {:?}", self.stage_mask);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compute programs
// ─────────────────────────────────────────────────────────────────────────────

/// A linked compute program: one module, one pipeline table, the same
/// descriptor machinery as graphics. Field order encodes teardown order.
pub struct ComputeProgram {
    layout: PipelineLayout,
    pipelines: RefCell<FxHashMap<Hashed<ComputePipelineIdentity>, Pipeline>>,
    module: Rc<ShaderModule>,
    module_cache: ModuleCacheRef,
    shader: Rc<ShaderInfo>,
    descriptors: ProgramDescriptors,
    device: Rc<dyn GpuDevice>,
}

impl ComputeProgram {
    pub(crate) fn create(
        device: &Rc<dyn GpuDevice>,
        compiler: &dyn ShaderCompiler,
        prior: Option<&Rc<ComputeProgram>>,
        shader: &Rc<ShaderInfo>,
    ) -> Result<Rc<Self>> {
        let module_cache = prior.map_or_else(ModuleCacheRef::fresh, |p| p.module_cache.share());
        let key = SpecKey::Compute {
            shader_id: shader.id,
        };
        let mut inserted = Vec::new();
        let (module, was_inserted) =
            module_cache
                .get()
                .borrow_mut()
                .get_or_compile(device, compiler, shader, key, None)?;
        if was_inserted {
            inserted.push(ModuleKey {
                stage: Stage::Compute,
                key,
            });
        }

        let (descriptors, set_layouts) = ProgramDescriptors::build(device, &[shader.as_ref()])
            .inspect_err(|_| remove_inserted(module_cache.get(), &inserted))?;
        let layout_handle = device
            .create_pipeline_layout(&set_layouts)
            .inspect_err(|_| remove_inserted(module_cache.get(), &inserted))?;

        debug!("linked compute program for shader {}", shader.id);
        Ok(Rc::new(Self {
            layout: PipelineLayout {
                handle: layout_handle,
                device: device.clone(),
            },
            pipelines: RefCell::new(FxHashMap::default()),
            module,
            module_cache,
            shader: shader.clone(),
            descriptors,
            device: device.clone(),
        }))
    }

    /// Looks up or bakes the compute pipeline for the current state.
    pub fn get_pipeline(&self, state: &mut ComputePipelineState) -> Result<PipelineHandle> {
        state.refresh(self.module.handle());
        let key = state.hashed();
        let mut table = self.pipelines.borrow_mut();
        if let Some(pipeline) = table.get(&key) {
            return Ok(pipeline.handle());
        }
        debug!("compute pipeline cache miss for shader {}", self.shader.id);
        let desc = ComputePipelineDescriptor {
            module: self.module.handle(),
            local_size: state.ident().local_size,
            layout: self.layout.handle(),
        };
        let handle = self
            .device
            .create_compute_pipeline(&desc)
            .inspect_err(|err| warn!("compute pipeline creation failed: {err}"))?;
        table.insert(key, Pipeline::new(handle, self.device.clone()));
        Ok(handle)
    }

    pub(crate) fn allocate_desc_set(
        &self,
        ty: DescriptorType,
        key: DescriptorStateKey,
        batch: &mut Batch,
    ) -> Result<AllocOutcome> {
        self.descriptors.allocate(ty, key, batch)
    }

    pub fn recycle_desc_set(&self, set: &Rc<DescriptorSet>) {
        self.descriptors.recycle(set);
    }

    #[must_use]
    pub fn descriptor_count(&self, ty: DescriptorType) -> usize {
        self.descriptors.descriptor_count(ty)
    }

    #[must_use]
    pub fn shader_id(&self) -> u32 {
        self.shader.id
    }

    #[must_use]
    pub fn module(&self) -> &Rc<ShaderModule> {
        &self.module
    }
}

impl Drop for ComputeProgram {
    fn drop(&mut self) {
        debug!("destroying compute program for shader {}", self.shader.id);
    }
}
