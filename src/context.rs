//! Cache Front-End
//!
//! [`StateCache`] is the draw loop's entry point. It tracks the bound shader
//! stages and their dirty bits, keeps the program cache (keyed by the bound
//! stage id tuple), owns the mutable pipeline states, and maintains the
//! binding-epoch counters that descriptor allocation is keyed by.
//!
//! Everything is single-threaded; the only suspension point is the
//! flush-and-retry path when a descriptor pool runs dry.

use std::rc::Rc;

use log::{error, warn};
use rustc_hash::FxHashMap;

use crate::batch::{Batch, BatchHost, ProgramRef};
use crate::descriptor::{
    AllocOutcome, DESCRIPTOR_TYPE_COUNT, DescriptorSet, DescriptorStateKey, DescriptorType,
};
use crate::device::{GpuDevice, PipelineHandle, ShaderCompiler};
use crate::error::{CacheError, Result};
use crate::pipeline::{ComputePipelineState, GfxPipelineState, PrimitiveTopology};
use crate::program::{ComputeProgram, GfxProgram};
use crate::shader::{DrawKeyContext, GFX_STAGE_COUNT, GfxStages, ShaderInfo, Stage, StageMask};

// ─────────────────────────────────────────────────────────────────────────────
// Binding epochs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct EpochSlot {
    epoch: u32,
    valid: bool,
}

/// Per-stage per-type binding epochs; bumped when the front-end rebinds
/// resources, folded into [`DescriptorStateKey`]s.
#[derive(Debug, Default)]
struct DescriptorStates {
    gfx: [[EpochSlot; DESCRIPTOR_TYPE_COUNT]; GFX_STAGE_COUNT],
    compute: [u32; DESCRIPTOR_TYPE_COUNT],
}

impl DescriptorStates {
    /// A stage contributes its epoch only while it is bound, has bindings of
    /// the type, and its state is valid.
    fn gfx_key(&self, stages: &GfxStages, ty: DescriptorType) -> DescriptorStateKey {
        let mut epochs = [None; GFX_STAGE_COUNT];
        for (i, shader) in stages.iter().enumerate() {
            let Some(shader) = shader else { continue };
            if shader.bindings[ty.index()].is_empty() {
                continue;
            }
            let slot = self.gfx[i][ty.index()];
            if slot.valid {
                epochs[i] = Some(slot.epoch);
            }
        }
        DescriptorStateKey::Gfx(epochs)
    }

    fn compute_key(&self, ty: DescriptorType) -> DescriptorStateKey {
        DescriptorStateKey::Compute(self.compute[ty.index()])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State cache
// ─────────────────────────────────────────────────────────────────────────────

/// The cache front-end owning bound-stage state, program caches, pipeline
/// states, and binding epochs.
pub struct StateCache {
    device: Rc<dyn GpuDevice>,
    compiler: Rc<dyn ShaderCompiler>,
    gfx_stages: GfxStages,
    compute_shader: Option<Rc<ShaderInfo>>,
    dirty_stages: StageMask,
    programs: FxHashMap<[u32; GFX_STAGE_COUNT], Rc<GfxProgram>>,
    compute_programs: FxHashMap<u32, Rc<ComputeProgram>>,
    curr_program: Option<Rc<GfxProgram>>,
    curr_compute: Option<Rc<ComputeProgram>>,
    key_ctx: DrawKeyContext,
    gfx_pipeline_state: GfxPipelineState,
    compute_pipeline_state: ComputePipelineState,
    desc_states: DescriptorStates,
}

impl StateCache {
    #[must_use]
    pub fn new(device: Rc<dyn GpuDevice>, compiler: Rc<dyn ShaderCompiler>) -> Self {
        Self {
            device,
            compiler,
            gfx_stages: Default::default(),
            compute_shader: None,
            dirty_stages: StageMask::empty(),
            programs: FxHashMap::default(),
            compute_programs: FxHashMap::default(),
            curr_program: None,
            curr_compute: None,
            key_ctx: DrawKeyContext::default(),
            gfx_pipeline_state: GfxPipelineState::new(),
            compute_pipeline_state: ComputePipelineState::new(),
            desc_states: DescriptorStates::default(),
        }
    }

    // ── Stage binding ────────────────────────────────────────────────────

    /// Binds (or unbinds) a graphics stage, marking it dirty. Binding or
    /// unbinding geometry or tess-eval also dirties the upstream stages
    /// whose `last_vertex_stage` specialization just moved.
    pub fn bind_gfx_stage(&mut self, stage: Stage, shader: Option<Rc<ShaderInfo>>) {
        debug_assert!(stage != Stage::Compute);
        debug_assert!(shader.as_ref().is_none_or(|s| s.stage == stage && s.id != 0));
        let i = stage.index();
        let prev_id = self.gfx_stages[i].as_ref().map(|s| s.id);
        let next_id = shader.as_ref().map(|s| s.id);
        if prev_id == next_id {
            self.gfx_stages[i] = shader;
            return;
        }
        let presence_changed = prev_id.is_some() != next_id.is_some();
        self.gfx_stages[i] = shader;
        self.dirty_stages |= stage.mask();
        if presence_changed {
            match stage {
                Stage::Geometry => {
                    self.dirty_stages |= StageMask::TESS_EVAL | StageMask::VERTEX;
                }
                Stage::TessEval => self.dirty_stages |= StageMask::VERTEX,
                _ => {}
            }
        }
    }

    /// Binds (or unbinds) the compute shader.
    pub fn bind_compute(&mut self, shader: Option<Rc<ShaderInfo>>) {
        debug_assert!(shader.as_ref().is_none_or(|s| s.stage == Stage::Compute));
        let changed = self.compute_shader.as_ref().map(|s| s.id)
            != shader.as_ref().map(|s| s.id);
        self.compute_shader = shader;
        if changed {
            self.dirty_stages |= StageMask::COMPUTE;
        }
    }

    /// Marks one stage for re-specialization on the next program update.
    pub fn mark_stage_dirty(&mut self, stage: Stage) {
        self.dirty_stages |= stage.mask();
    }

    /// Dirties whichever bound stage is last before rasterization, after a
    /// change to rasterizer-dependent key state.
    pub fn mark_last_vertex_stage_dirty(&mut self) {
        if self.gfx_stages[Stage::Geometry.index()].is_some() {
            self.dirty_stages |= StageMask::GEOMETRY;
        } else if self.gfx_stages[Stage::TessEval.index()].is_some() {
            self.dirty_stages |= StageMask::TESS_EVAL;
        } else {
            self.dirty_stages |= StageMask::VERTEX;
        }
    }

    /// Draw-state inputs to specialization keys. Callers changing a field
    /// must mark the affected stages dirty themselves.
    pub fn draw_key_ctx_mut(&mut self) -> &mut DrawKeyContext {
        &mut self.key_ctx
    }

    pub fn gfx_pipeline_state_mut(&mut self) -> &mut GfxPipelineState {
        &mut self.gfx_pipeline_state
    }

    pub fn compute_pipeline_state_mut(&mut self) -> &mut ComputePipelineState {
        &mut self.compute_pipeline_state
    }

    // ── Program updates ──────────────────────────────────────────────────

    /// Gets or creates the program for the bound graphics stage set, keyed
    /// by the stage id tuple. A cached program still re-resolves modules for
    /// dirty stages, since specialization keys may have moved.
    pub fn update_gfx_program(&mut self) -> Result<Rc<GfxProgram>> {
        let dirty = self.dirty_stages & StageMask::GFX;
        if dirty.is_empty() {
            if let Some(curr) = &self.curr_program {
                return Ok(curr.clone());
            }
        }
        if self.gfx_stages[Stage::Vertex.index()].is_none() {
            return Err(CacheError::NoShaderBound {
                stage: Stage::Vertex,
            });
        }

        let key: [u32; GFX_STAGE_COUNT] =
            std::array::from_fn(|i| self.gfx_stages[i].as_ref().map_or(0, |s| s.id));
        let program = if let Some(program) = self.programs.get(&key).cloned() {
            let changed = program.update_modules(
                self.compiler.as_ref(),
                &self.gfx_stages,
                dirty,
                &self.key_ctx,
            )?;
            if changed {
                self.gfx_pipeline_state.touch();
            }
            program
        } else {
            let program = GfxProgram::create(
                &self.device,
                self.compiler.as_ref(),
                self.curr_program.as_ref(),
                &self.gfx_stages,
                dirty,
                &self.key_ctx,
            )?;
            self.programs.insert(key, program.clone());
            program
        };

        if self
            .curr_program
            .as_ref()
            .is_none_or(|curr| !Rc::ptr_eq(curr, &program))
        {
            self.gfx_pipeline_state.touch();
        }
        self.curr_program = Some(program.clone());
        self.dirty_stages -= StageMask::GFX;
        Ok(program)
    }

    /// Gets or creates the program for the bound compute shader.
    pub fn update_compute_program(&mut self) -> Result<Rc<ComputeProgram>> {
        if !self.dirty_stages.contains(StageMask::COMPUTE) {
            if let Some(curr) = &self.curr_compute {
                return Ok(curr.clone());
            }
        }
        let shader = self.compute_shader.clone().ok_or(CacheError::NoShaderBound {
            stage: Stage::Compute,
        })?;

        let program = if let Some(program) = self.compute_programs.get(&shader.id).cloned() {
            program
        } else {
            let program = ComputeProgram::create(
                &self.device,
                self.compiler.as_ref(),
                self.curr_compute.as_ref(),
                &shader,
            )?;
            self.compute_programs.insert(shader.id, program.clone());
            program
        };

        if self
            .curr_compute
            .as_ref()
            .is_none_or(|curr| !Rc::ptr_eq(curr, &program))
        {
            self.compute_pipeline_state.touch();
        }
        self.curr_compute = Some(program.clone());
        self.dirty_stages -= StageMask::COMPUTE;
        Ok(program)
    }

    /// Updates the program and looks up or bakes the draw's pipeline.
    pub fn get_gfx_pipeline(&mut self, topology: PrimitiveTopology) -> Result<PipelineHandle> {
        let program = self.update_gfx_program()?;
        program.get_pipeline(&mut self.gfx_pipeline_state, topology)
    }

    /// Updates the program and looks up or bakes the dispatch's pipeline.
    pub fn get_compute_pipeline(&mut self) -> Result<PipelineHandle> {
        let program = self.update_compute_program()?;
        program.get_pipeline(&mut self.compute_pipeline_state)
    }

    // ── Descriptor state ─────────────────────────────────────────────────

    /// Bumps the binding epoch for a stage/type after the front-end rebinds
    /// resources.
    pub fn bump_descriptor_state(&mut self, stage: Stage, ty: DescriptorType) {
        if stage == Stage::Compute {
            self.desc_states.compute[ty.index()] =
                self.desc_states.compute[ty.index()].wrapping_add(1);
        } else {
            let slot = &mut self.desc_states.gfx[stage.index()][ty.index()];
            slot.epoch = slot.epoch.wrapping_add(1);
            slot.valid = true;
        }
    }

    /// Drops a stage/type from key derivation until the next bump.
    pub fn invalidate_descriptor_state(&mut self, stage: Stage, ty: DescriptorType) {
        if stage != Stage::Compute {
            self.desc_states.gfx[stage.index()][ty.index()].valid = false;
        }
    }

    /// Allocates the draw's descriptor set of `ty` from the current graphics
    /// program, flushing `batch` through `host` and retrying once if the
    /// pool is at capacity. The second element reports a cache hit (set
    /// contents already match the bindings).
    pub fn allocate_desc_set(
        &mut self,
        ty: DescriptorType,
        batch: &mut Batch,
        host: &mut dyn BatchHost,
    ) -> Result<(Rc<DescriptorSet>, bool)> {
        let program = self.curr_program.clone().ok_or(CacheError::NoShaderBound {
            stage: Stage::Vertex,
        })?;
        let mut flushed = false;
        loop {
            let key = self.desc_states.gfx_key(&self.gfx_stages, ty);
            match program.allocate_desc_set(ty, key, batch)? {
                AllocOutcome::Ready { set, cache_hit } => return Ok((set, cache_hit)),
                AllocOutcome::NeedsFlush => {
                    if flushed {
                        break;
                    }
                    warn!(
                        "descriptor pool for {ty:?} at capacity, flushing batch {}",
                        batch.id()
                    );
                    batch.reference_program(ProgramRef::Gfx(program.clone()));
                    host.flush_batch(batch);
                    flushed = true;
                }
            }
        }
        error!("descriptor pool for {ty:?} still exhausted after flush and retry");
        Err(CacheError::PoolExhausted { ty })
    }

    /// Compute-side counterpart of [`allocate_desc_set`](Self::allocate_desc_set).
    pub fn allocate_compute_desc_set(
        &mut self,
        ty: DescriptorType,
        batch: &mut Batch,
        host: &mut dyn BatchHost,
    ) -> Result<(Rc<DescriptorSet>, bool)> {
        let program = self.curr_compute.clone().ok_or(CacheError::NoShaderBound {
            stage: Stage::Compute,
        })?;
        let mut flushed = false;
        loop {
            let key = self.desc_states.compute_key(ty);
            match program.allocate_desc_set(ty, key, batch)? {
                AllocOutcome::Ready { set, cache_hit } => return Ok((set, cache_hit)),
                AllocOutcome::NeedsFlush => {
                    if flushed {
                        break;
                    }
                    warn!(
                        "descriptor pool for {ty:?} at capacity, flushing batch {}",
                        batch.id()
                    );
                    batch.reference_program(ProgramRef::Compute(program.clone()));
                    host.flush_batch(batch);
                    flushed = true;
                }
            }
        }
        error!("descriptor pool for {ty:?} still exhausted after flush and retry");
        Err(CacheError::PoolExhausted { ty })
    }

    // ── Destruction ──────────────────────────────────────────────────────

    /// Drops the cache's references to `program`. The program (and its
    /// native objects) lives on while batches still reference it.
    pub fn destroy_program(&mut self, program: &Rc<GfxProgram>) {
        let key = program.stage_ids();
        if self
            .programs
            .get(&key)
            .is_some_and(|p| Rc::ptr_eq(p, program))
        {
            self.programs.remove(&key);
        }
        if self
            .curr_program
            .as_ref()
            .is_some_and(|p| Rc::ptr_eq(p, program))
        {
            self.curr_program = None;
            self.dirty_stages |= program.stage_mask();
        }
    }

    /// Compute-side counterpart of [`destroy_program`](Self::destroy_program).
    pub fn destroy_compute_program(&mut self, program: &Rc<ComputeProgram>) {
        let key = program.shader_id();
        if self
            .compute_programs
            .get(&key)
            .is_some_and(|p| Rc::ptr_eq(p, program))
        {
            self.compute_programs.remove(&key);
        }
        if self
            .curr_compute
            .as_ref()
            .is_some_and(|p| Rc::ptr_eq(p, program))
        {
            self.curr_compute = None;
            self.dirty_stages |= StageMask::COMPUTE;
        }
    }

    /// Number of cached graphics programs.
    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn curr_program(&self) -> Option<&Rc<GfxProgram>> {
        self.curr_program.as_ref()
    }
}
