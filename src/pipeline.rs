//! Pipeline Identity & State
//!
//! A pipeline object is cached under a POD identity prefix: the per-stage
//! module handles plus the fixed-function words that feed pipeline creation.
//! Identity hashing is memoized — the draw loop mutates state through setters
//! that raise a dirty flag, and the hash is recomputed at most once per
//! lookup, never per field write.

use std::rc::Rc;

use crate::device::{GpuDevice, ModuleHandle, PipelineHandle};
use crate::hash::{Hashed, xxh_key};
use crate::shader::GFX_STAGE_COUNT;

/// Primitive topology of a draw; graphics pipeline tables are bucketed per
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
    LineListAdjacency,
    LineStripAdjacency,
    TriangleListAdjacency,
    TriangleStripAdjacency,
    PatchList,
}

impl PrimitiveTopology {
    pub const COUNT: usize = 11;

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graphics pipelines
// ─────────────────────────────────────────────────────────────────────────────

/// The hashed identity prefix of a graphics pipeline.
///
/// Equality and hashing cover exactly these fields; anything else the
/// front-end tracks alongside them is bookkeeping and never affects lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GfxPipelineIdentity {
    pub modules: [ModuleHandle; GFX_STAGE_COUNT],
    pub vertex_layout_id: u32,
    pub blend_id: u32,
    pub depth_stencil_id: u32,
    pub rasterizer_id: u32,
    pub sample_count: u8,
    pub patch_vertices: u8,
}

/// Mutable graphics pipeline state with a memoized identity hash.
#[derive(Debug, Clone)]
pub struct GfxPipelineState {
    ident: GfxPipelineIdentity,
    hash: u64,
    dirty: bool,
}

impl Default for GfxPipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl GfxPipelineState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ident: GfxPipelineIdentity::default(),
            hash: 0,
            dirty: true,
        }
    }

    #[must_use]
    pub fn ident(&self) -> &GfxPipelineIdentity {
        &self.ident
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Forces a rehash on the next lookup (module set changed, program
    /// switched).
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    pub fn set_vertex_layout_id(&mut self, id: u32) {
        if self.ident.vertex_layout_id != id {
            self.ident.vertex_layout_id = id;
            self.dirty = true;
        }
    }

    pub fn set_blend_id(&mut self, id: u32) {
        if self.ident.blend_id != id {
            self.ident.blend_id = id;
            self.dirty = true;
        }
    }

    pub fn set_depth_stencil_id(&mut self, id: u32) {
        if self.ident.depth_stencil_id != id {
            self.ident.depth_stencil_id = id;
            self.dirty = true;
        }
    }

    pub fn set_rasterizer_id(&mut self, id: u32) {
        if self.ident.rasterizer_id != id {
            self.ident.rasterizer_id = id;
            self.dirty = true;
        }
    }

    pub fn set_sample_count(&mut self, count: u8) {
        if self.ident.sample_count != count {
            self.ident.sample_count = count;
            self.dirty = true;
        }
    }

    pub fn set_patch_vertices(&mut self, vertices: u8) {
        if self.ident.patch_vertices != vertices {
            self.ident.patch_vertices = vertices;
            self.dirty = true;
        }
    }

    /// Snapshots the program's current module handles and rehashes, if
    /// dirty.
    pub(crate) fn refresh(&mut self, modules: [ModuleHandle; GFX_STAGE_COUNT]) {
        if self.dirty || self.ident.modules != modules {
            self.ident.modules = modules;
            self.hash = xxh_key(&self.ident);
            self.dirty = false;
        }
    }

    /// The identity under its memoized hash, for table lookup.
    #[must_use]
    pub(crate) fn hashed(&self) -> Hashed<GfxPipelineIdentity> {
        debug_assert!(!self.dirty);
        Hashed::precomputed(self.ident, self.hash)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compute pipelines
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a compute pipeline: the module, plus the workgroup size when
/// the module's size is dispatch-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComputePipelineIdentity {
    pub module: ModuleHandle,
    pub local_size: Option<[u32; 3]>,
}

/// Mutable compute pipeline state with a memoized identity hash.
#[derive(Debug, Clone)]
pub struct ComputePipelineState {
    ident: ComputePipelineIdentity,
    hash: u64,
    dirty: bool,
    use_local_size: bool,
}

impl Default for ComputePipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputePipelineState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ident: ComputePipelineIdentity::default(),
            hash: 0,
            dirty: true,
            use_local_size: false,
        }
    }

    #[must_use]
    pub fn ident(&self) -> &ComputePipelineIdentity {
        &self.ident
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Whether dispatch block dimensions are part of this pipeline's
    /// identity (module declares no fixed workgroup size).
    pub fn set_use_local_size(&mut self, use_local_size: bool) {
        if self.use_local_size != use_local_size {
            self.use_local_size = use_local_size;
            self.dirty = true;
        }
    }

    /// Refreshes the local-size identity from a dispatch's block dimensions.
    pub fn update_local_size(&mut self, block: [u32; 3]) {
        let next = self.use_local_size.then_some(block);
        if self.ident.local_size != next {
            self.ident.local_size = next;
            self.dirty = true;
        }
    }

    pub(crate) fn refresh(&mut self, module: ModuleHandle) {
        if self.dirty || self.ident.module != module {
            self.ident.module = module;
            self.hash = xxh_key(&self.ident);
            self.dirty = false;
        }
    }

    #[must_use]
    pub(crate) fn hashed(&self) -> Hashed<ComputePipelineIdentity> {
        debug_assert!(!self.dirty);
        Hashed::precomputed(self.ident, self.hash)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cached pipeline objects
// ─────────────────────────────────────────────────────────────────────────────

/// A baked pipeline; destroys its native handle on drop.
pub(crate) struct Pipeline {
    handle: PipelineHandle,
    device: Rc<dyn GpuDevice>,
}

impl Pipeline {
    pub(crate) fn new(handle: PipelineHandle, device: Rc<dyn GpuDevice>) -> Self {
        Self { handle, device }
    }

    #[must_use]
    pub(crate) fn handle(&self) -> PipelineHandle {
        self.handle
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}
