//! Device Collaborator Surface
//!
//! The cache never talks to a GPU API directly. Native object creation and
//! destruction go through the [`GpuDevice`] trait, and shader-module
//! compilation through [`ShaderCompiler`]. Handles returned by the device are
//! opaque newtypes; the cache only stores, compares, and hands them back.

use crate::descriptor::DescriptorType;
use crate::error::Result;
use crate::pipeline::{GfxPipelineIdentity, PrimitiveTopology};
use crate::shader::{ShaderInfo, SpecKey, StageMask};
use crate::slot_map::SlotMap;

// ─────────────────────────────────────────────────────────────────────────────
// Opaque handles
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// The reserved "no object" handle.
            pub const NULL: Self = Self(0);

            #[must_use]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

opaque_handle!(
    /// A compiled shader module owned by the device.
    ModuleHandle
);
opaque_handle!(
    /// A baked pipeline object.
    PipelineHandle
);
opaque_handle!(
    /// An aggregate pipeline layout.
    PipelineLayoutHandle
);
opaque_handle!(
    /// A descriptor set layout.
    SetLayoutHandle
);
opaque_handle!(
    /// A native descriptor pool.
    PoolHandle
);
opaque_handle!(
    /// A descriptor set allocated from a pool.
    SetHandle
);
opaque_handle!(
    /// Identity of a buffer or image bound through a descriptor slot.
    ResourceId
);

// ─────────────────────────────────────────────────────────────────────────────
// Creation descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// One binding slot within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    /// Array size of the binding (number of descriptors).
    pub count: u32,
    pub stages: StageMask,
    pub ty: DescriptorType,
}

/// Per-type capacity request for a native descriptor pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSize {
    pub ty: DescriptorType,
    pub count: u32,
}

/// Everything the device needs to bake a graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct GfxPipelineDescriptor {
    pub ident: GfxPipelineIdentity,
    pub topology: PrimitiveTopology,
    pub layout: PipelineLayoutHandle,
}

/// Everything the device needs to bake a compute pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDescriptor {
    pub module: ModuleHandle,
    /// Workgroup size baked into the pipeline, when the module's size is
    /// dispatch-dependent.
    pub local_size: Option<[u32; 3]>,
    pub layout: PipelineLayoutHandle,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator traits
// ─────────────────────────────────────────────────────────────────────────────

/// Native object creation and destruction.
///
/// Destruction is infallible: the cache calls it from `Drop` impls, in the
/// reverse order objects were created.
pub trait GpuDevice {
    fn create_pipeline(&self, desc: &GfxPipelineDescriptor) -> Result<PipelineHandle>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_pipeline_layout(&self, set_layouts: &[SetLayoutHandle])
    -> Result<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);

    fn create_descriptor_layout(&self, bindings: &[LayoutBinding]) -> Result<SetLayoutHandle>;
    fn destroy_descriptor_layout(&self, layout: SetLayoutHandle);

    fn create_descriptor_pool(&self, sizes: &[PoolSize], max_sets: u32) -> Result<PoolHandle>;
    fn destroy_descriptor_pool(&self, pool: PoolHandle);

    /// Allocates `count` sets of `layout` from `pool` in one call.
    fn allocate_descriptor_sets(
        &self,
        pool: PoolHandle,
        layout: SetLayoutHandle,
        count: u32,
    ) -> Result<Vec<SetHandle>>;

    fn destroy_shader_module(&self, module: ModuleHandle);
}

/// Shader-module compilation.
///
/// The compiler may assign interface slots through `slot_map`; graphics
/// stages of one program are always compiled against the same map, in
/// pipeline order, so downstream stages see upstream assignments. Compute
/// modules compile without a map.
pub trait ShaderCompiler {
    fn compile(
        &self,
        shader: &ShaderInfo,
        key: &SpecKey,
        slot_map: Option<&mut SlotMap>,
    ) -> Result<ModuleHandle>;
}
