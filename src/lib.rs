//! Runtime pipeline-object and descriptor-set cache for a GL-on-Vulkan style
//! driver core.
//!
//! [`StateCache`] is the entry point: bind shader stages, keep draw state
//! current, and ask for pipelines and descriptor sets. Native object creation
//! goes through the [`GpuDevice`] and [`ShaderCompiler`] collaborator traits;
//! batch lifetime flows through [`Batch`] and [`BatchHost`].

pub mod batch;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hash;
pub mod module_cache;
pub mod pipeline;
pub mod program;
pub mod shader;
pub mod slot_map;

pub use batch::{Batch, BatchHost, ProgramRef};
pub use context::StateCache;
pub use descriptor::{
    DESCRIPTOR_TYPE_COUNT, DescriptorSet, DescriptorStateKey, DescriptorType, POOL_CAPACITY,
};
pub use device::{
    ComputePipelineDescriptor, GfxPipelineDescriptor, GpuDevice, LayoutBinding, ModuleHandle,
    PipelineHandle, PipelineLayoutHandle, PoolHandle, PoolSize, ResourceId, SetHandle,
    SetLayoutHandle, ShaderCompiler,
};
pub use error::{CacheError, Result};
pub use module_cache::{ModuleKey, ShaderModule, ShaderModuleCache};
pub use pipeline::{
    ComputePipelineIdentity, ComputePipelineState, GfxPipelineIdentity, GfxPipelineState,
    PrimitiveTopology,
};
pub use program::{ComputeProgram, GfxProgram};
pub use shader::{
    BindingSlot, BuiltinOutputs, DrawKeyContext, FsKey, GFX_STAGE_COUNT, GFX_STAGES, GfxStages,
    ShaderInfo, SpecKey, Stage, StageMask, TcsKey, UserOutput, VsKey,
};
pub use slot_map::{SLOT_CAPACITY, SlotMap, SlotMapPlan, VAR0};
