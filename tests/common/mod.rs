//! Shared mock collaborators for the integration tests: a counting device,
//! a compiler that performs real slot-map assignment, and a batch host that
//! can retire flushed batches immediately.
#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use vitric::{
    Batch, BatchHost, BindingSlot, BuiltinOutputs, CacheError, ComputePipelineDescriptor,
    DescriptorType, GfxPipelineDescriptor, GpuDevice, LayoutBinding, ModuleHandle,
    PipelineHandle, PipelineLayoutHandle, PoolHandle, PoolSize, Result, SetHandle,
    SetLayoutHandle, ShaderCompiler, ShaderInfo, SlotMap, SpecKey, Stage, StateCache,
    UserOutput, VAR0,
};

// ─────────────────────────────────────────────────────────────────────────────
// Mock device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockDevice {
    next_handle: Cell<u64>,
    pub pipelines_created: Cell<u32>,
    pub pipelines_destroyed: Cell<u32>,
    pub pipeline_layouts_created: Cell<u32>,
    pub pipeline_layouts_destroyed: Cell<u32>,
    pub set_layouts_created: Cell<u32>,
    pub set_layouts_destroyed: Cell<u32>,
    pub pools_created: Cell<u32>,
    pub pools_destroyed: Cell<u32>,
    pub set_allocations: Cell<u32>,
    pub sets_allocated: Cell<u32>,
    pub modules_destroyed: Cell<u32>,
    pub fail_pipeline: Cell<bool>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            next_handle: Cell::new(1),
            ..Self::default()
        }
    }

    fn next(&self) -> u64 {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        handle
    }
}

impl GpuDevice for MockDevice {
    fn create_pipeline(&self, _desc: &GfxPipelineDescriptor) -> Result<PipelineHandle> {
        if self.fail_pipeline.get() {
            return Err(CacheError::DeviceObject("pipeline"));
        }
        self.pipelines_created.set(self.pipelines_created.get() + 1);
        Ok(PipelineHandle(self.next()))
    }

    fn create_compute_pipeline(&self, _desc: &ComputePipelineDescriptor) -> Result<PipelineHandle> {
        if self.fail_pipeline.get() {
            return Err(CacheError::DeviceObject("compute pipeline"));
        }
        self.pipelines_created.set(self.pipelines_created.get() + 1);
        Ok(PipelineHandle(self.next()))
    }

    fn destroy_pipeline(&self, _pipeline: PipelineHandle) {
        self.pipelines_destroyed.set(self.pipelines_destroyed.get() + 1);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[SetLayoutHandle],
    ) -> Result<PipelineLayoutHandle> {
        self.pipeline_layouts_created
            .set(self.pipeline_layouts_created.get() + 1);
        Ok(PipelineLayoutHandle(self.next()))
    }

    fn destroy_pipeline_layout(&self, _layout: PipelineLayoutHandle) {
        self.pipeline_layouts_destroyed
            .set(self.pipeline_layouts_destroyed.get() + 1);
    }

    fn create_descriptor_layout(&self, _bindings: &[LayoutBinding]) -> Result<SetLayoutHandle> {
        self.set_layouts_created.set(self.set_layouts_created.get() + 1);
        Ok(SetLayoutHandle(self.next()))
    }

    fn destroy_descriptor_layout(&self, _layout: SetLayoutHandle) {
        self.set_layouts_destroyed
            .set(self.set_layouts_destroyed.get() + 1);
    }

    fn create_descriptor_pool(&self, _sizes: &[PoolSize], _max_sets: u32) -> Result<PoolHandle> {
        self.pools_created.set(self.pools_created.get() + 1);
        Ok(PoolHandle(self.next()))
    }

    fn destroy_descriptor_pool(&self, _pool: PoolHandle) {
        self.pools_destroyed.set(self.pools_destroyed.get() + 1);
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: PoolHandle,
        _layout: SetLayoutHandle,
        count: u32,
    ) -> Result<Vec<SetHandle>> {
        self.set_allocations.set(self.set_allocations.get() + 1);
        self.sets_allocated.set(self.sets_allocated.get() + count);
        Ok((0..count).map(|_| SetHandle(self.next())).collect())
    }

    fn destroy_shader_module(&self, _module: ModuleHandle) {
        self.modules_destroyed.set(self.modules_destroyed.get() + 1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock compiler
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockCompiler {
    next_handle: Cell<u64>,
    pub compiles: Cell<u32>,
    pub fail_stage: Cell<Option<Stage>>,
}

impl MockCompiler {
    pub fn new() -> Self {
        Self {
            next_handle: Cell::new(1),
            ..Self::default()
        }
    }
}

impl ShaderCompiler for MockCompiler {
    fn compile(
        &self,
        shader: &ShaderInfo,
        _key: &SpecKey,
        slot_map: Option<&mut SlotMap>,
    ) -> Result<ModuleHandle> {
        if self.fail_stage.get() == Some(shader.stage) {
            return Err(CacheError::Compile {
                stage: shader.stage,
            });
        }
        if let Some(map) = slot_map {
            let slotted = shader.builtin_outputs - BuiltinOutputs::NO_SLOT;
            for bit in 0..VAR0 {
                if slotted.bits() & (1 << bit) != 0 && map.assign(bit, 1).is_none() {
                    return Err(CacheError::Compile {
                        stage: shader.stage,
                    });
                }
            }
            for out in &shader.user_outputs {
                if map.assign(out.slot(), out.vec4_slots).is_none() {
                    return Err(CacheError::Compile {
                        stage: shader.stage,
                    });
                }
            }
        }
        self.compiles.set(self.compiles.get() + 1);
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        Ok(ModuleHandle(handle))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock batch host
// ─────────────────────────────────────────────────────────────────────────────

pub struct MockHost {
    next_id: u64,
    pub flushes: u32,
    pub in_flight: Vec<Batch>,
    pub retire_on_flush: bool,
}

impl MockHost {
    pub fn new(retire_on_flush: bool) -> Self {
        Self {
            next_id: 1,
            flushes: 0,
            in_flight: Vec::new(),
            retire_on_flush,
        }
    }

    /// Drops every submitted batch, as if all its work completed.
    pub fn retire_all(&mut self) {
        self.in_flight.clear();
    }
}

impl BatchHost for MockHost {
    fn flush_batch(&mut self, batch: &mut Batch) {
        self.flushes += 1;
        self.next_id += 1;
        let submitted = std::mem::replace(batch, Batch::new(self.next_id));
        if self.retire_on_flush {
            drop(submitted);
        } else {
            self.in_flight.push(submitted);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rig & shader builders
// ─────────────────────────────────────────────────────────────────────────────

pub fn rig() -> (Rc<MockDevice>, Rc<MockCompiler>, StateCache) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Rc::new(MockDevice::new());
    let compiler = Rc::new(MockCompiler::new());
    let cache = StateCache::new(device.clone(), compiler.clone());
    (device, compiler, cache)
}

pub fn vs(id: u32) -> Rc<ShaderInfo> {
    let mut info = ShaderInfo::new(Stage::Vertex, id);
    info.builtin_outputs = BuiltinOutputs::POSITION;
    info.user_outputs.push(UserOutput {
        location: 0,
        vec4_slots: 1,
    });
    Rc::new(info)
}

pub fn vs_with_ubo(id: u32) -> Rc<ShaderInfo> {
    let mut info = ShaderInfo::new(Stage::Vertex, id);
    info.builtin_outputs = BuiltinOutputs::POSITION;
    info.user_outputs.push(UserOutput {
        location: 0,
        vec4_slots: 1,
    });
    info.bindings[DescriptorType::UniformBuffer.index()].push(BindingSlot {
        binding: 0,
        count: 1,
    });
    Rc::new(info)
}

pub fn fs(id: u32) -> Rc<ShaderInfo> {
    Rc::new(ShaderInfo::new(Stage::Fragment, id))
}

/// A producing stage with explicit user outputs, each `(location, vec4_slots)`.
pub fn producer(stage: Stage, id: u32, outputs: &[(u8, u8)]) -> Rc<ShaderInfo> {
    let mut info = ShaderInfo::new(stage, id);
    info.builtin_outputs = BuiltinOutputs::POSITION;
    for &(location, vec4_slots) in outputs {
        info.user_outputs.push(UserOutput {
            location,
            vec4_slots,
        });
    }
    Rc::new(info)
}

pub fn cs(id: u32) -> Rc<ShaderInfo> {
    Rc::new(ShaderInfo::new(Stage::Compute, id))
}

pub fn cs_with_ssbo(id: u32) -> Rc<ShaderInfo> {
    let mut info = ShaderInfo::new(Stage::Compute, id);
    info.bindings[DescriptorType::StorageBuffer.index()].push(BindingSlot {
        binding: 0,
        count: 1,
    });
    Rc::new(info)
}
