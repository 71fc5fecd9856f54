//! Descriptor Set Pools & Allocation
//!
//! Each program owns one pool per descriptor type. Allocation is keyed by the
//! binding-epoch state of the stages using the type, so a draw whose bindings
//! are unchanged gets its previous set back without touching the device.
//!
//! The allocator works through tiers, cheapest first: the last returned set,
//! the in-use table, the recyclable table, the pre-allocated array, a bounded
//! repurpose scan over recyclable sets no batch references, and finally a
//! fresh native bucket sized by capped geometric growth. When the pool is at
//! capacity the caller flushes the active batch and retries once.
//!
//! Sets are `Rc`-shared: batches clone the `Rc` and bump a batch refcount,
//! so a set (and the native pool behind it, held through `PoolBacking`)
//! outlives a destroyed program until the last referencing batch retires.

use std::cell::{Cell, RefCell};
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::batch::Batch;
use crate::device::{
    GpuDevice, LayoutBinding, PoolHandle, PoolSize, ResourceId, SetHandle, SetLayoutHandle,
};
use crate::error::{CacheError, Result};
use crate::hash::Hashed;
use crate::shader::{GFX_STAGE_COUNT, ShaderInfo, StageMask};

/// Number of descriptor types the cache manages.
pub const DESCRIPTOR_TYPE_COUNT: usize = 4;

/// Maximum sets a per-type pool will allocate before forcing a flush.
pub const POOL_CAPACITY: usize = 1024;

/// Geometric growth factor for native bucket allocation.
const BUCKET_FACTOR: usize = 10;

/// Probe bound for the repurpose scan over the recyclable table.
const REPURPOSE_PROBE_BOUND: usize = 100;

/// The descriptor types, one pool each per program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    SampledImage,
    StorageBuffer,
    StorageImage,
}

impl DescriptorType {
    pub const ALL: [Self; DESCRIPTOR_TYPE_COUNT] = [
        Self::UniformBuffer,
        Self::SampledImage,
        Self::StorageBuffer,
        Self::StorageImage,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State keys
// ─────────────────────────────────────────────────────────────────────────────

/// Binding-epoch snapshot a set was stamped with.
///
/// Graphics keys carry one epoch per stage that has bindings of the type;
/// stages without bindings stay `None` and are excluded from the hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorStateKey {
    Compute(u32),
    Gfx([Option<u32>; GFX_STAGE_COUNT]),
}

impl Hash for DescriptorStateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Compute(epoch) => state.write_u32(*epoch),
            Self::Gfx(epochs) => {
                for (stage, epoch) in epochs.iter().enumerate() {
                    if let Some(epoch) = epoch {
                        state.write_u8(stage as u8);
                        state.write_u32(*epoch);
                    }
                }
            }
        }
    }
}

impl DescriptorStateKey {
    fn unstamped() -> Self {
        Self::Gfx([None; GFX_STAGE_COUNT])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native object wrappers
// ─────────────────────────────────────────────────────────────────────────────

/// A descriptor set layout; destroys its native handle on last drop.
pub(crate) struct SetLayout {
    handle: SetLayoutHandle,
    device: Rc<dyn GpuDevice>,
}

impl SetLayout {
    pub(crate) fn new(handle: SetLayoutHandle, device: Rc<dyn GpuDevice>) -> Self {
        Self { handle, device }
    }

    pub(crate) fn handle(&self) -> SetLayoutHandle {
        self.handle
    }
}

impl Drop for SetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_layout(self.handle);
    }
}

/// A native descriptor pool. Sets hold an `Rc` to their backing, so the
/// native pool survives program destruction while any set is alive.
pub(crate) struct PoolBacking {
    handle: PoolHandle,
    device: Rc<dyn GpuDevice>,
}

impl PoolBacking {
    pub(crate) fn new(handle: PoolHandle, device: Rc<dyn GpuDevice>) -> Self {
        Self { handle, device }
    }

    pub(crate) fn handle(&self) -> PoolHandle {
        self.handle
    }

    pub(crate) fn device(&self) -> &Rc<dyn GpuDevice> {
        &self.device
    }
}

impl Drop for PoolBacking {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.handle);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor sets
// ─────────────────────────────────────────────────────────────────────────────

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetState {
    Unused,
    InUse,
    Recycled,
}

/// A pooled descriptor set.
///
/// Contract: the resource slots match the stamped key unless
/// [`is_invalid`](Self::is_invalid) returns true, in which case the caller
/// must rewrite the bindings and [`mark_valid`](Self::mark_valid) before use.
pub struct DescriptorSet {
    id: u64,
    ty: DescriptorType,
    handle: SetHandle,
    backing: Rc<PoolBacking>,
    pool: Weak<RefCell<DescriptorPool>>,
    key: RefCell<DescriptorStateKey>,
    hash: Cell<u64>,
    invalid: Cell<bool>,
    state: Cell<SetState>,
    batch_refs: Cell<u32>,
    resources: RefCell<Box<[Option<ResourceId>]>>,
}

impl DescriptorSet {
    fn new(
        ty: DescriptorType,
        handle: SetHandle,
        backing: Rc<PoolBacking>,
        pool: Weak<RefCell<DescriptorPool>>,
        num_resources: usize,
    ) -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            ty,
            handle,
            backing,
            pool,
            key: RefCell::new(DescriptorStateKey::unstamped()),
            hash: Cell::new(0),
            invalid: Cell::new(true),
            state: Cell::new(SetState::Unused),
            batch_refs: Cell::new(0),
            resources: RefCell::new(vec![None; num_resources].into_boxed_slice()),
        }
    }

    /// The shared set for pools with no descriptors; always valid, never
    /// recycled.
    fn new_null(ty: DescriptorType, handle: SetHandle, backing: Rc<PoolBacking>) -> Self {
        let set = Self::new(ty, handle, backing, Weak::new(), 0);
        set.invalid.set(false);
        set.state.set(SetState::InUse);
        set
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn ty(&self) -> DescriptorType {
        self.ty
    }

    #[must_use]
    pub fn handle(&self) -> SetHandle {
        self.handle
    }

    /// True when the native set's contents do not match the stamped key.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.invalid.get()
    }

    /// Marks the bindings written; the next keyed hit counts as a cache hit.
    pub fn mark_valid(&self) {
        self.invalid.set(false);
    }

    /// Number of batches currently referencing this set.
    #[must_use]
    pub fn batch_refs(&self) -> u32 {
        self.batch_refs.get()
    }

    #[must_use]
    pub fn resource(&self, index: usize) -> Option<ResourceId> {
        self.resources.borrow().get(index).copied().flatten()
    }

    /// Records the identity of the resource written to slot `index`.
    pub fn write_resource(&self, index: usize, resource: Option<ResourceId>) {
        if let Some(slot) = self.resources.borrow_mut().get_mut(index) {
            *slot = resource;
        }
    }

    pub(crate) fn acquire_batch_ref(&self) {
        self.batch_refs.set(self.batch_refs.get() + 1);
    }

    pub(crate) fn release_batch_ref(&self) {
        debug_assert!(self.batch_refs.get() > 0);
        self.batch_refs.set(self.batch_refs.get().saturating_sub(1));
    }

    pub(crate) fn pool(&self) -> &Weak<RefCell<DescriptorPool>> {
        &self.pool
    }

    fn clear_resources(&self) {
        self.resources.borrow_mut().fill(None);
        self.invalid.set(true);
    }

    fn stamped_key(&self) -> Hashed<DescriptorStateKey> {
        Hashed::precomputed(self.key.borrow().clone(), self.hash.get())
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("handle", &self.handle)
            .field("invalid", &self.invalid.get())
            .field("batch_refs", &self.batch_refs.get())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-type pools
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one allocation attempt against a pool.
pub(crate) enum AllocOutcome {
    Ready {
        set: Rc<DescriptorSet>,
        cache_hit: bool,
    },
    /// Pool at capacity with nothing repurposable; flush the active batch
    /// and retry.
    NeedsFlush,
}

/// One descriptor type's pool for one program.
pub(crate) struct DescriptorPool {
    ty: DescriptorType,
    layout: Option<Rc<SetLayout>>,
    backing: Option<Rc<PoolBacking>>,
    /// Bindings of this type across the program's stages; 0 marks a
    /// typeless pool served by the shared null set.
    num_descriptors: usize,
    /// Total descriptors (binding array sizes summed) per set.
    num_resources: usize,
    in_use: FxHashMap<Hashed<DescriptorStateKey>, Rc<DescriptorSet>>,
    recyclable: FxHashMap<Hashed<DescriptorStateKey>, Rc<DescriptorSet>>,
    unused: Vec<Rc<DescriptorSet>>,
    last_set: Option<Rc<DescriptorSet>>,
    allocated: usize,
}

impl DescriptorPool {
    fn typed(
        ty: DescriptorType,
        layout: Rc<SetLayout>,
        backing: Rc<PoolBacking>,
        num_descriptors: usize,
        num_resources: usize,
    ) -> Self {
        Self {
            ty,
            layout: Some(layout),
            backing: Some(backing),
            num_descriptors,
            num_resources,
            in_use: FxHashMap::default(),
            recyclable: FxHashMap::default(),
            unused: Vec::new(),
            last_set: None,
            allocated: 0,
        }
    }

    fn typeless(ty: DescriptorType) -> Self {
        Self {
            ty,
            layout: None,
            backing: None,
            num_descriptors: 0,
            num_resources: 0,
            in_use: FxHashMap::default(),
            recyclable: FxHashMap::default(),
            unused: Vec::new(),
            last_set: None,
            allocated: 0,
        }
    }

    fn last_set(&self) -> Option<Rc<DescriptorSet>> {
        self.last_set.clone()
    }

    fn set_last_set(&mut self, set: Rc<DescriptorSet>) {
        self.last_set = Some(set);
    }

    /// One allocation attempt; never flushes on its own.
    fn allocate(
        &mut self,
        self_ref: &Weak<RefCell<DescriptorPool>>,
        key: DescriptorStateKey,
        batch: &mut Batch,
    ) -> Result<AllocOutcome> {
        debug_assert!(self.num_descriptors > 0);
        let hashed = Hashed::new(key);

        // Tier 1: the set handed out last time.
        if let Some(last) = self.last_set() {
            if last.hash.get() == hashed.hash_value() && *last.key.borrow() == *hashed.key() {
                self.recyclable.remove(&hashed);
                let cache_hit = !last.is_invalid();
                return Ok(self.commit(last, hashed, cache_hit, batch));
            }
        }

        // Tier 2: already in use under this key.
        if let Some(set) = self.in_use.get(&hashed).cloned() {
            let cache_hit = !set.is_invalid();
            return Ok(self.finish(set, cache_hit, batch));
        }

        // Tier 3: recycled under this key; promote back to in-use.
        if let Some(set) = self.recyclable.remove(&hashed) {
            let cache_hit = !set.is_invalid();
            return Ok(self.commit(set, hashed, cache_hit, batch));
        }

        // Tier 4: pre-allocated spare.
        if let Some(set) = self.unused.pop() {
            debug_assert_eq!(set.state.get(), SetState::Unused);
            return Ok(self.commit(set, hashed, false, batch));
        }

        // Tier 5: repurpose a recyclable set no batch still references.
        if let Some(set) = self.take_repurposable() {
            set.clear_resources();
            return Ok(self.commit(set, hashed, false, batch));
        }

        if self.allocated >= POOL_CAPACITY {
            return Ok(AllocOutcome::NeedsFlush);
        }

        // Tier 6: grow a fresh bucket.
        let set = self.grow(self_ref)?;
        Ok(self.commit(set, hashed, false, batch))
    }

    /// Stamps `hashed` onto `set` and files it as in-use.
    fn commit(
        &mut self,
        set: Rc<DescriptorSet>,
        hashed: Hashed<DescriptorStateKey>,
        cache_hit: bool,
        batch: &mut Batch,
    ) -> AllocOutcome {
        set.hash.set(hashed.hash_value());
        *set.key.borrow_mut() = hashed.key().clone();
        set.state.set(SetState::InUse);
        if let Some(prev) = self.in_use.insert(hashed, set.clone()) {
            debug_assert!(Rc::ptr_eq(&prev, &set));
        }
        self.finish(set, cache_hit, batch)
    }

    /// Registers `set` with the batch and the last-set fast path.
    fn finish(
        &mut self,
        set: Rc<DescriptorSet>,
        cache_hit: bool,
        batch: &mut Batch,
    ) -> AllocOutcome {
        batch.add_desc_set(&set, self.num_descriptors);
        self.last_set = Some(set.clone());
        AllocOutcome::Ready { set, cache_hit }
    }

    /// Bounded scan for a recyclable set with no batch references. Invalid
    /// sets go first; past the probe bound any free set will do.
    fn take_repurposable(&mut self) -> Option<Rc<DescriptorSet>> {
        let mut chosen = None;
        for (probes, (key, set)) in self.recyclable.iter().enumerate() {
            if set.batch_refs.get() != 0 {
                continue;
            }
            if set.is_invalid() || probes >= REPURPOSE_PROBE_BOUND {
                chosen = Some(key.clone());
                break;
            }
        }
        let set = self.recyclable.remove(&chosen?)?;
        debug_assert_eq!(set.state.get(), SetState::Recycled);
        Some(set)
    }

    /// Allocates a native bucket: largest power of [`BUCKET_FACTOR`] below
    /// current demand, capped by remaining capacity. Keeps one set, stashes
    /// the rest.
    fn grow(&mut self, self_ref: &Weak<RefCell<DescriptorPool>>) -> Result<Rc<DescriptorSet>> {
        let demand = self.in_use.len() + self.recyclable.len() + 1;
        let mut bucket = BUCKET_FACTOR;
        let mut factor = BUCKET_FACTOR;
        while factor < demand {
            bucket = factor;
            factor *= BUCKET_FACTOR;
        }
        bucket = bucket.min(POOL_CAPACITY - self.allocated);

        let layout = self
            .layout
            .clone()
            .ok_or(CacheError::DeviceObject("descriptor set layout"))?;
        let backing = self
            .backing
            .clone()
            .ok_or(CacheError::DeviceObject("descriptor pool"))?;
        let handles =
            backing
                .device()
                .allocate_descriptor_sets(backing.handle(), layout.handle(), bucket as u32)?;
        self.allocated += handles.len();
        debug!(
            "descriptor pool grow: {:?} +{} sets, {} allocated",
            self.ty,
            handles.len(),
            self.allocated
        );

        let mut first = None;
        for handle in handles {
            let set = Rc::new(DescriptorSet::new(
                self.ty,
                handle,
                backing.clone(),
                self_ref.clone(),
                self.num_resources,
            ));
            if first.is_none() {
                first = Some(set);
            } else {
                self.unused.push(set);
            }
        }
        first.ok_or(CacheError::DeviceObject("descriptor set bucket"))
    }

    /// Moves `set` from in-use to recyclable once no batch references it.
    ///
    /// No-op while other in-flight batches still hold the set, when another
    /// set has since taken over its key, and for null sets.
    pub(crate) fn recycle(&mut self, set: &Rc<DescriptorSet>) {
        if set.batch_refs.get() != 0 || self.num_descriptors == 0 {
            return;
        }
        // Only in-use sets transition; spares and already-recycled sets
        // stay where they are.
        if set.state.get() != SetState::InUse {
            return;
        }
        let hashed = set.stamped_key();
        let matches = self
            .in_use
            .get(&hashed)
            .is_some_and(|current| Rc::ptr_eq(current, set));
        if matches {
            if let Some(set) = self.in_use.remove(&hashed) {
                set.state.set(SetState::Recycled);
                self.recyclable.insert(hashed, set);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-program descriptor machinery
// ─────────────────────────────────────────────────────────────────────────────

/// The shared objects behind typeless pools, created lazily on first
/// allocation and destroyed exactly once.
#[derive(Clone)]
pub(crate) struct NullAlloc {
    #[allow(dead_code)]
    layout: Rc<SetLayout>,
    #[allow(dead_code)]
    backing: Rc<PoolBacking>,
    set: Rc<DescriptorSet>,
}

/// A program's descriptor layouts, pools, and tables: one pool per type.
///
/// Field order matters for teardown: tables and pools drop before the null
/// objects.
pub(crate) struct ProgramDescriptors {
    num_descriptors: [usize; DESCRIPTOR_TYPE_COUNT],
    pools: [Rc<RefCell<DescriptorPool>>; DESCRIPTOR_TYPE_COUNT],
    null_alloc: RefCell<Option<NullAlloc>>,
    device: Rc<dyn GpuDevice>,
}

impl ProgramDescriptors {
    /// Builds layouts and pools from the union of the stages' bindings.
    /// Returns the per-type set layout handles (typeless types excluded) in
    /// type order, for pipeline layout creation.
    pub(crate) fn build(
        device: &Rc<dyn GpuDevice>,
        shaders: &[&ShaderInfo],
    ) -> Result<(Self, SmallVec<[SetLayoutHandle; DESCRIPTOR_TYPE_COUNT]>)> {
        let mut num_descriptors = [0usize; DESCRIPTOR_TYPE_COUNT];
        let mut num_resources = [0usize; DESCRIPTOR_TYPE_COUNT];
        let mut bindings: [SmallVec<[LayoutBinding; 8]>; DESCRIPTOR_TYPE_COUNT] =
            Default::default();
        for shader in shaders {
            for (i, ty) in DescriptorType::ALL.iter().enumerate() {
                for slot in &shader.bindings[i] {
                    bindings[i].push(LayoutBinding {
                        binding: slot.binding,
                        count: slot.count,
                        stages: shader.stage.mask(),
                        ty: *ty,
                    });
                    num_descriptors[i] += 1;
                    num_resources[i] += slot.count as usize;
                }
            }
        }

        let mut set_layouts = SmallVec::new();
        let mut pools: SmallVec<[Rc<RefCell<DescriptorPool>>; DESCRIPTOR_TYPE_COUNT]> =
            SmallVec::new();
        for (i, ty) in DescriptorType::ALL.iter().enumerate() {
            if num_descriptors[i] == 0 {
                pools.push(Rc::new(RefCell::new(DescriptorPool::typeless(*ty))));
                continue;
            }
            let layout_handle = device.create_descriptor_layout(&bindings[i])?;
            let layout = Rc::new(SetLayout::new(layout_handle, device.clone()));
            let pool_handle = device.create_descriptor_pool(
                &[PoolSize {
                    ty: *ty,
                    count: (num_resources[i] * POOL_CAPACITY) as u32,
                }],
                POOL_CAPACITY as u32,
            )?;
            let backing = Rc::new(PoolBacking::new(pool_handle, device.clone()));
            set_layouts.push(layout_handle);
            pools.push(Rc::new(RefCell::new(DescriptorPool::typed(
                *ty,
                layout,
                backing,
                num_descriptors[i],
                num_resources[i],
            ))));
        }
        let pools: [Rc<RefCell<DescriptorPool>>; DESCRIPTOR_TYPE_COUNT] = pools
            .into_inner()
            .map_err(|_| CacheError::DeviceObject("descriptor pool table"))?;

        Ok((
            Self {
                num_descriptors,
                pools,
                null_alloc: RefCell::new(None),
                device: device.clone(),
            },
            set_layouts,
        ))
    }

    pub(crate) fn descriptor_count(&self, ty: DescriptorType) -> usize {
        self.num_descriptors[ty.index()]
    }

    /// One allocation attempt; [`AllocOutcome::NeedsFlush`] asks the caller
    /// to flush the active batch and retry.
    pub(crate) fn allocate(
        &self,
        ty: DescriptorType,
        key: DescriptorStateKey,
        batch: &mut Batch,
    ) -> Result<AllocOutcome> {
        let i = ty.index();
        if self.num_descriptors[i] == 0 {
            return self.allocate_null(ty, batch);
        }
        let pool = &self.pools[i];
        let weak = Rc::downgrade(pool);
        pool.borrow_mut().allocate(&weak, key, batch)
    }

    /// Hands out the shared null set for a typeless type, materializing the
    /// null layout/pool/set on first use and priming the last-set fast path
    /// of every typeless pool at once.
    fn allocate_null(&self, ty: DescriptorType, batch: &mut Batch) -> Result<AllocOutcome> {
        {
            let mut pool = self.pools[ty.index()].borrow_mut();
            if let Some(last) = pool.last_set() {
                return Ok(pool.finish(last, true, batch));
            }
        }
        let null = self.ensure_null(ty)?;
        for (i, count) in self.num_descriptors.iter().enumerate() {
            if *count == 0 {
                self.pools[i].borrow_mut().set_last_set(null.set.clone());
            }
        }
        let mut pool = self.pools[ty.index()].borrow_mut();
        Ok(pool.finish(null.set.clone(), false, batch))
    }

    fn ensure_null(&self, ty: DescriptorType) -> Result<NullAlloc> {
        if let Some(null) = self.null_alloc.borrow().as_ref() {
            return Ok(null.clone());
        }
        debug!("materializing shared null descriptor set");
        let layout_handle = self.device.create_descriptor_layout(&[LayoutBinding {
            binding: 0,
            count: 1,
            stages: StageMask::GFX | StageMask::COMPUTE,
            ty: DescriptorType::UniformBuffer,
        }])?;
        let layout = Rc::new(SetLayout::new(layout_handle, self.device.clone()));
        let pool_handle = self.device.create_descriptor_pool(
            &[PoolSize {
                ty: DescriptorType::UniformBuffer,
                count: 1,
            }],
            1,
        )?;
        let backing = Rc::new(PoolBacking::new(pool_handle, self.device.clone()));
        let handles = self
            .device
            .allocate_descriptor_sets(pool_handle, layout_handle, 1)?;
        let handle = handles
            .into_iter()
            .next()
            .ok_or(CacheError::DeviceObject("null descriptor set"))?;
        let set = Rc::new(DescriptorSet::new_null(ty, handle, backing.clone()));
        let null = NullAlloc {
            layout,
            backing,
            set,
        };
        *self.null_alloc.borrow_mut() = Some(null.clone());
        Ok(null)
    }

    /// Returns `set` to its recyclable table; no-op for null sets.
    pub(crate) fn recycle(&self, set: &Rc<DescriptorSet>) {
        let i = set.ty().index();
        if self.num_descriptors[i] == 0 {
            return;
        }
        self.pools[i].borrow_mut().recycle(set);
    }
}
