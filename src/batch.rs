//! Batch Lifetime Tracking
//!
//! A [`Batch`] records which programs and descriptor sets the work recorded
//! so far depends on. References are `Rc` clones, so everything a batch
//! touched stays alive until the batch retires; descriptor sets additionally
//! carry a batch refcount, which is what makes them repurposable once it
//! returns to zero.
//!
//! Submission itself is outside this crate: the [`BatchHost`] collaborator
//! flushes the active batch when the descriptor allocator runs a pool dry.
//! Retiring a submitted batch is simply dropping it — `Drop` releases the
//! refcounts and recycles the sets.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::descriptor::DescriptorSet;
use crate::program::{ComputeProgram, GfxProgram};

/// A program reference held by a batch.
#[derive(Clone)]
pub enum ProgramRef {
    Gfx(Rc<GfxProgram>),
    Compute(Rc<ComputeProgram>),
}

/// State recorded into one submission's lifetime.
pub struct Batch {
    id: u64,
    desc_sets: FxHashMap<u64, Rc<DescriptorSet>>,
    programs: Vec<ProgramRef>,
    descs_used: usize,
}

impl Batch {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            desc_sets: FxHashMap::default(),
            programs: Vec::new(),
            descs_used: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of distinct descriptor sets referenced.
    #[must_use]
    pub fn desc_set_count(&self) -> usize {
        self.desc_sets.len()
    }

    /// Running descriptor total across referenced sets.
    #[must_use]
    pub fn descs_used(&self) -> usize {
        self.descs_used
    }

    /// Keeps `program` alive until this batch retires.
    pub fn reference_program(&mut self, program: ProgramRef) {
        self.programs.push(program);
    }

    /// References `set`, deduplicated per batch; returns true on first
    /// reference.
    pub(crate) fn add_desc_set(&mut self, set: &Rc<DescriptorSet>, descriptors: usize) -> bool {
        if self.desc_sets.contains_key(&set.id()) {
            return false;
        }
        set.acquire_batch_ref();
        self.desc_sets.insert(set.id(), set.clone());
        self.descs_used += descriptors;
        true
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        for (_, set) in self.desc_sets.drain() {
            set.release_batch_ref();
            if let Some(pool) = set.pool().upgrade() {
                pool.borrow_mut().recycle(&set);
            }
        }
    }
}

/// Batch submission collaborator.
pub trait BatchHost {
    /// Submits `batch`'s outstanding work and leaves the next active batch
    /// in its place. Retirement of the submitted batch drops its references.
    fn flush_batch(&mut self, batch: &mut Batch);
}
