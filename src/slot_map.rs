//! Interface Slot Map
//!
//! Cross-stage interface variables (builtins that need a location, plus user
//! varyings) are compacted into a small contiguous range of hardware
//! locations. A [`SlotMap`] records those assignments for one linked program;
//! every module of the program compiles against the same map so producer and
//! consumer stages agree on locations.
//!
//! Once any module has been compiled against a map, existing entries are
//! frozen. A program replacing part of its stages may keep the predecessor's
//! map (and thereby share its module cache) only when the retained
//! assignments plus the projected demand of the new stages still fit; see
//! [`plan`].

use crate::shader::{BuiltinOutputs, GfxStages, ShaderInfo, Stage, StageMask};

/// Number of assignable compacted locations.
pub const SLOT_CAPACITY: u8 = 32;

/// Slot index of the first user varying; lower indices are builtins.
pub const VAR0: u8 = 16;

/// Total addressable slot indices (builtins + user varyings).
pub const MAX_VARYINGS: usize = VAR0 as usize + 32;

/// Maps interface slot indices to compacted locations.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: [Option<u8>; MAX_VARYINGS],
    reserved: u8,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_VARYINGS],
            reserved: 0,
        }
    }

    /// Number of compacted locations already assigned.
    #[must_use]
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    /// The compacted location assigned to `slot`, if any.
    #[must_use]
    pub fn get(&self, slot: u8) -> Option<u8> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// Assigns `width` consecutive compacted locations to `slot`, or returns
    /// the existing assignment. `None` means the map is out of capacity.
    pub fn assign(&mut self, slot: u8, width: u8) -> Option<u8> {
        debug_assert!((slot as usize) < MAX_VARYINGS);
        debug_assert!(width >= 1);
        if let Some(loc) = self.slots[slot as usize] {
            return Some(loc);
        }
        if u32::from(self.reserved) + u32::from(width) > u32::from(SLOT_CAPACITY) {
            return None;
        }
        let loc = self.reserved;
        self.slots[slot as usize] = Some(loc);
        self.reserved += width;
        Some(loc)
    }

    /// Upper bound on the locations `shader` would additionally consume if
    /// compiled against this map. Builtins that use dedicated interfaces
    /// contribute nothing; other outputs count only while unassigned.
    #[must_use]
    pub fn projected_demand(&self, shader: &ShaderInfo) -> u32 {
        let mut demand = 0u32;
        let slotted = shader.builtin_outputs - BuiltinOutputs::NO_SLOT;
        for bit in 0..VAR0 {
            if slotted.bits() & (1 << bit) != 0 && self.slots[bit as usize].is_none() {
                demand += 1;
            }
        }
        for out in &shader.user_outputs {
            if self.slots[out.slot() as usize].is_none() {
                demand += u32::from(out.vec4_slots);
            }
        }
        demand
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Share-or-reset decision
// ─────────────────────────────────────────────────────────────────────────────

/// How a new program should obtain its slot map and module cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMapPlan {
    /// All-unassigned map and a brand-new module cache.
    Fresh,
    /// Copy of the predecessor's map plus a share of its module cache.
    Reuse,
}

/// Decides between reusing the predecessor program's slot map and starting
/// over.
///
/// Reuse requires a predecessor with at least one surviving (non-dirty)
/// stage, and that the predecessor's frozen assignments leave room for the
/// worst-case demand of the producing stages about to be compiled, plus
/// their streamout outputs. Sharing is all-or-nothing.
#[must_use]
pub fn plan(
    prior: Option<(&SlotMap, StageMask)>,
    stages: &GfxStages,
    dirty: StageMask,
) -> SlotMapPlan {
    let Some((prior_map, prior_mask)) = prior else {
        return SlotMapPlan::Fresh;
    };
    if prior_mask.is_empty() || dirty == prior_mask {
        return SlotMapPlan::Fresh;
    }
    if prior_map.reserved() > 0 {
        // Tess-ctrl and fragment outputs never land in the map.
        let mut max_demand = 0u32;
        let mut xfb = 0u32;
        for stage in [Stage::Vertex, Stage::TessEval, Stage::Geometry] {
            if let Some(shader) = &stages[stage.index()] {
                xfb = xfb.max(shader.xfb_outputs);
                max_demand = max_demand.max(prior_map.projected_demand(shader));
            }
        }
        if u32::from(prior_map.reserved()) + max_demand + xfb > u32::from(SLOT_CAPACITY) {
            return SlotMapPlan::Fresh;
        }
    }
    SlotMapPlan::Reuse
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::shader::UserOutput;

    fn producer(id: u32, user_slots: &[(u8, u8)]) -> ShaderInfo {
        let mut info = ShaderInfo::new(Stage::Vertex, id);
        info.builtin_outputs = BuiltinOutputs::POSITION;
        for &(location, vec4_slots) in user_slots {
            info.user_outputs.push(UserOutput {
                location,
                vec4_slots,
            });
        }
        info
    }

    #[test]
    fn assign_compacts_and_is_stable() {
        let mut map = SlotMap::new();
        assert_eq!(map.assign(VAR0, 2), Some(0));
        assert_eq!(map.assign(VAR0 + 4, 1), Some(2));
        // Re-assigning returns the frozen location without consuming more.
        assert_eq!(map.assign(VAR0, 2), Some(0));
        assert_eq!(map.reserved(), 3);
    }

    #[test]
    fn assign_refuses_overflow() {
        let mut full = SlotMap::new();
        assert_eq!(full.assign(VAR0, SLOT_CAPACITY), Some(0));
        assert_eq!(full.assign(VAR0 + 1, 1), None);
        assert_eq!(full.reserved(), SLOT_CAPACITY);
        // The refused slot stays unassigned.
        assert_eq!(full.get(VAR0 + 1), None);
    }

    #[test]
    fn assign_rejects_oversized_width() {
        let mut map = SlotMap::new();
        assert_eq!(map.assign(VAR0, 30), Some(0));
        // A width that would overflow the u8 sum is refused, not wrapped.
        assert_eq!(map.assign(VAR0 + 1, u8::MAX), None);
        assert_eq!(map.reserved(), 30);
    }

    #[test]
    fn projection_skips_assigned_and_no_slot_builtins() {
        let mut map = SlotMap::new();
        let shader = producer(1, &[(0, 2), (1, 1)]);
        // POSITION is a no-slot builtin, so demand is the two user outputs.
        assert_eq!(map.projected_demand(&shader), 3);
        map.assign(VAR0, 2);
        assert_eq!(map.projected_demand(&shader), 1);
    }

    #[test]
    fn plan_resets_without_prior_or_when_all_stages_dirty() {
        let stages: GfxStages = Default::default();
        assert_eq!(
            plan(None, &stages, StageMask::VERTEX),
            SlotMapPlan::Fresh
        );

        let map = SlotMap::new();
        let prior_mask = StageMask::VERTEX | StageMask::FRAGMENT;
        assert_eq!(
            plan(Some((&map, prior_mask)), &stages, prior_mask),
            SlotMapPlan::Fresh
        );
        assert_eq!(
            plan(Some((&map, prior_mask)), &stages, StageMask::FRAGMENT),
            SlotMapPlan::Reuse
        );
    }

    #[test]
    fn plan_resets_on_projected_overflow() {
        let mut map = SlotMap::new();
        map.assign(VAR0 + 31, 30);
        let mut stages: GfxStages = Default::default();
        stages[Stage::Vertex.index()] = Some(Rc::new(producer(1, &[(0, 2), (1, 2)])));

        let prior_mask = StageMask::VERTEX | StageMask::FRAGMENT;
        assert_eq!(
            plan(Some((&map, prior_mask)), &stages, StageMask::FRAGMENT),
            SlotMapPlan::Fresh
        );

        // Demand that still fits keeps the map.
        let mut small: GfxStages = Default::default();
        small[Stage::Vertex.index()] = Some(Rc::new(producer(1, &[(0, 1)])));
        assert_eq!(
            plan(Some((&map, prior_mask)), &small, StageMask::FRAGMENT),
            SlotMapPlan::Reuse
        );
    }
}
