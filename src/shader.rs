//! Shader Stage Descriptions & Specialization Keys
//!
//! A [`ShaderInfo`] is the cache's view of one bound shader: a stable id, its
//! stage, interface metadata (builtin and user outputs), and descriptor
//! binding slots. The cache never inspects IR; compilation is the
//! [`ShaderCompiler`](crate::device::ShaderCompiler) collaborator's job.
//!
//! A [`SpecKey`] captures the draw-state-dependent specialization of a shader
//! for one compiled module. Keys are stage-shaped: vertex, tess-eval, and
//! geometry share one layout, fragment and tess-ctrl each have their own, and
//! compute keys carry no state beyond the shader id.

use std::rc::Rc;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::descriptor::DESCRIPTOR_TYPE_COUNT;
use crate::slot_map::VAR0;

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// Number of graphics stages (compute excluded).
pub const GFX_STAGE_COUNT: usize = 5;

/// Graphics stages in pipeline order. Modules are compiled in this order so
/// downstream stages observe upstream slot assignments.
pub const GFX_STAGES: [Stage; GFX_STAGE_COUNT] = [
    Stage::Vertex,
    Stage::TessCtrl,
    Stage::TessEval,
    Stage::Geometry,
    Stage::Fragment,
];

/// A shader pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

impl Stage {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::TessCtrl => 1,
            Self::TessEval => 2,
            Self::Geometry => 3,
            Self::Fragment => 4,
            Self::Compute => 5,
        }
    }

    #[must_use]
    pub fn mask(self) -> StageMask {
        StageMask::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    /// A set of shader stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageMask: u8 {
        const VERTEX = 1 << 0;
        const TESS_CTRL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;

        /// All graphics stages.
        const GFX = Self::VERTEX.bits()
            | Self::TESS_CTRL.bits()
            | Self::TESS_EVAL.bits()
            | Self::GEOMETRY.bits()
            | Self::FRAGMENT.bits();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interface metadata
// ─────────────────────────────────────────────────────────────────────────────

bitflags! {
    /// Builtin output variables a stage writes.
    ///
    /// The bit position of a slot-taking builtin doubles as its index in the
    /// slot map's builtin range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuiltinOutputs: u32 {
        const POSITION = 1 << 0;
        const POINT_SIZE = 1 << 1;
        const LAYER = 1 << 2;
        const PRIMITIVE_ID = 1 << 3;
        const CLIP_DISTANCE = 1 << 4;
        const CULL_DISTANCE = 1 << 5;
        const VIEWPORT = 1 << 6;
        const TESS_LEVEL_OUTER = 1 << 7;
        const TESS_LEVEL_INNER = 1 << 8;
        const FOG_COORD = 1 << 9;
        const FRONT_COLOR = 1 << 10;
        const BACK_COLOR = 1 << 11;

        /// Builtins consumed through dedicated hardware interfaces; they
        /// never occupy a slot-map entry.
        const NO_SLOT = Self::POSITION.bits()
            | Self::POINT_SIZE.bits()
            | Self::LAYER.bits()
            | Self::PRIMITIVE_ID.bits()
            | Self::CLIP_DISTANCE.bits()
            | Self::CULL_DISTANCE.bits()
            | Self::VIEWPORT.bits()
            | Self::TESS_LEVEL_OUTER.bits()
            | Self::TESS_LEVEL_INNER.bits();
    }
}

/// A user-declared output varying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserOutput {
    /// Declared location, relative to the first user varying.
    pub location: u8,
    /// Number of consecutive vec4 slots the variable occupies (arrays,
    /// matrices).
    pub vec4_slots: u8,
}

impl UserOutput {
    /// The slot-map index of this varying.
    #[must_use]
    pub fn slot(self) -> u8 {
        VAR0 + self.location
    }
}

/// One descriptor binding declared by a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    /// Array size (number of descriptors behind the binding).
    pub count: u32,
}

/// The cache's view of a bound shader.
#[derive(Debug, Clone)]
pub struct ShaderInfo {
    /// Stable nonzero identity; id 0 is reserved for "no shader bound".
    pub id: u32,
    pub stage: Stage,
    pub builtin_outputs: BuiltinOutputs,
    pub user_outputs: SmallVec<[UserOutput; 8]>,
    /// Number of streamout (transform feedback) outputs.
    pub xfb_outputs: u32,
    /// Fragment shaders only: whether the shader writes the sample mask.
    pub writes_sample_mask: bool,
    /// Descriptor bindings, grouped by descriptor type index.
    pub bindings: [SmallVec<[BindingSlot; 4]>; DESCRIPTOR_TYPE_COUNT],
}

impl ShaderInfo {
    #[must_use]
    pub fn new(stage: Stage, id: u32) -> Self {
        Self {
            id,
            stage,
            builtin_outputs: BuiltinOutputs::empty(),
            user_outputs: SmallVec::new(),
            xfb_outputs: 0,
            writes_sample_mask: false,
            bindings: Default::default(),
        }
    }

    /// Packed mask of written outputs: builtin bits in the low word, user
    /// locations from bit [`VAR0`] up. Feeds tess-ctrl specialization.
    #[must_use]
    pub fn outputs_written(&self) -> u64 {
        let mut mask = u64::from(self.builtin_outputs.bits());
        for out in &self.user_outputs {
            mask |= 1 << (VAR0 + out.location);
        }
        mask
    }
}

/// The currently bound graphics shaders, indexed by [`Stage::index`].
pub type GfxStages = [Option<Rc<ShaderInfo>>; GFX_STAGE_COUNT];

// ─────────────────────────────────────────────────────────────────────────────
// Specialization keys
// ─────────────────────────────────────────────────────────────────────────────

/// Draw-state inputs to specialization key derivation.
///
/// The front-end keeps this current and marks affected stages dirty when a
/// field changes.
#[derive(Debug, Clone, Default)]
pub struct DrawKeyContext {
    /// Rasterizer maps clip-space depth from [-1, 1] rather than [0, 1].
    pub clip_halfz: bool,
    /// Draw id must be pushed to the vertex stage (multidraw fallback).
    pub push_drawid: bool,
    /// The framebuffer is multisampled.
    pub framebuffer_samples: bool,
    /// Dual-source blend lowering is forced on.
    pub force_dual_color_blend: bool,
    /// Point sprite coordinate replacement is active.
    pub point_sprites: bool,
    /// Per-texcoord replacement bits (meaningful only with `point_sprites`).
    pub coord_replace_bits: u32,
    /// Replaced coordinates are y-inverted (meaningful only with
    /// `point_sprites`).
    pub coord_replace_yinvert: bool,
    /// Patch size for tessellation control specialization.
    pub vertices_per_patch: u8,
}

/// Key for vertex, tess-eval, and geometry modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsKey {
    pub shader_id: u32,
    /// This stage is the last one before rasterization.
    pub last_vertex_stage: bool,
    pub clip_halfz: bool,
    pub push_drawid: bool,
}

/// Key for fragment modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsKey {
    pub shader_id: u32,
    /// Sample-rate shading forced by a written sample mask on a
    /// multisampled framebuffer.
    pub samples: bool,
    pub force_dual_color_blend: bool,
    pub coord_replace_bits: u32,
    pub coord_replace_yinvert: bool,
}

/// Key for tessellation control modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcsKey {
    pub shader_id: u32,
    pub vertices_per_patch: u8,
    /// Output mask of the bound vertex stage; patch passthrough depends on
    /// it.
    pub vs_outputs_written: u64,
}

/// A stage-shaped specialization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecKey {
    VertexLike(VsKey),
    Fragment(FsKey),
    TessCtrl(TcsKey),
    Compute { shader_id: u32 },
}

impl SpecKey {
    /// Derives the key for `shader` given the bound stage set and draw
    /// state.
    #[must_use]
    pub fn for_stage(shader: &ShaderInfo, stages: &GfxStages, ctx: &DrawKeyContext) -> Self {
        match shader.stage {
            Stage::Vertex | Stage::TessEval | Stage::Geometry => {
                let last_vertex_stage = match shader.stage {
                    Stage::Geometry => true,
                    Stage::TessEval => stages[Stage::Geometry.index()].is_none(),
                    _ => {
                        stages[Stage::Geometry.index()].is_none()
                            && stages[Stage::TessEval.index()].is_none()
                    }
                };
                Self::VertexLike(VsKey {
                    shader_id: shader.id,
                    last_vertex_stage,
                    clip_halfz: ctx.clip_halfz,
                    push_drawid: shader.stage == Stage::Vertex && ctx.push_drawid,
                })
            }
            Stage::Fragment => {
                let (coord_replace_bits, coord_replace_yinvert) = if ctx.point_sprites {
                    (ctx.coord_replace_bits, ctx.coord_replace_yinvert)
                } else {
                    (0, false)
                };
                Self::Fragment(FsKey {
                    shader_id: shader.id,
                    samples: shader.writes_sample_mask && ctx.framebuffer_samples,
                    force_dual_color_blend: ctx.force_dual_color_blend,
                    coord_replace_bits,
                    coord_replace_yinvert,
                })
            }
            Stage::TessCtrl => Self::TessCtrl(TcsKey {
                shader_id: shader.id,
                vertices_per_patch: ctx.vertices_per_patch,
                vs_outputs_written: stages[Stage::Vertex.index()]
                    .as_ref()
                    .map_or(0, |vs| vs.outputs_written()),
            }),
            Stage::Compute => Self::Compute {
                shader_id: shader.id,
            },
        }
    }
}
