//! Program and pipeline cache behavior: pipeline lookup memoization,
//! identity-prefix keying, module sharing across programs, slot-map resets,
//! compile failure unwinding, and ordered teardown.

mod common;

use common::{cs, fs, producer, rig, vs, vs_with_ubo};
use vitric::{PrimitiveTopology, Stage};

#[test]
fn repeated_pipeline_lookup_hits_cache() {
    let (device, compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));

    let first = cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    let second = cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();

    assert_eq!(first, second);
    assert_eq!(device.pipelines_created.get(), 1);
    // One module per stage, each under its own specialization key.
    assert_eq!(compiler.compiles.get(), 2);
}

#[test]
fn identity_prefix_drives_the_pipeline_key() {
    let (device, _compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    assert_eq!(device.pipelines_created.get(), 1);

    // A field inside the hashed prefix forces a new pipeline.
    cache.gfx_pipeline_state_mut().set_blend_id(3);
    cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    assert_eq!(device.pipelines_created.get(), 2);

    // Re-setting the same value and a bare rehash change nothing.
    cache.gfx_pipeline_state_mut().set_blend_id(3);
    cache.gfx_pipeline_state_mut().touch();
    cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    assert_eq!(device.pipelines_created.get(), 2);

    // Topology buckets are separate tables.
    cache.get_gfx_pipeline(PrimitiveTopology::LineList).unwrap();
    assert_eq!(device.pipelines_created.get(), 3);
}

#[test]
fn programs_with_compatible_slot_maps_share_modules() {
    let (_device, compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    let a = cache.update_gfx_program().unwrap();

    // Swapping only the fragment shader keeps the slot map, so the new
    // program shares the cache and the very same vertex module.
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(3)));
    let b = cache.update_gfx_program().unwrap();

    assert!(b.shares_module_cache_with(&a));
    let va = a.module(Stage::Vertex).unwrap();
    let vb = b.module(Stage::Vertex).unwrap();
    assert!(std::rc::Rc::ptr_eq(&va, &vb));
    assert_eq!(compiler.compiles.get(), 3);
    assert_eq!(cache.program_count(), 2);

    // Binding the first fragment shader back re-resolves from the shared
    // cache without compiling anything.
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    let again = cache.update_gfx_program().unwrap();
    assert!(std::rc::Rc::ptr_eq(&again, &a));
    assert_eq!(compiler.compiles.get(), 3);
}

#[test]
fn projected_slot_overflow_resets_map_and_cache() {
    let (_device, _compiler, mut cache) = rig();
    // 20 single-slot varyings.
    let wide: Vec<(u8, u8)> = (0..20).map(|i| (i, 1)).collect();
    cache.bind_gfx_stage(Stage::Vertex, Some(producer(Stage::Vertex, 1, &wide)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    let a = cache.update_gfx_program().unwrap();
    assert_eq!(a.slot_reserved(), 20);

    // 5 more still fit: the map is copied and the cache shared.
    let more: Vec<(u8, u8)> = (20..25).map(|i| (i, 1)).collect();
    cache.bind_gfx_stage(Stage::Vertex, Some(producer(Stage::Vertex, 3, &more)));
    let b = cache.update_gfx_program().unwrap();
    assert!(b.shares_module_cache_with(&a));
    assert_eq!(b.slot_reserved(), 25);

    // 9 more would overflow 32: full reset, fresh cache, fresh assignments.
    let over: Vec<(u8, u8)> = (25..28).map(|i| (i, 3)).collect();
    cache.bind_gfx_stage(Stage::Vertex, Some(producer(Stage::Vertex, 4, &over)));
    let c = cache.update_gfx_program().unwrap();
    assert!(!c.shares_module_cache_with(&b));
    assert_eq!(c.slot_reserved(), 9);
    assert_eq!(b.slot_reserved(), 25);
    assert_eq!(c.cached_module_count(), 1);
}

#[test]
fn compile_failure_unwinds_sibling_insertions() {
    let (_device, compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    let a = cache.update_gfx_program().unwrap();
    assert_eq!(a.cached_module_count(), 2);

    // Bind a geometry stage and a failing fragment shader. The vertex
    // module recompiles (its last-vertex-stage key moved) and the geometry
    // module compiles before the fragment failure; both must be unwound
    // from the shared cache.
    compiler.fail_stage.set(Some(Stage::Fragment));
    cache.bind_gfx_stage(Stage::Geometry, Some(producer(Stage::Geometry, 5, &[(0, 1)])));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(6)));
    assert!(cache.update_gfx_program().is_err());

    assert_eq!(a.cached_module_count(), 2);
    assert_eq!(compiler.compiles.get(), 4);
    assert!(std::rc::Rc::ptr_eq(cache.curr_program().unwrap(), &a));

    // Dirty bits survive the failure, so fixing the compiler recovers.
    compiler.fail_stage.set(None);
    let b = cache.update_gfx_program().unwrap();
    assert!(b.shares_module_cache_with(&a));
    assert_eq!(b.cached_module_count(), 5);
}

#[test]
fn pipeline_creation_failure_caches_nothing() {
    let (device, _compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));

    device.fail_pipeline.set(true);
    assert!(cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).is_err());

    device.fail_pipeline.set(false);
    cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    assert_eq!(device.pipelines_created.get(), 1);
}

#[test]
fn teardown_destroys_native_objects_in_order() {
    let (device, _compiler, mut cache) = rig();
    cache.bind_gfx_stage(Stage::Vertex, Some(vs_with_ubo(1)));
    cache.bind_gfx_stage(Stage::Fragment, Some(fs(2)));
    cache.get_gfx_pipeline(PrimitiveTopology::TriangleList).unwrap();
    let a = cache.update_gfx_program().unwrap();

    cache.destroy_program(&a);
    drop(a);

    assert_eq!(device.pipelines_destroyed.get(), 1);
    assert_eq!(device.pipeline_layouts_destroyed.get(), 1);
    assert_eq!(device.modules_destroyed.get(), 2);
    assert_eq!(device.set_layouts_destroyed.get(), 1);
    assert_eq!(device.pools_destroyed.get(), 1);
}

#[test]
fn compute_pipeline_keys_on_local_size_only_when_enabled() {
    let (device, compiler, mut cache) = rig();
    cache.bind_compute(Some(cs(9)));

    let first = cache.get_compute_pipeline().unwrap();
    let second = cache.get_compute_pipeline().unwrap();
    assert_eq!(first, second);
    assert_eq!(device.pipelines_created.get(), 1);
    assert_eq!(compiler.compiles.get(), 1);

    // Dispatch-dependent workgroup size joins the identity once enabled.
    cache.compute_pipeline_state_mut().set_use_local_size(true);
    cache.compute_pipeline_state_mut().update_local_size([8, 8, 1]);
    cache.get_compute_pipeline().unwrap();
    assert_eq!(device.pipelines_created.get(), 2);

    cache.compute_pipeline_state_mut().update_local_size([8, 8, 1]);
    cache.get_compute_pipeline().unwrap();
    assert_eq!(device.pipelines_created.get(), 2);

    cache.compute_pipeline_state_mut().update_local_size([16, 16, 1]);
    cache.get_compute_pipeline().unwrap();
    assert_eq!(device.pipelines_created.get(), 3);
}
