//! Stream scheduling and workbuffer layout tests.

mod common;

use common::*;
use lumen_compiler::{compile, CompileOptions};

#[test]
fn test_independent_branches_use_separate_streams() {
    init_tracing();
    let graph = make_two_branch_graph();
    let options = CompileOptions {
        stream_count: 2,
        ..CompileOptions::default()
    };
    let plan = compile(&graph, &host_ctx(), &options).unwrap();

    assert_eq!(plan.ops.len(), 2);
    assert_eq!(plan.fused_count(), 2);
    assert_eq!(plan.ops[0].schedule.stream, 0);
    assert_eq!(plan.ops[1].schedule.stream, 1);
    assert_eq!(plan.used_streams(), vec![0, 1]);
    assert!(plan.ops.iter().all(|op| op.schedule.waits.is_empty()));
}

#[test]
fn test_mutable_regions_are_disjoint_across_streams() {
    init_tracing();
    let graph = make_two_branch_graph();
    let ctx = host_ctx();
    let options = CompileOptions {
        stream_count: 2,
        ..CompileOptions::default()
    };
    let plan = compile(&graph, &ctx, &options).unwrap();
    let layout = &plan.layout;
    let alignment = ctx.properties().workbuffer_alignment;

    assert_eq!(layout.alignment, alignment);
    assert!(!layout.stream_regions[0].overlaps(&layout.stream_regions[1]));
    for op in &plan.ops {
        for &offset in op.workbuffers.immutable.iter().chain(&op.workbuffers.mutable) {
            assert_eq!(offset % alignment, 0, "offset {offset} is not aligned");
        }
    }
    // Immutable buffers are never shared.
    assert_ne!(
        plan.ops[0].workbuffers.immutable[0],
        plan.ops[1].workbuffers.immutable[0]
    );
    assert_eq!(layout.mutable_size, layout.stream_regions[1].end());
}

#[test]
fn test_same_stream_shares_mutable_region() {
    init_tracing();
    let graph = make_two_branch_graph();
    let plan = compile(&graph, &host_ctx(), &CompileOptions::default()).unwrap();

    assert_eq!(plan.used_streams(), vec![0]);
    assert_eq!(plan.ops[0].workbuffers.mutable, plan.ops[1].workbuffers.mutable);
    assert_eq!(plan.layout.stream_regions.len(), 1);
    assert_eq!(plan.layout.immutable_size % plan.layout.alignment, 0);
}

#[test]
fn test_op_for_node() {
    init_tracing();
    let graph = make_two_branch_graph();
    let plan = compile(&graph, &host_ctx(), &CompileOptions::default()).unwrap();
    assert_eq!(plan.op_for_node(1), Some(0));
    assert_eq!(plan.op_for_node(5), Some(1));
    assert_eq!(plan.op_for_node(6), None);
}
