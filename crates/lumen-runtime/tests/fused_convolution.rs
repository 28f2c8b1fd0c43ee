//! End-to-end tests for fused convolution chains.

mod common;

use common::{
    assert_vec_approx_eq, host_device_with_capability, init_tracing, make_conv_chain, pattern,
    reference_conv_chain, tensor, values, ConvParams, ConvSpec,
};
use lumen_core::{ElementType, Error};
use lumen_runtime::{CompileOptions, Runtime, RuntimeError};

fn unfused() -> CompileOptions {
    CompileOptions {
        enable_fusion: false,
        ..CompileOptions::default()
    }
}

/// Round f32 values through `dtype` so references see the same inputs.
fn quantize(dtype: ElementType, values: &[f32]) -> Vec<f32> {
    match dtype {
        ElementType::F16 => values
            .iter()
            .map(|&v| half::f16::from_f32(v).to_f32())
            .collect(),
        _ => values.to_vec(),
    }
}

// ================================================================================
// Fused vs unfused
// ================================================================================

#[test]
fn test_fused_matches_unfused_relu_chain() -> anyhow::Result<()> {
    init_tracing();
    let spec = ConvSpec::new([1, 3, 30, 30], 5, [3, 3]);
    let params = ConvParams::generate(&spec, 1);
    let graph = make_conv_chain(&spec, ElementType::F32, &params, Some("Relu"));

    let runtime = Runtime::new();
    let fused = runtime.compile(&graph, &CompileOptions::default())?;
    let reference = runtime.compile(&graph, &unfused())?;
    assert_eq!(fused.plan().ops.len(), 1);
    assert_eq!(fused.plan().fused_count(), 1);
    assert_eq!(reference.plan().ops.len(), 3);

    let x = tensor(ElementType::F32, &pattern(3 * 30 * 30, 7), &[1, 3, 30, 30]);
    let fused_out = fused.run_host(std::slice::from_ref(&x))?;
    let unfused_out = reference.run_host(&[x])?;

    assert_eq!(fused_out[0].shape(), &[1, 5, 28, 28]);
    assert_eq!(fused_out, unfused_out);
    Ok(())
}

#[test]
fn test_fused_matches_unfused_bias_only() -> anyhow::Result<()> {
    let spec = ConvSpec::new([1, 3, 30, 30], 5, [3, 3]);
    let params = ConvParams::generate(&spec, 2);
    let graph = make_conv_chain(&spec, ElementType::F32, &params, None);

    let runtime = Runtime::new();
    let fused = runtime.compile(&graph, &CompileOptions::default())?;
    let reference = runtime.compile(&graph, &unfused())?;
    assert_eq!(fused.plan().fused_count(), 1);

    let x = tensor(ElementType::F32, &pattern(3 * 30 * 30, 8), &[1, 3, 30, 30]);
    assert_eq!(
        fused.run_host(std::slice::from_ref(&x))?,
        reference.run_host(&[x])?
    );
    Ok(())
}

// ================================================================================
// Fused vs naive reference
// ================================================================================

#[test]
fn test_fused_against_reference_grid() -> anyhow::Result<()> {
    init_tracing();
    let runtime = Runtime::new();
    let mut cases = 0;

    for kernel in [[3, 3], [3, 5]] {
        for strides in [[1, 1], [1, 3]] {
            for dilations in [[1, 1], [3, 1]] {
                for channels in [1, 5] {
                    for dtype in [ElementType::F32, ElementType::F16] {
                        for activation in [None, Some("Relu")] {
                            let spec = ConvSpec {
                                strides,
                                dilations,
                                pads_begin: [1, 0],
                                pads_end: [0, 2],
                                ..ConvSpec::new([1, 3, 30, 30], channels, kernel)
                            };
                            let generated = ConvParams::generate(&spec, cases);
                            let params = ConvParams {
                                weights: quantize(dtype, &generated.weights),
                                bias: quantize(dtype, &generated.bias),
                            };
                            let x = quantize(dtype, &pattern(3 * 30 * 30, 100 + cases));

                            let graph = make_conv_chain(&spec, dtype, &params, activation);
                            let compiled = runtime.compile(&graph, &CompileOptions::default())?;
                            assert_eq!(compiled.plan().fused_count(), 1);

                            let outputs = compiled.run_host(&[tensor(dtype, &x, &spec.input)])?;
                            assert_eq!(outputs[0].shape(), &spec.output_shape());

                            let expected =
                                reference_conv_chain(&spec, dtype, &x, &params, activation);
                            let epsilon = match dtype {
                                ElementType::F16 => 1e-3,
                                _ => 1e-5,
                            };
                            assert_vec_approx_eq(&values(&outputs[0]), &expected, epsilon);
                            cases += 1;
                        }
                    }
                }
            }
        }
    }

    assert_eq!(cases, 64);
    Ok(())
}

// ================================================================================
// Workbuffers
// ================================================================================

#[test]
fn test_immutable_workbuffers_stable_across_runs() -> anyhow::Result<()> {
    let spec = ConvSpec::new([1, 3, 30, 30], 5, [3, 3]);
    let params = ConvParams::generate(&spec, 3);
    let graph = make_conv_chain(&spec, ElementType::F32, &params, Some("Relu"));

    let runtime = Runtime::new();
    let compiled = runtime.compile(&graph, &CompileOptions::default())?;
    let arena = compiled.immutable_arena();
    assert!(arena.size() > 0);

    let snapshot = || -> anyhow::Result<Vec<u8>> {
        let mut bytes = vec![0u8; arena.size()];
        runtime.device().copy_to_host(arena.ptr(), &mut bytes)?;
        Ok(bytes)
    };
    let initial = snapshot()?;

    let mut previous = None;
    for seed in 0..3 {
        let x = tensor(ElementType::F32, &pattern(3 * 30 * 30, 50 + seed), &[1, 3, 30, 30]);
        let outputs = compiled.run_host(&[x])?;
        assert_eq!(snapshot()?, initial, "immutable workbuffer changed in run {seed}");
        assert_ne!(previous.as_ref(), Some(&outputs));
        previous = Some(outputs);
    }
    Ok(())
}

#[test]
fn test_mutable_regions_sized_for_chain() -> anyhow::Result<()> {
    let spec = ConvSpec::new([1, 3, 30, 30], 5, [3, 3]);
    let params = ConvParams::generate(&spec, 4);
    let graph = make_conv_chain(&spec, ElementType::F32, &params, None);

    let runtime = Runtime::new();
    let compiled = runtime.compile(&graph, &CompileOptions::default())?;
    let layout = &compiled.plan().layout;
    assert_eq!(compiled.mutable_arena().size(), layout.mutable_size);
    assert_eq!(layout.stream_regions.len(), 1);
    assert!(layout.mutable_size >= 27 * 28 * 28 * 4);
    Ok(())
}

// ================================================================================
// Capability checks
// ================================================================================

#[test]
fn test_half_precision_requires_capability() {
    let spec = ConvSpec::new([1, 3, 30, 30], 5, [3, 3]);
    let params = ConvParams::generate(&spec, 5);
    let graph = make_conv_chain(&spec, ElementType::F16, &params, Some("Relu"));

    let runtime = Runtime::with_device(host_device_with_capability((5, 0)));
    let result = runtime.compile(&graph, &CompileOptions::default());
    assert!(matches!(
        result,
        Err(RuntimeError::GraphCompilation(Error::UnsupportedElementType {
            dtype: ElementType::F16,
            ..
        }))
    ));

    let runtime = Runtime::with_device(host_device_with_capability((5, 3)));
    assert!(runtime.compile(&graph, &CompileOptions::default()).is_ok());
}
