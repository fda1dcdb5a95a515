//! Kore Edge benchmark: measures per-call latency of a delegated method.
//!
//! Usage: cargo run --example bench_edge -p kore-edge --release

use std::sync::Arc;
use std::time::Instant;

use kore_delegate::{CompileSpec, HostTensor, SegmentBuilder, CPU_BACKEND_NAME};
use kore_edge::{
    BufferDataLoader, EValue, MethodBuilder, Module, ModuleConfig, ProgramBuilder, TensorShapeDynamism,
};
use kore_kernels::OpKind;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Kore Edge Benchmark ===");
    println!();

    let configs = [("tiny", 8, 8), ("small", 64, 64), ("medium", 256, 256)];

    for (name, m, n) in &configs {
        for precision in ["fp32", "fp16"] {
            let bytes = build_program(*m, *n, precision)?;
            let config = ModuleConfig { runtime_arena_bytes: 8 * m * n * 4 + (1 << 16), ..Default::default() };
            let mut module = Module::from_loader(Arc::new(BufferDataLoader::new(bytes)), config);

            let x: Vec<f32> = (0..m * n).map(|i| ((i as f32) * 0.37).sin()).collect();
            let inputs = [EValue::Tensor(HostTensor::from_f32(&x, &[*m, *n])?)];

            // Warmup; also loads the method and compiles the delegate.
            let start = Instant::now();
            module.forward(&inputs)?;
            let first_ms = start.elapsed().as_secs_f64() * 1000.0;

            let iters = 100;
            let start = Instant::now();
            for _ in 0..iters {
                module.forward(&inputs)?;
            }
            let per_call_us = start.elapsed().as_secs_f64() * 1e6 / iters as f64;

            println!(
                "{:<8} {}x{:<4} {} | first call {:.2}ms | steady {:.1}us/call",
                name, m, n, precision, first_ms, per_call_us
            );
        }
    }

    println!();
    println!("Done.");
    Ok(())
}

/// `forward(x) = softmax(relu(x @ w + b))`; the matmul block is delegated,
/// softmax runs on the portable interpreter.
fn build_program(m: usize, n: usize, precision: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let w: Vec<f32> = (0..n * n).map(|i| ((i as f32) * 0.7123).sin() * 0.1).collect();
    let b = vec![0.01f32; n];

    let mut seg = SegmentBuilder::new();
    seg.add_input(1, &[m, n], false)
        .add_constant_f32(10, &[n, n], &w)
        .add_constant_f32(11, &[n], &b)
        .add_internal(20, &[m, n], false)
        .add_internal(21, &[m, n], false)
        .add_output(2, &[m, n], false)
        .add_node(OpKind::MatMul, &[1, 10], 20)
        .add_node(OpKind::Add, &[20, 11], 21)
        .add_node(OpKind::Relu, &[21], 2);
    let segment = seg.build()?;

    let mut program = ProgramBuilder::new();
    let segment = program.add_segment(&segment);

    let mut method = MethodBuilder::new("forward");
    let x = method.add_planned_tensor(&[m, n], TensorShapeDynamism::Static);
    let h = method.add_planned_tensor(&[m, n], TensorShapeDynamism::Static);
    let y = method.add_planned_tensor(&[m, n], TensorShapeDynamism::Static);
    let delegate = method.add_delegate(
        CPU_BACKEND_NAME,
        segment,
        vec![CompileSpec::new("precision", precision)],
    );
    method
        .add_input(x)
        .add_output(y)
        .add_delegate_call(delegate, &[x, h])
        .add_kernel(OpKind::Softmax, &[h], y);
    program.add_method(method.build());
    Ok(program.build()?)
}
