//! End-to-end tests: build programs, load them through `Module`, execute.
//! Run with: cargo test -p kore-edge -- --nocapture

use std::io::Write;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kore_delegate::{
    register_backend, BackendConfig, CompileSpec, CpuBackend, DelegateError, DelegateTensor, GraphBackend,
    GraphDef, HostTensor, NativeRuntime, NativeStatus, RecordingTracer, SegmentBuilder, CPU_BACKEND_NAME,
};
use kore_edge::{
    BufferDataLoader, EValue, EdgeError, ErrorKind, LoadMode, MethodBuilder, Module, ModuleConfig,
    Program, ProgramBuilder, TensorShapeDynamism, ValueMeta, Verification,
};
use kore_kernels::OpKind;

fn tensor(data: &[f32], sizes: &[usize]) -> EValue {
    EValue::Tensor(HostTensor::from_f32(data, sizes).unwrap())
}

fn values(out: &EValue) -> &[f32] {
    out.as_tensor().unwrap().as_f32()
}

fn module_from(bytes: Vec<u8>) -> Module {
    Module::from_loader(Arc::new(BufferDataLoader::new(bytes)), ModuleConfig::default())
}

/// `forward(a, b) = b - a` delegated, with segment inputs declared 5 then 3
/// and output 7. Delegate args follow argument-ID order: 3, 5, 7.
fn sub_program(backend: &str) -> Vec<u8> {
    let mut seg = SegmentBuilder::new();
    seg.add_input(5, &[2], false)
        .add_input(3, &[2], false)
        .add_output(7, &[2], false)
        .add_node(OpKind::Sub, &[5, 3], 7);

    let mut p = ProgramBuilder::new();
    let segment = p.add_segment(&seg.build().unwrap());
    let mut m = MethodBuilder::new("forward");
    let a = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
    let b = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
    let y = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
    let d = m.add_delegate(backend, segment, Vec::new());
    // ID 3 <- a, ID 5 <- b, ID 7 <- y
    m.add_input(a).add_input(b).add_output(y).add_delegate_call(d, &[a, b, y]);
    p.add_method(m.build());
    p.build().unwrap()
}

/// `forward(x) = relu(x) * w` with a dynamic delegate and a portable kernel.
fn dynamic_program(output: TensorShapeDynamism, profiling: bool) -> Vec<u8> {
    let mut seg = SegmentBuilder::new();
    seg.add_input(0, &[2, 3], true)
        .add_output(1, &[2, 3], true)
        .add_node(OpKind::Relu, &[0], 1);

    let mut p = ProgramBuilder::new();
    let segment = p.add_segment(&seg.build().unwrap());
    let w = p.add_constant_f32(&[1.0, 10.0, 100.0]);

    let mut m = MethodBuilder::new("forward");
    let x = m.add_planned_tensor(&[2, 3], TensorShapeDynamism::DynamicBound);
    let h = m.add_planned_tensor(&[2, 3], output);
    let c = m.add_constant_tensor(&[3], w);
    let y = m.add_tensor(&[2, 3], TensorShapeDynamism::DynamicUnbound);
    let specs = if profiling { vec![CompileSpec::new("profiling", "on")] } else { Vec::new() };
    let d = m.add_delegate(CPU_BACKEND_NAME, segment, specs);
    m.add_input(x)
        .add_output(y)
        .add_delegate_call(d, &[x, h])
        .add_kernel(OpKind::Mul, &[h, c], y);
    p.add_method(m.build());
    p.build().unwrap()
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_lazy_load_and_meta() {
    let mut module = module_from(sub_program(CPU_BACKEND_NAME));
    assert!(!module.is_loaded());
    assert_eq!(module.method_names().unwrap(), vec!["forward".to_string()]);
    assert!(module.is_loaded());
    assert!(!module.is_method_loaded("forward"));

    let meta = module.method_meta("forward").unwrap();
    assert_eq!(meta.inputs.len(), 2);
    assert_eq!(
        meta.outputs[0],
        ValueMeta::Tensor { sizes: vec![2], dynamism: TensorShapeDynamism::Static }
    );
    assert_eq!(meta.num_delegates, 1);

    module.load_method("forward").unwrap();
    module.load_method("forward").unwrap();
    assert!(module.is_method_loaded("forward"));
}

#[test]
fn test_method_not_found() {
    let mut module = module_from(sub_program(CPU_BACKEND_NAME));
    let err = module.execute("backward", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_garbage_program() {
    let mut module = module_from(b"definitely not a program".to_vec());
    let err = module.load(Verification::Minimal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProgram);
    assert!(!module.is_loaded());
}

#[test]
fn test_unaddressable_tensor_rejected() {
    let mut p = ProgramBuilder::new();
    let mut m = MethodBuilder::new("forward");
    let x = m.add_tensor(&[usize::MAX, 2], TensorShapeDynamism::Static);
    let y = m.add_tensor(&[2], TensorShapeDynamism::Static);
    m.add_input(x).add_output(y).add_kernel(OpKind::Relu, &[x], y);
    p.add_method(m.build());
    let bytes = p.build().unwrap();

    let mut module = module_from(bytes.clone());
    let err = module.load(Verification::InternalConsistency).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProgram);

    // Minimal verification defers the check to method load.
    let mut module = module_from(bytes);
    module.load(Verification::Minimal).unwrap();
    let err = module.load_method("forward").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProgram);
    assert!(!module.is_method_loaded("forward"));
}

#[test]
fn test_file_load_mode() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&sub_program(CPU_BACKEND_NAME)).unwrap();
    file.flush().unwrap();

    let mut module = Module::new(file.path(), LoadMode::File);
    let out = module.forward(&[tensor(&[1.0, 2.0], &[2]), tensor(&[10.0, 20.0], &[2])]).unwrap();
    assert_eq!(values(&out[0]), &[9.0, 18.0]);
}

#[cfg(feature = "mmap")]
#[test]
fn test_mmap_load_modes() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&sub_program(CPU_BACKEND_NAME)).unwrap();
    file.flush().unwrap();

    for mode in [LoadMode::Mmap, LoadMode::MmapUseMlockIgnoreErrors] {
        let mut module = Module::new(file.path(), mode);
        module.load(Verification::InternalConsistency).unwrap();
        let out = module.get("forward", &[tensor(&[0.5, 0.5], &[2]), tensor(&[1.0, 1.0], &[2])]).unwrap();
        assert_eq!(values(&out), &[0.5, 0.5]);
    }
}

#[test]
fn test_shared_program() {
    let loader = Arc::new(BufferDataLoader::new(sub_program(CPU_BACKEND_NAME)));
    let program = Arc::new(Program::load(loader, Verification::InternalConsistency).unwrap());

    let mut a = Module::from_program(Arc::clone(&program), ModuleConfig::default());
    let mut b = Module::from_program(program, ModuleConfig::default());
    assert!(a.is_loaded() && b.is_loaded());
    let inputs = [tensor(&[1.0, 1.0], &[2]), tensor(&[3.0, 4.0], &[2])];
    assert_eq!(values(&a.forward(&inputs).unwrap()[0]), &[2.0, 3.0]);
    assert_eq!(values(&b.forward(&inputs).unwrap()[0]), &[2.0, 3.0]);
}

// ============================================================================
// Delegates
// ============================================================================

struct CountingBackend {
    builds: Arc<AtomicUsize>,
}

impl GraphBackend for CountingBackend {
    fn name(&self) -> &str {
        "CountingTestBackend"
    }
    fn is_available(&self) -> bool {
        true
    }
    fn supports(&self, _: OpKind) -> bool {
        true
    }
    fn build_runtime(
        &self,
        graph: GraphDef,
        config: &BackendConfig,
    ) -> Result<Box<dyn NativeRuntime>, NativeStatus> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        CpuBackend::new().build_runtime(graph, config)
    }
}

#[test]
fn test_delegate_compiled_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    register_backend(Arc::new(CountingBackend { builds: Arc::clone(&builds) })).unwrap();

    let mut module = module_from(sub_program("CountingTestBackend"));
    module.load_method("forward").unwrap();
    module.load_method("forward").unwrap();
    for i in 0..3 {
        let x = i as f32;
        let out = module.forward(&[tensor(&[x, x], &[2]), tensor(&[5.0, 6.0], &[2])]).unwrap();
        assert_eq!(values(&out[0]), &[5.0 - x, 6.0 - x]);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unregistered_backend() {
    let mut module = module_from(sub_program("NoSuchBackend"));
    let err = module.load_method("forward").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert!(!module.is_method_loaded("forward"));
}

#[test]
fn test_arena_exhaustion_at_load() {
    let mut seg = SegmentBuilder::new();
    seg.add_input(0, &[64], false)
        .add_constant_f32(1, &[64], &[1.0; 64])
        .add_output(2, &[64], false)
        .add_node(OpKind::Add, &[0, 1], 2);
    let mut p = ProgramBuilder::new();
    let segment = p.add_segment(&seg.build().unwrap());
    let mut m = MethodBuilder::new("forward");
    let x = m.add_planned_tensor(&[64], TensorShapeDynamism::Static);
    let y = m.add_planned_tensor(&[64], TensorShapeDynamism::Static);
    let d = m.add_delegate(CPU_BACKEND_NAME, segment, Vec::new());
    m.add_input(x).add_output(y).add_delegate_call(d, &[x, y]);
    p.add_method(m.build());

    let config = ModuleConfig { runtime_arena_bytes: 64, ..ModuleConfig::default() };
    let mut module = Module::from_loader(Arc::new(BufferDataLoader::new(p.build().unwrap())), config);
    let err = module.load_method("forward").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn test_bad_compile_spec_fails_load() {
    let mut seg = SegmentBuilder::new();
    seg.add_input(0, &[1], false).add_output(1, &[1], false).add_node(OpKind::Relu, &[0], 1);
    let mut p = ProgramBuilder::new();
    let segment = p.add_segment(&seg.build().unwrap());
    let mut m = MethodBuilder::new("forward");
    let x = m.add_planned_tensor(&[1], TensorShapeDynamism::Static);
    let y = m.add_planned_tensor(&[1], TensorShapeDynamism::Static);
    let d = m.add_delegate(CPU_BACKEND_NAME, segment, vec![CompileSpec::new("precision", "int4")]);
    m.add_input(x).add_output(y).add_delegate_call(d, &[x, y]);
    p.add_method(m.build());

    let mut module = module_from(p.build().unwrap());
    let err = module.load_method("forward").unwrap_err();
    assert!(matches!(err, EdgeError::Delegate(DelegateError::NotSupported(_))));
}

#[test]
fn test_delegate_arg_count_mismatch() {
    let mut seg = SegmentBuilder::new();
    seg.add_input(0, &[1], false).add_output(1, &[1], false).add_node(OpKind::Relu, &[0], 1);
    let mut p = ProgramBuilder::new();
    let segment = p.add_segment(&seg.build().unwrap());
    let mut m = MethodBuilder::new("forward");
    let x = m.add_planned_tensor(&[1], TensorShapeDynamism::Static);
    let d = m.add_delegate(CPU_BACKEND_NAME, segment, Vec::new());
    m.add_input(x).add_output(x).add_delegate_call(d, &[x]);
    p.add_method(m.build());

    let mut module = module_from(p.build().unwrap());
    let err = module.load_method("forward").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProgram);
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn test_input_errors_leave_method_usable() {
    let mut module = module_from(sub_program(CPU_BACKEND_NAME));

    let err = module.forward(&[tensor(&[1.0, 2.0], &[2])]).unwrap_err();
    assert_eq!(err.to_string(), "invalid argument: expected 2 inputs but given 1");

    let err = module.forward(&[EValue::Int(1), tensor(&[1.0, 2.0], &[2])]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Static input given a new shape.
    let err = module.forward(&[tensor(&[1.0; 3], &[3]), tensor(&[1.0; 3], &[3])]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    let out = module.forward(&[tensor(&[1.0, 2.0], &[2]), tensor(&[4.0, 4.0], &[2])]).unwrap();
    assert_eq!(values(&out[0]), &[3.0, 2.0]);
}

#[test]
fn test_dynamic_shapes_through_delegate_and_kernel() {
    let mut module = module_from(dynamic_program(TensorShapeDynamism::DynamicBound, false));

    let out = module.get("forward", &[tensor(&[-1.0, 2.0, -3.0], &[1, 3])]).unwrap();
    let out = out.into_tensor().unwrap();
    assert_eq!(out.as_f32(), &[0.0, 20.0, 0.0]);

    let out = module
        .get("forward", &[tensor(&[1.0, 1.0, 1.0, -1.0, 2.0, 3.0], &[2, 3])])
        .unwrap();
    assert_eq!(values(&out), &[1.0, 10.0, 100.0, 0.0, 20.0, 300.0]);

    // Beyond the input bound.
    let err = module.get("forward", &[tensor(&[0.0; 9], &[3, 3])]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_static_delegate_output_cannot_follow_dynamic_input() {
    let mut module = module_from(dynamic_program(TensorShapeDynamism::Static, false));
    let err = module.get("forward", &[tensor(&[1.0, 2.0, 3.0], &[1, 3])]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    // The original shape still runs.
    let out = module.get("forward", &[tensor(&[1.0; 6], &[2, 3])]).unwrap();
    assert_eq!(values(&out), &[1.0, 10.0, 100.0, 1.0, 10.0, 100.0]);
}

#[test]
fn test_kernel_only_method() {
    let mut p = ProgramBuilder::new();
    let c = p.add_constant_f32(&[0.5, 0.5]);
    let mut m = MethodBuilder::new("scale");
    let x = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
    let w = m.add_constant_tensor(&[2], c);
    let y = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
    let n = m.add_int(42);
    m.add_input(x).add_output(y).add_output(n).add_kernel(OpKind::Mul, &[x, w], y);
    p.add_method(m.build());

    let mut module = module_from(p.build().unwrap());
    let out = module.execute("scale", &[tensor(&[4.0, 8.0], &[2])]).unwrap();
    assert_eq!(values(&out[0]), &[2.0, 4.0]);
    assert_eq!(out[1].as_int(), Some(42));
}

#[test]
fn test_get_without_outputs() {
    let mut p = ProgramBuilder::new();
    let mut m = MethodBuilder::new("noop");
    let x = m.add_planned_tensor(&[1], TensorShapeDynamism::Static);
    m.add_input(x);
    p.add_method(m.build());

    let mut module = module_from(p.build().unwrap());
    let err = module.get("noop", &[tensor(&[1.0], &[1])]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_profiling_events_reach_tracer() {
    let tracer = Arc::new(RecordingTracer::new());
    let mut module = module_from(dynamic_program(TensorShapeDynamism::DynamicBound, true))
        .with_event_tracer(tracer.clone());

    module.forward(&[tensor(&[1.0; 6], &[2, 3])]).unwrap();
    let events = tracer.events();
    assert!(events.iter().any(|e| e.name == "relu"));
    let invoke = events.iter().find(|e| e.name == "delegate_invoke").unwrap();
    assert_eq!(invoke.method.as_deref(), Some("forward"));

    tracer.clear();
    module.forward(&[tensor(&[1.0; 3], &[1, 3])]).unwrap();
    assert!(!tracer.is_empty());
}

// ============================================================================
// Caller-owned outputs
// ============================================================================

fn ptr_of(buf: &mut [f32]) -> NonNull<f32> {
    NonNull::from(buf).cast()
}

#[test]
fn test_delegate_writes_into_caller_output() {
    let mut module = module_from(sub_program(CPU_BACKEND_NAME));
    let mut caller = vec![0.0f32; 2];
    unsafe { module.set_output_data_ptr("forward", 0, ptr_of(&mut caller), caller.len()) }.unwrap();
    assert!(module.is_method_loaded("forward"));

    let out = module.forward(&[tensor(&[1.0, 2.0], &[2]), tensor(&[10.0, 20.0], &[2])]).unwrap();
    assert_eq!(values(&out[0]), &[9.0, 18.0]);
    assert_eq!(caller, vec![9.0, 18.0]);

    module.forward(&[tensor(&[0.0, 0.0], &[2]), tensor(&[3.0, 4.0], &[2])]).unwrap();
    assert_eq!(caller, vec![3.0, 4.0]);
}

#[test]
fn test_dynamic_output_stays_in_caller_buffer() {
    let mut module = module_from(dynamic_program(TensorShapeDynamism::DynamicBound, false));
    let mut caller = vec![-1.0f32; 6];
    unsafe { module.set_output_data_ptr("forward", 0, ptr_of(&mut caller), caller.len()) }.unwrap();

    let out = module.forward(&[tensor(&[1.0, -1.0, 2.0], &[1, 3])]).unwrap();
    assert_eq!(out[0].as_tensor().unwrap().sizes(), &[1, 3]);
    assert_eq!(&caller[..3], &[1.0, 0.0, 200.0]);
    assert_eq!(&caller[3..], &[-1.0, -1.0, -1.0]);
}

#[test]
fn test_caller_output_checks() {
    let mut module = module_from(sub_program(CPU_BACKEND_NAME));
    let mut short = vec![0.0f32; 1];
    let err = unsafe { module.set_output_data_ptr("forward", 0, ptr_of(&mut short), short.len()) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut buf = vec![0.0f32; 2];
    let err = unsafe { module.set_output_data_ptr("forward", 1, ptr_of(&mut buf), buf.len()) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("out of range"));

    let err = unsafe { module.set_output_data_ptr("backward", 0, ptr_of(&mut buf), buf.len()) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // A rejected buffer leaves the planned output in place.
    let out = module.forward(&[tensor(&[1.0, 1.0], &[2]), tensor(&[2.0, 3.0], &[2])]).unwrap();
    assert_eq!(values(&out[0]), &[1.0, 2.0]);
    assert_eq!(short, vec![0.0]);
}

#[test]
fn test_non_tensor_output_rejected() {
    let mut p = ProgramBuilder::new();
    let mut m = MethodBuilder::new("count");
    let n = m.add_int(7);
    m.add_output(n);
    p.add_method(m.build());

    let mut module = module_from(p.build().unwrap());
    let mut buf = vec![0.0f32; 1];
    let err = unsafe { module.set_output_data_ptr("count", 0, ptr_of(&mut buf), buf.len()) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
