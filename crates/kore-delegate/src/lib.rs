//! # kore-delegate
//!
//! Backend delegation for Kore edge inference.
//!
//! A program may hand whole subgraphs to a hardware backend as opaque
//! segments. This crate compiles such a segment once into a
//! [`BackendExecutor`] and then drives it per call:
//!
//! - [`BackendCompiler`] parses a [`segment`], resolves [`CompileSpec`]s and
//!   asks a [`GraphBackend`] to build its native graph.
//! - [`BackendExecutor`] keeps the argument IDs, binds caller tensors,
//!   invokes the backend and resizes dynamic outputs.
//! - [`Profiler`] reports per-operator timings to an optional [`EventTracer`].
//!
//! The reference [`CpuBackend`] runs graphs with `kore-kernels` and is always
//! available through the [`registry`].

pub mod arena;
pub mod args;
pub mod backend;
pub mod compile_spec;
pub mod compiler;
pub mod cpu;
pub mod error;
pub mod executor;
pub mod profiler;
pub mod registry;
pub mod segment;
pub mod shape;
pub mod tensor;

pub use arena::{Arena, ArenaSlice};
pub use args::ArgumentIds;
pub use backend::{
    translate_status, ExternalValue, GraphBackend, GraphDef, GraphNode, GraphValue, NativeRuntime,
    NativeStatus, OperatorTiming, RuntimeHandle,
};
pub use compile_spec::{BackendConfig, CompileSpec, Precision};
pub use compiler::BackendCompiler;
pub use cpu::{CpuBackend, CPU_BACKEND_NAME};
pub use error::DelegateError;
pub use executor::{BackendExecutor, ExecutorBuilder};
pub use profiler::{DelegateEvent, EventTracer, ExecutionContext, Profiler, RecordingTracer};
pub use registry::{get_backend, register_backend, registered_backends};
pub use segment::{Segment, SegmentBuilder};
pub use shape::{TensorShape, MAX_TENSOR_DIMS};
pub use tensor::{DelegateTensor, HostTensor};

pub type Result<T> = std::result::Result<T, DelegateError>;
