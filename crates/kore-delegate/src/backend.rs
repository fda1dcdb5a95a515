//! Capability traits a native graph backend implements.
//!
//! A [`GraphBackend`] turns a [`GraphDef`] into a [`NativeRuntime`], the
//! backend's compiled graph object. The runtime is driven through a small
//! set of calls: reshape externals, re-propagate shapes, set up external
//! buffers, invoke, and read back profiling data. Failures are reported as
//! [`NativeStatus`] codes and translated by [`translate_status`].

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use kore_kernels::OpKind;

use crate::arena::ArenaSlice;
use crate::compile_spec::BackendConfig;
use crate::segment::ValueKind;
use crate::shape::TensorShape;
use crate::{DelegateError, Result};

/// Whether external-value records carry shape metadata in this build.
pub const CARRIES_SHAPES: bool = cfg!(feature = "dynamic-shapes");

/// Status codes reported by native backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeStatus {
    InvalidParameter,
    InvalidState,
    Unsupported,
    OutOfMemory,
    Uninitialized,
    ExecutionFailed,
}

impl NativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeStatus::InvalidParameter => "invalid_parameter",
            NativeStatus::InvalidState => "invalid_state",
            NativeStatus::Unsupported => "unsupported",
            NativeStatus::OutOfMemory => "out_of_memory",
            NativeStatus::Uninitialized => "uninitialized",
            NativeStatus::ExecutionFailed => "execution_failed",
        }
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a native status onto the runtime error taxonomy.
pub fn translate_status(status: NativeStatus, context: &str) -> DelegateError {
    match status {
        NativeStatus::Unsupported => {
            DelegateError::unsupported(format!("{}: backend reported {}", context, status))
        }
        NativeStatus::OutOfMemory => DelegateError::OutOfMemory { requested: 0, available: 0 },
        other => DelegateError::native(context, other),
    }
}

/// One argument slot bound to caller memory for a single invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExternalValue {
    id: u32,
    data: NonNull<u8>,
    nbytes: usize,
    #[cfg(feature = "dynamic-shapes")]
    shape: TensorShape,
}

impl ExternalValue {
    /// The shape is kept only when the build carries shape metadata.
    pub fn new(id: u32, data: NonNull<u8>, nbytes: usize, shape: TensorShape) -> Self {
        #[cfg(not(feature = "dynamic-shapes"))]
        let _ = shape;
        Self {
            id,
            data,
            nbytes,
            #[cfg(feature = "dynamic-shapes")]
            shape,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn shape(&self) -> Option<&TensorShape> {
        #[cfg(feature = "dynamic-shapes")]
        {
            Some(&self.shape)
        }
        #[cfg(not(feature = "dynamic-shapes"))]
        {
            None
        }
    }
}

/// A graph value as handed to the backend.
#[derive(Debug)]
pub struct GraphValue {
    pub id: u32,
    pub dims: Vec<usize>,
    pub kind: ValueKind,
    pub dynamic: bool,
    /// Decoded f32 data for constants, in persistent arena memory.
    pub data: Option<ArenaSlice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub op: OpKind,
    pub inputs: Vec<u32>,
    pub output: u32,
}

/// A validated graph, ready for a backend to build.
#[derive(Debug, Default)]
pub struct GraphDef {
    pub values: Vec<GraphValue>,
    pub nodes: Vec<GraphNode>,
}

impl GraphDef {
    pub fn value(&self, id: u32) -> Option<&GraphValue> {
        self.values.iter().find(|v| v.id == id)
    }
}

/// Wall-clock time spent in one operator during the last invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorTiming {
    pub name: String,
    pub duration: Duration,
}

/// A native accelerator library's graph compiler.
pub trait GraphBackend: Send + Sync {
    /// Registry name, e.g. `"KoreCpuBackend"`.
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn supports(&self, op: OpKind) -> bool;

    /// Reject options the backend cannot honor.
    fn check_config(&self, _config: &BackendConfig) -> Result<()> {
        Ok(())
    }

    fn build_runtime(
        &self,
        graph: GraphDef,
        config: &BackendConfig,
    ) -> std::result::Result<Box<dyn NativeRuntime>, NativeStatus>;
}

/// A compiled native graph.
pub trait NativeRuntime {
    /// Record a new shape for an external value.
    fn reshape_external(&mut self, id: u32, shape: &TensorShape) -> std::result::Result<(), NativeStatus>;

    /// Re-propagate shapes through the graph after external reshapes.
    fn reshape(&mut self) -> std::result::Result<(), NativeStatus>;

    /// Current shape of an external value.
    fn external_shape(&self, id: u32) -> std::result::Result<TensorShape, NativeStatus>;

    /// Attach caller buffers to external values for the next `invoke`.
    ///
    /// # Safety
    ///
    /// Every external's `data` must be valid for reads and writes of
    /// `nbytes` bytes, suitably aligned for f32, and not accessed by anyone
    /// else until the following `invoke` returns.
    unsafe fn setup(&mut self, externals: &[ExternalValue]) -> std::result::Result<(), NativeStatus>;

    fn invoke(&mut self) -> std::result::Result<(), NativeStatus>;

    fn enable_profiling(&mut self) -> std::result::Result<(), NativeStatus> {
        Err(NativeStatus::Unsupported)
    }

    /// Per-operator timings of the last invocation.
    fn operator_timings(&self) -> Vec<OperatorTiming> {
        Vec::new()
    }

    /// Free native resources. Called exactly once, by [`RuntimeHandle`].
    fn release(&mut self);
}

/// Exclusive owner of a native runtime; releases it exactly once on drop.
pub struct RuntimeHandle {
    runtime: Box<dyn NativeRuntime>,
}

impl RuntimeHandle {
    pub fn new(runtime: Box<dyn NativeRuntime>) -> Self {
        Self { runtime }
    }

    pub fn get(&self) -> &dyn NativeRuntime {
        self.runtime.as_ref()
    }

    pub fn get_mut(&mut self) -> &mut dyn NativeRuntime {
        self.runtime.as_mut()
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.runtime.release();
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RuntimeHandle")
    }
}
