//! Reference graph backend running on the host CPU.
//!
//! Executes delegated graphs with the portable `kore-kernels` operators. It
//! is the backend every build has, and the one the test suite compiles
//! against.

mod runtime;

pub use runtime::CpuRuntime;

use kore_kernels::OpKind;
use tracing::debug;

use crate::backend::{GraphBackend, GraphDef, NativeRuntime, NativeStatus};
use crate::compile_spec::BackendConfig;
use crate::{DelegateError, Result};

/// Registry name of the CPU backend.
pub const CPU_BACKEND_NAME: &str = "KoreCpuBackend";

#[derive(Debug, Clone)]
pub struct CpuBackend {
    ops: Vec<OpKind>,
}

impl CpuBackend {
    /// A backend supporting every operator.
    pub fn new() -> Self {
        Self { ops: OpKind::ALL.to_vec() }
    }

    /// A backend limited to `ops`.
    pub fn with_ops(ops: &[OpKind]) -> Self {
        Self { ops: ops.to_vec() }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for CpuBackend {
    fn name(&self) -> &str {
        CPU_BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports(&self, op: OpKind) -> bool {
        self.ops.contains(&op)
    }

    fn check_config(&self, config: &BackendConfig) -> Result<()> {
        if config.device != "cpu" {
            return Err(DelegateError::unsupported(format!(
                "{} cannot run on device '{}'",
                CPU_BACKEND_NAME, config.device
            )));
        }
        if config.num_threads == Some(0) {
            return Err(DelegateError::invalid("num_threads must be at least 1"));
        }
        if let Some(n) = config.num_threads {
            debug!(num_threads = n, "cpu backend runs single-threaded; ignoring num_threads");
        }
        Ok(())
    }

    fn build_runtime(
        &self,
        graph: GraphDef,
        config: &BackendConfig,
    ) -> std::result::Result<Box<dyn NativeRuntime>, NativeStatus> {
        Ok(Box::new(CpuRuntime::build(graph, config.precision)?))
    }
}
