//! The invocable result of compiling one delegate segment.
//!
//! An executor is built once by a compiler through [`ExecutorBuilder`] and
//! then driven in a repeating cycle: optionally `resize_output`, then
//! `bind`, then `invoke`. Bindings never outlive a cycle: every `bind`
//! starts from an empty external list and every `invoke` consumes it.

use std::fmt;

use tracing::{debug, error, trace};

use crate::args::ArgumentIds;
use crate::backend::{translate_status, ExternalValue, NativeRuntime, RuntimeHandle};
use crate::profiler::{ExecutionContext, Profiler};
use crate::shape::TensorShape;
use crate::tensor::DelegateTensor;
use crate::{DelegateError, Result};

/// Compile-time handle that populates an executor's argument lists.
///
/// Only the holder of a builder can register arguments or declare the
/// input/output order; a finished [`BackendExecutor`] exposes no mutation
/// of either.
#[derive(Debug, Default)]
pub struct ExecutorBuilder {
    args: ArgumentIds,
    input_ids: Vec<u32>,
    output_ids: Vec<u32>,
    dynamic: bool,
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_argument(&mut self, id: u32) -> &mut Self {
        self.args.register(id);
        self
    }

    /// Declare the next input in program order.
    pub fn declare_input(&mut self, id: u32) -> &mut Self {
        self.input_ids.push(id);
        self
    }

    /// Declare the next output in program order.
    pub fn declare_output(&mut self, id: u32) -> &mut Self {
        self.output_ids.push(id);
        self
    }

    /// Mark the graph as having shapes that may change between calls.
    pub fn set_dynamic(&mut self, dynamic: bool) -> &mut Self {
        self.dynamic = dynamic;
        self
    }

    pub fn finish(self, mut runtime: Box<dyn NativeRuntime>, profiling: bool) -> BackendExecutor {
        let profiler = Profiler::initialize(runtime.as_mut(), profiling);
        BackendExecutor {
            runtime: RuntimeHandle::new(runtime),
            args: self.args,
            input_ids: self.input_ids,
            output_ids: self.output_ids,
            externals: Vec::new(),
            bound: false,
            dynamic: self.dynamic,
            profiler,
        }
    }
}

pub struct BackendExecutor {
    runtime: RuntimeHandle,
    args: ArgumentIds,
    input_ids: Vec<u32>,
    output_ids: Vec<u32>,
    externals: Vec<ExternalValue>,
    bound: bool,
    dynamic: bool,
    profiler: Profiler,
}

impl BackendExecutor {
    pub fn argument_count(&self) -> usize {
        self.args.len()
    }

    /// The `index`-th argument ID in ascending order.
    pub fn argument_at(&mut self, index: usize) -> Result<u32> {
        self.args.get(index)
    }

    pub fn num_inputs(&self) -> usize {
        self.input_ids.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_ids.len()
    }

    /// Input argument IDs in program-declared order.
    pub fn input_ids(&self) -> &[u32] {
        &self.input_ids
    }

    /// Output argument IDs in program-declared order.
    pub fn output_ids(&self) -> &[u32] {
        &self.output_ids
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether a binding is pending for the current cycle.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Feed new input shapes to the backend and return the output shapes
    /// it derives, in declared output order.
    pub fn propagate_shapes(&mut self, input_shapes: &[TensorShape]) -> Result<Vec<TensorShape>> {
        check_count("input shapes", self.input_ids.len(), input_shapes.len())?;
        let runtime = self.runtime.get_mut();
        for (&id, shape) in self.input_ids.iter().zip(input_shapes) {
            runtime
                .reshape_external(id, shape)
                .map_err(|s| translate_status(s, &format!("reshape input {}", id)))?;
        }
        runtime.reshape().map_err(|s| translate_status(s, "reshape graph"))?;
        self.output_ids
            .iter()
            .map(|&id| {
                runtime
                    .external_shape(id)
                    .map_err(|s| translate_status(s, &format!("query output {} shape", id)))
            })
            .collect()
    }

    /// Attach caller tensors to the declared inputs and outputs.
    ///
    /// Any previous binding is discarded first, even when this call fails.
    ///
    /// # Safety
    ///
    /// The storage of every bound tensor must stay valid, and must not be
    /// read or written by anyone else, until the next [`invoke`] returns or
    /// the executor is bound again. [`BackendExecutor::execute`] upholds this
    /// by borrowing the tensors across both calls.
    ///
    /// [`invoke`]: BackendExecutor::invoke
    pub unsafe fn bind(
        &mut self,
        inputs: &mut [&mut dyn DelegateTensor],
        outputs: &mut [&mut dyn DelegateTensor],
        input_shapes: &[TensorShape],
        output_shapes: &[TensorShape],
    ) -> Result<()> {
        self.externals.clear();
        self.bound = false;

        check_count("inputs", self.input_ids.len(), inputs.len())?;
        check_count("outputs", self.output_ids.len(), outputs.len())?;
        check_count("input shapes", inputs.len(), input_shapes.len())?;
        check_count("output shapes", outputs.len(), output_shapes.len())?;

        let mut externals = Vec::with_capacity(inputs.len() + outputs.len());
        for ((&id, tensor), shape) in self.input_ids.iter().zip(inputs.iter_mut()).zip(input_shapes) {
            externals.push(external(id, &mut **tensor, shape)?);
        }
        for ((&id, tensor), shape) in self.output_ids.iter().zip(outputs.iter_mut()).zip(output_shapes) {
            externals.push(external(id, &mut **tensor, shape)?);
        }

        trace!(externals = externals.len(), "bound delegate arguments");
        self.externals = externals;
        self.bound = true;
        Ok(())
    }

    /// Run the backend on the current binding. Ends the cycle whether or not
    /// the backend succeeds; the next call needs a fresh `bind`.
    pub fn invoke(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if !self.bound {
            return Err(DelegateError::internal("executor not bound; call bind before invoke"));
        }
        let externals = std::mem::take(&mut self.externals);
        self.bound = false;

        // SAFETY: `bind`'s contract keeps every external buffer valid and
        // exclusively ours until this call returns.
        let setup = unsafe { self.runtime.get_mut().setup(&externals) };
        setup.map_err(|s| DelegateError::native("backend setup failed", s))?;

        if let Err(e) = self.profiler.start(ctx) {
            error!(error = %e, "failed to start delegate profiler");
        }
        let status = self.runtime.get_mut().invoke();
        if let Err(e) = self.profiler.end(self.runtime.get()) {
            error!(error = %e, "failed to end delegate profiler");
        }

        status.map_err(|s| DelegateError::native("backend invoke failed", s))
    }

    /// Resize an output tensor to `shape` ahead of binding it.
    ///
    /// The rank may never change. An identical shape leaves the tensor
    /// untouched.
    pub fn resize_output(&self, tensor: &mut dyn DelegateTensor, shape: &TensorShape) -> Result<()> {
        if tensor.dim() != shape.rank() {
            return Err(DelegateError::unsupported(format!(
                "rank can't change: output has rank {}, requested shape {}",
                tensor.dim(),
                shape
            )));
        }
        if tensor.sizes() == shape.dims() {
            return Ok(());
        }
        debug!(from = ?tensor.sizes(), to = %shape, "resizing delegate output");
        tensor.resize(shape.dims())
    }

    /// Bind the tensors at their current sizes and invoke.
    pub fn execute(
        &mut self,
        inputs: &mut [&mut dyn DelegateTensor],
        outputs: &mut [&mut dyn DelegateTensor],
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let input_shapes = shapes_of(inputs)?;
        let output_shapes = shapes_of(outputs)?;
        // SAFETY: the tensors stay mutably borrowed until `invoke` returns.
        unsafe { self.bind(inputs, outputs, &input_shapes, &output_shapes)? };
        self.invoke(ctx)
    }
}

impl fmt::Debug for BackendExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendExecutor")
            .field("arguments", &self.args.len())
            .field("input_ids", &self.input_ids)
            .field("output_ids", &self.output_ids)
            .field("dynamic", &self.dynamic)
            .field("bound", &self.bound)
            .finish()
    }
}

fn check_count(what: &str, expected: usize, given: usize) -> Result<()> {
    if expected != given {
        return Err(DelegateError::invalid(format!(
            "expected {} {} but given {}",
            expected, what, given
        )));
    }
    Ok(())
}

/// Describe one bound argument, checking its storage covers `shape`.
fn external(id: u32, tensor: &mut dyn DelegateTensor, shape: &TensorShape) -> Result<ExternalValue> {
    let nbytes = tensor.nbytes();
    let need = shape.numel() * 4;
    if nbytes < need {
        return Err(DelegateError::invalid(format!(
            "argument {} holds {} bytes, shape {} needs {}",
            id, nbytes, shape, need
        )));
    }
    Ok(ExternalValue::new(id, tensor.data_ptr(), nbytes, *shape))
}

fn shapes_of(tensors: &[&mut dyn DelegateTensor]) -> Result<Vec<TensorShape>> {
    tensors.iter().map(|t| TensorShape::new(t.sizes())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeStatus;
    use crate::tensor::HostTensor;

    /// Runtime that copies input 0 into output 0.
    struct Echo {
        externals: Vec<ExternalValue>,
        fail_next: bool,
    }

    impl NativeRuntime for Echo {
        fn reshape_external(&mut self, _: u32, _: &TensorShape) -> std::result::Result<(), NativeStatus> {
            Ok(())
        }
        fn reshape(&mut self) -> std::result::Result<(), NativeStatus> {
            Ok(())
        }
        fn external_shape(&self, _: u32) -> std::result::Result<TensorShape, NativeStatus> {
            Ok(TensorShape::scalar())
        }
        unsafe fn setup(&mut self, externals: &[ExternalValue]) -> std::result::Result<(), NativeStatus> {
            self.externals = externals.to_vec();
            Ok(())
        }
        fn invoke(&mut self) -> std::result::Result<(), NativeStatus> {
            if std::mem::take(&mut self.fail_next) {
                return Err(NativeStatus::ExecutionFailed);
            }
            let (src, dst) = (self.externals[0], self.externals[1]);
            let n = src.nbytes().min(dst.nbytes());
            unsafe { std::ptr::copy_nonoverlapping(src.data().as_ptr(), dst.data().as_ptr(), n) };
            Ok(())
        }
        fn release(&mut self) {}
    }

    fn echo_executor(fail_next: bool) -> BackendExecutor {
        let mut b = ExecutorBuilder::new();
        b.register_argument(1).register_argument(0);
        b.declare_input(0).declare_output(1);
        b.finish(Box::new(Echo { externals: Vec::new(), fail_next }), false)
    }

    #[test]
    fn test_invoke_without_bind_is_internal() {
        let mut exec = echo_executor(false);
        let err = exec.invoke(&ExecutionContext::new()).unwrap_err();
        assert!(matches!(err, DelegateError::Internal { .. }));
    }

    #[test]
    fn test_execute_copies() {
        let mut exec = echo_executor(false);
        let mut a = HostTensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let mut out = HostTensor::zeros(&[2]);
        exec.execute(&mut [&mut a], &mut [&mut out], &ExecutionContext::new()).unwrap();
        assert_eq!(out.as_f32(), &[1.0, 2.0]);
        assert!(!exec.is_bound());
    }

    #[test]
    fn test_count_mismatch_message() {
        let mut exec = echo_executor(false);
        let mut a = HostTensor::zeros(&[2]);
        let mut b = HostTensor::zeros(&[2]);
        let mut out = HostTensor::zeros(&[2]);
        let err = exec
            .execute(&mut [&mut a, &mut b], &mut [&mut out], &ExecutionContext::new())
            .unwrap_err();
        assert_eq!(err, DelegateError::invalid("expected 1 inputs but given 2"));
    }

    #[test]
    fn test_bind_with_separately_borrowed_outputs() {
        let mut exec = echo_executor(false);
        let mut a = HostTensor::from_f32(&[3.0, 4.0], &[2]).unwrap();
        let mut inputs: [&mut dyn DelegateTensor; 1] = [&mut a];
        let shape = TensorShape::new(&[2]).unwrap();
        {
            let mut out = HostTensor::zeros(&[2]);
            let mut outputs: [&mut dyn DelegateTensor; 1] = [&mut out];
            unsafe { exec.bind(&mut inputs, &mut outputs, &[shape], &[shape]) }.unwrap();
            assert!(exec.is_bound());
            exec.invoke(&ExecutionContext::new()).unwrap();
            assert_eq!(out.as_f32(), &[3.0, 4.0]);
        }
        assert!(!exec.is_bound());
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut exec = echo_executor(false);
        let mut a = HostTensor::zeros(&[2]);
        let mut out = HostTensor::zeros(&[2]);
        let big = TensorShape::new(&[4]).unwrap();
        let err = unsafe { exec.bind(&mut [&mut a], &mut [&mut out], &[big], &[big]) }.unwrap_err();
        assert!(matches!(err, DelegateError::InvalidArgument(_)));
        assert!(!exec.is_bound());
    }

    #[test]
    fn test_failed_invoke_keeps_native_status() {
        let mut exec = echo_executor(true);
        let mut a = HostTensor::zeros(&[1]);
        let mut out = HostTensor::zeros(&[1]);
        let err = exec.execute(&mut [&mut a], &mut [&mut out], &ExecutionContext::new()).unwrap_err();
        assert_eq!(err.native_status(), Some(NativeStatus::ExecutionFailed));
        assert!(!exec.is_bound());
    }
}
