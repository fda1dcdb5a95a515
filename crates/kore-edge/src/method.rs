//! A loaded, executable method.
//!
//! Loading builds every value in method memory and compiles each delegate
//! exactly once. Executing copies the inputs in, runs the instructions in
//! order and copies the outputs out. Compiled delegates and memory survive
//! failed executions.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::Arc;

use kore_delegate::{
    get_backend, BackendCompiler, BackendExecutor, DelegateTensor, EventTracer, ExecutionContext,
    TensorShape,
};
use kore_kernels::OpKind;
use tracing::{debug, info, trace};

use crate::format::{InstructionDef, MethodDef, TensorDef, TensorShapeDynamism, ValueDef};
use crate::interpreter::run_kernel;
use crate::memory::{MemoryManager, Storage, Tensor};
use crate::program::Program;
use crate::value::{restore, take_tensor, EValue, Value};
use crate::{EdgeError, Result};

enum Instruction {
    Kernel {
        op: OpKind,
        args: Vec<usize>,
    },
    /// Delegate call with value indices in the executor's declared order.
    Delegate {
        delegate: usize,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
    },
}

/// A compiled delegate and the backend it came from.
struct DelegateHandle {
    backend: String,
    executor: BackendExecutor,
}

impl DelegateHandle {
    fn execute(
        &mut self,
        values: &mut [Value],
        inputs: &[usize],
        outputs: &[usize],
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let mut taken = Vec::with_capacity(inputs.len() + outputs.len());
        for &index in inputs.iter().chain(outputs) {
            match take_tensor(values, index) {
                Ok(t) => taken.push((index, t)),
                Err(e) => {
                    restore(values, taken);
                    return Err(e);
                }
            }
        }
        let result = self.run(&mut taken, inputs.len(), ctx);
        restore(values, taken);
        result
    }

    fn run(&mut self, taken: &mut [(usize, Tensor)], num_inputs: usize, ctx: &ExecutionContext) -> Result<()> {
        let (ins, outs) = taken.split_at_mut(num_inputs);

        if self.executor.is_dynamic() {
            let shapes = ins
                .iter()
                .map(|(_, t)| TensorShape::new(t.sizes()))
                .collect::<kore_delegate::Result<Vec<_>>>()?;
            let out_shapes = self.executor.propagate_shapes(&shapes)?;
            for ((_, t), shape) in outs.iter_mut().zip(&out_shapes) {
                self.executor.resize_output(t, shape)?;
            }
        }

        let mut in_refs: Vec<&mut dyn DelegateTensor> =
            ins.iter_mut().map(|(_, t)| t as &mut dyn DelegateTensor).collect();
        let mut out_refs: Vec<&mut dyn DelegateTensor> =
            outs.iter_mut().map(|(_, t)| t as &mut dyn DelegateTensor).collect();
        trace!(backend = %self.backend, "invoking delegate");
        self.executor.execute(&mut in_refs, &mut out_refs, ctx)?;
        Ok(())
    }
}

pub struct Method {
    name: String,
    values: Vec<Value>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    instructions: Vec<Instruction>,
    delegates: Vec<DelegateHandle>,
    memory: MemoryManager,
    ctx: ExecutionContext,
}

impl Method {
    /// Build method `name` of `program` in `memory`.
    pub fn load(
        program: &Program,
        name: &str,
        memory: MemoryManager,
        event_tracer: Option<Arc<dyn EventTracer>>,
    ) -> Result<Self> {
        let def = program.method(name)?;

        let values = def
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| build_value(program, &memory, i, v))
            .collect::<Result<Vec<_>>>()?;

        let mut delegates = Vec::with_capacity(def.delegates.len());
        for (i, d) in def.delegates.iter().enumerate() {
            let backend = get_backend(&d.backend).ok_or_else(|| {
                EdgeError::NotSupported(format!("backend '{}' is not registered", d.backend))
            })?;
            let blob = program.segment_data(d.segment)?;
            let executor =
                BackendCompiler::new(backend.as_ref()).compile(&blob, &d.compile_specs, memory.method_allocator())?;
            debug!(method = name, delegate = i, backend = %d.backend, "compiled delegate");
            delegates.push(DelegateHandle { backend: d.backend.clone(), executor });
        }

        let instructions = def
            .instructions
            .iter()
            .enumerate()
            .map(|(n, inst)| resolve_instruction(def, n, inst, &mut delegates))
            .collect::<Result<Vec<_>>>()?;

        for &i in def.inputs.iter().chain(&def.outputs) {
            if i >= values.len() {
                return Err(EdgeError::program(format!(
                    "method '{}' refers to value {} of {}",
                    name,
                    i,
                    values.len()
                )));
            }
        }

        let mut ctx = ExecutionContext::new().with_method(name);
        if let Some(tracer) = event_tracer {
            ctx = ctx.with_tracer(tracer);
        }

        info!(
            method = name,
            values = values.len(),
            instructions = instructions.len(),
            delegates = delegates.len(),
            arena_used = memory.method_allocator().used(),
            "loaded method"
        );
        Ok(Self {
            name: name.to_string(),
            values,
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            instructions,
            delegates,
            memory,
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Point output `index` at caller memory, so every later execution
    /// writes that result straight into `data`.
    ///
    /// The output must be a tensor whose current shape fits in `len` values.
    /// A dynamic output may then shrink or grow up to `len`, but never
    /// moves off the caller's buffer.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of `len` f32 values for as
    /// long as this method may run, and must not be accessed elsewhere while
    /// it does. The loan ends when the method is dropped or the output is
    /// pointed somewhere else.
    pub unsafe fn set_output_data_ptr(&mut self, index: usize, data: NonNull<f32>, len: usize) -> Result<()> {
        let &value = self.outputs.get(index).ok_or_else(|| {
            EdgeError::invalid(format!(
                "output index {} out of range ({} outputs)",
                index,
                self.outputs.len()
            ))
        })?;
        match &mut self.values[value] {
            Value::Tensor(t) => t.set_storage(Storage::External { ptr: data, capacity: len })?,
            other => {
                return Err(EdgeError::invalid(format!(
                    "output {} is {}, not a tensor",
                    index,
                    other.tag()
                )))
            }
        }
        debug!(method = %self.name, output = index, capacity = len, "output bound to caller memory");
        Ok(())
    }

    /// Run with `inputs` and return copies of the outputs.
    pub fn execute(&mut self, inputs: &[EValue]) -> Result<Vec<EValue>> {
        if inputs.len() != self.inputs.len() {
            return Err(EdgeError::invalid(format!(
                "expected {} inputs but given {}",
                self.inputs.len(),
                inputs.len()
            )));
        }
        for (&index, input) in self.inputs.iter().zip(inputs) {
            self.values[index].set(input)?;
        }

        for instruction in &self.instructions {
            match instruction {
                Instruction::Kernel { op, args } => run_kernel(*op, &mut self.values, args)?,
                Instruction::Delegate { delegate, inputs, outputs } => {
                    self.delegates[*delegate].execute(&mut self.values, inputs, outputs, &self.ctx)?
                }
            }
        }

        self.outputs.iter().map(|&i| self.values[i].to_evalue()).collect()
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("instructions", &self.instructions.len())
            .field("delegates", &self.delegates.len())
            .finish()
    }
}

fn build_value(program: &Program, memory: &MemoryManager, index: usize, def: &ValueDef) -> Result<Value> {
    Ok(match def {
        ValueDef::Tensor(t) => Value::Tensor(build_tensor(program, memory, index, t)?),
        ValueDef::Int { value } => Value::Int(*value),
        ValueDef::Double { value } => Value::Double(*value),
        ValueDef::Bool { value } => Value::Bool(*value),
        ValueDef::None => Value::None,
    })
}

fn build_tensor(program: &Program, memory: &MemoryManager, index: usize, def: &TensorDef) -> Result<Tensor> {
    let arena = memory.method_allocator();
    let nbytes = def.nbytes().ok_or_else(|| {
        EdgeError::program(format!("value {} shape {:?} is too large to address", index, def.sizes))
    })?;

    if let Some(c) = def.constant {
        let bytes = program.constant_data(c)?;
        if bytes.len() != nbytes {
            return Err(EdgeError::program(format!(
                "constant {} holds {} bytes, value {} needs {}",
                c,
                bytes.len(),
                index,
                nbytes
            )));
        }
        let mut tensor = Tensor::allocate(&def.sizes, TensorShapeDynamism::Static, arena)?;
        for (dst, chunk) in tensor.as_f32_mut().iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        return Ok(tensor);
    }

    let tensor = match def.allocation {
        Some(allocation) => {
            let storage = memory.planned_memory().tensor_storage(allocation, def.numel())?;
            Tensor::new(&def.sizes, def.dynamism, storage)?
        }
        None => Tensor::allocate(&def.sizes, def.dynamism, arena)?,
    };
    Ok(match def.dynamism {
        TensorShapeDynamism::DynamicUnbound => tensor.with_growth(arena),
        _ => tensor,
    })
}

fn resolve_instruction(
    def: &MethodDef,
    n: usize,
    inst: &InstructionDef,
    delegates: &mut [DelegateHandle],
) -> Result<Instruction> {
    match inst {
        InstructionDef::Kernel { op, args } => {
            let op = OpKind::from_str(op)
                .map_err(|e| EdgeError::program(format!("instruction {}: {}", n, e)))?;
            if args.len() != op.arity() + 1 {
                return Err(EdgeError::program(format!(
                    "instruction {}: {} takes {} args, got {}",
                    n,
                    op,
                    op.arity() + 1,
                    args.len()
                )));
            }
            Ok(Instruction::Kernel { op, args: args.clone() })
        }
        InstructionDef::Delegate { delegate, args } => {
            let handle = delegates.get_mut(*delegate).ok_or_else(|| {
                EdgeError::program(format!(
                    "instruction {} calls delegate {} of {}",
                    n,
                    delegate,
                    def.delegates.len()
                ))
            })?;
            let executor = &mut handle.executor;
            if args.len() != executor.argument_count() {
                return Err(EdgeError::program(format!(
                    "instruction {}: delegate takes {} args, got {}",
                    n,
                    executor.argument_count(),
                    args.len()
                )));
            }

            // args[i] belongs to the i-th smallest argument ID.
            let mut slot_of = HashMap::with_capacity(args.len());
            for (slot, &value) in args.iter().enumerate() {
                slot_of.insert(executor.argument_at(slot)?, value);
            }
            let lookup = |ids: &[u32]| -> Result<Vec<usize>> {
                ids.iter()
                    .map(|id| {
                        slot_of.get(id).copied().ok_or_else(|| {
                            EdgeError::program(format!("delegate argument {} has no slot", id))
                        })
                    })
                    .collect()
            };
            Ok(Instruction::Delegate {
                delegate: *delegate,
                inputs: lookup(executor.input_ids())?,
                outputs: lookup(executor.output_ids())?,
            })
        }
    }
}
