use std::collections::HashMap;
use std::ptr::NonNull;
use std::time::Instant;

use kore_kernels::{numel, OpKind};
use smallvec::SmallVec;
use tracing::debug;

use crate::arena::ArenaSlice;
use crate::backend::{ExternalValue, GraphDef, NativeRuntime, NativeStatus, OperatorTiming};
use crate::compile_spec::Precision;
use crate::segment::ValueKind;
use crate::shape::TensorShape;

type Dims = SmallVec<[usize; 4]>;
type Status<T> = std::result::Result<T, NativeStatus>;

#[derive(Clone, Copy)]
struct Bound {
    ptr: NonNull<f32>,
    len: usize,
}

enum Storage {
    Constant(ArenaSlice),
    Scratch(Vec<f32>),
    External(Option<Bound>),
}

struct Slot {
    id: u32,
    kind: ValueKind,
    dynamic: bool,
    declared: Dims,
    dims: Dims,
    storage: Storage,
}

struct Node {
    op: OpKind,
    inputs: SmallVec<[usize; 2]>,
    output: usize,
}

enum OutBuf {
    Owned(Vec<f32>),
    Bound(Bound),
}

/// Compiled graph for [`super::CpuBackend`].
///
/// Intermediate values live in owned scratch buffers sized by the last shape
/// propagation; inputs and outputs point at caller memory between `setup`
/// and the end of the following `invoke`.
pub struct CpuRuntime {
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
    nodes: Vec<Node>,
    precision: Precision,
    profiling: bool,
    timings: Vec<OperatorTiming>,
    ready: bool,
    released: bool,
}

impl CpuRuntime {
    pub fn build(graph: GraphDef, precision: Precision) -> Status<Self> {
        let mut slots = Vec::with_capacity(graph.values.len());
        let mut index = HashMap::with_capacity(graph.values.len());
        for value in graph.values {
            if index.insert(value.id, slots.len()).is_some() {
                return Err(NativeStatus::InvalidParameter);
            }
            let storage = match value.kind {
                ValueKind::Constant => {
                    let data = value.data.ok_or(NativeStatus::InvalidParameter)?;
                    if data.as_f32().len() < numel(&value.dims) {
                        return Err(NativeStatus::InvalidParameter);
                    }
                    Storage::Constant(data)
                }
                ValueKind::Internal => Storage::Scratch(Vec::new()),
                ValueKind::Input | ValueKind::Output => Storage::External(None),
            };
            let dims = Dims::from_slice(&value.dims);
            slots.push(Slot {
                id: value.id,
                kind: value.kind,
                dynamic: value.dynamic,
                declared: dims.clone(),
                dims,
                storage,
            });
        }

        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for node in graph.nodes {
            let lookup = |id: u32| index.get(&id).copied().ok_or(NativeStatus::InvalidParameter);
            let output = lookup(node.output)?;
            if !matches!(slots[output].kind, ValueKind::Internal | ValueKind::Output)
                || node.inputs.contains(&node.output)
            {
                return Err(NativeStatus::InvalidParameter);
            }
            let inputs = node.inputs.iter().map(|&id| lookup(id)).collect::<Status<_>>()?;
            nodes.push(Node { op: node.op, inputs, output });
        }

        let mut runtime = Self {
            slots,
            index,
            nodes,
            precision,
            profiling: false,
            timings: Vec::new(),
            ready: false,
            released: false,
        };
        runtime.propagate()?;
        Ok(runtime)
    }

    fn slot_mut(&mut self, id: u32) -> Status<&mut Slot> {
        let &idx = self.index.get(&id).ok_or(NativeStatus::InvalidParameter)?;
        Ok(&mut self.slots[idx])
    }

    fn propagate(&mut self) -> Status<()> {
        for node in &self.nodes {
            let out = {
                let in_dims: SmallVec<[&[usize]; 2]> =
                    node.inputs.iter().map(|&s| self.slots[s].dims.as_slice()).collect();
                node.op.infer_shape(&in_dims).map_err(|e| {
                    debug!(op = %node.op, error = %e, "shape propagation failed");
                    NativeStatus::InvalidParameter
                })?
            };
            let slot = &mut self.slots[node.output];
            if !slot.dynamic && slot.declared.as_slice() != out.as_slice() {
                debug!(value = slot.id, declared = ?slot.declared, derived = ?out, "static value changed shape");
                return Err(NativeStatus::InvalidParameter);
            }
            slot.dims = Dims::from_vec(out);
            if let Storage::Scratch(buf) = &mut slot.storage {
                buf.resize(numel(&slot.dims), 0.0);
            }
        }
        Ok(())
    }

    fn unbind(&mut self) {
        for slot in &mut self.slots {
            if let Storage::External(bound) = &mut slot.storage {
                *bound = None;
            }
        }
        self.ready = false;
    }

    fn attach(&mut self, externals: &[ExternalValue]) -> Status<()> {
        let mut reshaped = false;
        for ext in externals {
            let slot = self.slot_mut(ext.id())?;
            if !slot.kind.is_external() {
                return Err(NativeStatus::InvalidParameter);
            }
            if ext.data().as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
                return Err(NativeStatus::InvalidParameter);
            }
            if let Some(shape) = ext.shape() {
                if slot.kind == ValueKind::Input && shape.dims() != slot.dims.as_slice() {
                    if !slot.dynamic {
                        return Err(NativeStatus::InvalidParameter);
                    }
                    slot.dims = Dims::from_slice(shape.dims());
                    reshaped = true;
                }
            }
            slot.storage = Storage::External(Some(Bound { ptr: ext.data().cast(), len: ext.nbytes() / 4 }));
        }
        if reshaped {
            self.propagate()?;
        }
        for slot in &self.slots {
            if let Storage::External(bound) = &slot.storage {
                match bound {
                    Some(b) if b.len >= numel(&slot.dims) => {}
                    _ => return Err(NativeStatus::InvalidParameter),
                }
            }
        }
        Ok(())
    }

    fn view(&self, slot: usize) -> Option<&[f32]> {
        match &self.slots[slot].storage {
            Storage::Constant(data) => Some(data.as_f32()),
            Storage::Scratch(buf) => Some(buf.as_slice()),
            // SAFETY: bound pointers are valid for `len` f32s until invoke returns.
            Storage::External(Some(b)) => Some(unsafe { std::slice::from_raw_parts(b.ptr.as_ptr(), b.len) }),
            Storage::External(None) => None,
        }
    }

    fn run_node(&self, ni: usize, out: &mut OutBuf) -> Status<()> {
        let node = &self.nodes[ni];
        let mut inputs: SmallVec<[(&[f32], &[usize]); 2]> = SmallVec::new();
        for &s in &node.inputs {
            let data = self.view(s).ok_or(NativeStatus::InvalidState)?;
            inputs.push((data, self.slots[s].dims.as_slice()));
        }
        let out_dims = self.slots[node.output].dims.as_slice();
        let buf: &mut [f32] = match out {
            OutBuf::Owned(v) => v.as_mut_slice(),
            // SAFETY: see `view`; outputs never alias a node's inputs.
            OutBuf::Bound(b) => unsafe { std::slice::from_raw_parts_mut(b.ptr.as_ptr(), b.len) },
        };
        node.op.run(&inputs, buf, out_dims).map_err(|e| {
            debug!(op = %node.op, error = %e, "cpu kernel failed");
            NativeStatus::ExecutionFailed
        })?;
        if self.precision == Precision::Fp16 {
            for v in &mut buf[..numel(out_dims)] {
                *v = half::f16::from_f32(*v).to_f32();
            }
        }
        Ok(())
    }

    fn run_nodes(&mut self) -> Status<()> {
        for ni in 0..self.nodes.len() {
            let started = self.profiling.then(Instant::now);
            let out_slot = self.nodes[ni].output;
            let mut out = match &mut self.slots[out_slot].storage {
                Storage::Scratch(buf) => OutBuf::Owned(std::mem::take(buf)),
                Storage::External(Some(b)) => OutBuf::Bound(*b),
                _ => return Err(NativeStatus::InvalidState),
            };

            let result = self.run_node(ni, &mut out);
            if let OutBuf::Owned(v) = out {
                if let Storage::Scratch(buf) = &mut self.slots[out_slot].storage {
                    *buf = v;
                }
            }
            result?;
            if let Some(started) = started {
                let op = self.nodes[ni].op;
                self.timings.push(OperatorTiming { name: op.as_str().to_string(), duration: started.elapsed() });
            }
        }
        Ok(())
    }
}

impl NativeRuntime for CpuRuntime {
    fn reshape_external(&mut self, id: u32, shape: &TensorShape) -> Status<()> {
        let slot = self.slot_mut(id)?;
        if !slot.kind.is_external() {
            return Err(NativeStatus::InvalidParameter);
        }
        if slot.dims.as_slice() == shape.dims() {
            return Ok(());
        }
        if !slot.dynamic {
            return Err(NativeStatus::InvalidParameter);
        }
        slot.dims = Dims::from_slice(shape.dims());
        Ok(())
    }

    fn reshape(&mut self) -> Status<()> {
        if self.released {
            return Err(NativeStatus::Uninitialized);
        }
        self.propagate()
    }

    fn external_shape(&self, id: u32) -> Status<TensorShape> {
        let &idx = self.index.get(&id).ok_or(NativeStatus::InvalidParameter)?;
        TensorShape::new(&self.slots[idx].dims).map_err(|_| NativeStatus::InvalidParameter)
    }

    unsafe fn setup(&mut self, externals: &[ExternalValue]) -> Status<()> {
        if self.released {
            return Err(NativeStatus::Uninitialized);
        }
        self.unbind();
        match self.attach(externals) {
            Ok(()) => {
                self.ready = true;
                Ok(())
            }
            Err(status) => {
                self.unbind();
                Err(status)
            }
        }
    }

    fn invoke(&mut self) -> Status<()> {
        if self.released || !self.ready {
            return Err(NativeStatus::Uninitialized);
        }
        self.timings.clear();
        let result = self.run_nodes();
        self.unbind();
        result
    }

    fn enable_profiling(&mut self) -> Status<()> {
        self.profiling = true;
        Ok(())
    }

    fn operator_timings(&self) -> Vec<OperatorTiming> {
        self.timings.clone()
    }

    fn release(&mut self) {
        self.unbind();
        self.slots.clear();
        self.nodes.clear();
        self.index.clear();
        self.released = true;
    }
}
