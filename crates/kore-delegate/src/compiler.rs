//! Turns a serialized delegate segment into a [`BackendExecutor`].

use std::collections::HashSet;

use kore_kernels::OpKind;
use tracing::{debug, info};

use crate::arena::{Arena, ArenaSlice};
use crate::backend::{translate_status, GraphBackend, GraphDef, GraphNode, GraphValue};
use crate::compile_spec::{BackendConfig, CompileSpec};
use crate::executor::{BackendExecutor, ExecutorBuilder};
use crate::segment::{Segment, SegmentDType, ValueDef, ValueKind};
use crate::shape::TensorShape;
use crate::{DelegateError, Result};

/// One-shot compiler for a single backend.
///
/// Each `compile` call produces a fresh executor; an executor is never
/// compiled into twice.
pub struct BackendCompiler<'b> {
    backend: &'b dyn GraphBackend,
}

impl<'b> BackendCompiler<'b> {
    pub fn new(backend: &'b dyn GraphBackend) -> Self {
        Self { backend }
    }

    /// Compile `blob` with the given options.
    ///
    /// Constant data the executor keeps is allocated from `arena`.
    pub fn compile(&self, blob: &[u8], specs: &[CompileSpec], arena: &Arena) -> Result<BackendExecutor> {
        if blob.is_empty() {
            return Err(DelegateError::invalid("empty delegate segment"));
        }
        let backend = self.backend.name();
        if !self.backend.is_available() {
            return Err(DelegateError::unsupported(format!("backend {} is not available", backend)));
        }

        let segment = Segment::parse(blob)?;
        let config = BackendConfig::from_specs(specs)?;
        self.backend.check_config(&config)?;

        let header = &segment.header;
        debug!(
            backend,
            values = header.values.len(),
            nodes = header.nodes.len(),
            precision = config.precision.as_str(),
            "compiling delegate segment"
        );

        let mut builder = ExecutorBuilder::new();
        let mut seen = HashSet::with_capacity(header.values.len());
        let mut values = Vec::with_capacity(header.values.len());
        for def in &header.values {
            if !seen.insert(def.id) {
                return Err(DelegateError::invalid(format!("value {} defined twice", def.id)));
            }
            TensorShape::new(&def.dims)?;
            if def.kind.is_external() {
                builder.register_argument(def.id);
            }
            let data = match def.kind {
                ValueKind::Constant => Some(decode_constant(&segment, def, arena)?),
                _ => None,
            };
            values.push(GraphValue {
                id: def.id,
                dims: def.dims.clone(),
                kind: def.kind,
                dynamic: def.dynamic,
                data,
            });
        }

        let mut nodes = Vec::with_capacity(header.nodes.len());
        for node in &header.nodes {
            let op: OpKind = node
                .op
                .parse()
                .map_err(|_| DelegateError::unsupported(format!("unknown operator '{}'", node.op)))?;
            if !self.backend.supports(op) {
                return Err(DelegateError::unsupported(format!(
                    "backend {} does not support operator {}",
                    backend, op
                )));
            }
            if node.inputs.len() != op.arity() {
                return Err(DelegateError::invalid(format!(
                    "{} takes {} inputs, node lists {}",
                    op,
                    op.arity(),
                    node.inputs.len()
                )));
            }
            for id in node.inputs.iter().chain(std::iter::once(&node.output)) {
                if !seen.contains(id) {
                    return Err(DelegateError::invalid(format!("{} references undefined value {}", op, id)));
                }
            }
            nodes.push(GraphNode { op, inputs: node.inputs.clone(), output: node.output });
        }

        declare_externals(&mut builder, header.input_ids.as_slice(), &values, ValueKind::Input)?;
        declare_externals(&mut builder, header.output_ids.as_slice(), &values, ValueKind::Output)?;

        let dynamic = values.iter().any(|v| v.dynamic);
        builder.set_dynamic(dynamic);

        let runtime = self
            .backend
            .build_runtime(GraphDef { values, nodes }, &config)
            .map_err(|s| translate_status(s, "backend graph build failed"))?;

        info!(
            backend,
            inputs = header.input_ids.len(),
            outputs = header.output_ids.len(),
            dynamic,
            "compiled delegate segment"
        );
        Ok(builder.finish(runtime, config.profiling))
    }
}

/// Declare `ids` in order after checking they cover exactly the values of `kind`.
fn declare_externals(
    builder: &mut ExecutorBuilder,
    ids: &[u32],
    values: &[GraphValue],
    kind: ValueKind,
) -> Result<()> {
    let what = if kind == ValueKind::Input { "input" } else { "output" };
    let expected = values.iter().filter(|v| v.kind == kind).count();
    if ids.len() != expected {
        return Err(DelegateError::invalid(format!(
            "segment declares {} {}s but defines {}",
            ids.len(),
            what,
            expected
        )));
    }
    let mut declared = HashSet::with_capacity(ids.len());
    for &id in ids {
        let matches = values.iter().any(|v| v.id == id && v.kind == kind);
        if !matches || !declared.insert(id) {
            return Err(DelegateError::invalid(format!("{} {} is not a distinct {} value", what, id, what)));
        }
        if kind == ValueKind::Input {
            builder.declare_input(id);
        } else {
            builder.declare_output(id);
        }
    }
    Ok(())
}

/// Copy a constant into arena memory as f32.
fn decode_constant(segment: &Segment<'_>, def: &ValueDef, arena: &Arena) -> Result<ArenaSlice> {
    let bytes = segment
        .constant_bytes(def)
        .ok_or_else(|| DelegateError::invalid(format!("constant {} has no data", def.id)))?;
    let mut slice = arena.allocate_f32(def.numel())?;
    let out = slice.as_f32_mut();
    match def.dtype {
        SegmentDType::F32 => {
            for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            }
        }
        SegmentDType::F16 => {
            for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *dst = half::f16::from_le_bytes([src[0], src[1]]).to_f32();
            }
        }
    }
    Ok(slice)
}
