//! `.korf` program container: single-file, mmap-friendly.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "KORF" (4 bytes)          │
//! │ Version: u32 LE                  │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (methods, data index)│
//! ├──────────────────────────────────┤
//! │ Padding to 64-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Data region (segments, constants)│
//! └──────────────────────────────────┘
//! ```
//!
//! Delegate segments and constant tensors live in the data region and are
//! addressed by [`DataRange`]s relative to its start.

use kore_delegate::CompileSpec;
use kore_kernels::OpKind;
use serde::{Deserialize, Serialize};

use crate::{EdgeError, Result};

/// Magic bytes identifying a program container.
pub const MAGIC: &[u8; 4] = b"KORF";

/// Current format version.
pub const VERSION: u32 = 1;

/// Bytes before the header JSON: magic, version, header size.
pub const PREAMBLE: usize = 12;

/// Alignment of the data region and of every entry inside it.
pub const DATA_ALIGNMENT: usize = 64;

/// Alignment of tensors inside a planned buffer.
pub const PLAN_ALIGNMENT: usize = 16;

/// How a tensor's shape may change between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorShapeDynamism {
    /// Fixed shape.
    #[default]
    Static,
    /// Any shape up to the declared sizes.
    DynamicBound,
    /// Any shape; grows its storage when needed.
    DynamicUnbound,
}

/// Location of a tensor in the memory plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub buffer_id: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDef {
    /// Initial sizes; the upper bound for `DynamicBound` tensors.
    pub sizes: Vec<usize>,
    #[serde(default)]
    pub dynamism: TensorShapeDynamism,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
    /// Index into the program's constant table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<usize>,
}

impl TensorDef {
    pub fn numel(&self) -> usize {
        kore_kernels::numel(&self.sizes)
    }

    /// Byte size as f32, or `None` if the shape can't be addressed.
    pub fn nbytes(&self) -> Option<usize> {
        kore_kernels::checked_nbytes(&self.sizes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueDef {
    Tensor(TensorDef),
    Int { value: i64 },
    Double { value: f64 },
    Bool { value: bool },
    None,
}

impl ValueDef {
    pub fn as_tensor(&self) -> Option<&TensorDef> {
        match self {
            ValueDef::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionDef {
    /// Portable kernel. `args` lists the input values followed by the output.
    Kernel { op: String, args: Vec<usize> },
    /// Delegated subgraph. `args` maps each external argument slot, in
    /// ascending argument-ID order, to a value index.
    Delegate { delegate: usize, args: Vec<usize> },
}

/// A subgraph handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateDef {
    pub backend: String,
    /// Index into the program's segment table.
    pub segment: usize,
    #[serde(default)]
    pub compile_specs: Vec<CompileSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub values: Vec<ValueDef>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub instructions: Vec<InstructionDef>,
    /// Byte size of each planned buffer.
    #[serde(default)]
    pub planned_buffers: Vec<usize>,
    #[serde(default)]
    pub delegates: Vec<DelegateDef>,
}

/// Byte range relative to the start of the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub offset: usize,
    pub size: usize,
}

impl DataRange {
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramHeader {
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub segments: Vec<DataRange>,
    #[serde(default)]
    pub constants: Vec<DataRange>,
}

/// Parsed preamble: where the header sits and where data begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub header_size: usize,
}

impl Preamble {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE {
            return Err(EdgeError::program(format!(
                "file too small for program container: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(EdgeError::program("invalid magic bytes (expected KORF)"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != VERSION {
            return Err(EdgeError::program(format!("unsupported version: {}", version)));
        }
        let header_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        Ok(Self { header_size })
    }

    pub fn header_end(&self) -> usize {
        PREAMBLE + self.header_size
    }

    pub fn data_start(&self) -> usize {
        align_up(self.header_end(), DATA_ALIGNMENT)
    }
}

/// Round `n` up to the next multiple of `align`.
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn f32_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Builder for program containers, used by export tooling and tests.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    header: ProgramHeader,
    data: Vec<u8>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a delegate segment; returns its index.
    pub fn add_segment(&mut self, bytes: &[u8]) -> usize {
        let range = self.push_data(bytes);
        self.header.segments.push(range);
        self.header.segments.len() - 1
    }

    /// Store an f32 constant; returns its index.
    pub fn add_constant_f32(&mut self, data: &[f32]) -> usize {
        let range = self.push_data(&f32_bytes(data));
        self.header.constants.push(range);
        self.header.constants.len() - 1
    }

    pub fn add_method(&mut self, method: MethodDef) -> &mut Self {
        self.header.methods.push(method);
        self
    }

    pub fn header(&self) -> &ProgramHeader {
        &self.header
    }

    /// Serialize to container bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        let header_bytes = serde_json::to_vec(&self.header)?;
        let header_size = u32::try_from(header_bytes.len())
            .map_err(|_| EdgeError::program("program header larger than 4 GiB"))?;

        let data_start = align_up(PREAMBLE + header_bytes.len(), DATA_ALIGNMENT);
        let mut buf = Vec::with_capacity(data_start + self.data.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.resize(data_start, 0);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    fn push_data(&mut self, bytes: &[u8]) -> DataRange {
        let offset = align_up(self.data.len(), DATA_ALIGNMENT);
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);
        DataRange { offset, size: bytes.len() }
    }
}

/// Builder for one method. Planned tensors are packed into buffer 0.
#[derive(Debug)]
pub struct MethodBuilder {
    def: MethodDef,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: MethodDef {
                name: name.into(),
                values: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                instructions: Vec::new(),
                planned_buffers: Vec::new(),
                delegates: Vec::new(),
            },
        }
    }

    /// Add a tensor placed in the memory plan; returns its value index.
    pub fn add_planned_tensor(&mut self, sizes: &[usize], dynamism: TensorShapeDynamism) -> usize {
        if self.def.planned_buffers.is_empty() {
            self.def.planned_buffers.push(0);
        }
        let offset = align_up(self.def.planned_buffers[0], PLAN_ALIGNMENT);
        let tensor = TensorDef {
            sizes: sizes.to_vec(),
            dynamism,
            allocation: Some(Allocation { buffer_id: 0, offset }),
            constant: None,
        };
        self.def.planned_buffers[0] = tensor
            .nbytes()
            .and_then(|n| offset.checked_add(n))
            .unwrap_or(usize::MAX);
        self.push_value(ValueDef::Tensor(tensor))
    }

    /// Add a tensor with no planned location. Its storage comes from the
    /// method allocator at load time.
    pub fn add_tensor(&mut self, sizes: &[usize], dynamism: TensorShapeDynamism) -> usize {
        self.push_value(ValueDef::Tensor(TensorDef {
            sizes: sizes.to_vec(),
            dynamism,
            allocation: None,
            constant: None,
        }))
    }

    /// Add a tensor backed by constant `index` of the program.
    pub fn add_constant_tensor(&mut self, sizes: &[usize], constant: usize) -> usize {
        self.push_value(ValueDef::Tensor(TensorDef {
            sizes: sizes.to_vec(),
            dynamism: TensorShapeDynamism::Static,
            allocation: None,
            constant: Some(constant),
        }))
    }

    pub fn add_int(&mut self, value: i64) -> usize {
        self.push_value(ValueDef::Int { value })
    }

    pub fn add_double(&mut self, value: f64) -> usize {
        self.push_value(ValueDef::Double { value })
    }

    pub fn add_bool(&mut self, value: bool) -> usize {
        self.push_value(ValueDef::Bool { value })
    }

    pub fn add_none(&mut self) -> usize {
        self.push_value(ValueDef::None)
    }

    pub fn add_value(&mut self, value: ValueDef) -> usize {
        self.push_value(value)
    }

    pub fn add_input(&mut self, value: usize) -> &mut Self {
        self.def.inputs.push(value);
        self
    }

    pub fn add_output(&mut self, value: usize) -> &mut Self {
        self.def.outputs.push(value);
        self
    }

    pub fn add_kernel(&mut self, op: OpKind, inputs: &[usize], output: usize) -> &mut Self {
        let mut args = inputs.to_vec();
        args.push(output);
        self.def.instructions.push(InstructionDef::Kernel { op: op.as_str().to_string(), args });
        self
    }

    /// Declare a delegate over segment `segment`; returns its index.
    pub fn add_delegate(&mut self, backend: &str, segment: usize, compile_specs: Vec<CompileSpec>) -> usize {
        self.def.delegates.push(DelegateDef {
            backend: backend.to_string(),
            segment,
            compile_specs,
        });
        self.def.delegates.len() - 1
    }

    /// Call delegate `delegate` with `args` in ascending argument-ID order.
    pub fn add_delegate_call(&mut self, delegate: usize, args: &[usize]) -> &mut Self {
        self.def.instructions.push(InstructionDef::Delegate { delegate, args: args.to_vec() });
        self
    }

    pub fn add_instruction(&mut self, instruction: InstructionDef) -> &mut Self {
        self.def.instructions.push(instruction);
        self
    }

    pub fn build(self) -> MethodDef {
        self.def
    }

    fn push_value(&mut self, value: ValueDef) -> usize {
        self.def.values.push(value);
        self.def.values.len() - 1
    }
}
