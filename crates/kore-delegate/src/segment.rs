//! Serialized delegate segment: the opaque blob a backend compiles.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "KDSG" (4 bytes)          │
//! │ Version: u32 LE                  │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (values, nodes, I/O) │
//! ├──────────────────────────────────┤
//! │ Padding to 16-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Constant blob                    │
//! └──────────────────────────────────┘
//! ```
//!
//! The header lists every graph value with its argument ID. Input and output
//! IDs appear in the order the surrounding program declares them, which is
//! not necessarily ascending.

use kore_kernels::OpKind;
use serde::{Deserialize, Serialize};

use crate::arena::align_up;
use crate::{DelegateError, Result};

/// Magic bytes identifying a delegate segment.
pub const MAGIC: &[u8; 4] = b"KDSG";

/// Current segment version.
pub const VERSION: u32 = 1;

const PREAMBLE: usize = 12;
const BLOB_ALIGNMENT: usize = 16;

/// Storage type of a value. Computation is always f32; f16 only affects
/// how constants are stored in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentDType {
    F32,
    F16,
}

impl SegmentDType {
    pub fn storage_bytes(&self, n: usize) -> usize {
        match self {
            SegmentDType::F32 => n * 4,
            SegmentDType::F16 => n * 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Internal,
    Input,
    Output,
    Constant,
}

impl ValueKind {
    /// Inputs and outputs are external: their memory is supplied per call.
    pub fn is_external(&self) -> bool {
        matches!(self, ValueKind::Input | ValueKind::Output)
    }
}

/// Byte range inside the constant blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantRef {
    pub offset: usize,
    pub nbytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDef {
    pub id: u32,
    pub dtype: SegmentDType,
    pub dims: Vec<usize>,
    pub kind: ValueKind,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<ConstantRef>,
}

impl ValueDef {
    /// Element count. Exact for any value accepted by [`Segment::parse`].
    pub fn numel(&self) -> usize {
        kore_kernels::numel(&self.dims)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    pub op: String,
    pub inputs: Vec<u32>,
    pub output: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub values: Vec<ValueDef>,
    pub nodes: Vec<NodeDef>,
    pub input_ids: Vec<u32>,
    pub output_ids: Vec<u32>,
}

/// A parsed segment borrowing its constant blob from the source buffer.
#[derive(Debug)]
pub struct Segment<'a> {
    pub header: SegmentHeader,
    constants: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Parse and validate the framing and constant ranges of a segment.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < PREAMBLE {
            return Err(DelegateError::invalid(format!(
                "segment too small: {} bytes",
                data.len()
            )));
        }
        if &data[0..4] != MAGIC {
            return Err(DelegateError::invalid("bad segment magic (expected KDSG)"));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(DelegateError::invalid(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let header_end = PREAMBLE
            .checked_add(header_size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| DelegateError::invalid("segment header exceeds buffer"))?;

        let header: SegmentHeader = serde_json::from_slice(&data[PREAMBLE..header_end])
            .map_err(|e| DelegateError::invalid(format!("segment header: {}", e)))?;

        let blob_start = align_up(header_end, BLOB_ALIGNMENT).min(data.len());
        let constants = &data[blob_start..];

        for value in &header.values {
            if kore_kernels::checked_nbytes(&value.dims).is_none() {
                return Err(DelegateError::invalid(format!(
                    "value {} shape {:?} is too large to address",
                    value.id, value.dims
                )));
            }
            match (value.kind, value.constant) {
                (ValueKind::Constant, Some(range)) => {
                    let end = range.offset.checked_add(range.nbytes);
                    if end.map_or(true, |end| end > constants.len()) {
                        return Err(DelegateError::invalid(format!(
                            "constant {} range {}+{} exceeds blob of {} bytes",
                            value.id,
                            range.offset,
                            range.nbytes,
                            constants.len()
                        )));
                    }
                    let expected = value.dtype.storage_bytes(value.numel());
                    if range.nbytes != expected {
                        return Err(DelegateError::invalid(format!(
                            "constant {} holds {} bytes, shape needs {}",
                            value.id, range.nbytes, expected
                        )));
                    }
                }
                (ValueKind::Constant, None) => {
                    return Err(DelegateError::invalid(format!(
                        "constant {} has no data",
                        value.id
                    )));
                }
                _ => {}
            }
        }

        Ok(Segment { header, constants })
    }

    /// Raw bytes of a constant value.
    pub fn constant_bytes(&self, value: &ValueDef) -> Option<&'a [u8]> {
        let range = value.constant?;
        self.constants.get(range.offset..range.offset + range.nbytes)
    }

    pub fn value(&self, id: u32) -> Option<&ValueDef> {
        self.header.values.iter().find(|v| v.id == id)
    }
}

/// Writer for delegate segments, used by ahead-of-time tooling and tests.
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    header: SegmentHeader,
    blob: Vec<u8>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input; inputs are declared in call order.
    pub fn add_input(&mut self, id: u32, dims: &[usize], dynamic: bool) -> &mut Self {
        self.push_value(id, SegmentDType::F32, dims, ValueKind::Input, dynamic, None);
        self.header.input_ids.push(id);
        self
    }

    /// Add an output; outputs are declared in call order.
    pub fn add_output(&mut self, id: u32, dims: &[usize], dynamic: bool) -> &mut Self {
        self.push_value(id, SegmentDType::F32, dims, ValueKind::Output, dynamic, None);
        self.header.output_ids.push(id);
        self
    }

    pub fn add_internal(&mut self, id: u32, dims: &[usize], dynamic: bool) -> &mut Self {
        self.push_value(id, SegmentDType::F32, dims, ValueKind::Internal, dynamic, None);
        self
    }

    pub fn add_constant_f32(&mut self, id: u32, dims: &[usize], data: &[f32]) -> &mut Self {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let range = self.push_blob(&bytes);
        self.push_value(id, SegmentDType::F32, dims, ValueKind::Constant, false, Some(range));
        self
    }

    /// Add a constant stored as f16.
    pub fn add_constant_f16(&mut self, id: u32, dims: &[usize], data: &[f32]) -> &mut Self {
        let bytes: Vec<u8> = data
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect();
        let range = self.push_blob(&bytes);
        self.push_value(id, SegmentDType::F16, dims, ValueKind::Constant, false, Some(range));
        self
    }

    pub fn add_node(&mut self, op: OpKind, inputs: &[u32], output: u32) -> &mut Self {
        self.header.nodes.push(NodeDef {
            op: op.as_str().to_string(),
            inputs: inputs.to_vec(),
            output,
        });
        self
    }

    /// Raw node with an arbitrary op tag.
    pub fn add_node_tag(&mut self, op: &str, inputs: &[u32], output: u32) -> &mut Self {
        self.header.nodes.push(NodeDef { op: op.to_string(), inputs: inputs.to_vec(), output });
        self
    }

    /// Serialize to segment bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        let header_bytes = serde_json::to_vec(&self.header)
            .map_err(|e| DelegateError::internal(format!("serialize segment header: {}", e)))?;
        let header_size = u32::try_from(header_bytes.len())
            .map_err(|_| DelegateError::invalid("segment header larger than 4 GiB"))?;

        let blob_start = align_up(PREAMBLE + header_bytes.len(), BLOB_ALIGNMENT);
        let mut buf = Vec::with_capacity(blob_start + self.blob.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.resize(blob_start, 0);
        buf.extend_from_slice(&self.blob);
        Ok(buf)
    }

    fn push_blob(&mut self, bytes: &[u8]) -> ConstantRef {
        let offset = align_up(self.blob.len(), BLOB_ALIGNMENT);
        self.blob.resize(offset, 0);
        self.blob.extend_from_slice(bytes);
        ConstantRef { offset, nbytes: bytes.len() }
    }

    fn push_value(
        &mut self,
        id: u32,
        dtype: SegmentDType,
        dims: &[usize],
        kind: ValueKind,
        dynamic: bool,
        constant: Option<ConstantRef>,
    ) {
        self.header.values.push(ValueDef {
            id,
            dtype,
            dims: dims.to_vec(),
            kind,
            dynamic,
            constant,
        });
    }
}
