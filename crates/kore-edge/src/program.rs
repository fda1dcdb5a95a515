//! A loaded program container: parsed header plus lazy access to its data.

use std::borrow::Cow;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use kore_kernels::OpKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::format::{
    DataRange, InstructionDef, MethodDef, Preamble, ProgramHeader, TensorShapeDynamism, ValueDef,
    PREAMBLE,
};
use crate::loader::DataLoader;
use crate::{EdgeError, Result};

/// How much of the program to check at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Verification {
    /// Framing and header structure only.
    #[default]
    Minimal,
    /// Additionally check every index, range and operator reference.
    InternalConsistency,
}

/// Shape information for one method input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueMeta {
    Tensor { sizes: Vec<usize>, dynamism: TensorShapeDynamism },
    Int,
    Double,
    Bool,
    None,
}

impl ValueMeta {
    fn of(value: &ValueDef) -> Self {
        match value {
            ValueDef::Tensor(t) => ValueMeta::Tensor { sizes: t.sizes.clone(), dynamism: t.dynamism },
            ValueDef::Int { .. } => ValueMeta::Int,
            ValueDef::Double { .. } => ValueMeta::Double,
            ValueDef::Bool { .. } => ValueMeta::Bool,
            ValueDef::None => ValueMeta::None,
        }
    }
}

/// Summary of a method, available without loading it.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodMeta {
    pub name: String,
    pub inputs: Vec<ValueMeta>,
    pub outputs: Vec<ValueMeta>,
    pub planned_buffer_sizes: Vec<usize>,
    pub num_delegates: usize,
    pub num_instructions: usize,
}

pub struct Program {
    loader: Arc<dyn DataLoader>,
    header: ProgramHeader,
    data_start: usize,
}

impl Program {
    /// Parse the container served by `loader`.
    pub fn load(loader: Arc<dyn DataLoader>, verification: Verification) -> Result<Self> {
        let preamble = Preamble::parse(&loader.read(0, PREAMBLE.min(loader.size()))?)?;
        if preamble.header_end() > loader.size() {
            return Err(EdgeError::program(format!(
                "header of {} bytes exceeds file of {} bytes",
                preamble.header_size,
                loader.size()
            )));
        }
        let header: ProgramHeader =
            serde_json::from_slice(&loader.read(PREAMBLE, preamble.header_size)?)?;
        let data_start = preamble.data_start();
        if data_start > loader.size() && !(header.segments.is_empty() && header.constants.is_empty()) {
            return Err(EdgeError::program("data region starts past end of file"));
        }

        let program = Self { loader, header, data_start };
        if verification == Verification::InternalConsistency {
            program.verify()?;
        }
        info!(
            methods = program.header.methods.len(),
            segments = program.header.segments.len(),
            constants = program.header.constants.len(),
            ?verification,
            "loaded program"
        );
        Ok(program)
    }

    pub fn header(&self) -> &ProgramHeader {
        &self.header
    }

    pub fn num_methods(&self) -> usize {
        self.header.methods.len()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.header.methods.iter().map(|m| m.name.clone()).collect()
    }

    pub fn method(&self, name: &str) -> Result<&MethodDef> {
        self.header
            .methods
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| EdgeError::MethodNotFound(name.to_string()))
    }

    pub fn method_meta(&self, name: &str) -> Result<MethodMeta> {
        let def = self.method(name)?;
        let meta_of = |indices: &[usize]| -> Result<Vec<ValueMeta>> {
            indices
                .iter()
                .map(|&i| {
                    def.values.get(i).map(ValueMeta::of).ok_or_else(|| {
                        EdgeError::program(format!("method '{}' refers to missing value {}", name, i))
                    })
                })
                .collect()
        };
        Ok(MethodMeta {
            name: def.name.clone(),
            inputs: meta_of(&def.inputs)?,
            outputs: meta_of(&def.outputs)?,
            planned_buffer_sizes: def.planned_buffers.clone(),
            num_delegates: def.delegates.len(),
            num_instructions: def.instructions.len(),
        })
    }

    /// Bytes of delegate segment `index`.
    pub fn segment_data(&self, index: usize) -> Result<Cow<'_, [u8]>> {
        let range = self.header.segments.get(index).ok_or_else(|| {
            EdgeError::program(format!(
                "segment {} out of range ({} segments)",
                index,
                self.header.segments.len()
            ))
        })?;
        self.read_range(*range)
    }

    /// Bytes of constant `index`.
    pub fn constant_data(&self, index: usize) -> Result<Cow<'_, [u8]>> {
        let range = self.header.constants.get(index).ok_or_else(|| {
            EdgeError::program(format!(
                "constant {} out of range ({} constants)",
                index,
                self.header.constants.len()
            ))
        })?;
        self.read_range(*range)
    }

    fn read_range(&self, range: DataRange) -> Result<Cow<'_, [u8]>> {
        let offset = self
            .data_start
            .checked_add(range.offset)
            .ok_or_else(|| EdgeError::program("data offset overflows"))?;
        self.loader.read(offset, range.size)
    }

    fn data_len(&self) -> usize {
        self.loader.size().saturating_sub(self.data_start)
    }

    fn verify(&self) -> Result<()> {
        let data_len = self.data_len();
        for (what, table) in [("segment", &self.header.segments), ("constant", &self.header.constants)] {
            for (i, range) in table.iter().enumerate() {
                if range.end().map_or(true, |end| end > data_len) {
                    return Err(EdgeError::program(format!(
                        "{} {} range {}+{} exceeds data region of {} bytes",
                        what, i, range.offset, range.size, data_len
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        for method in &self.header.methods {
            if !names.insert(method.name.as_str()) {
                return Err(EdgeError::program(format!("duplicate method '{}'", method.name)));
            }
            self.verify_method(method)?;
        }
        debug!("program passed internal consistency checks");
        Ok(())
    }

    fn verify_method(&self, m: &MethodDef) -> Result<()> {
        let fail = |msg: String| EdgeError::program(format!("method '{}': {}", m.name, msg));
        let check_value = |i: usize, what: &str| {
            if i < m.values.len() {
                Ok(())
            } else {
                Err(fail(format!("{} refers to value {} of {}", what, i, m.values.len())))
            }
        };

        for (i, value) in m.values.iter().enumerate() {
            let Some(t) = value.as_tensor() else { continue };
            let nbytes = t
                .nbytes()
                .ok_or_else(|| fail(format!("value {} shape {:?} is too large to address", i, t.sizes)))?;
            if let Some(c) = t.constant {
                let range = self
                    .header
                    .constants
                    .get(c)
                    .ok_or_else(|| fail(format!("value {} uses missing constant {}", i, c)))?;
                if range.size != nbytes {
                    return Err(fail(format!(
                        "constant {} holds {} bytes, value {} needs {}",
                        c, range.size, i, nbytes
                    )));
                }
            }
            if let Some(a) = t.allocation {
                let size = m
                    .planned_buffers
                    .get(a.buffer_id)
                    .ok_or_else(|| fail(format!("value {} uses missing buffer {}", i, a.buffer_id)))?;
                if a.offset % 4 != 0 || a.offset.checked_add(nbytes).map_or(true, |end| end > *size) {
                    return Err(fail(format!(
                        "value {} at offset {} does not fit buffer {} of {} bytes",
                        i, a.offset, a.buffer_id, size
                    )));
                }
            }
        }

        for &i in &m.inputs {
            check_value(i, "input")?;
        }
        for &i in &m.outputs {
            check_value(i, "output")?;
        }
        for d in &m.delegates {
            if d.segment >= self.header.segments.len() {
                return Err(fail(format!("delegate uses missing segment {}", d.segment)));
            }
        }

        for (n, instruction) in m.instructions.iter().enumerate() {
            match instruction {
                InstructionDef::Kernel { op, args } => {
                    let kind = OpKind::from_str(op).map_err(|e| fail(format!("instruction {}: {}", n, e)))?;
                    if args.len() != kind.arity() + 1 {
                        return Err(fail(format!(
                            "instruction {}: {} takes {} args, got {}",
                            n,
                            op,
                            kind.arity() + 1,
                            args.len()
                        )));
                    }
                    for &a in args {
                        check_value(a, "kernel argument")?;
                    }
                    if let Some(&out) = args.last() {
                        match m.values[out].as_tensor() {
                            Some(t) if t.constant.is_none() => {}
                            _ => {
                                return Err(fail(format!(
                                    "instruction {} writes value {} which is not a mutable tensor",
                                    n, out
                                )))
                            }
                        }
                    }
                }
                InstructionDef::Delegate { delegate, args } => {
                    if *delegate >= m.delegates.len() {
                        return Err(fail(format!("instruction {} calls missing delegate {}", n, delegate)));
                    }
                    for &a in args {
                        check_value(a, "delegate argument")?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("methods", &self.method_names())
            .field("size", &self.loader.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{InstructionDef, MethodBuilder, ProgramBuilder};
    use crate::loader::BufferDataLoader;
    use crate::ErrorKind;

    fn load(bytes: Vec<u8>, v: Verification) -> Result<Program> {
        Program::load(Arc::new(BufferDataLoader::new(bytes)), v)
    }

    fn relu_program() -> ProgramBuilder {
        let mut p = ProgramBuilder::new();
        let c = p.add_constant_f32(&[1.0, 2.0]);
        let mut m = MethodBuilder::new("forward");
        let x = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
        let w = m.add_constant_tensor(&[2], c);
        let y = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
        m.add_input(x).add_output(y).add_kernel(OpKind::Add, &[x, w], y);
        p.add_method(m.build());
        p
    }

    #[test]
    fn test_load_and_meta() {
        let program = load(relu_program().build().unwrap(), Verification::InternalConsistency).unwrap();
        assert_eq!(program.method_names(), vec!["forward".to_string()]);
        let meta = program.method_meta("forward").unwrap();
        assert_eq!(
            meta.inputs,
            vec![ValueMeta::Tensor { sizes: vec![2], dynamism: TensorShapeDynamism::Static }]
        );
        assert_eq!(meta.planned_buffer_sizes, vec![24]);
        assert_eq!(meta.num_instructions, 1);
        let c = program.constant_data(0).unwrap();
        assert_eq!(&c[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_missing_method() {
        let program = load(relu_program().build().unwrap(), Verification::Minimal).unwrap();
        let err = program.method_meta("backward").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_truncated_header() {
        let bytes = relu_program().build().unwrap();
        let err = load(bytes[..40].to_vec(), Verification::Minimal).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProgram);
    }

    #[test]
    fn test_consistency_catches_bad_indices() {
        let mut p = relu_program();
        let mut m = MethodBuilder::new("broken");
        let x = m.add_planned_tensor(&[2], TensorShapeDynamism::Static);
        m.add_input(x).add_output(x).add_kernel(OpKind::Relu, &[x], 9);
        p.add_method(m.build());
        let bytes = p.build().unwrap();

        // Minimal verification does not look inside methods.
        assert!(load(bytes.clone(), Verification::Minimal).is_ok());
        let err = load(bytes, Verification::InternalConsistency).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProgram);
    }

    #[test]
    fn test_consistency_catches_unknown_op_and_missing_delegate() {
        let mut p = ProgramBuilder::new();
        let mut m = MethodBuilder::new("forward");
        let x = m.add_tensor(&[1], TensorShapeDynamism::Static);
        m.add_instruction(InstructionDef::Kernel { op: "conv9d".into(), args: vec![x, x] });
        p.add_method(m.build());
        assert!(load(p.build().unwrap(), Verification::InternalConsistency).is_err());

        let mut p = ProgramBuilder::new();
        let mut m = MethodBuilder::new("forward");
        let x = m.add_tensor(&[1], TensorShapeDynamism::Static);
        m.add_delegate_call(0, &[x]);
        p.add_method(m.build());
        assert!(load(p.build().unwrap(), Verification::InternalConsistency).is_err());
    }

    #[test]
    fn test_consistency_rejects_unaddressable_tensor() {
        let mut p = ProgramBuilder::new();
        let mut m = MethodBuilder::new("forward");
        let x = m.add_tensor(&[usize::MAX, 2], TensorShapeDynamism::Static);
        m.add_input(x).add_output(x);
        p.add_method(m.build());
        let bytes = p.build().unwrap();

        assert!(load(bytes.clone(), Verification::Minimal).is_ok());
        let err = load(bytes, Verification::InternalConsistency).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProgram);
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_duplicate_method_names() {
        let mut p = relu_program();
        p.add_method(MethodBuilder::new("forward").build());
        let err = load(p.build().unwrap(), Verification::InternalConsistency).unwrap_err();
        assert!(err.to_string().contains("duplicate method"));
    }
}
