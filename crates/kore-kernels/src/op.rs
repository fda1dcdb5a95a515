//! Operator table: tags, arity, shape inference, and dispatch.

use std::fmt;
use std::str::FromStr;

use crate::{activation, checked_nbytes, elementwise, matmul, numel, KernelError, Result};

/// Operators understood by Kore backends and the portable interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Silu,
    /// Softmax over the last dimension.
    Softmax,
    /// [.., M, K] @ [.., K, N] (rank-2 rhs is shared across the batch).
    MatMul,
    Copy,
}

impl OpKind {
    pub const ALL: [OpKind; 12] = [
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Div,
        OpKind::Relu,
        OpKind::Sigmoid,
        OpKind::Tanh,
        OpKind::Gelu,
        OpKind::Silu,
        OpKind::Softmax,
        OpKind::MatMul,
        OpKind::Copy,
    ];

    /// String tag used in serialized graphs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Gelu => "gelu",
            OpKind::Silu => "silu",
            OpKind::Softmax => "softmax",
            OpKind::MatMul => "matmul",
            OpKind::Copy => "copy",
        }
    }

    /// Number of tensor inputs.
    pub fn arity(&self) -> usize {
        if self.is_binary() {
            2
        } else {
            1
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::MatMul
        )
    }

    fn check_arity(&self, got: usize) -> Result<()> {
        if got != self.arity() {
            return Err(KernelError::Arity { op: *self, expected: self.arity(), got });
        }
        Ok(())
    }

    /// Compute the output dims for the given input dims.
    ///
    /// The result always has a byte size that fits in `usize`.
    pub fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        self.check_arity(inputs.len())?;
        let out = self.derive_shape(inputs)?;
        if checked_nbytes(&out).is_none() {
            return Err(KernelError::Overflow { dims: out });
        }
        Ok(out)
    }

    fn derive_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                elementwise::broadcast_shapes(inputs[0], inputs[1])
                    .map(|s| s.to_vec())
                    .ok_or_else(|| KernelError::Broadcast {
                        lhs: inputs[0].to_vec(),
                        rhs: inputs[1].to_vec(),
                    })
            }
            OpKind::MatMul => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                let (m, k, batch) = split_matrix(self, lhs)?;
                let (k2, n, rhs_batch) = split_matrix(self, rhs)?;
                if k != k2 || (rhs.len() > 2 && rhs_batch != batch) {
                    return Err(KernelError::MatmulShape { lhs: lhs.to_vec(), rhs: rhs.to_vec() });
                }
                let mut out = batch.to_vec();
                out.push(m);
                out.push(n);
                Ok(out)
            }
            OpKind::Softmax => {
                if inputs[0].is_empty() {
                    return Err(KernelError::Rank { op: *self, min: 1, got: 0 });
                }
                Ok(inputs[0].to_vec())
            }
            _ => Ok(inputs[0].to_vec()),
        }
    }

    /// Run the kernel. `out_dims` must come from [`OpKind::infer_shape`].
    pub fn run(&self, inputs: &[(&[f32], &[usize])], out: &mut [f32], out_dims: &[usize]) -> Result<()> {
        self.check_arity(inputs.len())?;
        for (data, dims) in inputs {
            check_len(data.len(), numel(dims))?;
        }
        let n = numel(out_dims);
        check_len(out.len(), n)?;
        let out = &mut out[..n];

        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let (a, a_dims) = inputs[0];
                let (b, b_dims) = inputs[1];
                let f: fn(f32, f32) -> f32 = match self {
                    OpKind::Add => |x, y| x + y,
                    OpKind::Sub => |x, y| x - y,
                    OpKind::Mul => |x, y| x * y,
                    _ => |x, y| x / y,
                };
                elementwise::binary_broadcast(a, a_dims, b, b_dims, out, out_dims, f);
            }
            OpKind::MatMul => {
                let (a, a_dims) = inputs[0];
                let (b, b_dims) = inputs[1];
                let (m, k, batch) = split_matrix(self, a_dims)?;
                let n = b_dims[b_dims.len() - 1];
                matmul::matmul_batched(a, b, out, numel(batch), m, n, k, b_dims.len() == 2);
            }
            _ => {
                let src = &inputs[0].0[..n];
                match self {
                    OpKind::Relu => activation::relu(src, out),
                    OpKind::Sigmoid => activation::sigmoid(src, out),
                    OpKind::Tanh => activation::tanh(src, out),
                    OpKind::Gelu => activation::gelu(src, out),
                    OpKind::Silu => activation::silu(src, out),
                    OpKind::Softmax => activation::softmax_last_axis(src, out, out_dims),
                    _ => elementwise::copy(src, out),
                }
            }
        }
        Ok(())
    }
}

/// Split `[.., rows, cols]` into (rows, cols, batch dims).
fn split_matrix<'a>(op: &OpKind, dims: &'a [usize]) -> Result<(usize, usize, &'a [usize])> {
    let r = dims.len();
    if r < 2 {
        return Err(KernelError::Rank { op: *op, min: 2, got: r });
    }
    Ok((dims[r - 2], dims[r - 1], &dims[..r - 2]))
}

fn check_len(have: usize, need: usize) -> Result<()> {
    if have < need {
        return Err(KernelError::BufferTooSmall { need, have });
    }
    Ok(())
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| KernelError::UnknownOp(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse() {
        for op in OpKind::ALL {
            assert_eq!(op.as_str().parse::<OpKind>().unwrap(), op);
        }
        assert!(matches!("conv9d".parse::<OpKind>(), Err(KernelError::UnknownOp(_))));
    }

    #[test]
    fn test_infer_matmul() {
        assert_eq!(OpKind::MatMul.infer_shape(&[&[2, 3], &[3, 4]]).unwrap(), vec![2, 4]);
        assert_eq!(OpKind::MatMul.infer_shape(&[&[5, 2, 3], &[3, 4]]).unwrap(), vec![5, 2, 4]);
        assert!(OpKind::MatMul.infer_shape(&[&[2, 3], &[2, 4]]).is_err());
        assert!(OpKind::MatMul.infer_shape(&[&[3], &[3, 4]]).is_err());
    }

    #[test]
    fn test_arity_checked() {
        let err = OpKind::Add.infer_shape(&[&[2]]).unwrap_err();
        assert_eq!(err, KernelError::Arity { op: OpKind::Add, expected: 2, got: 1 });
    }

    #[test]
    fn test_run_add_and_relu() {
        let a = [1.0, -2.0, 3.0];
        let b = [1.0, 1.0, -5.0];
        let mut out = [0.0f32; 3];
        OpKind::Add.run(&[(&a, &[3]), (&b, &[3])], &mut out, &[3]).unwrap();
        assert_eq!(out, [2.0, -1.0, -2.0]);

        let src = out;
        OpKind::Relu.run(&[(&src, &[3])], &mut out, &[3]).unwrap();
        assert_eq!(out, [2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_run_softmax_over_last_axis() {
        let x = [0.0, 0.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0];
        let dims = [2, 1, 4];
        let out_dims = OpKind::Softmax.infer_shape(&[&dims]).unwrap();
        let mut out = [0.0f32; 8];
        OpKind::Softmax.run(&[(&x, &dims)], &mut out, &out_dims).unwrap();
        assert!((out[0] - out[1]).abs() < 1e-7 && out[2] > out[0]);
        assert!(out[4..].iter().all(|&v| (v - 0.25).abs() < 1e-6));
        assert!(OpKind::Softmax.infer_shape(&[&[]]).is_err());
    }

    #[test]
    fn test_run_bias_broadcast_then_activation() {
        // [2, 1, 3] + [3] -> [2, 1, 3]
        let x = [-1.0, 0.0, 1.0, 2.0, 3.0, 4.0];
        let bias = [1.0, -1.0, 0.0];
        let out_dims = OpKind::Add.infer_shape(&[&[2, 1, 3], &[3]]).unwrap();
        assert_eq!(out_dims, vec![2, 1, 3]);
        let mut sum = [0.0f32; 6];
        OpKind::Add.run(&[(&x, &[2, 1, 3]), (&bias, &[3])], &mut sum, &out_dims).unwrap();
        assert_eq!(sum, [0.0, -1.0, 1.0, 3.0, 2.0, 4.0]);

        let mut out = [0.0f32; 6];
        OpKind::Relu.run(&[(&sum, &out_dims)], &mut out, &out_dims).unwrap();
        assert_eq!(out, [0.0, 0.0, 1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_run_rejects_short_output() {
        let a = [1.0, 2.0];
        let mut out = [0.0f32; 1];
        let err = OpKind::Copy.run(&[(&a, &[2])], &mut out, &[2]).unwrap_err();
        assert_eq!(err, KernelError::BufferTooSmall { need: 2, have: 1 });
    }

    #[test]
    fn test_infer_rejects_unaddressable_shapes() {
        let err = OpKind::Relu.infer_shape(&[&[usize::MAX, 2]]).unwrap_err();
        assert_eq!(err, KernelError::Overflow { dims: vec![usize::MAX, 2] });

        // Both operands fit; the product does not.
        let big = 1usize << (usize::BITS / 2);
        assert!(crate::checked_nbytes(&[big, 1]).is_some());
        let err = OpKind::MatMul.infer_shape(&[&[big, 1], &[1, big]]).unwrap_err();
        assert!(matches!(err, KernelError::Overflow { .. }));
    }

    #[test]
    fn test_run_with_overflowing_dims_fails_cleanly() {
        let a = [1.0, 2.0];
        let mut out = [0.0f32; 2];
        let err = OpKind::Copy.run(&[(&a, &[usize::MAX, 2])], &mut out, &[2]).unwrap_err();
        assert_eq!(err, KernelError::BufferTooSmall { need: usize::MAX, have: 2 });
    }

    #[test]
    fn test_numel_helpers() {
        assert_eq!(numel(&[]), 1);
        assert_eq!(numel(&[usize::MAX, 2]), usize::MAX);
        assert_eq!(crate::checked_numel(&[2, 3, 4]), Some(24));
        assert_eq!(crate::checked_numel(&[usize::MAX, 2]), None);
        assert_eq!(crate::checked_nbytes(&[usize::MAX / 2]), None);
    }
}
