//! Portable kernel execution over method values.

use kore_delegate::DelegateTensor;
use kore_kernels::OpKind;

use crate::value::{restore, take_tensor, tensor_at, Value};
use crate::{EdgeError, Result};

/// Run `op` with `args` = inputs followed by the output.
///
/// The output is resized to the inferred shape first, so its dynamism
/// decides whether a shape change is allowed.
pub(crate) fn run_kernel(op: OpKind, values: &mut [Value], args: &[usize]) -> Result<()> {
    let (&out_index, in_indices) = args
        .split_last()
        .ok_or_else(|| EdgeError::program(format!("{} instruction has no output", op)))?;

    let mut out = take_tensor(values, out_index)?;
    let result = compute(op, values, in_indices, &mut out);
    restore(values, vec![(out_index, out)]);
    result
}

fn compute(op: OpKind, values: &[Value], in_indices: &[usize], out: &mut crate::memory::Tensor) -> Result<()> {
    let inputs = in_indices
        .iter()
        .map(|&i| tensor_at(values, i))
        .collect::<Result<Vec<_>>>()?;
    let dims: Vec<&[usize]> = inputs.iter().map(|t| t.sizes()).collect();
    let out_dims = op.infer_shape(&dims)?;
    out.resize(&out_dims)?;

    let operands: Vec<(&[f32], &[usize])> = inputs.iter().map(|t| (t.as_f32(), t.sizes())).collect();
    op.run(&operands, out.as_f32_mut(), &out_dims)?;
    Ok(())
}
