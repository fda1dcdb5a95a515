use std::fmt;

use crate::{DelegateError, Result};

/// Maximum rank a backend graph value may have.
pub const MAX_TENSOR_DIMS: usize = 6;

/// Rank plus a fixed-capacity array of extents.
///
/// This is the shape record exchanged with backends on every call, so it
/// lives inline (no heap allocation) and is `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    num_dims: usize,
    dims: [usize; MAX_TENSOR_DIMS],
}

impl TensorShape {
    /// Create a shape from extents. Fails if the rank exceeds
    /// [`MAX_TENSOR_DIMS`] or the f32 byte size overflows `usize`.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.len() > MAX_TENSOR_DIMS {
            return Err(DelegateError::invalid(format!(
                "rank {} exceeds the maximum of {} dimensions",
                dims.len(),
                MAX_TENSOR_DIMS
            )));
        }
        if kore_kernels::checked_nbytes(dims).is_none() {
            return Err(DelegateError::invalid(format!("shape {:?} is too large to address", dims)));
        }
        let mut out = [0usize; MAX_TENSOR_DIMS];
        out[..dims.len()].copy_from_slice(dims);
        Ok(Self { num_dims: dims.len(), dims: out })
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self { num_dims: 0, dims: [0; MAX_TENSOR_DIMS] }
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.num_dims
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.num_dims]
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims().get(axis).copied()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        kore_kernels::numel(self.dims())
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorShape({:?})", self.dims())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
