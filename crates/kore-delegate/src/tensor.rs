//! Tensor access as seen by a backend executor.

use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::{DelegateError, Result};

/// A tensor whose storage can be bound to a backend argument slot.
///
/// The executor never owns the storage: it reads the buffer address at bind
/// time and, for dynamic outputs, asks the owner to resize it through
/// [`DelegateTensor::resize`].
pub trait DelegateTensor {
    /// Current extents.
    fn sizes(&self) -> &[usize];

    /// Number of dimensions (rank).
    fn dim(&self) -> usize {
        self.sizes().len()
    }

    fn numel(&self) -> usize {
        kore_kernels::numel(self.sizes())
    }

    /// Bytes addressable through [`DelegateTensor::data_ptr`].
    fn nbytes(&self) -> usize;

    /// Start of the tensor's f32 storage.
    fn data_ptr(&mut self) -> NonNull<u8>;

    /// Resize the storage to the given extents. Data is not preserved.
    fn resize(&mut self, sizes: &[usize]) -> Result<()>;
}

/// An owned, host-resident f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    sizes: SmallVec<[usize; 4]>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Wrap `data` with the given extents; the element count must match.
    pub fn new(sizes: &[usize], data: Vec<f32>) -> Result<Self> {
        let numel = element_count(sizes)?;
        if numel != data.len() {
            return Err(DelegateError::invalid(format!(
                "shape {:?} requires {} elements, got {}",
                sizes,
                numel,
                data.len()
            )));
        }
        Ok(Self { sizes: SmallVec::from_slice(sizes), data })
    }

    pub fn from_f32(data: &[f32], sizes: &[usize]) -> Result<Self> {
        Self::new(sizes, data.to_vec())
    }

    /// Zero-filled tensor.
    ///
    /// # Panics
    ///
    /// Panics if the element count overflows `usize`, like `vec!` does.
    pub fn zeros(sizes: &[usize]) -> Self {
        let numel = kore_kernels::numel(sizes);
        Self { sizes: SmallVec::from_slice(sizes), data: vec![0.0; numel] }
    }

    pub fn as_f32(&self) -> &[f32] {
        &self.data
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

impl DelegateTensor for HostTensor {
    fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn nbytes(&self) -> usize {
        self.data.len() * 4
    }

    fn data_ptr(&mut self) -> NonNull<u8> {
        NonNull::from(self.data.as_mut_slice()).cast()
    }

    fn resize(&mut self, sizes: &[usize]) -> Result<()> {
        let numel = element_count(sizes)?;
        if numel != self.data.len() {
            self.data = vec![0.0; numel];
        }
        self.sizes = SmallVec::from_slice(sizes);
        Ok(())
    }
}

/// Element count of a shape whose f32 byte size fits in `usize`.
fn element_count(sizes: &[usize]) -> Result<usize> {
    kore_kernels::checked_numel(sizes)
        .filter(|n| n.checked_mul(4).is_some())
        .ok_or_else(|| DelegateError::invalid(format!("shape {:?} is too large to address", sizes)))
}
