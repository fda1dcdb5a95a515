//! # kore-kernels
//!
//! Portable operator library for Kore execution backends.
//!
//! All kernels work on raw `&[f32]` slices plus explicit dimension lists, so
//! they can run over planned arena memory, delegate external buffers, or plain
//! vectors alike. The same [`OpKind`] table is used by the reference CPU graph
//! backend and by the portable interpreter for non-delegated instructions.

pub mod activation;
pub mod elementwise;
pub mod error;
pub mod matmul;
pub mod op;

pub use error::KernelError;
pub use op::OpKind;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Number of elements described by `dims` (1 for a scalar).
///
/// Saturates at `usize::MAX`, so a length check against an overflowing
/// shape fails instead of panicking. Use [`checked_numel`] to validate
/// untrusted extents.
pub fn numel(dims: &[usize]) -> usize {
    dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
}

/// Element count, or `None` if it does not fit in `usize`.
pub fn checked_numel(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Bytes needed to hold `dims` as f32, or `None` on overflow.
pub fn checked_nbytes(dims: &[usize]) -> Option<usize> {
    checked_numel(dims)?.checked_mul(std::mem::size_of::<f32>())
}
