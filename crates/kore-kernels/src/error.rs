use crate::op::OpKind;

/// Errors raised by shape inference and kernel execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("unknown operator '{0}'")]
    UnknownOp(String),

    #[error("{op} expects {expected} inputs, got {got}")]
    Arity { op: OpKind, expected: usize, got: usize },

    #[error("cannot broadcast {lhs:?} with {rhs:?}")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("matmul shape mismatch: {lhs:?} @ {rhs:?}")]
    MatmulShape { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("{op} requires rank >= {min}, got rank {got}")]
    Rank { op: OpKind, min: usize, got: usize },

    #[error("shape {dims:?} is too large to address")]
    Overflow { dims: Vec<usize> },

    #[error("buffer too small: need {need} elements, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}
