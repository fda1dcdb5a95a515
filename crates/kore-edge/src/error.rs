use kore_delegate::DelegateError;
use kore_kernels::KernelError;

/// Coarse error category shared by every Kore edge crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotSupported,
    Internal,
    OutOfMemory,
    OutOfRange,
    InvalidProgram,
    NotFound,
    AccessFailed,
}

/// Errors from loading and running programs.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error("kernel failed: {0}")]
    Kernel(#[from] KernelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed program header: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    #[error("program not loaded")]
    NotLoaded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl EdgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EdgeError::Delegate(e) => match e {
                DelegateError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                DelegateError::NotSupported(_) => ErrorKind::NotSupported,
                DelegateError::Internal { .. } => ErrorKind::Internal,
                DelegateError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
                DelegateError::OutOfRange { .. } => ErrorKind::OutOfRange,
            },
            EdgeError::Kernel(_) => ErrorKind::InvalidArgument,
            EdgeError::Io(_) => ErrorKind::AccessFailed,
            EdgeError::Json(_) | EdgeError::InvalidProgram(_) => ErrorKind::InvalidProgram,
            EdgeError::MethodNotFound(_) => ErrorKind::NotFound,
            EdgeError::NotLoaded => ErrorKind::Internal,
            EdgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EdgeError::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    pub(crate) fn program(msg: impl Into<String>) -> Self {
        EdgeError::InvalidProgram(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EdgeError::InvalidArgument(msg.into())
    }
}
