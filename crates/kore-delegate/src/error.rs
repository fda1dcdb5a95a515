use crate::backend::NativeStatus;

/// Errors produced by the delegation layer.
///
/// The variants follow the runtime-wide taxonomy: argument problems,
/// capabilities a backend cannot realize, internal/backend failures, and
/// allocator exhaustion. Native backend statuses are never dropped; they
/// travel inside `Internal` for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("internal error: {message}{}", status_suffix(.status))]
    Internal {
        message: String,
        status: Option<NativeStatus>,
    },

    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("index {index} out of range ({len} entries)")]
    OutOfRange { index: usize, len: usize },
}

impl DelegateError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DelegateError::InvalidArgument(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        DelegateError::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DelegateError::Internal { message: msg.into(), status: None }
    }

    /// Internal failure carrying the backend's native status.
    pub fn native(msg: impl Into<String>, status: NativeStatus) -> Self {
        DelegateError::Internal { message: msg.into(), status: Some(status) }
    }

    /// The native status attached to an `Internal` error, if any.
    pub fn native_status(&self) -> Option<NativeStatus> {
        match self {
            DelegateError::Internal { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<NativeStatus>) -> String {
    match status {
        Some(s) => format!(" (native status: {})", s),
        None => String::new(),
    }
}
