//! # kore-edge
//!
//! On-device program runtime for Kore.
//!
//! A `.korf` program holds one or more methods. Each method is a list of
//! instructions over a table of values: portable kernels from
//! `kore-kernels`, or calls into delegated subgraphs that a backend compiled
//! through `kore-delegate`.
//!
//! ## Key Features
//! - `.korf` container: single-file, mmap-friendly, 64-byte aligned data
//! - Data loaders over buffers, files and memory maps (optionally mlocked)
//! - Memory plans with static, bounded and unbounded dynamic tensors
//! - Delegates compiled once per loaded method and reused on every call
//! - [`Module`] facade: lazy load, per-method caching, `forward`

pub mod error;
pub mod format;
pub mod loader;
pub mod memory;
pub mod method;
pub mod module;
pub mod program;
pub mod value;

mod interpreter;

pub use error::{EdgeError, ErrorKind};
pub use format::{MethodBuilder, ProgramBuilder, TensorShapeDynamism};
pub use loader::{BufferDataLoader, DataLoader, FileDataLoader};
#[cfg(feature = "mmap")]
pub use loader::{MlockConfig, MmapDataLoader};
pub use memory::{HierarchicalAllocator, MemoryManager, Tensor};
pub use method::Method;
pub use module::{LoadMode, Module, ModuleConfig};
pub use program::{MethodMeta, Program, ValueMeta, Verification};
pub use value::EValue;

pub type Result<T> = std::result::Result<T, EdgeError>;
