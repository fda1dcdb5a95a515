//! `Module`: the one-stop facade over program loading and method execution.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use kore_delegate::EventTracer;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::loader::{DataLoader, FileDataLoader};
use crate::memory::{MemoryManager, DEFAULT_RUNTIME_ARENA_BYTES};
use crate::method::Method;
use crate::program::{MethodMeta, Program, Verification};
use crate::value::EValue;
use crate::{EdgeError, Result};

/// How a program file is brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    /// Read on demand through a file handle.
    File,
    /// Memory-map without locking.
    Mmap,
    /// Memory-map and lock pages; failure to lock fails the load.
    MmapUseMlock,
    /// Memory-map and try to lock pages.
    MmapUseMlockIgnoreErrors,
}

impl Default for LoadMode {
    fn default() -> Self {
        if cfg!(feature = "mmap") {
            LoadMode::MmapUseMlockIgnoreErrors
        } else {
            LoadMode::File
        }
    }
}

/// Runtime options for a [`Module`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub load_mode: LoadMode,
    /// Verification used when loading happens implicitly.
    pub verification: Verification,
    /// Size of each method's allocator for constants, backend state and
    /// unplanned tensors.
    pub runtime_arena_bytes: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            load_mode: LoadMode::default(),
            verification: Verification::Minimal,
            runtime_arena_bytes: DEFAULT_RUNTIME_ARENA_BYTES,
        }
    }
}

enum Source {
    Path(PathBuf),
    Loader(Arc<dyn DataLoader>),
    Program,
}

pub struct Module {
    source: Source,
    config: ModuleConfig,
    program: Option<Arc<Program>>,
    methods: HashMap<String, Method>,
    event_tracer: Option<Arc<dyn EventTracer>>,
}

impl Module {
    /// Module over the program file at `path`.
    pub fn new(path: impl Into<PathBuf>, load_mode: LoadMode) -> Self {
        Self::with_config(path, ModuleConfig { load_mode, ..ModuleConfig::default() })
    }

    pub fn with_config(path: impl Into<PathBuf>, config: ModuleConfig) -> Self {
        Self::from_source(Source::Path(path.into()), config, None)
    }

    /// Module over an already-open data source.
    pub fn from_loader(loader: Arc<dyn DataLoader>, config: ModuleConfig) -> Self {
        Self::from_source(Source::Loader(loader), config, None)
    }

    /// Module over a program shared with other modules.
    pub fn from_program(program: Arc<Program>, config: ModuleConfig) -> Self {
        Self::from_source(Source::Program, config, Some(program))
    }

    /// Report delegate profiling events to `tracer` for methods loaded
    /// from now on.
    pub fn with_event_tracer(mut self, tracer: Arc<dyn EventTracer>) -> Self {
        self.event_tracer = Some(tracer);
        self
    }

    fn from_source(source: Source, config: ModuleConfig, program: Option<Arc<Program>>) -> Self {
        Self { source, config, program, methods: HashMap::new(), event_tracer: None }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Load the program. Does nothing if it is already loaded.
    pub fn load(&mut self, verification: Verification) -> Result<()> {
        if self.program.is_some() {
            return Ok(());
        }
        let loader = self.open_loader()?;
        let program = Program::load(loader, verification)?;
        self.program = Some(Arc::new(program));
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    pub fn program(&self) -> Result<&Arc<Program>> {
        self.program.as_ref().ok_or(EdgeError::NotLoaded)
    }

    pub fn method_names(&mut self) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        Ok(self.program()?.method_names())
    }

    /// Load method `name` with its memory plan and compiled delegates.
    /// Does nothing if it is already loaded.
    pub fn load_method(&mut self, name: &str) -> Result<()> {
        if self.methods.contains_key(name) {
            return Ok(());
        }
        self.ensure_loaded()?;
        let program = Arc::clone(self.program()?);
        let meta = program.method_meta(name)?;
        let memory = MemoryManager::for_plan(&meta.planned_buffer_sizes, self.config.runtime_arena_bytes)?;
        let method = Method::load(&program, name, memory, self.event_tracer.clone())?;
        self.methods.insert(name.to_string(), method);
        Ok(())
    }

    pub fn is_method_loaded(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_meta(&mut self, name: &str) -> Result<MethodMeta> {
        self.ensure_loaded()?;
        self.program()?.method_meta(name)
    }

    /// Point output `index` of method `name` at caller memory, loading the
    /// method first if needed. See [`Method::set_output_data_ptr`].
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of `len` f32 values, and
    /// unaccessed elsewhere during executions, until this module is dropped
    /// or the output is pointed somewhere else.
    pub unsafe fn set_output_data_ptr(
        &mut self,
        name: &str,
        index: usize,
        data: NonNull<f32>,
        len: usize,
    ) -> Result<()> {
        self.load_method(name)?;
        let method = self
            .methods
            .get_mut(name)
            .ok_or_else(|| EdgeError::MethodNotFound(name.to_string()))?;
        method.set_output_data_ptr(index, data, len)
    }

    /// Run method `name`, loading it first if needed.
    pub fn execute(&mut self, name: &str, inputs: &[EValue]) -> Result<Vec<EValue>> {
        self.load_method(name)?;
        let method = self
            .methods
            .get_mut(name)
            .ok_or_else(|| EdgeError::MethodNotFound(name.to_string()))?;
        method.execute(inputs)
    }

    /// Run method `name` and return its first output.
    pub fn get(&mut self, name: &str, inputs: &[EValue]) -> Result<EValue> {
        self.execute(name, inputs)?
            .into_iter()
            .next()
            .ok_or_else(|| EdgeError::invalid(format!("method '{}' returned no outputs", name)))
    }

    /// Run the `forward` method.
    pub fn forward(&mut self, inputs: &[EValue]) -> Result<Vec<EValue>> {
        self.execute("forward", inputs)
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        self.load(self.config.verification)
    }

    fn open_loader(&self) -> Result<Arc<dyn DataLoader>> {
        let path = match &self.source {
            Source::Loader(loader) => return Ok(Arc::clone(loader)),
            Source::Program => return Err(EdgeError::NotLoaded),
            Source::Path(path) => path,
        };
        info!(path = %path.display(), mode = ?self.config.load_mode, "opening program");
        match self.config.load_mode {
            LoadMode::File => Ok(Arc::new(FileDataLoader::open(path)?)),
            mode => open_mmap(path, mode),
        }
    }
}

#[cfg(feature = "mmap")]
fn open_mmap(path: &std::path::Path, mode: LoadMode) -> Result<Arc<dyn DataLoader>> {
    use crate::loader::{MlockConfig, MmapDataLoader};

    let mlock = match mode {
        LoadMode::MmapUseMlock => MlockConfig::UseMlock,
        LoadMode::MmapUseMlockIgnoreErrors => MlockConfig::UseMlockIgnoreErrors,
        _ => MlockConfig::NoMlock,
    };
    Ok(Arc::new(MmapDataLoader::open(path, mlock)?))
}

#[cfg(not(feature = "mmap"))]
fn open_mmap(_: &std::path::Path, mode: LoadMode) -> Result<Arc<dyn DataLoader>> {
    Err(EdgeError::NotSupported(format!(
        "load mode {:?} requires the mmap feature",
        mode
    )))
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Module")
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .field("methods", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ModuleConfig = serde_json::from_str(r#"{"load_mode":"File"}"#).unwrap();
        assert_eq!(config.load_mode, LoadMode::File);
        assert_eq!(config.verification, Verification::Minimal);
        assert_eq!(config.runtime_arena_bytes, DEFAULT_RUNTIME_ARENA_BYTES);
    }

    #[test]
    fn test_program_before_load() {
        let module = Module::new("/nonexistent/model.korf", LoadMode::File);
        assert!(!module.is_loaded());
        assert!(matches!(module.program(), Err(EdgeError::NotLoaded)));
    }

    #[test]
    fn test_missing_file_fails_load() {
        let mut module = Module::new("/nonexistent/model.korf", LoadMode::File);
        let err = module.load(Verification::Minimal).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AccessFailed);
        assert!(!module.is_loaded());
    }
}
