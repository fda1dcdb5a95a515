//! Process-wide registry of graph backends, keyed by name.
//!
//! The reference CPU backend is registered the first time the registry is
//! touched.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use crate::backend::GraphBackend;
use crate::cpu::CpuBackend;
use crate::{DelegateError, Result};

static BACKENDS: OnceLock<Mutex<HashMap<String, Arc<dyn GraphBackend>>>> = OnceLock::new();

fn backends() -> &'static Mutex<HashMap<String, Arc<dyn GraphBackend>>> {
    BACKENDS.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn GraphBackend>> = HashMap::new();
        let cpu = CpuBackend::new();
        map.insert(cpu.name().to_string(), Arc::new(cpu));
        Mutex::new(map)
    })
}

/// Register a backend under its own name. Names must be unique.
pub fn register_backend(backend: Arc<dyn GraphBackend>) -> Result<()> {
    let mut map = backends().lock();
    let name = backend.name().to_string();
    if map.contains_key(&name) {
        return Err(DelegateError::invalid(format!("backend '{}' is already registered", name)));
    }
    info!(backend = %name, "registered delegate backend");
    map.insert(name, backend);
    Ok(())
}

pub fn get_backend(name: &str) -> Option<Arc<dyn GraphBackend>> {
    backends().lock().get(name).map(Arc::clone)
}

/// Names of all registered backends, sorted.
pub fn registered_backends() -> Vec<String> {
    let mut names: Vec<String> = backends().lock().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CPU_BACKEND_NAME;

    #[test]
    fn test_cpu_preregistered() {
        assert!(get_backend(CPU_BACKEND_NAME).is_some());
        assert!(registered_backends().iter().any(|n| n == CPU_BACKEND_NAME));
        assert!(get_backend("NoSuchBackend").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = register_backend(Arc::new(CpuBackend::new())).unwrap_err();
        assert!(matches!(err, DelegateError::InvalidArgument(_)));
    }
}
