use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{info, warn};

use super::{DynamicOptimizerModule, ModuleError, OptimizerModule};

/// Loads a module by file name.
pub type ModuleLoader =
    dyn Fn(&str) -> Result<Arc<dyn OptimizerModule>, ModuleError> + Send + Sync;

#[derive(Default)]
struct SharedState {
    loaded: Option<(String, Arc<dyn OptimizerModule>)>,
    refs: usize,
    /// Load failures by module name; reported once, then served from here.
    failed: HashMap<String, String>,
}

/// Process-scoped optimizer handle.
///
/// The module is loaded under a single init lock on the first [`SharedModule::acquire`] and stays
/// loaded while any [`ModuleLease`] is alive. [`SharedModule::shutdown`] unloads it once the last
/// lease is gone.
pub struct SharedModule {
    loader: Box<ModuleLoader>,
    state: Arc<Mutex<SharedState>>,
}

impl fmt::Debug for SharedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SharedModule")
            .field("loaded", &state.loaded.as_ref().map(|(name, _)| name))
            .field("refs", &state.refs)
            .finish()
    }
}

static GLOBAL: OnceLock<SharedModule> = OnceLock::new();

impl SharedModule {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn OptimizerModule>, ModuleError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: Arc::new(Mutex::new(SharedState::default())),
        }
    }

    /// Handle backed by native shared modules.
    pub fn dynamic() -> Self {
        Self::new(|name| {
            DynamicOptimizerModule::load(name).map(|m| Arc::new(m) as Arc<dyn OptimizerModule>)
        })
    }

    /// Process-wide native handle.
    pub fn global() -> &'static SharedModule {
        GLOBAL.get_or_init(SharedModule::dynamic)
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self, name: &str) -> Result<ModuleLease, ModuleError> {
        let mut state = self.lock();
        if let Some((loaded, module)) = &state.loaded {
            if loaded == name {
                let module = Arc::clone(module);
                state.refs += 1;
                return Ok(self.lease(module));
            }
            if state.refs > 0 {
                return Err(ModuleError::NameMismatch {
                    loaded: loaded.clone(),
                    requested: name.to_string(),
                });
            }
            info!(target: "graph_fuser", module = %loaded, "unloading optimizer module");
            state.loaded = None;
        }

        if let Some(message) = state.failed.get(name) {
            return Err(ModuleError::Unavailable {
                name: name.to_string(),
                message: message.clone(),
            });
        }

        match (self.loader)(name) {
            Ok(module) => {
                info!(target: "graph_fuser", module = name, "optimizer module loaded");
                state.loaded = Some((name.to_string(), Arc::clone(&module)));
                state.refs = 1;
                Ok(self.lease(module))
            }
            Err(err) => {
                warn!(
                    target: "graph_fuser",
                    module = name,
                    error = %err,
                    "failed to load optimizer module, fusion disabled"
                );
                state.failed.insert(name.to_string(), err.to_string());
                Err(err)
            }
        }
    }

    fn lease(&self, module: Arc<dyn OptimizerModule>) -> ModuleLease {
        ModuleLease {
            module,
            state: Arc::clone(&self.state),
        }
    }

    /// Unloads the module when no lease is alive. Returns `true` if nothing stays loaded.
    pub fn shutdown(&self) -> bool {
        let mut state = self.lock();
        if state.refs > 0 {
            return false;
        }
        if let Some((name, _)) = state.loaded.take() {
            info!(target: "graph_fuser", module = %name, "unloading optimizer module");
        }
        true
    }

    pub fn loaded_name(&self) -> Option<String> {
        self.lock().loaded.as_ref().map(|(name, _)| name.clone())
    }

    pub fn ref_count(&self) -> usize {
        self.lock().refs
    }
}

/// Keeps the shared module loaded while alive.
pub struct ModuleLease {
    module: Arc<dyn OptimizerModule>,
    state: Arc<Mutex<SharedState>>,
}

impl fmt::Debug for ModuleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLease")
            .field("module", &self.module.name())
            .finish()
    }
}

impl ModuleLease {
    pub fn module(&self) -> Arc<dyn OptimizerModule> {
        Arc::clone(&self.module)
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refs = state.refs.saturating_sub(1);
    }
}
