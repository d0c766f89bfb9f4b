//! Boundary to the external graph optimizer.
//!
//! The optimizer is consumed through [`OptimizerModule`]. [`DynamicOptimizerModule`] talks to a
//! native shared module over a JSON-encoded C ABI, [`FnOptimizerModule`] wraps plain closures, and
//! [`SharedModule`] owns the process-scoped, reference-counted module handle.

mod dynamic;
mod shared;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::exchange::{ExchangeGraph, ExchangeNode};

pub use dynamic::{
    DynamicOptimizerModule, FUSE_GRAPH_SYMBOL, PRE_GRAPH_SYMBOL, RELEASE_GRAPH_SYMBOL,
};
pub use shared::{ModuleLease, ModuleLoader, SharedModule};

/// Status returned by the native entry points on success.
pub const STATUS_SUCCESS: i32 = 0;
/// Status returned by the native fuse entry point when it could not optimize the graph.
pub const STATUS_FUSER_FAILED: i32 = 1;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("failed to load optimizer module `{name}`: {message}")]
    Load { name: String, message: String },
    #[error("optimizer module `{name}` is missing entry point `{symbol}`")]
    MissingSymbol { name: String, symbol: String },
    #[error("optimizer module `{name}` is unavailable: {message}")]
    Unavailable { name: String, message: String },
    #[error("optimizer module `{loaded}` is in use, cannot switch to `{requested}`")]
    NameMismatch { loaded: String, requested: String },
    #[error("optimizer returned status {status}")]
    Failed { status: i32 },
    #[error("optimizer returned an empty buffer")]
    EmptyResult,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Buffer owned by a native module, returned to it through the release entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    // Stored as usize so results can cross threads.
    pub(crate) ptr: usize,
    pub(crate) len: usize,
}

/// Optimized graph returned by [`OptimizerModule::fuse_graph`].
///
/// Hand it back through [`OptimizerModule::release`] once the result has been committed.
#[derive(Debug)]
pub struct FusedGraph {
    pub graph: ExchangeGraph,
    pub(crate) buffer: Option<RawBuffer>,
}

impl FusedGraph {
    pub fn new(graph: ExchangeGraph) -> Self {
        Self {
            graph,
            buffer: None,
        }
    }
}

pub trait OptimizerModule: Send + Sync {
    fn name(&self) -> &str;

    fn fuse_graph(&self, graph: &ExchangeGraph) -> Result<FusedGraph, ModuleError>;

    /// Alternate decomposition of `node`; `None` when the module has no such entry point.
    fn get_pre_graph(&self, _node: &ExchangeNode) -> Option<Result<ExchangeGraph, ModuleError>> {
        None
    }

    /// Returns a successful result to the module.
    fn release(&self, _result: FusedGraph) {}

    /// Clusters containing a node without inputs are not submitted when this is set.
    fn requires_inputs(&self) -> bool {
        false
    }
}

type FuseFn = dyn Fn(&ExchangeGraph) -> Result<ExchangeGraph, ModuleError> + Send + Sync;
type PreGraphFn = dyn Fn(&ExchangeNode) -> Result<ExchangeGraph, ModuleError> + Send + Sync;

/// Optimizer backed by closures, used where no native module is available.
pub struct FnOptimizerModule {
    name: String,
    fuse: Box<FuseFn>,
    pre_graph: Option<Box<PreGraphFn>>,
    requires_inputs: bool,
    calls: AtomicUsize,
    released: AtomicUsize,
}

impl fmt::Debug for FnOptimizerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOptimizerModule")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .field("released", &self.released())
            .finish()
    }
}

impl FnOptimizerModule {
    pub fn new<F>(name: impl Into<String>, fuse: F) -> Self
    where
        F: Fn(&ExchangeGraph) -> Result<ExchangeGraph, ModuleError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fuse: Box::new(fuse),
            pre_graph: None,
            requires_inputs: false,
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Module that returns every graph unchanged.
    pub fn identity() -> Self {
        Self::new("identity", |graph| Ok(graph.clone()))
    }

    pub fn with_pre_graph<F>(mut self, pre_graph: F) -> Self
    where
        F: Fn(&ExchangeNode) -> Result<ExchangeGraph, ModuleError> + Send + Sync + 'static,
    {
        self.pre_graph = Some(Box::new(pre_graph));
        self
    }

    pub fn requiring_inputs(mut self) -> Self {
        self.requires_inputs = true;
        self
    }

    /// Number of `fuse_graph` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl OptimizerModule for FnOptimizerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fuse_graph(&self, graph: &ExchangeGraph) -> Result<FusedGraph, ModuleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.fuse)(graph).map(FusedGraph::new)
    }

    fn get_pre_graph(&self, node: &ExchangeNode) -> Option<Result<ExchangeGraph, ModuleError>> {
        self.pre_graph.as_ref().map(|f| f(node))
    }

    fn release(&self, _result: FusedGraph) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn requires_inputs(&self) -> bool {
        self.requires_inputs
    }
}

/// Serializes every call into a module whose entry points are not reentrant.
pub struct SerializedModule {
    inner: Arc<dyn OptimizerModule>,
    lock: Mutex<()>,
}

impl SerializedModule {
    pub fn new(inner: Arc<dyn OptimizerModule>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

impl OptimizerModule for SerializedModule {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fuse_graph(&self, graph: &ExchangeGraph) -> Result<FusedGraph, ModuleError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.fuse_graph(graph)
    }

    fn get_pre_graph(&self, node: &ExchangeNode) -> Option<Result<ExchangeGraph, ModuleError>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.get_pre_graph(node)
    }

    fn release(&self, result: FusedGraph) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.release(result)
    }

    fn requires_inputs(&self) -> bool {
        self.inner.requires_inputs()
    }
}
