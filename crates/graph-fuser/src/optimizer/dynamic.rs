use std::{ptr, slice};

use libloading::Library;
use tracing::{debug, warn};

use crate::exchange::{ExchangeGraph, ExchangeNode};

use super::{FusedGraph, ModuleError, OptimizerModule, RawBuffer, STATUS_SUCCESS};

pub const FUSE_GRAPH_SYMBOL: &str = "graph_fuser_fuse_graph";
pub const PRE_GRAPH_SYMBOL: &str = "graph_fuser_get_pre_graph";
pub const RELEASE_GRAPH_SYMBOL: &str = "graph_fuser_release_graph";

type FuseGraphFn = unsafe extern "C" fn(
    input: *const u8,
    input_len: usize,
    output: *mut *mut u8,
    output_len: *mut usize,
) -> i32;
type PreGraphFn = unsafe extern "C" fn(
    node: *const u8,
    node_len: usize,
    output: *mut *mut u8,
    output_len: *mut usize,
) -> i32;
type ReleaseGraphFn = unsafe extern "C" fn(buffer: *mut u8, len: usize) -> i32;

/// Optimizer loaded from a native shared module.
pub struct DynamicOptimizerModule {
    name: String,
    _lib: Library,
    fuse_graph: FuseGraphFn,
    pre_graph: Option<PreGraphFn>,
    release_graph: Option<ReleaseGraphFn>,
}

impl std::fmt::Debug for DynamicOptimizerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicOptimizerModule")
            .field("name", &self.name)
            .field("pre_graph", &self.pre_graph.is_some())
            .field("release_graph", &self.release_graph.is_some())
            .finish()
    }
}

impl DynamicOptimizerModule {
    pub fn load(name: &str) -> Result<Self, ModuleError> {
        // SAFETY: Loading runs the module's initializers; the module is trusted to be an optimizer
        // built against this ABI.
        let lib = unsafe { Library::new(name) }.map_err(|err| ModuleError::Load {
            name: name.to_string(),
            message: err.to_string(),
        })?;
        let fuse_graph = load_symbol::<FuseGraphFn>(&lib, FUSE_GRAPH_SYMBOL).ok_or_else(|| {
            ModuleError::MissingSymbol {
                name: name.to_string(),
                symbol: FUSE_GRAPH_SYMBOL.to_string(),
            }
        })?;
        let pre_graph = load_symbol::<PreGraphFn>(&lib, PRE_GRAPH_SYMBOL);
        if pre_graph.is_none() {
            warn!(target: "graph_fuser", module = name, "no pre-graph entry point");
        }
        let release_graph = load_symbol::<ReleaseGraphFn>(&lib, RELEASE_GRAPH_SYMBOL);
        if release_graph.is_none() {
            warn!(
                target: "graph_fuser",
                module = name,
                "no release entry point, optimizer buffers will not be returned"
            );
        }
        debug!(target: "graph_fuser", module = name, "optimizer module loaded");
        Ok(Self {
            name: name.to_string(),
            _lib: lib,
            fuse_graph,
            pre_graph,
            release_graph,
        })
    }

    fn parse(&self, buffer: RawBuffer) -> Result<ExchangeGraph, ModuleError> {
        if buffer.ptr == 0 || buffer.len == 0 {
            return Err(ModuleError::EmptyResult);
        }
        // SAFETY: The module hands out a buffer of `len` bytes that stays valid until released.
        let bytes = unsafe { slice::from_raw_parts(buffer.ptr as *const u8, buffer.len) };
        Ok(ExchangeGraph::from_json(bytes)?)
    }

    fn release_buffer(&self, buffer: RawBuffer) {
        let Some(release) = self.release_graph else {
            return;
        };
        // SAFETY: The buffer was returned by this module and is released exactly once.
        let status = unsafe { release(buffer.ptr as *mut u8, buffer.len) };
        if status != STATUS_SUCCESS {
            warn!(target: "graph_fuser", module = %self.name, status, "release entry point failed");
        }
    }
}

/// Invokes one of the `(input, len, &mut out, &mut out_len)` entry points.
fn call_entry(
    entry: unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32,
    input: &[u8],
) -> Result<RawBuffer, ModuleError> {
    let mut output: *mut u8 = ptr::null_mut();
    let mut output_len = 0usize;
    // SAFETY: Input is a live byte slice; output pointers refer to locals written by the callee.
    let status = unsafe { entry(input.as_ptr(), input.len(), &mut output, &mut output_len) };
    if status != STATUS_SUCCESS {
        return Err(ModuleError::Failed { status });
    }
    Ok(RawBuffer {
        ptr: output as usize,
        len: output_len,
    })
}

impl OptimizerModule for DynamicOptimizerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn fuse_graph(&self, graph: &ExchangeGraph) -> Result<FusedGraph, ModuleError> {
        let input = graph.to_json()?;
        let buffer = call_entry(self.fuse_graph, &input)?;
        match self.parse(buffer) {
            Ok(graph) => Ok(FusedGraph {
                graph,
                buffer: Some(buffer),
            }),
            Err(err) => {
                if buffer.ptr != 0 {
                    self.release_buffer(buffer);
                }
                Err(err)
            }
        }
    }

    fn get_pre_graph(&self, node: &ExchangeNode) -> Option<Result<ExchangeGraph, ModuleError>> {
        let entry = self.pre_graph?;
        let result = serde_json::to_vec(node)
            .map_err(ModuleError::from)
            .and_then(|input| call_entry(entry, &input))
            .and_then(|buffer| {
                let parsed = self.parse(buffer);
                if buffer.ptr != 0 {
                    self.release_buffer(buffer);
                }
                parsed
            });
        Some(result)
    }

    fn release(&self, result: FusedGraph) {
        if let Some(buffer) = result.buffer {
            self.release_buffer(buffer);
        }
    }
}

fn load_symbol<T: Copy>(lib: &Library, name: &str) -> Option<T> {
    // SAFETY: Caller provides the symbol type declared by the optimizer ABI.
    let sym = unsafe { lib.get::<T>(name.as_bytes()) }.ok()?;
    Some(*sym)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let err = DynamicOptimizerModule::load("libgraph_fuser_does_not_exist.so")
            .expect_err("library must not load");
        assert!(matches!(err, ModuleError::Load { .. }));
    }
}
