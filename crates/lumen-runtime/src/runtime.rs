//! Runtime initialization and device management.

use crate::error::Result;
use crate::graph::CompiledGraph;
use lumen_compiler::CompileOptions;
use lumen_core::{CreationContext, Device, DeviceProperties, GraphDesc, HostDevice};
use std::sync::Arc;

/// Main entry point for executing graphs.
///
/// Holds the device and the creation context every graph is compiled
/// against.
///
/// # Example
/// ```no_run
/// # use lumen_runtime::Runtime;
/// # use lumen_compiler::CompileOptions;
/// # use lumen_core::GraphDesc;
/// # fn main() -> anyhow::Result<()> {
/// # let graph = GraphDesc::new("model");
/// let runtime = Runtime::new();
/// let compiled = runtime.compile(&graph, &CompileOptions::default())?;
/// # Ok(())
/// # }
/// ```
pub struct Runtime {
    ctx: CreationContext,
}

impl Runtime {
    /// Initialize the runtime on a host-memory device.
    pub fn new() -> Self {
        Self::with_device(Arc::new(HostDevice::new()))
    }

    /// Initialize the runtime on a specific device.
    ///
    /// Graphs compiled by this runtime issue their first stream on the
    /// device's default stream.
    pub fn with_device(device: Arc<dyn Device>) -> Self {
        tracing::debug!(properties = ?device.properties(), "runtime initialized");
        Self {
            ctx: CreationContext::new(device),
        }
    }

    /// Compile a graph for this runtime's device.
    ///
    /// # Errors
    /// Returns an error if compilation, allocation or workbuffer
    /// initialization fails.
    pub fn compile(&self, graph: &GraphDesc, options: &CompileOptions) -> Result<CompiledGraph> {
        CompiledGraph::compile(graph, &self.ctx, options)
    }

    /// Creation context used for compilation.
    pub fn context(&self) -> &CreationContext {
        &self.ctx
    }

    /// Get a reference to the device.
    pub fn device(&self) -> &Arc<dyn Device> {
        self.ctx.device()
    }

    /// Properties of the device.
    pub fn properties(&self) -> &DeviceProperties {
        self.ctx.properties()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("ctx", &self.ctx).finish()
    }
}
