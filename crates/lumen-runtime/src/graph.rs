//! Compiled graph: device resources plus the per-request execution driver.

use crate::arena::DeviceBuffer;
use crate::error::{Result, RuntimeError};
use crate::handle::{CompletionSet, RunHandle};
use crate::tensor::Tensor;
use lumen_compiler::{CompileOptions, CompiledPlan};
use lumen_core::{
    CreationContext, Device, DeviceError, DevicePtr, Error, EventId, ExecutionCtx, GraphDesc,
    Operation, StreamId, TensorDesc, TensorKind, Workbuffers,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Buffer-table slots and workbuffer pointers of one planned operation.
#[derive(Debug)]
struct OpBinding {
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    workbuffers: Workbuffers,
}

/// A graph compiled for one device, reusable across requests.
///
/// Owns every compile-time allocation: constants, intermediates and the two
/// workbuffer arenas. Each request binds caller input/output pointers into a
/// copy of the buffer table, dispatches the operations in plan order on
/// their assigned streams, and synchronizes.
///
/// # Example
/// ```no_run
/// # use lumen_runtime::{CompiledGraph, Tensor};
/// # use lumen_compiler::CompileOptions;
/// # use lumen_core::{CreationContext, GraphDesc, HostDevice};
/// # use std::sync::Arc;
/// # fn main() -> anyhow::Result<()> {
/// # let graph = GraphDesc::new("model");
/// let ctx = CreationContext::new(Arc::new(HostDevice::new()));
/// let compiled = CompiledGraph::compile(&graph, &ctx, &CompileOptions::default())?;
/// let outputs = compiled.run_host(&[Tensor::from_vec(vec![1.0f32; 4], &[4])?])?;
/// # Ok(())
/// # }
/// ```
pub struct CompiledGraph {
    device: Arc<dyn Device>,
    plan: CompiledPlan,

    /// Tensor metadata (constant data stripped).
    tensors: Vec<TensorDesc>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,

    /// Buffer table with constants and intermediates filled in; caller
    /// input/output slots stay null.
    table: Vec<DevicePtr>,
    bindings: Vec<OpBinding>,

    streams: Vec<StreamId>,
    /// Event recorded after each operation that a consumer on another stream waits on.
    events: Vec<Option<EventId>>,
    /// Event recorded at the end of each request, per stream.
    fences: Vec<EventId>,

    /// Serialises host issuance and blocking synchronization.
    issue: Mutex<()>,

    _tensor_buffers: Vec<DeviceBuffer>,
    immutable_arena: DeviceBuffer,
    mutable_arena: DeviceBuffer,
}

impl CompiledGraph {
    /// Compile `graph` and allocate its device resources.
    ///
    /// # Arguments
    ///
    /// * `graph` - Ordered graph descriptor
    /// * `ctx` - Creation context; its stream becomes stream 0 of the graph
    /// * `options` - Fusion and stream options
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::GraphCompilation` if construction, allocation
    /// or workbuffer initialization fails.
    #[tracing::instrument(skip_all, fields(graph = %graph.name, streams = options.stream_count))]
    pub fn compile(
        graph: &GraphDesc,
        ctx: &CreationContext,
        options: &CompileOptions,
    ) -> Result<Self> {
        let plan = lumen_compiler::compile(graph, ctx, options)?;
        let device = Arc::clone(ctx.device());

        let (table, tensor_buffers) = {
            let _span = tracing::debug_span!("allocate_tensors").entered();
            allocate_tensors(&device, graph)?
        };

        let (immutable_arena, mutable_arena, bindings) = {
            let _span = tracing::debug_span!("allocate_workbuffers").entered();
            let immutable = DeviceBuffer::allocate(&device, plan.layout.immutable_size)
                .map_err(Error::from)?;
            let mutable =
                DeviceBuffer::allocate(&device, plan.layout.mutable_size).map_err(Error::from)?;

            let bindings = plan
                .ops
                .iter()
                .map(|planned| OpBinding {
                    inputs: planned.op.input_ids().iter().map(|i| i.0).collect(),
                    outputs: planned.op.output_ids().iter().map(|i| i.0).collect(),
                    workbuffers: Workbuffers {
                        immutable: planned
                            .workbuffers
                            .immutable
                            .iter()
                            .map(|&offset| immutable.at(offset))
                            .collect(),
                        mutable: planned
                            .workbuffers
                            .mutable
                            .iter()
                            .map(|&offset| mutable.at(offset))
                            .collect(),
                    },
                })
                .collect::<Vec<_>>();
            (immutable, mutable, bindings)
        };

        {
            let _span = tracing::debug_span!("initialize_workbuffers").entered();
            for (planned, binding) in plan.ops.iter().zip(&bindings) {
                planned
                    .op
                    .initialize_workbuffers(device.as_ref(), &binding.workbuffers.immutable)
                    .map_err(|e| match e {
                        Error::InitializationFailure(_) => e,
                        other => Error::InitializationFailure(format!(
                            "{}: {other}",
                            planned.op.name()
                        )),
                    })?;
            }
        }

        let mut streams = vec![ctx.stream()];
        for _ in 1..plan.stream_count {
            streams.push(device.create_stream().map_err(Error::from)?);
        }
        let events = plan
            .ops
            .iter()
            .map(|planned| {
                planned
                    .schedule
                    .records_event
                    .then(|| device.create_event())
                    .transpose()
            })
            .collect::<std::result::Result<Vec<_>, DeviceError>>()
            .map_err(Error::from)?;
        let fences = if streams.len() > 1 {
            streams
                .iter()
                .map(|_| device.create_event())
                .collect::<std::result::Result<Vec<_>, DeviceError>>()
                .map_err(Error::from)?
        } else {
            Vec::new()
        };

        let tensors = graph
            .tensors
            .iter()
            .map(|tensor| TensorDesc {
                data: None,
                ..tensor.clone()
            })
            .collect();

        tracing::debug!(
            ops = plan.ops.len(),
            fused = plan.fused_count(),
            streams = streams.len(),
            "graph ready"
        );

        Ok(Self {
            device,
            plan,
            tensors,
            inputs: graph.inputs.clone(),
            outputs: graph.outputs.clone(),
            table,
            bindings,
            streams,
            events,
            fences,
            issue: Mutex::new(()),
            _tensor_buffers: tensor_buffers,
            immutable_arena,
            mutable_arena,
        })
    }

    /// The compiled plan.
    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    /// Arena holding every immutable workbuffer.
    pub fn immutable_arena(&self) -> &DeviceBuffer {
        &self.immutable_arena
    }

    /// Arena holding the per-stream mutable workbuffer regions.
    pub fn mutable_arena(&self) -> &DeviceBuffer {
        &self.mutable_arena
    }

    /// Metadata of the graph inputs, in binding order.
    pub fn input_descs(&self) -> impl Iterator<Item = &TensorDesc> + '_ {
        self.inputs.iter().map(|&id| &self.tensors[id])
    }

    /// Metadata of the graph outputs, in binding order.
    pub fn output_descs(&self) -> impl Iterator<Item = &TensorDesc> + '_ {
        self.outputs.iter().map(|&id| &self.tensors[id])
    }

    /// Execute one request and block until it finishes.
    ///
    /// `inputs` and `outputs` are device pointers in graph input/output
    /// order.
    ///
    /// # Errors
    ///
    /// - `InvalidInputOutput` for wrong counts or null pointers
    /// - `Execution { kind: PreLaunch, .. }` if an operation refuses to enqueue
    /// - `Execution { kind: DeviceFault, .. }` for a deferred kernel fault
    pub fn run(&self, inputs: &[DevicePtr], outputs: &[DevicePtr]) -> Result<()> {
        let _guard = self.lock_issue();
        self.issue(inputs, outputs)?;
        self.synchronize_all()
    }

    /// Execute one request without blocking.
    ///
    /// The returned handle resolves once every stream has finished the
    /// request. Caller buffers must stay alive until then.
    pub fn run_async(&self, inputs: &[DevicePtr], outputs: &[DevicePtr]) -> Result<RunHandle> {
        let _guard = self.lock_issue();
        self.issue(inputs, outputs)?;

        let (completions, handle) = CompletionSet::new(self.streams.len());
        for &stream in &self.streams {
            self.device.on_complete(stream, completions.callback(stream))?;
        }
        tracing::trace!("completion callbacks registered");
        Ok(handle)
    }

    /// Upload host tensors, run, and download the outputs.
    pub fn run_host(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if inputs.len() != self.inputs.len() {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "expected {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }

        let mut input_buffers = Vec::with_capacity(inputs.len());
        for (tensor, desc) in inputs.iter().zip(self.input_descs()) {
            if tensor.dtype() != desc.dtype || tensor.shape() != desc.shape.as_slice() {
                return Err(RuntimeError::TensorError(format!(
                    "input '{}' expects {} {:?}, got {} {:?}",
                    desc.name,
                    desc.dtype,
                    desc.shape,
                    tensor.dtype(),
                    tensor.shape()
                )));
            }
            input_buffers.push(DeviceBuffer::with_data(&self.device, tensor.as_bytes())?);
        }

        let mut output_buffers = Vec::with_capacity(self.outputs.len());
        for desc in self.output_descs() {
            let size = desc.size_bytes().map_err(|e| RuntimeError::TensorError(e.to_string()))?;
            output_buffers.push(DeviceBuffer::allocate(&self.device, size)?);
        }

        let input_ptrs: Vec<_> = input_buffers.iter().map(DeviceBuffer::ptr).collect();
        let output_ptrs: Vec<_> = output_buffers.iter().map(DeviceBuffer::ptr).collect();
        self.run(&input_ptrs, &output_ptrs)?;

        self.output_descs()
            .zip(&output_buffers)
            .map(|(desc, buffer)| -> Result<Tensor> {
                let mut data = vec![0u8; buffer.size()];
                self.device.copy_to_host(buffer.ptr(), &mut data)?;
                Ok(Tensor::from_raw(data, &desc.shape, desc.dtype))
            })
            .collect()
    }

    fn lock_issue(&self) -> MutexGuard<'_, ()> {
        self.issue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind and dispatch one request. Must hold the issue lock.
    fn issue(&self, inputs: &[DevicePtr], outputs: &[DevicePtr]) -> Result<()> {
        let table = self.bind(inputs, outputs)?;
        tracing::trace!("request bound");

        // Fence against the previous request on the other streams.
        for (s, &stream) in self.streams.iter().enumerate() {
            for (f, &fence) in self.fences.iter().enumerate() {
                if f != s {
                    self.device.wait_event(stream, fence)?;
                }
            }
        }

        for (index, (planned, binding)) in self.plan.ops.iter().zip(&self.bindings).enumerate() {
            let stream = self.streams[planned.schedule.stream];
            for &producer in &planned.schedule.waits {
                if let Some(event) = self.events[producer] {
                    self.device.wait_event(stream, event)?;
                }
            }

            let op_inputs: Vec<_> = binding.inputs.iter().map(|&slot| table[slot]).collect();
            let op_outputs: Vec<_> = binding.outputs.iter().map(|&slot| table[slot]).collect();
            let ctx = ExecutionCtx::new(self.device.as_ref(), stream, index);

            if let Err(e) = planned
                .op
                .execute(&ctx, &op_inputs, &op_outputs, &binding.workbuffers)
            {
                tracing::debug!(op = index, error = %e, "operation failed to enqueue");
                // Drain the streams; an earlier deferred fault takes precedence.
                self.synchronize_all()?;
                return Err(RuntimeError::pre_launch(index, e));
            }

            if let Some(event) = self.events[index] {
                self.device.record_event(event, stream)?;
            }
        }

        for (&stream, &fence) in self.streams.iter().zip(&self.fences) {
            self.device.record_event(fence, stream)?;
        }
        tracing::trace!(ops = self.plan.ops.len(), "request dispatched");
        Ok(())
    }

    /// Fill caller pointers into a copy of the buffer table.
    fn bind(&self, inputs: &[DevicePtr], outputs: &[DevicePtr]) -> Result<Vec<DevicePtr>> {
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "expected {} inputs and {} outputs, got {} and {}",
                self.inputs.len(),
                self.outputs.len(),
                inputs.len(),
                outputs.len()
            )));
        }

        let mut table = self.table.clone();
        let bound = self.inputs.iter().zip(inputs).chain(self.outputs.iter().zip(outputs));
        for (&slot, &ptr) in bound {
            if ptr.is_null() {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "null pointer bound to '{}'",
                    self.tensors[slot].name
                )));
            }
            table[slot] = ptr;
        }
        Ok(table)
    }

    /// Synchronize every stream, returning the earliest deferred fault.
    ///
    /// All streams are synchronized even after a fault so none keeps a
    /// stale error for the next request.
    fn synchronize_all(&self) -> Result<()> {
        let mut first: Option<DeviceError> = None;
        for &stream in &self.streams {
            if let Err(error) = self.device.synchronize(stream) {
                let earlier = match (&first, error.tag()) {
                    (None, _) => true,
                    (Some(current), Some(tag)) => current.tag().map_or(true, |t| tag < t),
                    (Some(_), None) => false,
                };
                if earlier {
                    first = Some(error);
                }
            }
        }
        tracing::trace!(failed = first.is_some(), "request synchronized");
        match first {
            Some(error) => Err(RuntimeError::device_fault(error)),
            None => Ok(()),
        }
    }
}

impl Drop for CompiledGraph {
    fn drop(&mut self) {
        // Outstanding non-blocking requests still reference the arenas.
        for &stream in &self.streams {
            let _ = self.device.synchronize(stream);
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("ops", &self.plan.ops.len())
            .field("streams", &self.streams)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Allocate constants (uploaded) and intermediates.
fn allocate_tensors(
    device: &Arc<dyn Device>,
    graph: &GraphDesc,
) -> Result<(Vec<DevicePtr>, Vec<DeviceBuffer>)> {
    let mut table = vec![DevicePtr::NULL; graph.tensors.len()];
    let mut buffers = Vec::new();

    for (id, tensor) in graph.tensors.iter().enumerate() {
        let buffer = match tensor.kind {
            TensorKind::Constant => {
                let data = tensor.data.as_deref().unwrap_or_default();
                DeviceBuffer::with_data(device, data).map_err(Error::from)?
            }
            TensorKind::Intermediate => {
                DeviceBuffer::allocate(device, tensor.size_bytes()?).map_err(Error::from)?
            }
            TensorKind::Input | TensorKind::Output => continue,
        };
        tracing::trace!(tensor = %tensor.name, bytes = buffer.size(), "allocated tensor");
        table[id] = buffer.ptr();
        buffers.push(buffer);
    }

    Ok((table, buffers))
}
