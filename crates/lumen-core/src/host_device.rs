//! Host-memory implementation of the `Device` trait.
//!
//! Each stream is a worker thread draining an in-order command queue. Kernels
//! run against a shared, mutex-guarded allocation pool. Events are
//! generation counters: a record bumps the generation when the recording
//! stream reaches it, a wait blocks the waiting stream until the generation
//! it captured at enqueue time has been reached.
//!
//! A kernel failure makes its stream sticky-failed: later launches on that
//! stream are skipped (event records still complete, so other streams never
//! deadlock) until the failure is observed by `synchronize` or a completion
//! callback.

use crate::device::{
    Completion, Device, DeviceError, DeviceMemory, DevicePtr, DeviceProperties, EventId, Kernel,
    LaunchDesc, StreamId,
};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Configuration for a `HostDevice`.
#[derive(Debug, Clone, Default)]
pub struct HostDeviceConfig {
    /// Properties reported to operations.
    pub properties: DeviceProperties,

    /// Optional cap on the total bytes allocated at once.
    pub memory_limit: Option<usize>,
}

/// Allocation pool shared by every stream.
#[derive(Debug, Default)]
struct HostMemory {
    allocations: HashMap<u64, Vec<u8>>,
    next_handle: u64,
    used: usize,
}

impl HostMemory {
    fn range(&self, ptr: DevicePtr, len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let allocation = self
            .allocations
            .get(&ptr.allocation)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        let end = ptr.offset.checked_add(len).unwrap_or(usize::MAX);
        if end > allocation.len() {
            return Err(DeviceError::OutOfBounds {
                ptr,
                len,
                size: allocation.len(),
            });
        }
        Ok(ptr.offset..end)
    }
}

impl DeviceMemory for HostMemory {
    fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], DeviceError> {
        let range = self.range(ptr, len)?;
        Ok(&self.allocations[&ptr.allocation][range])
    }

    fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DeviceError> {
        let range = self.range(ptr, len)?;
        let allocation = self
            .allocations
            .get_mut(&ptr.allocation)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        Ok(&mut allocation[range])
    }
}

#[derive(Debug, Default)]
struct EventState {
    /// Number of records enqueued so far.
    enqueued: AtomicU64,

    /// Highest generation reached by a recording stream.
    reached: Mutex<u64>,
    cond: Condvar,
}

enum Command {
    Launch { desc: LaunchDesc, kernel: Kernel },
    Record { event: Arc<EventState>, generation: u64 },
    Wait { event: Arc<EventState>, generation: u64 },
    Complete(Completion),
    Sync(Sender<Result<(), DeviceError>>),
}

struct StreamWorker {
    sender: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

/// A `Device` backed by host memory and worker threads.
pub struct HostDevice {
    properties: DeviceProperties,
    memory_limit: Option<usize>,
    memory: Arc<Mutex<HostMemory>>,
    streams: Mutex<Vec<StreamWorker>>,
    events: Mutex<Vec<Arc<EventState>>>,
}

impl HostDevice {
    /// Create a device with default properties and no memory limit.
    pub fn new() -> Self {
        Self::with_config(HostDeviceConfig::default())
    }

    /// Create a device from a configuration.
    pub fn with_config(config: HostDeviceConfig) -> Self {
        let device = Self {
            properties: config.properties,
            memory_limit: config.memory_limit,
            memory: Arc::new(Mutex::new(HostMemory {
                next_handle: 1,
                ..HostMemory::default()
            })),
            streams: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        };
        if let Ok(mut streams) = device.streams.lock() {
            streams.push(device.spawn_worker(0));
        }
        device
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.memory.lock().map(|m| m.used).unwrap_or(0)
    }

    fn spawn_worker(&self, index: usize) -> StreamWorker {
        let (sender, receiver) = mpsc::channel();
        let memory = Arc::clone(&self.memory);
        let thread = thread::Builder::new()
            .name(format!("lumen-stream-{index}"))
            .spawn(move || stream_loop(receiver, memory))
            .ok();
        StreamWorker {
            sender: Some(sender),
            thread,
        }
    }

    fn enqueue(&self, stream: StreamId, command: Command) -> Result<(), DeviceError> {
        let streams = self
            .streams
            .lock()
            .map_err(|_| DeviceError::Lost("stream table poisoned".into()))?;
        let worker = streams
            .get(stream.0)
            .ok_or(DeviceError::InvalidStream(stream))?;
        worker
            .sender
            .as_ref()
            .ok_or(DeviceError::InvalidStream(stream))?
            .send(command)
            .map_err(|_| DeviceError::Lost(format!("stream {} worker exited", stream.0)))
    }

    fn event(&self, event: EventId) -> Result<Arc<EventState>, DeviceError> {
        let events = self
            .events
            .lock()
            .map_err(|_| DeviceError::Lost("event table poisoned".into()))?;
        events
            .get(event.0)
            .cloned()
            .ok_or(DeviceError::InvalidEvent(event))
    }

    fn lock_memory(&self) -> Result<std::sync::MutexGuard<'_, HostMemory>, DeviceError> {
        self.memory
            .lock()
            .map_err(|_| DeviceError::Lost("memory pool poisoned".into()))
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("properties", &self.properties)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

fn stream_loop(receiver: Receiver<Command>, memory: Arc<Mutex<HostMemory>>) {
    let mut failure: Option<DeviceError> = None;

    while let Ok(command) = receiver.recv() {
        match command {
            Command::Launch { desc, kernel } => {
                if failure.is_some() {
                    tracing::trace!(kernel = %desc.name, "skipping launch on failed stream");
                    continue;
                }
                if let Err(error) = run_kernel(&memory, &desc, kernel) {
                    tracing::debug!(kernel = %desc.name, %error, "kernel fault");
                    failure = Some(error);
                }
            }
            Command::Record { event, generation } => {
                let mut reached = match event.reached.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *reached = (*reached).max(generation);
                event.cond.notify_all();
            }
            Command::Wait { event, generation } => {
                let mut reached = match event.reached.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                while *reached < generation {
                    reached = match event.cond.wait(reached) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
            Command::Complete(callback) => {
                callback(failure.take().map_or(Ok(()), Err));
            }
            Command::Sync(reply) => {
                let _ = reply.send(failure.take().map_or(Ok(()), Err));
            }
        }
    }
}

fn run_kernel(
    memory: &Mutex<HostMemory>,
    desc: &LaunchDesc,
    kernel: Kernel,
) -> Result<(), DeviceError> {
    let mut memory = memory
        .lock()
        .map_err(|_| DeviceError::Lost("memory pool poisoned".into()))?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel(&mut *memory)));
    let error = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(DeviceError::KernelFault { message, tag, .. })) => {
            return Err(DeviceError::KernelFault {
                kernel: desc.name.clone(),
                tag: tag.or(desc.tag),
                message,
            })
        }
        Ok(Err(other)) => other.to_string(),
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "kernel panicked".to_string()),
    };
    Err(DeviceError::KernelFault {
        kernel: desc.name.clone(),
        tag: desc.tag,
        message: error,
    })
}

impl Device for HostDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn default_stream(&self) -> StreamId {
        StreamId(0)
    }

    fn allocate(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        let mut memory = self.lock_memory()?;
        if let Some(limit) = self.memory_limit {
            let available = limit.saturating_sub(memory.used);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        let handle = memory.next_handle;
        memory.next_handle += 1;
        memory.used += bytes;
        memory.allocations.insert(handle, vec![0; bytes]);
        Ok(DevicePtr {
            allocation: handle,
            offset: 0,
        })
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if ptr.offset != 0 {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        let mut memory = self.lock_memory()?;
        let allocation = memory
            .allocations
            .remove(&ptr.allocation)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        memory.used -= allocation.len();
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamId, DeviceError> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| DeviceError::Lost("stream table poisoned".into()))?;
        let id = streams.len();
        streams.push(self.spawn_worker(id));
        tracing::trace!(stream = id, "created stream");
        Ok(StreamId(id))
    }

    fn create_event(&self) -> Result<EventId, DeviceError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| DeviceError::Lost("event table poisoned".into()))?;
        events.push(Arc::new(EventState::default()));
        Ok(EventId(events.len() - 1))
    }

    fn record_event(&self, event: EventId, stream: StreamId) -> Result<(), DeviceError> {
        let state = self.event(event)?;
        let generation = state.enqueued.fetch_add(1, Ordering::SeqCst) + 1;
        self.enqueue(
            stream,
            Command::Record {
                event: state,
                generation,
            },
        )
    }

    fn wait_event(&self, stream: StreamId, event: EventId) -> Result<(), DeviceError> {
        let state = self.event(event)?;
        let generation = state.enqueued.load(Ordering::SeqCst);
        if generation == 0 {
            return Ok(());
        }
        self.enqueue(
            stream,
            Command::Wait {
                event: state,
                generation,
            },
        )
    }

    fn launch(
        &self,
        stream: StreamId,
        desc: LaunchDesc,
        kernel: Kernel,
    ) -> Result<(), DeviceError> {
        self.enqueue(stream, Command::Launch { desc, kernel })
    }

    fn copy_to_device(&self, dst: DevicePtr, data: &[u8]) -> Result<(), DeviceError> {
        let mut memory = self.lock_memory()?;
        memory.bytes_mut(dst, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), DeviceError> {
        let memory = self.lock_memory()?;
        out.copy_from_slice(memory.bytes(src, out.len())?);
        Ok(())
    }

    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError> {
        let (reply, status) = mpsc::channel();
        self.enqueue(stream, Command::Sync(reply))?;
        status
            .recv()
            .map_err(|_| DeviceError::Lost(format!("stream {} worker exited", stream.0)))?
    }

    fn on_complete(&self, stream: StreamId, callback: Completion) -> Result<(), DeviceError> {
        self.enqueue(stream, Command::Complete(callback))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let workers = match self.streams.get_mut() {
            Ok(streams) => std::mem::take(streams),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        let current = thread::current().id();
        for mut worker in workers {
            drop(worker.sender.take());
            if let Some(handle) = worker.thread.take() {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }
}
