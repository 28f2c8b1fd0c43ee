//! Device abstraction consumed by operations and the execution driver.
//!
//! The `Device` trait is the boundary to the allocator/stream subsystem:
//! memory allocation, streams, events, kernel launches, blocking copies and
//! synchronization. Kernel launches are asynchronous; failures inside a
//! kernel are reported only when the stream is synchronized (or through a
//! completion callback), never by `launch` itself.

use crate::types::{DeviceElement, ElementType};
use bytemuck::Pod;
use std::fmt;

/// Opaque device address: an allocation handle plus a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    /// Allocation handle (0 is reserved for null).
    pub allocation: u64,

    /// Byte offset inside the allocation.
    pub offset: usize,
}

impl DevicePtr {
    /// The null pointer.
    pub const NULL: DevicePtr = DevicePtr {
        allocation: 0,
        offset: 0,
    };

    /// Check if this is the null pointer.
    pub fn is_null(&self) -> bool {
        self.allocation == 0
    }

    /// Pointer `bytes` further into the same allocation.
    pub fn add(self, bytes: usize) -> DevicePtr {
        DevicePtr {
            allocation: self.allocation,
            offset: self.offset + bytes,
        }
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.allocation, self.offset)
    }
}

/// Handle to an in-order device work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub usize);

/// Handle to a device event used for cross-stream ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub usize);

/// Static capabilities of a device, used for kernel selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Human-readable device name.
    pub name: String,

    /// Compute capability as (major, minor).
    pub compute_capability: (u32, u32),

    /// Total device memory in bytes.
    pub total_memory: usize,

    /// Alignment applied to every workbuffer placement, in bytes.
    pub workbuffer_alignment: usize,
}

impl DeviceProperties {
    /// Check if kernels for `dtype` can run on this device.
    ///
    /// Half precision needs compute capability 5.3, bfloat16 needs 8.0.
    pub fn supports(&self, dtype: ElementType) -> bool {
        match dtype {
            ElementType::F16 => self.compute_capability >= (5, 3),
            ElementType::BF16 => self.compute_capability >= (8, 0),
            other => crate::types::representation_of(other).is_ok(),
        }
    }
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            compute_capability: (8, 6),
            total_memory: 1 << 32,
            workbuffer_alignment: 256,
        }
    }
}

/// Device-side failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid device pointer {0}")]
    InvalidPointer(DevicePtr),

    #[error("Access of {len} bytes at {ptr} is out of bounds (allocation holds {size})")]
    OutOfBounds {
        ptr: DevicePtr,
        len: usize,
        size: usize,
    },

    #[error("Invalid stream {0:?}")]
    InvalidStream(StreamId),

    #[error("Invalid event {0:?}")]
    InvalidEvent(EventId),

    #[error("Kernel '{kernel}' failed: {message}")]
    KernelFault {
        kernel: String,
        tag: Option<usize>,
        message: String,
    },

    #[error("Device lost: {0}")]
    Lost(String),
}

impl DeviceError {
    /// Launch tag of the kernel that faulted, if any.
    pub fn tag(&self) -> Option<usize> {
        match self {
            DeviceError::KernelFault { tag, .. } => *tag,
            _ => None,
        }
    }
}

/// Describes one kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDesc {
    /// Kernel name (for diagnostics).
    pub name: String,

    /// Caller-defined tag carried into deferred fault reports.
    pub tag: Option<usize>,
}

/// Device memory as seen from inside a running kernel.
pub trait DeviceMemory {
    /// Borrow `len` bytes starting at `ptr`.
    fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], DeviceError>;

    /// Mutably borrow `len` bytes starting at `ptr`.
    fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DeviceError>;
}

impl dyn DeviceMemory + '_ {
    /// Load `count` elements of `T` starting at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, count: usize) -> Result<Vec<T>, DeviceError> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes(ptr, count * size)?;
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// Store `values` starting at `ptr`.
    pub fn write<T: Pod>(&mut self, ptr: DevicePtr, values: &[T]) -> Result<(), DeviceError> {
        let src: &[u8] = bytemuck::cast_slice(values);
        self.bytes_mut(ptr, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Load `count` elements and widen them to `f64`.
    pub fn read_wide<T: DeviceElement>(
        &self,
        ptr: DevicePtr,
        count: usize,
    ) -> Result<Vec<f64>, DeviceError> {
        Ok(self
            .read::<T>(ptr, count)?
            .into_iter()
            .map(T::to_f64)
            .collect())
    }

    /// Narrow `values` to `T` and store them starting at `ptr`.
    pub fn write_narrow<T: DeviceElement>(
        &mut self,
        ptr: DevicePtr,
        values: &[f64],
    ) -> Result<(), DeviceError> {
        let narrowed: Vec<T> = values.iter().map(|&v| T::from_f64(v)).collect();
        self.write(ptr, &narrowed)
    }

    /// Load `count` integer elements and widen them to `i128`.
    pub fn read_integer<T: DeviceElement>(
        &self,
        ptr: DevicePtr,
        count: usize,
    ) -> Result<Vec<i128>, DeviceError> {
        Ok(self
            .read::<T>(ptr, count)?
            .into_iter()
            .map(T::to_i128)
            .collect())
    }

    /// Narrow `values` to `T`, keeping the low bits, and store them.
    pub fn write_integer<T: DeviceElement>(
        &mut self,
        ptr: DevicePtr,
        values: &[i128],
    ) -> Result<(), DeviceError> {
        let narrowed: Vec<T> = values.iter().map(|&v| T::from_i128(v)).collect();
        self.write(ptr, &narrowed)
    }
}

/// Kernel body executed by a stream once its predecessors have completed.
pub type Kernel = Box<dyn FnOnce(&mut dyn DeviceMemory) -> Result<(), DeviceError> + Send>;

/// Completion callback invoked with the stream status once prior work finishes.
pub type Completion = Box<dyn FnOnce(Result<(), DeviceError>) + Send>;

/// Device/allocator collaborator.
pub trait Device: Send + Sync {
    /// Static capabilities of this device.
    fn properties(&self) -> &DeviceProperties;

    /// The stream created together with the device.
    fn default_stream(&self) -> StreamId;

    /// Allocate `bytes` of device memory.
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;

    /// Release an allocation returned by `allocate`.
    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Create a new stream.
    fn create_stream(&self) -> Result<StreamId, DeviceError>;

    /// Create a new event.
    fn create_event(&self) -> Result<EventId, DeviceError>;

    /// Enqueue a record of `event` on `stream`.
    fn record_event(&self, event: EventId, stream: StreamId) -> Result<(), DeviceError>;

    /// Make `stream` wait for the most recent record of `event`.
    ///
    /// Waiting on an event that was never recorded is a no-op.
    fn wait_event(&self, stream: StreamId, event: EventId) -> Result<(), DeviceError>;

    /// Enqueue a kernel on `stream` and return immediately.
    fn launch(&self, stream: StreamId, desc: LaunchDesc, kernel: Kernel)
        -> Result<(), DeviceError>;

    /// Blocking host-to-device copy.
    fn copy_to_device(&self, dst: DevicePtr, data: &[u8]) -> Result<(), DeviceError>;

    /// Blocking device-to-host copy.
    fn copy_to_host(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Block until all work on `stream` has completed.
    ///
    /// Returns the first kernel fault observed on the stream since the last
    /// synchronization and clears it.
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Invoke `callback` once all work currently enqueued on `stream` completes.
    ///
    /// The callback observes (and clears) the stream status, like `synchronize`.
    fn on_complete(&self, stream: StreamId, callback: Completion) -> Result<(), DeviceError>;
}
