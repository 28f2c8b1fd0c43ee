//! Device allocations owned by a compiled graph.

use lumen_core::{Device, DeviceError, DevicePtr};
use std::sync::Arc;

/// A device allocation freed on drop.
///
/// Used for the workbuffer arenas, constant and intermediate tensors, and
/// the staging buffers of `CompiledGraph::run_host`.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    ptr: DevicePtr,
    size: usize,
}

impl DeviceBuffer {
    /// Allocate `size` bytes (at least one, so the base pointer is never null).
    pub fn allocate(device: &Arc<dyn Device>, size: usize) -> Result<Self, DeviceError> {
        let ptr = device.allocate(size.max(1))?;
        Ok(Self {
            device: Arc::clone(device),
            ptr,
            size,
        })
    }

    /// Allocate and fill with `data`.
    pub fn with_data(device: &Arc<dyn Device>, data: &[u8]) -> Result<Self, DeviceError> {
        let buffer = Self::allocate(device, data.len())?;
        device.copy_to_device(buffer.ptr, data)?;
        Ok(buffer)
    }

    /// Base pointer.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Pointer `offset` bytes into the allocation.
    pub fn at(&self, offset: usize) -> DevicePtr {
        self.ptr.add(offset)
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.free(self.ptr) {
            tracing::warn!(ptr = %self.ptr, error = %e, "failed to free device buffer");
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
