//! Creation context shared by every operation during one build pass.

use crate::device::{Device, DeviceProperties, StreamId};
use crate::types::ElementType;
use crate::{Error, Result};
use std::sync::Arc;

/// Read-only context handed to operation constructors.
///
/// Owned by the graph builder. Operations read device properties from it at
/// construction and keep no reference afterwards.
#[derive(Clone)]
pub struct CreationContext {
    device: Arc<dyn Device>,
    properties: DeviceProperties,
    stream: StreamId,
}

impl CreationContext {
    /// Create a context for `device`, using its default stream.
    pub fn new(device: Arc<dyn Device>) -> Self {
        let properties = device.properties().clone();
        let stream = device.default_stream();
        Self {
            device,
            properties,
            stream,
        }
    }

    /// Use `stream` as the current stream.
    pub fn with_stream(mut self, stream: StreamId) -> Self {
        self.stream = stream;
        self
    }

    /// The device handle.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Device properties captured at context creation.
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// The current stream.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Fail with `UnsupportedElementType` if the device cannot run `dtype`.
    pub fn require_support(&self, dtype: ElementType, what: &str) -> Result<()> {
        if self.properties.supports(dtype) {
            Ok(())
        } else {
            Err(Error::unsupported_type(
                dtype,
                format!(
                    "{what} on {} (compute capability {}.{})",
                    self.properties.name,
                    self.properties.compute_capability.0,
                    self.properties.compute_capability.1
                ),
            ))
        }
    }
}

impl std::fmt::Debug for CreationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationContext")
            .field("properties", &self.properties)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
