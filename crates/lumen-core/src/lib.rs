//! Core types, operation contract, and device abstraction for Lumen.
//!
//! This crate provides the foundational abstractions that all other Lumen crates depend on:
//! - Element types and the type-trait registry (`ElementType`, `representation_of`)
//! - Graph descriptors handed over by the IR producer (`GraphDesc`, `NodeDesc`, `TensorDesc`)
//! - Creation context and node attribute access for operation construction
//! - Index collections binding operations to the graph-wide buffer table
//! - The `Operation` execution contract and workbuffer descriptors
//! - The `Device` trait and a host-memory device (`HostDevice`)

pub mod broadcast;
pub mod context;
pub mod device;
pub mod graph;
pub mod host_device;
pub mod index;
pub mod node;
pub mod operation;
pub mod types;
pub mod workbuffer;

pub use half;

// Re-export commonly used types
pub use broadcast::{broadcast_shape, broadcast_strides};
pub use context::CreationContext;
pub use device::{
    Completion, Device, DeviceError, DeviceMemory, DevicePtr, DeviceProperties, EventId, Kernel,
    LaunchDesc, StreamId,
};
pub use graph::{AttributeValue, GraphDesc, NodeDesc, NodeId, TensorDesc, TensorId, TensorKind};
pub use host_device::{HostDevice, HostDeviceConfig};
pub use index::{BufferIndex, IndexCollection};
pub use node::NodeView;
pub use operation::{validate_binding, ExecutionCtx, Operation};
pub use types::{representation_of, DeviceElement, DeviceRepr, ElementType, Representation};
pub use workbuffer::{Mutability, WorkbufferRequest, Workbuffers};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for operation construction and execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unsupported element type {dtype} for {context}")]
    UnsupportedElementType { dtype: ElementType, context: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Workbuffer initialization failed: {0}")]
    InitializationFailure(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    /// Shorthand for an `UnsupportedElementType` error.
    pub fn unsupported_type(dtype: ElementType, context: impl Into<String>) -> Self {
        Error::UnsupportedElementType {
            dtype,
            context: context.into(),
        }
    }

    /// Whether this error came from construction-time validation.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedElementType { .. }
                | Error::ShapeMismatch(_)
                | Error::UnsupportedConfiguration(_)
                | Error::Attribute(_)
        )
    }
}
