//! Error types for the runtime crate.

use lumen_core::DeviceError;
use std::fmt;
use thiserror::Error;

/// When an execution error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionErrorKind {
    /// An operation refused to enqueue its work.
    PreLaunch,

    /// A kernel faulted on the device; observed at synchronization.
    DeviceFault,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::PreLaunch => write!(f, "pre-launch"),
            ExecutionErrorKind::DeviceFault => write!(f, "device fault"),
        }
    }
}

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Compilation, operation construction or workbuffer initialization failed.
    #[error("Graph compilation failed: {0}")]
    GraphCompilation(#[from] lumen_core::Error),

    /// A request failed while executing.
    #[error("Execution failed ({kind}) at operation {}: {message}", op_label(.op_index))]
    Execution {
        kind: ExecutionErrorKind,
        op_index: Option<usize>,
        message: String,
    },

    /// Invalid input/output binding.
    #[error("Invalid input or output: {0}")]
    InvalidInputOutput(String),

    /// Device call outside of operation execution failed.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    TensorError(String),
}

fn op_label(op_index: &Option<usize>) -> String {
    op_index.map_or_else(|| "?".to_string(), |index| index.to_string())
}

impl RuntimeError {
    /// Execution error for a device fault, attributed through its launch tag.
    pub(crate) fn device_fault(error: DeviceError) -> Self {
        RuntimeError::Execution {
            kind: ExecutionErrorKind::DeviceFault,
            op_index: error.tag(),
            message: error.to_string(),
        }
    }

    /// Execution error for an operation that failed to enqueue.
    pub(crate) fn pre_launch(op_index: usize, error: lumen_core::Error) -> Self {
        RuntimeError::Execution {
            kind: ExecutionErrorKind::PreLaunch,
            op_index: Some(op_index),
            message: error.to_string(),
        }
    }

    /// The failing operation's plan index, for execution errors.
    pub fn op_index(&self) -> Option<usize> {
        match self {
            RuntimeError::Execution { op_index, .. } => *op_index,
            _ => None,
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
