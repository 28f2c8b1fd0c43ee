//! Workbuffer descriptors.
//!
//! An operation declares its scratch needs once, at construction, as a list
//! of immutable and mutable byte sizes. Immutable buffers are populated
//! exactly once before first execution and never written again. Mutable
//! buffers carry no contents from one invocation to the next.

use crate::device::DevicePtr;

/// Whether a workbuffer keeps its contents across executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    Immutable,
    Mutable,
}

/// Byte sizes of the workbuffers an operation needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WorkbufferRequest {
    /// Sizes of immutable buffers, in binding order.
    pub immutable: Vec<usize>,

    /// Sizes of mutable buffers, in binding order.
    pub mutable: Vec<usize>,
}

impl WorkbufferRequest {
    /// A request for no workbuffers.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add an immutable buffer of `bytes`.
    pub fn with_immutable(mut self, bytes: usize) -> Self {
        self.immutable.push(bytes);
        self
    }

    /// Add a mutable buffer of `bytes`.
    pub fn with_mutable(mut self, bytes: usize) -> Self {
        self.mutable.push(bytes);
        self
    }

    /// Check if nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.immutable.is_empty() && self.mutable.is_empty()
    }

    /// All requested buffers with their mutability, immutable first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Mutability)> + '_ {
        self.immutable
            .iter()
            .map(|&size| (size, Mutability::Immutable))
            .chain(self.mutable.iter().map(|&size| (size, Mutability::Mutable)))
    }
}

/// Device addresses bound to an operation's workbuffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workbuffers {
    pub immutable: Vec<DevicePtr>,
    pub mutable: Vec<DevicePtr>,
}

impl Workbuffers {
    /// Check that the binding matches `request` (counts and non-null pointers).
    pub fn matches(&self, request: &WorkbufferRequest) -> bool {
        self.immutable.len() == request.immutable.len()
            && self.mutable.len() == request.mutable.len()
            && self
                .immutable
                .iter()
                .chain(&self.mutable)
                .all(|ptr| !ptr.is_null())
    }
}
