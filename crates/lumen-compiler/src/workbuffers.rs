//! Workbuffer layout planning.
//!
//! Immutable workbuffers are laid out back to back in one arena and never
//! shared. Mutable workbuffers live in a second arena split into one region
//! per stream: operations on the same stream reuse their stream's region,
//! operations on different streams never overlap.

use lumen_core::{Error, Result, WorkbufferRequest};

/// Byte offsets of one operation's workbuffers inside the two arenas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkbufferSlots {
    pub immutable: Vec<usize>,
    pub mutable: Vec<usize>,
}

/// A byte range of the mutable arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Arena sizes and per-operation offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkbufferLayout {
    pub alignment: usize,
    pub immutable_size: usize,
    pub mutable_size: usize,

    /// Mutable region of each stream.
    pub stream_regions: Vec<Region>,

    /// Slots of each operation, in plan order.
    pub slots: Vec<WorkbufferSlots>,
}

/// Round `value` up to a multiple of `alignment`.
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Plan arena layout for operations with the given requests and streams.
///
/// # Arguments
///
/// * `requests` - Workbuffer request of each operation, in plan order.
/// * `streams` - Stream index of each operation.
/// * `stream_count` - Number of streams.
/// * `alignment` - Device workbuffer alignment in bytes.
pub fn plan_workbuffers(
    requests: &[WorkbufferRequest],
    streams: &[usize],
    stream_count: usize,
    alignment: usize,
) -> Result<WorkbufferLayout> {
    if alignment == 0 {
        return Err(Error::UnsupportedConfiguration(
            "workbuffer alignment must be non-zero".to_string(),
        ));
    }
    if requests.len() != streams.len() {
        return Err(Error::InvalidGraph(format!(
            "{} workbuffer requests for {} stream assignments",
            requests.len(),
            streams.len()
        )));
    }

    let mut immutable_size = 0;
    let mut stream_sizes = vec![0usize; stream_count];
    let mut slots = Vec::with_capacity(requests.len());

    for (request, &stream) in requests.iter().zip(streams) {
        let Some(stream_size) = stream_sizes.get_mut(stream) else {
            return Err(Error::InvalidGraph(format!(
                "operation assigned to stream {stream} of {stream_count}"
            )));
        };

        let mut slot = WorkbufferSlots::default();
        for &bytes in &request.immutable {
            slot.immutable.push(immutable_size);
            immutable_size += align_up(bytes, alignment);
        }

        // Offsets relative to the stream region for now.
        let mut cursor = 0;
        for &bytes in &request.mutable {
            slot.mutable.push(cursor);
            cursor += align_up(bytes, alignment);
        }
        *stream_size = (*stream_size).max(cursor);
        slots.push(slot);
    }

    let mut stream_regions = Vec::with_capacity(stream_count);
    let mut mutable_size = 0;
    for size in stream_sizes {
        stream_regions.push(Region {
            offset: mutable_size,
            size,
        });
        mutable_size += size;
    }
    for (slot, &stream) in slots.iter_mut().zip(streams) {
        let base = stream_regions[stream].offset;
        for offset in &mut slot.mutable {
            *offset += base;
        }
    }

    tracing::debug!(
        immutable_size,
        mutable_size,
        streams = stream_count,
        "planned workbuffer arenas"
    );

    Ok(WorkbufferLayout {
        alignment,
        immutable_size,
        mutable_size,
        stream_regions,
        slots,
    })
}
