//! Per-frame results delivered to the host framework.

use lethe_core::prelude::ResultMetadata;

use crate::request::OutputBuffer;

/// Completion state of one output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// The processor wrote the buffer.
    Ok,
    /// The buffer was skipped (fence timeout, missing stream, processing
    /// failure) or force-completed at shutdown. Ownership still returns
    /// to the host framework.
    Incomplete,
}

/// One output buffer handed back with its completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultBuffer {
    pub buffer: OutputBuffer,
    pub status: BufferStatus,
}

/// Buffers produced by one physical camera of a composite result.
///
/// Physical sub-results carry buffers only; metadata stays on the owner
/// result.
#[derive(Debug, Clone)]
pub struct PhysicalResult {
    pub camera_id: u32,
    pub buffers: Vec<ResultBuffer>,
}

/// One delivered capture result.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub camera_id: u32,
    pub pipeline_id: u32,
    pub frame_number: u32,
    /// Result metadata; present on owner results, absent on physical
    /// sub-results.
    pub metadata: Option<ResultMetadata>,
    /// Output buffers in request order.
    pub buffers: Vec<ResultBuffer>,
    /// Per-physical-camera sub-results for composite cameras.
    pub physical: Vec<PhysicalResult>,
    /// Partial-result counter; this pipeline delivers exactly one.
    pub partial: u32,
}

impl CaptureResult {
    /// Whether every buffer completed normally.
    pub fn complete(&self) -> bool {
        self.buffers
            .iter()
            .chain(self.physical.iter().flat_map(|p| p.buffers.iter()))
            .all(|b| b.status == BufferStatus::Ok)
    }
}
