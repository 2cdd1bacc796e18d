//! Collaborator boundaries owned by the host stack.
//!
//! The session never reaches for ambient global state: the frame
//! processor and result callback are injected at construction, the sensor
//! controller at device construction.

use lethe_core::prelude::RequestMetadata;
use lethe_device::prelude::CaptureBuffer;

use crate::request::OutputBuffer;
use crate::result::CaptureResult;

/// Which blit engine the processor should prefer.
///
/// Same-geometry transfers are plain copies; anything else needs the
/// color-convert/resize engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitHint {
    Copy,
    Convert,
}

/// Errors surfaced by the frame processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("conversion failed: {0}")]
    Convert(String),
    #[error("jpeg encode failed: {0}")]
    Encode(String),
}

/// Format conversion, resize and JPEG encoding collaborator.
///
/// The pipeline hands it a source capture buffer and a destination buffer
/// descriptor and reads back nothing but the status; pixel contents are
/// never interpreted here.
pub trait FrameProcessor: Send + Sync {
    fn convert(
        &self,
        source: &CaptureBuffer,
        dest: &OutputBuffer,
        hint: BlitHint,
    ) -> Result<(), ProcessError>;

    fn encode_jpeg(
        &self,
        source: &CaptureBuffer,
        dest: &OutputBuffer,
        metadata: &RequestMetadata,
    ) -> Result<(), ProcessError>;
}

/// Result delivery boundary, owned by the host framework.
///
/// Both calls are invoked synchronously from the dispatcher thread.
pub trait ResultCallback: Send + Sync {
    fn notify_shutter(&self, pipeline_id: u32, frame_number: u32, timestamp_ns: u64);

    fn deliver_result(&self, result: CaptureResult);
}
