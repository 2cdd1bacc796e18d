//! Capture requests, as submitted and as queued.

use std::os::fd::RawFd;

use lethe_core::prelude::{Fence, RequestMetadata};
use smallvec::SmallVec;
use tracing::warn;

/// An output buffer owned by the host framework.
///
/// The handle is opaque to the pipeline; only the frame processor
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBuffer {
    /// Configured stream this buffer belongs to.
    pub stream_id: i32,
    /// Opaque buffer handle owned by the host framework.
    pub handle: u64,
    /// Capacity of the buffer in bytes.
    pub size: u32,
}

/// One output target as submitted by the host framework.
#[derive(Debug)]
pub struct OutputTarget {
    pub buffer: OutputBuffer,
    /// Caller-owned acquire fence; duplicated at submit time so the
    /// caller's descriptor lifetime stays independent.
    pub acquire_fence: Option<RawFd>,
    /// Physical camera expected to fill this buffer, for composite
    /// cameras.
    pub physical_camera: Option<u32>,
}

/// One capture request as submitted by the host framework.
#[derive(Debug)]
pub struct CaptureRequest {
    pub pipeline_id: u32,
    /// Per-request metadata; absent means "keep the previous settings".
    pub metadata: Option<RequestMetadata>,
    pub outputs: Vec<OutputTarget>,
}

/// An output target after submit: fence duplicated and scoped.
#[derive(Debug)]
pub(crate) struct QueuedOutput {
    pub buffer: OutputBuffer,
    pub fence: Option<Fence>,
    pub physical_camera: Option<u32>,
}

/// One pending request awaiting the dispatcher.
///
/// Created by `submit_requests`, consumed exactly once, then released.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub pipeline_id: u32,
    pub frame_number: u32,
    pub metadata: Option<RequestMetadata>,
    pub outputs: SmallVec<[QueuedOutput; 4]>,
}

impl QueuedRequest {
    /// Wrap a submitted request, duplicating its acquire fences.
    ///
    /// A fence that cannot be duplicated is dropped with a warning; the
    /// buffer is then treated as immediately writable, which degrades one
    /// buffer rather than failing the submit.
    pub fn from_submitted(frame_number: u32, request: CaptureRequest) -> Self {
        let outputs = request
            .outputs
            .into_iter()
            .map(|target| {
                let fence = target.acquire_fence.and_then(|fd| match Fence::duplicate(fd) {
                    Ok(fence) => Some(fence),
                    Err(err) => {
                        warn!(
                            stream = target.buffer.stream_id,
                            fd,
                            error = %err,
                            "acquire fence duplication failed; treating buffer as ready"
                        );
                        None
                    }
                });
                QueuedOutput {
                    buffer: target.buffer,
                    fence,
                    physical_camera: target.physical_camera,
                }
            })
            .collect();
        Self {
            pipeline_id: request.pipeline_id,
            frame_number,
            metadata: request.metadata,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn target(stream_id: i32, fence: Option<RawFd>) -> OutputTarget {
        OutputTarget {
            buffer: OutputBuffer {
                stream_id,
                handle: 0x10,
                size: 4096,
            },
            acquire_fence: fence,
            physical_camera: None,
        }
    }

    #[test]
    fn submit_duplicates_fences() {
        let (rx, _tx) = pipe();
        let request = CaptureRequest {
            pipeline_id: 0,
            metadata: None,
            outputs: vec![target(0, Some(rx.as_raw_fd()))],
        };
        let queued = QueuedRequest::from_submitted(5, request);
        assert_eq!(queued.frame_number, 5);
        let fence = queued.outputs[0].fence.as_ref().unwrap();
        // The duplicate is a distinct descriptor.
        assert_ne!(fence.as_raw_fd(), rx.as_raw_fd());
    }

    #[test]
    fn invalid_fence_degrades_to_ready() {
        let request = CaptureRequest {
            pipeline_id: 0,
            metadata: None,
            outputs: vec![target(0, Some(-1))],
        };
        let queued = QueuedRequest::from_submitted(1, request);
        assert!(queued.outputs[0].fence.is_none());
    }
}
