#![doc = include_str!("../README.md")]

pub mod clock;
pub mod collaborators;
pub mod pipeline;
pub mod request;
pub mod result;
pub mod session;

pub mod prelude {
    pub use crate::clock::ShutterClock;
    pub use crate::collaborators::{BlitHint, FrameProcessor, ProcessError, ResultCallback};
    pub use crate::pipeline::{
        PipelineDescriptor, PipelineStream, StreamRequest, StreamRole, PREVIEW_BUFFER_COUNT,
        STILL_BUFFER_COUNT,
    };
    pub use crate::request::{CaptureRequest, OutputBuffer, OutputTarget};
    pub use crate::result::{BufferStatus, CaptureResult, PhysicalResult, ResultBuffer};
    pub use crate::session::{
        CaptureSession, ConfigError, SessionConfig, SessionError, SubmitError, DESTROY_GRACE,
        FENCE_TIMEOUT, QUEUE_WAIT,
    };
    pub use lethe_device::prelude::*;
}
