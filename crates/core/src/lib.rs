#![doc = include_str!("../README.md")]

pub mod fence;
pub mod format;
pub mod metadata;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        fence::{Fence, FenceStatus},
        format::{FourCc, PixelFormat, Resolution, StreamGeometry, UsageFlags},
        metadata::{
            AeState, AfState, AwbState, CaptureIntent, FpsRange, RequestMetadata, ResultMetadata,
            SceneMode,
        },
        metrics::{DeviceMetrics, SessionMetrics},
        queue::{frame_queue, DrainOutcome, FrameQueueRx, FrameQueueTx, SendOutcome},
    };
}
