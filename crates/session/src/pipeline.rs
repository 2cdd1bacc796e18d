//! Pipeline configuration: stream roles and descriptors.

use std::sync::Arc;

use lethe_core::prelude::{CaptureIntent, PixelFormat, StreamGeometry, UsageFlags};
use lethe_device::prelude::ConfigStreamPolicy;
use tracing::debug;

use crate::collaborators::ResultCallback;
use crate::session::ConfigError;

/// Buffer budget for preview-class streams.
pub const PREVIEW_BUFFER_COUNT: u32 = 3;
/// Buffer budget for still-capture streams.
pub const STILL_BUFFER_COUNT: u32 = 1;

/// What a configured stream is for, derived from its pixel format and
/// usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Preview,
    StillCapture,
    VideoRecord,
    Callback,
}

impl StreamRole {
    /// Classify a requested stream.
    pub fn classify(format: PixelFormat, usage: UsageFlags) -> StreamRole {
        match format {
            PixelFormat::Jpeg => StreamRole::StillCapture,
            PixelFormat::Opaque => {
                if usage.contains(UsageFlags::VIDEO_ENCODER) {
                    StreamRole::VideoRecord
                } else {
                    StreamRole::Preview
                }
            }
            _ => StreamRole::Callback,
        }
    }

    /// Buffer budget the host is allowed to keep in flight for the role.
    pub fn max_buffers(self) -> u32 {
        match self {
            StreamRole::StillCapture => STILL_BUFFER_COUNT,
            StreamRole::Preview | StreamRole::VideoRecord | StreamRole::Callback => {
                PREVIEW_BUFFER_COUNT
            }
        }
    }
}

/// One stream requested into a pipeline.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Host-framework stream id; unique within the session.
    pub id: i32,
    pub geometry: StreamGeometry,
    /// Physical camera producing this stream, for composite cameras.
    pub physical_camera: Option<u32>,
}

/// A stream after configuration: role classified, buffer budget assigned.
#[derive(Debug, Clone)]
pub struct PipelineStream {
    pub id: i32,
    pub geometry: StreamGeometry,
    pub role: StreamRole,
    pub physical_camera: Option<u32>,
    pub max_buffers: u32,
}

/// Negotiated configuration for one stream-configuration session.
///
/// Created by `configure_pipeline`, read by the dispatcher, destroyed by
/// `destroy_pipelines`.
#[derive(Clone)]
pub struct PipelineDescriptor {
    pub id: u32,
    pub physical_camera_id: u32,
    pub callback: Arc<dyn ResultCallback>,
    pub streams: Vec<PipelineStream>,
    preview_idx: Option<usize>,
    still_idx: Option<usize>,
    record_idx: Option<usize>,
    callback_idx: Option<usize>,
}

impl PipelineDescriptor {
    pub(crate) fn new(
        id: u32,
        physical_camera_id: u32,
        callback: Arc<dyn ResultCallback>,
        requests: &[StreamRequest],
    ) -> Self {
        let mut preview_idx = None;
        let mut still_idx = None;
        let mut record_idx = None;
        let mut callback_idx = None;
        let mut streams = Vec::with_capacity(requests.len());

        for (idx, request) in requests.iter().enumerate() {
            let role = StreamRole::classify(request.geometry.format, request.geometry.usage);
            match role {
                StreamRole::Preview => preview_idx = Some(idx),
                StreamRole::StillCapture => still_idx = Some(idx),
                StreamRole::VideoRecord => record_idx = Some(idx),
                StreamRole::Callback => callback_idx = Some(idx),
            }
            debug!(
                pipeline = id,
                stream = request.id,
                ?role,
                geometry = %request.geometry,
                "classified stream"
            );
            streams.push(PipelineStream {
                id: request.id,
                geometry: request.geometry,
                role,
                physical_camera: request.physical_camera,
                max_buffers: role.max_buffers(),
            });
        }

        Self {
            id,
            physical_camera_id,
            callback,
            streams,
            preview_idx,
            still_idx,
            record_idx,
            callback_idx,
        }
    }

    /// Look up a configured stream by host id.
    pub fn stream(&self, stream_id: i32) -> Option<&PipelineStream> {
        self.streams.iter().find(|s| s.id == stream_id)
    }

    /// Choose which configured stream drives the device geometry for a
    /// request with the given intent.
    ///
    /// Still-capture intent prefers the still role. Sensors with the
    /// larger-area merge policy let the bigger of the callback and
    /// still-capture streams win for preview intent. Otherwise the
    /// preference order is preview, callback, still-capture, record.
    pub fn pick_config_stream(
        &self,
        intent: CaptureIntent,
        policy: ConfigStreamPolicy,
    ) -> Result<usize, ConfigError> {
        let mut picked = None;

        if intent == CaptureIntent::StillCapture {
            picked = self.still_idx;
        } else if policy == ConfigStreamPolicy::LargerOfCallbackAndStill
            && intent == CaptureIntent::Preview
        {
            if let (Some(cb), Some(still)) = (self.callback_idx, self.still_idx) {
                let cb_area = self.streams[cb].geometry.resolution.area();
                let still_area = self.streams[still].geometry.resolution.area();
                picked = Some(if cb_area >= still_area { cb } else { still });
            }
        }

        let picked = picked
            .or(self.preview_idx)
            .or(self.callback_idx)
            .or(self.still_idx)
            .or(self.record_idx)
            .ok_or(ConfigError::NoStreamConfigured)?;

        debug!(
            pipeline = self.id,
            ?intent,
            stream = self.streams[picked].id,
            "picked config stream"
        );
        Ok(picked)
    }
}

impl std::fmt::Debug for PipelineDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDescriptor")
            .field("id", &self.id)
            .field("physical_camera_id", &self.physical_camera_id)
            .field("streams", &self.streams.len())
            .finish()
    }
}
