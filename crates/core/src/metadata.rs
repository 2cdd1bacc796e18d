//! Typed views over the metadata blobs exchanged with the host framework.
//!
//! Metadata construction lives in the external catalog; the pipeline only
//! reads the handful of fields that drive stream selection and frame-rate
//! resolution, and stamps convergence state into results.

/// Capture intent carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CaptureIntent {
    Custom,
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
}

/// Scene mode carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SceneMode {
    Disabled,
    Hdr,
}

/// Requested auto-exposure frame-rate range, inclusive on both ends.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::FpsRange;
///
/// let range = FpsRange { min: 15, max: 15 };
/// assert!(range.max_at_most(15));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FpsRange {
    pub min: i32,
    pub max: i32,
}

impl FpsRange {
    /// Whether both ends of the range are at or below `limit`.
    pub fn max_at_most(&self, limit: i32) -> bool {
        self.min <= limit && self.max <= limit
    }
}

/// The per-request metadata fields the pipeline reads.
///
/// The full blob is owned by the external metadata catalog; this view is
/// what the catalog resolves for the pipeline. All fields are optional —
/// an absent intent means the request does not change the device
/// configuration.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::{CaptureIntent, RequestMetadata};
///
/// let meta = RequestMetadata {
///     capture_intent: Some(CaptureIntent::Preview),
///     ..RequestMetadata::default()
/// };
/// assert!(meta.wants_reconfigure());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestMetadata {
    /// Capture intent, when the request carries one.
    pub capture_intent: Option<CaptureIntent>,
    /// Scene mode, when the request carries one.
    pub scene_mode: Option<SceneMode>,
    /// Target auto-exposure fps range.
    pub target_fps: Option<FpsRange>,
    /// Requested focal length; selects the physical sensor on composite
    /// cameras.
    pub focal_length: Option<f32>,
}

impl RequestMetadata {
    /// Whether this request can change the active device configuration.
    pub fn wants_reconfigure(&self) -> bool {
        self.capture_intent.is_some() || self.scene_mode.is_some() || self.target_fps.is_some()
    }
}

/// Auto-exposure convergence state stamped into results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AeState {
    Inactive,
    Converged,
}

/// Auto-focus state stamped into results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AfState {
    Inactive,
    Focused,
}

/// Auto-white-balance state stamped into results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AwbState {
    Inactive,
    Converged,
}

/// Result metadata: the request view carried forward plus the state the
/// pipeline stamps per frame.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::{AeState, RequestMetadata, ResultMetadata};
///
/// let result = ResultMetadata::converged(RequestMetadata::default(), 1_000);
/// assert_eq!(result.ae_state, AeState::Converged);
/// assert_eq!(result.sensor_timestamp_ns, 1_000);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResultMetadata {
    /// Latest request metadata, carried forward when a request has none.
    pub request: RequestMetadata,
    /// Shutter timestamp in nanoseconds.
    pub sensor_timestamp_ns: u64,
    pub ae_state: AeState,
    pub af_state: AfState,
    pub awb_state: AwbState,
}

impl ResultMetadata {
    /// Stamp the fixed-function convergence state onto a request view.
    ///
    /// This sensor family has no incremental 3A reporting: exposure and
    /// white balance always report converged, focus reports inactive.
    pub fn converged(request: RequestMetadata, sensor_timestamp_ns: u64) -> Self {
        Self {
            request,
            sensor_timestamp_ns,
            ae_state: AeState::Converged,
            af_state: AfState::Inactive,
            awb_state: AwbState::Converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_does_not_reconfigure() {
        assert!(!RequestMetadata::default().wants_reconfigure());
    }

    #[test]
    fn fps_range_bound_check() {
        assert!(FpsRange { min: 10, max: 15 }.max_at_most(15));
        assert!(!FpsRange { min: 10, max: 30 }.max_at_most(15));
    }

    #[test]
    fn converged_stamp_keeps_request_fields() {
        let request = RequestMetadata {
            scene_mode: Some(SceneMode::Hdr),
            ..RequestMetadata::default()
        };
        let result = ResultMetadata::converged(request.clone(), 42);
        assert_eq!(result.request, request);
        assert_eq!(result.af_state, AfState::Inactive);
    }
}
