//! Sensor descriptors and the sensor-control collaborator boundary.
//!
//! A [`SensorDescriptor`] is produced by the external configuration store
//! and consumed when a capture device is opened; it carries everything the
//! pipeline needs to know about one physical sensor that cannot be probed
//! from the node itself.

use std::path::PathBuf;

use lethe_core::prelude::{RequestMetadata, Resolution};

/// How a sensor's capture node sources its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferingKind {
    /// Kernel-owned memory-mapped buffers.
    Mmap { mplane: bool },
    /// Pre-allocated DMA buffers from an external allocator.
    Dma { mplane: bool },
    /// DMA buffers over a USB transport that cannot hold the node open
    /// while idle.
    UsbDma,
}

/// Number of frames to discard after a geometry change, per resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OmitEntry {
    pub resolution: Resolution,
    pub count: u32,
}

/// Which stream drives the device geometry when several roles could.
///
/// The larger-area rule exists for sensor formats whose conformance
/// behavior requires merging the callback and still-capture streams for
/// preview intent; it is a per-sensor policy, not general logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConfigStreamPolicy {
    /// preview → callback → still-capture → video-record.
    #[default]
    Standard,
    /// For preview intent, the larger-area of the callback and
    /// still-capture streams wins before the standard order applies.
    LargerOfCallbackAndStill,
}

/// Static description of one physical sensor, as resolved by the external
/// configuration store.
///
/// # Example
/// ```rust
/// use lethe_device::sensor::{BufferingKind, SensorDescriptor};
///
/// let sensor = SensorDescriptor::new("ov5640", "/dev/video0", BufferingKind::Mmap { mplane: false });
/// assert_eq!(sensor.default_fps, 30);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorDescriptor {
    /// Sensor name as reported by the configuration store.
    pub name: String,
    /// Capture node path.
    pub device_path: PathBuf,
    /// Buffer sourcing strategy for this sensor's node.
    pub buffering: BufferingKind,
    /// Resolutions advertised for preview-class streams.
    pub preview_resolutions: Vec<Resolution>,
    /// Resolutions advertised for still-capture streams.
    pub picture_resolutions: Vec<Resolution>,
    /// Warm-up frames to discard after a geometry change.
    pub omit_table: Vec<OmitEntry>,
    /// Frame rate used when the device cannot enumerate intervals.
    pub default_fps: u32,
    /// Platform variant string, for per-platform geometry overrides.
    pub platform: String,
    /// Config-stream selection policy for this sensor's format.
    pub config_policy: ConfigStreamPolicy,
    /// Nominal focal length in millimetres, used to pick the physical
    /// sensor on composite cameras.
    pub focal_length: f32,
}

impl SensorDescriptor {
    /// Descriptor with pack defaults; callers fill in the advertised
    /// resolution lists and omit table from the configuration store.
    pub fn new(
        name: impl Into<String>,
        device_path: impl Into<PathBuf>,
        buffering: BufferingKind,
    ) -> Self {
        Self {
            name: name.into(),
            device_path: device_path.into(),
            buffering,
            preview_resolutions: Vec::new(),
            picture_resolutions: Vec::new(),
            omit_table: Vec::new(),
            default_fps: 30,
            platform: String::new(),
            config_policy: ConfigStreamPolicy::default(),
            focal_length: 0.0,
        }
    }

    /// Omit count for an exact width×height match, zero otherwise.
    pub fn omit_count(&self, resolution: Resolution) -> u32 {
        self.omit_table
            .iter()
            .find(|entry| entry.resolution == resolution)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Whether a resolution is advertised for either stream class.
    pub fn advertises(&self, resolution: Resolution) -> bool {
        self.preview_resolutions.contains(&resolution)
            || self.picture_resolutions.contains(&resolution)
    }
}

/// Errors surfaced by a sensor controller.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor control channel unavailable: {0}")]
    Unavailable(String),
    #[error("sensor control apply failed: {0}")]
    Apply(String),
}

/// Collaborator driving the ISP/sensor control protocol.
///
/// The pipeline calls [`attach`](SensorController::attach) once the node is
/// opened, [`apply`](SensorController::apply) once per frame, and
/// [`save_state`](SensorController::save_state) /
/// [`restore_state`](SensorController::restore_state) around stop/start so
/// exposure, white balance and dewarp state survive a reconfigure.
pub trait SensorController: Send + Sync {
    /// Bind to an opened device node.
    fn attach(&self, device_path: &std::path::Path) -> Result<(), SensorError>;

    /// Apply metadata-driven adjustments for one frame.
    fn apply(&self, metadata: &RequestMetadata) -> Result<(), SensorError>;

    /// Snapshot control state before the device stops.
    fn save_state(&self);

    /// Restore the snapshot after the device restarts.
    fn restore_state(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(w: u32, h: u32) -> Resolution {
        Resolution::new(w, h).unwrap()
    }

    #[test]
    fn omit_count_requires_exact_match() {
        let mut sensor =
            SensorDescriptor::new("test", "/dev/video9", BufferingKind::Mmap { mplane: false });
        sensor.omit_table.push(OmitEntry {
            resolution: res(1280, 720),
            count: 3,
        });
        assert_eq!(sensor.omit_count(res(1280, 720)), 3);
        assert_eq!(sensor.omit_count(res(1280, 800)), 0);
    }

    #[test]
    fn advertises_checks_both_lists() {
        let mut sensor =
            SensorDescriptor::new("test", "/dev/video9", BufferingKind::Mmap { mplane: false });
        sensor.preview_resolutions.push(res(640, 480));
        sensor.picture_resolutions.push(res(2592, 1944));
        assert!(sensor.advertises(res(640, 480)));
        assert!(sensor.advertises(res(2592, 1944)));
        assert!(!sensor.advertises(res(1920, 1080)));
    }
}
