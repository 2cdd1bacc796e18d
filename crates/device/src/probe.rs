//! Capture-node enumeration.
//!
//! Builds the advertised-mode lists that feed sensor descriptors. Probing
//! is deliberately tolerant: quirky drivers that fail format or interval
//! enumeration still yield whatever could be read instead of being
//! dropped.

use lethe_core::prelude::{FourCc, Resolution};
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::prelude::*;
use v4l::video::Capture;

/// One advertised capture mode: a format/resolution pair with the discrete
/// frame rates the device enumerates for it.
#[derive(Debug, Clone)]
pub struct ProbedMode {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    pub frame_rates: Vec<u32>,
}

/// One enumerated capture node.
#[derive(Debug, Clone)]
pub struct ProbedNode {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    pub modes: Vec<ProbedMode>,
}

/// Probe all capture nodes; returns (nodes, errors) for observability.
///
/// # Example
/// ```rust,ignore
/// let (nodes, errors) = lethe_device::probe::probe_nodes();
/// for node in nodes {
///     println!("{} ({}): {} modes", node.path, node.card, node.modes.len());
/// }
/// for err in errors {
///     eprintln!("probe: {err}");
/// }
/// ```
pub fn probe_nodes() -> (Vec<ProbedNode>, Vec<String>) {
    let mut nodes = Vec::new();
    let mut errors = Vec::new();
    for dev in v4l::context::enum_devices() {
        match build_node(dev.path()) {
            Ok(node) => nodes.push(node),
            Err(err) => errors.push(format!("{}: {err}", dev.path().display())),
        }
    }
    (nodes, errors)
}

fn build_node(path: &std::path::Path) -> Result<ProbedNode, Box<dyn std::error::Error>> {
    let dev = Device::with_path(path)?;
    let caps = dev.query_caps()?;

    if !(caps.capabilities.contains(Flags::VIDEO_CAPTURE)
        || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE))
    {
        // Skip non-capture nodes (decoders, encoders, metadata nodes).
        return Err("not a capture device".into());
    }

    let mut modes = Vec::new();
    let formats = dev.enum_formats().unwrap_or_default();
    for fmt in formats {
        let fourcc = FourCc::from(u32::from_le_bytes(fmt.fourcc.repr));
        let framesizes = match dev.enum_framesizes(fmt.fourcc) {
            Ok(sizes) => sizes,
            Err(_) => continue,
        };
        for size in framesizes {
            // Only discrete sizes feed descriptor lists; stepwise devices
            // advertise a range the configuration store handles itself.
            if let FrameSizeEnum::Discrete(fs) = size.size {
                let resolution = match Resolution::new(fs.width, fs.height) {
                    Some(resolution) => resolution,
                    None => continue,
                };
                let mut frame_rates = Vec::new();
                let intervals = dev
                    .enum_frameintervals(fmt.fourcc, fs.width, fs.height)
                    .unwrap_or_default();
                for interval in intervals {
                    if let v4l::frameinterval::FrameIntervalEnum::Discrete(discrete) =
                        interval.interval
                    {
                        if discrete.numerator != 0 && discrete.denominator != 0 {
                            frame_rates.push(discrete.denominator / discrete.numerator);
                        }
                    }
                }
                modes.push(ProbedMode {
                    fourcc,
                    resolution,
                    frame_rates,
                });
            }
        }
    }

    Ok(ProbedNode {
        path: path.display().to_string(),
        card: caps.card,
        driver: caps.driver,
        bus_info: caps.bus,
        modes,
    })
}
