use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a device-native pixel encoding.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"YUYV");
/// assert_eq!(fcc.to_string(), "YUYV");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding, as used on the kernel boundary.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Resolution of a stream.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::Resolution;
///
/// let res = Resolution::new(1280, 720).unwrap();
/// assert_eq!(res.area(), 1280 * 720);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Pixel count, used by the larger-area stream tie-break.
    pub fn area(&self) -> u64 {
        self.width.get() as u64 * self.height.get() as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel format as seen by the host framework.
///
/// The capture device translates these to its native [`FourCc`] encoding at
/// configure time; `Opaque` lets the pipeline pick (preview/record streams),
/// `Jpeg` marks still-capture blob streams.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::PixelFormat;
///
/// assert_eq!(PixelFormat::Yuyv.to_fourcc().to_string(), "YUYV");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelFormat {
    /// Implementation-defined; the pipeline chooses the backing encoding.
    Opaque,
    /// Compressed JPEG blob (still capture).
    Jpeg,
    /// Packed YUV 4:2:2.
    Yuyv,
    /// Semi-planar YUV 4:2:0.
    Nv12,
    /// Planar YUV 4:2:0.
    Yuv420,
    /// Packed RGB, 3 bytes per pixel.
    Rgb24,
}

impl PixelFormat {
    /// Device-native encoding for this format.
    ///
    /// Opaque and Jpeg streams are backed by the packed YUV 4:2:2 capture
    /// encoding; the frame processor converts/encodes from there.
    pub fn to_fourcc(self) -> FourCc {
        match self {
            PixelFormat::Opaque | PixelFormat::Jpeg | PixelFormat::Yuyv => FourCc::new(*b"YUYV"),
            PixelFormat::Nv12 => FourCc::new(*b"NV12"),
            PixelFormat::Yuv420 => FourCc::new(*b"YU12"),
            PixelFormat::Rgb24 => FourCc::new(*b"RGB3"),
        }
    }

    /// Bytes per pixel for packed formats; `None` for planar/compressed.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Opaque | PixelFormat::Jpeg | PixelFormat::Nv12 | PixelFormat::Yuv420 => {
                None
            }
        }
    }
}

/// Consumer usage bits attached to a requested stream.
///
/// Only the bits the pipeline itself inspects are named; everything else is
/// carried opaquely for the allocator.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::UsageFlags;
///
/// let usage = UsageFlags::VIDEO_ENCODER;
/// assert!(usage.contains(UsageFlags::VIDEO_ENCODER));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsageFlags(pub u64);

impl UsageFlags {
    /// No usage bits.
    pub const NONE: UsageFlags = UsageFlags(0);
    /// Stream feeds a hardware video encoder (record role).
    pub const VIDEO_ENCODER: UsageFlags = UsageFlags(1 << 0);
    /// Stream is composited to a display (preview role).
    pub const COMPOSER: UsageFlags = UsageFlags(1 << 1);
    /// Stream is read back by the CPU (callback role).
    pub const CPU_READ: UsageFlags = UsageFlags(1 << 2);

    /// Whether all bits of `other` are set.
    pub fn contains(&self, other: UsageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub fn union(&self, other: UsageFlags) -> UsageFlags {
        UsageFlags(self.0 | other.0)
    }
}

/// Geometry of one capture stream: format, size, usage and frame rate.
///
/// Immutable once a device is started; changing any field requires
/// stop → reconfigure → start.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::{PixelFormat, Resolution, StreamGeometry, UsageFlags};
///
/// let geometry = StreamGeometry {
///     format: PixelFormat::Yuyv,
///     resolution: Resolution::new(1280, 720).unwrap(),
///     usage: UsageFlags::COMPOSER,
///     fps: 30,
/// };
/// assert_eq!(geometry.resolution.to_string(), "1280x720");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamGeometry {
    /// Pixel format requested by the host framework.
    pub format: PixelFormat,
    /// Width and height in pixels.
    pub resolution: Resolution,
    /// Consumer usage bits.
    pub usage: UsageFlags,
    /// Frame rate in frames per second.
    pub fps: u32,
}

impl StreamGeometry {
    /// Same format and resolution, ignoring usage and fps.
    pub fn same_shape(&self, other: &StreamGeometry) -> bool {
        self.format == other.format && self.resolution == other.resolution
    }
}

impl fmt::Display for StreamGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} @{}fps", self.format, self.resolution, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_roundtrips_through_u32() {
        let fcc = FourCc::new(*b"NV12");
        assert_eq!(FourCc::from(fcc.to_u32()), fcc);
    }

    #[test]
    fn fourcc_parses_four_ascii_bytes() {
        let fcc: FourCc = "YUYV".parse().unwrap();
        assert_eq!(fcc, FourCc::new(*b"YUYV"));
        assert!("YU".parse::<FourCc>().is_err());
    }

    #[test]
    fn resolution_rejects_zero_dimensions() {
        assert!(Resolution::new(0, 480).is_none());
        assert!(Resolution::new(640, 0).is_none());
    }

    #[test]
    fn geometry_shape_ignores_fps_and_usage() {
        let a = StreamGeometry {
            format: PixelFormat::Yuyv,
            resolution: Resolution::new(640, 480).unwrap(),
            usage: UsageFlags::NONE,
            fps: 30,
        };
        let mut b = a;
        b.fps = 15;
        b.usage = UsageFlags::VIDEO_ENCODER;
        assert!(a.same_shape(&b));
    }
}
