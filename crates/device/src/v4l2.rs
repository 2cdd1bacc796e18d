//! Raw V4L2 transport.
//!
//! This is the only module in the workspace that touches `#[repr(C)]`
//! layouts. Request/response structs are built fresh per call and
//! marshaled through a single `xioctl` helper; everything above this file
//! works with the typed values from [`crate::transport`].

// The structs mirror the kernel uapi names and carry fields the kernel
// reads even though this side never does.
#![allow(non_camel_case_types, dead_code)]

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use lethe_core::prelude::{FourCc, Resolution};
use tracing::debug;

use crate::transport::{
    BufferMapping, BufferSlot, DequeuedBuffer, DeviceTransport, FormatRequest, MemoryKind,
    NegotiatedFormat, QueueBacking, QueueSlot, TransportError,
};

const VIDEO_CAPTURE: u32 = 1;
const VIDEO_CAPTURE_MPLANE: u32 = 9;

const MEMORY_MMAP: u32 = 1;
const MEMORY_DMABUF: u32 = 4;

const FRMIVAL_TYPE_DISCRETE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_plane_pix_format {
    sizeimage: u32,
    bytesperline: u32,
    reserved: [u16; 6],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_pix_format_mplane {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    colorspace: u32,
    plane_fmt: [v4l2_plane_pix_format; 8],
    num_planes: u8,
    flags: u8,
    ycbcr_enc: u8,
    quantization: u8,
    xfer_func: u8,
    reserved: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
union v4l2_format_fmt {
    pix: v4l2_pix_format,
    pix_mp: v4l2_pix_format_mplane,
    // Other union arms hold pointers in the kernel headers, which pads the
    // struct to 8-byte alignment on 64-bit; mirror that so the ioctl size
    // encoding matches.
    raw: [u64; 25],
}

#[repr(C)]
struct v4l2_format {
    type_: u32,
    fmt: v4l2_format_fmt,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_captureparm {
    capability: u32,
    capturemode: u32,
    timeperframe: v4l2_fract,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union v4l2_streamparm_parm {
    capture: v4l2_captureparm,
    raw: [u8; 200],
}

#[repr(C)]
struct v4l2_streamparm {
    type_: u32,
    parm: v4l2_streamparm_parm,
}

#[repr(C)]
struct v4l2_requestbuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    reserved: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union v4l2_plane_m {
    mem_offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_plane {
    bytesused: u32,
    length: u32,
    m: v4l2_plane_m,
    data_offset: u32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
union v4l2_buffer_m {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut v4l2_plane,
    fd: i32,
}

#[repr(C)]
struct v4l2_buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: v4l2_timecode,
    sequence: u32,
    memory: u32,
    m: v4l2_buffer_m,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[repr(C)]
struct v4l2_exportbuffer {
    type_: u32,
    index: u32,
    plane: u32,
    flags: u32,
    fd: i32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_frmival_stepwise {
    min: v4l2_fract,
    max: v4l2_fract,
    step: v4l2_fract,
}

#[repr(C)]
#[derive(Clone, Copy)]
union v4l2_frmivalenum_u {
    discrete: v4l2_fract,
    stepwise: v4l2_frmival_stepwise,
}

#[repr(C)]
struct v4l2_frmivalenum {
    index: u32,
    pixel_format: u32,
    width: u32,
    height: u32,
    type_: u32,
    u: v4l2_frmivalenum_u,
    reserved: [u32; 2],
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> libc::c_ulong {
    (((dir) << 30) | ((size) << 16) | ((ty) << 8) | (nr)) as libc::c_ulong
}

const fn iow<T>(nr: u32) -> libc::c_ulong {
    ioc(IOC_WRITE, b'V' as u32, nr, mem::size_of::<T>() as u32)
}

const fn iowr<T>(nr: u32) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, b'V' as u32, nr, mem::size_of::<T>() as u32)
}

const VIDIOC_S_FMT: libc::c_ulong = iowr::<v4l2_format>(5);
const VIDIOC_REQBUFS: libc::c_ulong = iowr::<v4l2_requestbuffers>(8);
const VIDIOC_QUERYBUF: libc::c_ulong = iowr::<v4l2_buffer>(9);
const VIDIOC_QBUF: libc::c_ulong = iowr::<v4l2_buffer>(15);
const VIDIOC_EXPBUF: libc::c_ulong = iowr::<v4l2_exportbuffer>(16);
const VIDIOC_DQBUF: libc::c_ulong = iowr::<v4l2_buffer>(17);
const VIDIOC_STREAMON: libc::c_ulong = iow::<i32>(18);
const VIDIOC_STREAMOFF: libc::c_ulong = iow::<i32>(19);
const VIDIOC_S_PARM: libc::c_ulong = iowr::<v4l2_streamparm>(22);
const VIDIOC_ENUM_FRAMEINTERVALS: libc::c_ulong = iowr::<v4l2_frmivalenum>(75);

fn xioctl<T>(
    fd: RawFd,
    op: &'static str,
    request: libc::c_ulong,
    arg: &mut T,
) -> Result<(), TransportError> {
    loop {
        let rc = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(TransportError::Ioctl { op, source: err });
        }
    }
}

/// Transport over one V4L2 capture node.
///
/// Single- and multi-planar nodes are handled by the same code paths; the
/// planarity is fixed at construction because it is a property of the
/// driver, not of a particular configuration.
pub struct V4l2Transport {
    fd: Option<OwnedFd>,
    mplane: bool,
}

impl V4l2Transport {
    pub fn new(mplane: bool) -> Self {
        Self { fd: None, mplane }
    }

    fn buf_type(&self) -> u32 {
        if self.mplane {
            VIDEO_CAPTURE_MPLANE
        } else {
            VIDEO_CAPTURE
        }
    }

    fn raw_fd(&self) -> Result<RawFd, TransportError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(TransportError::NotOpen)
    }

    fn memory_value(memory: MemoryKind) -> u32 {
        match memory {
            MemoryKind::Mmap => MEMORY_MMAP,
            MemoryKind::DmaBuf => MEMORY_DMABUF,
        }
    }

    fn fill_backing(buf: &mut v4l2_buffer, plane: &mut v4l2_plane, mplane: bool, slot: &QueueSlot) {
        match slot.backing {
            QueueBacking::Mmap { offset, length } => {
                if mplane {
                    plane.m.mem_offset = offset as u32;
                    plane.length = length;
                } else {
                    buf.m.offset = offset as u32;
                    buf.length = length;
                }
            }
            QueueBacking::DmaBuf { fd, length } => {
                if mplane {
                    plane.m.fd = fd;
                    plane.length = length;
                } else {
                    buf.m.fd = fd;
                    buf.length = length;
                }
            }
        }
    }
}

impl DeviceTransport for V4l2Transport {
    fn open(&mut self, path: &Path) -> Result<(), TransportError> {
        if self.fd.is_some() {
            return Ok(());
        }
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
            TransportError::Open {
                path: path.display().to_string(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            }
        })?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(TransportError::Open {
                path: path.display().to_string(),
                source: io::Error::last_os_error(),
            });
        }
        debug!(path = %path.display(), fd, "opened capture node");
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    fn close(&mut self) {
        self.fd = None;
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn negotiate_format(
        &mut self,
        request: FormatRequest,
    ) -> Result<NegotiatedFormat, TransportError> {
        let fd = self.raw_fd()?;
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = self.buf_type();
        // Capture engines want 8-aligned dimensions.
        let width = request.resolution.width.get() & !0x7;
        let height = request.resolution.height.get() & !0x7;
        if self.mplane {
            let mut pix_mp: v4l2_pix_format_mplane = unsafe { mem::zeroed() };
            pix_mp.width = width;
            pix_mp.height = height;
            pix_mp.pixelformat = request.fourcc.to_u32();
            pix_mp.num_planes = 1;
            fmt.fmt.pix_mp = pix_mp;
        } else {
            let mut pix: v4l2_pix_format = unsafe { mem::zeroed() };
            pix.width = width;
            pix.height = height;
            pix.pixelformat = request.fourcc.to_u32();
            fmt.fmt.pix = pix;
        }
        xioctl(fd, "VIDIOC_S_FMT", VIDIOC_S_FMT, &mut fmt)?;

        let (width, height, pixelformat, bytes_per_line, image_size) = if self.mplane {
            let pix = unsafe { fmt.fmt.pix_mp };
            (
                pix.width,
                pix.height,
                pix.pixelformat,
                pix.plane_fmt[0].bytesperline,
                pix.plane_fmt[0].sizeimage,
            )
        } else {
            let pix = unsafe { fmt.fmt.pix };
            (
                pix.width,
                pix.height,
                pix.pixelformat,
                pix.bytesperline,
                pix.sizeimage,
            )
        };
        let resolution = Resolution::new(width, height).ok_or(TransportError::Ioctl {
            op: "VIDIOC_S_FMT",
            source: io::Error::from(io::ErrorKind::InvalidData),
        })?;
        Ok(NegotiatedFormat {
            fourcc: FourCc::from(pixelformat),
            resolution,
            bytes_per_line,
            image_size,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<(), TransportError> {
        let fd = self.raw_fd()?;
        let mut capture: v4l2_captureparm = unsafe { mem::zeroed() };
        capture.timeperframe = v4l2_fract {
            numerator: 1,
            denominator: fps.max(1),
        };
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = self.buf_type();
        parm.parm.capture = capture;
        xioctl(fd, "VIDIOC_S_PARM", VIDIOC_S_PARM, &mut parm)
    }

    fn frame_rates(
        &mut self,
        fourcc: FourCc,
        resolution: Resolution,
    ) -> Result<Vec<u32>, TransportError> {
        let fd = self.raw_fd()?;
        let mut rates = Vec::new();
        let mut index = 0u32;
        loop {
            let mut ival: v4l2_frmivalenum = unsafe { mem::zeroed() };
            ival.index = index;
            ival.pixel_format = fourcc.to_u32();
            ival.width = resolution.width.get();
            ival.height = resolution.height.get();
            match xioctl(
                fd,
                "VIDIOC_ENUM_FRAMEINTERVALS",
                VIDIOC_ENUM_FRAMEINTERVALS,
                &mut ival,
            ) {
                Ok(()) => {
                    if ival.type_ == FRMIVAL_TYPE_DISCRETE {
                        let fract = unsafe { ival.u.discrete };
                        if fract.numerator != 0 && fract.denominator != 0 {
                            rates.push(fract.denominator / fract.numerator);
                        }
                    }
                    index += 1;
                }
                Err(_) if index > 0 => break,
                Err(TransportError::Ioctl { source, .. })
                    if source.raw_os_error() == Some(libc::ENOTTY) =>
                {
                    return Err(TransportError::IntervalsUnsupported);
                }
                Err(_) => break,
            }
        }
        Ok(rates)
    }

    fn request_buffers(&mut self, memory: MemoryKind, count: u32) -> Result<u32, TransportError> {
        let fd = self.raw_fd()?;
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = self.buf_type();
        req.memory = Self::memory_value(memory);
        xioctl(fd, "VIDIOC_REQBUFS", VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferSlot, TransportError> {
        let fd = self.raw_fd()?;
        let mut plane: v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = self.buf_type();
        buf.memory = MEMORY_MMAP;
        if self.mplane {
            buf.m.planes = &mut plane;
            buf.length = 1;
        }
        xioctl(fd, "VIDIOC_QUERYBUF", VIDIOC_QUERYBUF, &mut buf)?;
        if self.mplane {
            Ok(BufferSlot {
                index,
                offset: unsafe { plane.m.mem_offset } as u64,
                length: plane.length,
            })
        } else {
            Ok(BufferSlot {
                index,
                offset: unsafe { buf.m.offset } as u64,
                length: buf.length,
            })
        }
    }

    fn export_buffer(&mut self, index: u32) -> Result<OwnedFd, TransportError> {
        let fd = self.raw_fd()?;
        let mut exp: v4l2_exportbuffer = unsafe { mem::zeroed() };
        exp.type_ = self.buf_type();
        exp.index = index;
        xioctl(fd, "VIDIOC_EXPBUF", VIDIOC_EXPBUF, &mut exp)?;
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn map_buffer(&mut self, slot: &BufferSlot) -> Result<BufferMapping, TransportError> {
        let fd = self.raw_fd()?;
        let len = slot.length as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                slot.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransportError::Map {
                len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(unsafe { BufferMapping::from_kernel(ptr.cast(), len) })
    }

    fn queue_buffer(&mut self, memory: MemoryKind, slot: &QueueSlot) -> Result<(), TransportError> {
        let fd = self.raw_fd()?;
        let mut plane: v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = slot.index;
        buf.type_ = self.buf_type();
        buf.memory = Self::memory_value(memory);
        Self::fill_backing(&mut buf, &mut plane, self.mplane, slot);
        if self.mplane {
            buf.m.planes = &mut plane;
            buf.length = 1;
        }
        xioctl(fd, "VIDIOC_QBUF", VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, memory: MemoryKind) -> Result<DequeuedBuffer, TransportError> {
        let fd = self.raw_fd()?;
        let mut plane: v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = self.buf_type();
        buf.memory = Self::memory_value(memory);
        if self.mplane {
            buf.m.planes = &mut plane;
            buf.length = 1;
        }
        xioctl(fd, "VIDIOC_DQBUF", VIDIOC_DQBUF, &mut buf)?;
        let bytes_used = if self.mplane {
            plane.bytesused
        } else {
            buf.bytesused
        };
        let timestamp_ns =
            buf.timestamp.tv_sec as u64 * 1_000_000_000 + buf.timestamp.tv_usec as u64 * 1_000;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used,
            timestamp_ns,
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let fd = self.raw_fd()?;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc > 0 {
                return Ok(true);
            }
            if rc == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Ioctl {
                    op: "poll",
                    source: err,
                });
            }
        }
    }

    fn stream_on(&mut self) -> Result<(), TransportError> {
        let fd = self.raw_fd()?;
        let mut buf_type = self.buf_type() as i32;
        xioctl(fd, "VIDIOC_STREAMON", VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> Result<(), TransportError> {
        let fd = self.raw_fd()?;
        let mut buf_type = self.buf_type() as i32;
        xioctl(fd, "VIDIOC_STREAMOFF", VIDIOC_STREAMOFF, &mut buf_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_codes_match_the_uapi_encoding() {
        // _IOWR('V', 5, struct v4l2_format) with the 64-bit layout (208 bytes).
        assert_eq!(mem::size_of::<v4l2_format>(), 208);
        assert_eq!(VIDIOC_S_FMT, 0xc0d0_5605);
        // _IOW('V', 18, int).
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
    }

    #[test]
    fn request_buffers_struct_is_20_bytes() {
        assert_eq!(mem::size_of::<v4l2_requestbuffers>(), 20);
    }

    #[test]
    fn closed_transport_reports_not_open() {
        let mut transport = V4l2Transport::new(false);
        assert!(!transport.is_open());
        assert!(matches!(
            transport.stream_on(),
            Err(TransportError::NotOpen)
        ));
    }
}
