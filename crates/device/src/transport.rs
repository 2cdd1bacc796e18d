//! Typed boundary between the capture state machine and the kernel.
//!
//! Every operation takes and returns plain value structs; raw byte layouts
//! exist only inside transport implementations. The state machine and the
//! buffer strategies are written against this trait, which is also what
//! the tests fake.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use lethe_core::prelude::{FourCc, Resolution};

/// Errors surfaced by a device transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("device node not open")]
    NotOpen,
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: io::Error,
    },
    #[error("mapping {len} bytes failed: {source}")]
    Map { len: usize, source: io::Error },
    #[error("frame-interval enumeration not supported")]
    IntervalsUnsupported,
}

impl TransportError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NotOpen => "not_open",
            TransportError::Open { .. } => "open_failed",
            TransportError::Ioctl { .. } => "ioctl_failed",
            TransportError::Map { .. } => "map_failed",
            TransportError::IntervalsUnsupported => "intervals_unsupported",
        }
    }
}

/// How the device addresses its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Kernel-allocated buffers addressed by mapping offset.
    Mmap,
    /// Externally allocated DMA buffers addressed by file descriptor.
    DmaBuf,
}

/// Format negotiation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCc,
    pub resolution: Resolution,
}

/// What the device actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    pub bytes_per_line: u32,
    /// Total image size in bytes for one frame.
    pub image_size: u32,
}

/// Reply to a buffer query: where the kernel placed one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlot {
    pub index: u32,
    /// Mapping offset (doubles as the physical address on the one device
    /// family that reports it there).
    pub offset: u64,
    pub length: u32,
}

/// Backing description used when enqueueing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBacking {
    Mmap { offset: u64, length: u32 },
    DmaBuf { fd: RawFd, length: u32 },
}

/// One enqueue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub index: u32,
    pub backing: QueueBacking,
}

/// One dequeued (filled) buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub timestamp_ns: u64,
}

/// A mapped view of one buffer.
///
/// Kernel mappings are unmapped on drop; heap mappings (used by external
/// allocators and tests) are freed on drop.
#[derive(Debug)]
pub struct BufferMapping {
    ptr: *mut u8,
    len: usize,
    kind: MappingKind,
}

#[derive(Debug)]
enum MappingKind {
    Kernel,
    Heap,
}

// The mapping is exclusively owned and only handed across the worker
// thread boundary as part of a CaptureBuffer move.
unsafe impl Send for BufferMapping {}
unsafe impl Sync for BufferMapping {}

impl BufferMapping {
    /// Wrap a kernel mapping obtained from `mmap`.
    ///
    /// # Safety
    /// `ptr` must be a valid `MAP_SHARED` mapping of exactly `len` bytes
    /// that stays valid until drop.
    pub unsafe fn from_kernel(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            kind: MappingKind::Kernel,
        }
    }

    /// Allocate a zeroed heap mapping of `len` bytes.
    pub fn from_heap(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self {
            ptr,
            len,
            kind: MappingKind::Heap,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for BufferMapping {
    fn drop(&mut self) {
        match self.kind {
            MappingKind::Kernel => unsafe {
                libc::munmap(self.ptr.cast(), self.len);
            },
            MappingKind::Heap => unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(
                    self.ptr, self.len,
                )));
            },
        }
    }
}

/// Operations a capture device issues against its kernel node.
///
/// One implementation exists per node; the state machine owns it
/// exclusively, so all methods take `&mut self`.
pub trait DeviceTransport: Send {
    /// Open the node. Fails when the path cannot be opened.
    fn open(&mut self, path: &Path) -> Result<(), TransportError>;

    /// Close the node; a no-op when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Set format and return what the device granted.
    fn negotiate_format(
        &mut self,
        request: FormatRequest,
    ) -> Result<NegotiatedFormat, TransportError>;

    /// Apply a frame rate via stream parameters.
    fn set_frame_rate(&mut self, fps: u32) -> Result<(), TransportError>;

    /// Enumerate discrete frame rates for a format/resolution pair.
    ///
    /// Returns `IntervalsUnsupported` for devices without interval
    /// enumeration; callers fall back to the sensor's default rate.
    fn frame_rates(
        &mut self,
        fourcc: FourCc,
        resolution: Resolution,
    ) -> Result<Vec<u32>, TransportError>;

    /// Request `count` buffers; returns the count actually granted.
    /// `count == 0` releases the kernel side of all buffers.
    fn request_buffers(&mut self, memory: MemoryKind, count: u32) -> Result<u32, TransportError>;

    /// Query one kernel-allocated buffer's placement.
    fn query_buffer(&mut self, index: u32) -> Result<BufferSlot, TransportError>;

    /// Export a kernel buffer as a file descriptor.
    fn export_buffer(&mut self, index: u32) -> Result<OwnedFd, TransportError>;

    /// Map a kernel buffer into the process.
    fn map_buffer(&mut self, slot: &BufferSlot) -> Result<BufferMapping, TransportError>;

    /// Enqueue a buffer for capture.
    fn queue_buffer(&mut self, memory: MemoryKind, slot: &QueueSlot) -> Result<(), TransportError>;

    /// Dequeue a filled buffer. Only valid after `wait_readable` reported
    /// data, the node being non-blocking.
    fn dequeue_buffer(&mut self, memory: MemoryKind) -> Result<DequeuedBuffer, TransportError>;

    /// Block until the device signals a completed buffer or the timeout
    /// elapses. `Ok(false)` means timeout.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    fn stream_on(&mut self) -> Result<(), TransportError>;

    fn stream_off(&mut self) -> Result<(), TransportError>;
}
