//! Hardware capture buffers and the strategies that source them.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use tracing::warn;

use crate::device::DeviceError;
use crate::transport::{
    BufferMapping, DeviceTransport, MemoryKind, QueueBacking, QueueSlot, TransportError,
};

/// One hardware buffer belonging to a capture device.
///
/// Owned exclusively by the device that allocated it while unqueued;
/// ownership moves to the caller on acquire and back on return. Never
/// shared.
#[derive(Debug)]
pub struct CaptureBuffer {
    /// Slot index within the device's buffer ring.
    pub index: u32,
    /// Exported or allocator-provided file descriptor.
    pub fd: Option<OwnedFd>,
    /// Mapping offset or physical address, depending on the strategy.
    pub offset: u64,
    /// Allocated length in bytes.
    pub length: u32,
    /// Bytes one frame of the negotiated format occupies.
    pub format_length: u32,
    /// CPU mapping, when the strategy provides one.
    pub mapping: Option<BufferMapping>,
    /// Id of the owning capture device.
    pub owner: u32,
    /// Bytes filled by the device, set at dequeue time.
    pub bytes_used: u32,
    /// Device timestamp of the captured frame, set at dequeue time.
    pub timestamp_ns: u64,
}

impl CaptureBuffer {
    /// Borrow the frame bytes, when a CPU mapping exists.
    pub fn data(&self) -> Option<&[u8]> {
        let len = self.bytes_used.max(self.format_length) as usize;
        self.mapping
            .as_ref()
            .map(|m| &m.as_slice()[..len.min(m.len())])
    }

    pub(crate) fn queue_slot(&self, memory: MemoryKind) -> QueueSlot {
        let backing = match memory {
            MemoryKind::Mmap => QueueBacking::Mmap {
                offset: self.offset,
                length: self.length,
            },
            MemoryKind::DmaBuf => QueueBacking::DmaBuf {
                fd: self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1),
                length: self.length,
            },
        };
        QueueSlot {
            index: self.index,
            backing,
        }
    }
}

/// Errors from the external physical-memory allocator.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("allocator out of memory for {len} bytes")]
    OutOfMemory { len: usize },
    #[error("allocator failed: {0}")]
    Backend(String),
}

/// A DMA buffer produced by the external allocator.
///
/// Freeing happens on drop; the allocator hands over full ownership of the
/// descriptor and mapping.
#[derive(Debug)]
pub struct DmaBuffer {
    pub fd: OwnedFd,
    /// Physical address of the allocation.
    pub phys_addr: u64,
    pub length: u32,
    pub mapping: Option<BufferMapping>,
}

/// External physical-memory allocator collaborator.
///
/// Injected at device construction for the DMA strategies; the pipeline
/// never reaches for a global allocator instance.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, length: usize) -> Result<DmaBuffer, AllocError>;
}

/// How a capture device sources its buffers.
///
/// A closed set selected once at device construction; each variant holds
/// only what it needs.
#[derive(Clone)]
pub enum BufferStrategy {
    /// Kernel-owned memory-mapped buffers.
    MemoryMapped { mplane: bool },
    /// Pre-allocated DMA buffers addressed by file descriptor.
    DmaExported {
        allocator: Arc<dyn BufferAllocator>,
        mplane: bool,
    },
    /// DMA buffers over USB; the node cannot stay open while idle, so it
    /// is closed after stop and reopened before the next configure.
    UsbDma { allocator: Arc<dyn BufferAllocator> },
}

impl std::fmt::Debug for BufferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferStrategy::MemoryMapped { mplane } => {
                f.debug_struct("MemoryMapped").field("mplane", mplane).finish()
            }
            BufferStrategy::DmaExported { mplane, .. } => {
                f.debug_struct("DmaExported").field("mplane", mplane).finish()
            }
            BufferStrategy::UsbDma { .. } => f.debug_struct("UsbDma").finish(),
        }
    }
}

impl BufferStrategy {
    /// Memory addressing used on the kernel boundary.
    pub fn memory_kind(&self) -> MemoryKind {
        match self {
            BufferStrategy::MemoryMapped { .. } => MemoryKind::Mmap,
            BufferStrategy::DmaExported { .. } | BufferStrategy::UsbDma { .. } => {
                MemoryKind::DmaBuf
            }
        }
    }

    /// Whether the node is multi-planar.
    pub fn mplane(&self) -> bool {
        match self {
            BufferStrategy::MemoryMapped { mplane }
            | BufferStrategy::DmaExported { mplane, .. } => *mplane,
            BufferStrategy::UsbDma { .. } => false,
        }
    }

    /// Whether the node must be closed after stop and reopened before the
    /// next configure.
    pub fn requires_reopen(&self) -> bool {
        matches!(self, BufferStrategy::UsbDma { .. })
    }

    /// Allocate and register `count` buffers against the device.
    ///
    /// On any failure the kernel side is released again so the device is
    /// left with no registered buffers.
    pub(crate) fn allocate(
        &self,
        transport: &mut dyn DeviceTransport,
        count: u32,
        image_size: u32,
        owner: u32,
    ) -> Result<Vec<CaptureBuffer>, DeviceError> {
        match self {
            BufferStrategy::MemoryMapped { mplane } => {
                self.allocate_mmap(transport, count, image_size, owner, *mplane)
            }
            BufferStrategy::DmaExported { allocator, .. }
            | BufferStrategy::UsbDma { allocator } => {
                self.allocate_dma(transport, allocator.as_ref(), count, image_size, owner)
            }
        }
    }

    fn allocate_mmap(
        &self,
        transport: &mut dyn DeviceTransport,
        count: u32,
        image_size: u32,
        owner: u32,
        mplane: bool,
    ) -> Result<Vec<CaptureBuffer>, DeviceError> {
        let granted = transport.request_buffers(MemoryKind::Mmap, count)?;
        let mut buffers = Vec::with_capacity(granted as usize);
        let result = (|| -> Result<(), DeviceError> {
            for index in 0..granted {
                let slot = transport.query_buffer(index)?;
                let fd = transport.export_buffer(index)?;
                let mapping = transport.map_buffer(&slot)?;
                // One buffer-mapped device family only reports a valid
                // physical address on a second query, after the mapping
                // exists.
                let offset = if mplane {
                    slot.offset
                } else {
                    transport.query_buffer(index)?.offset
                };
                buffers.push(CaptureBuffer {
                    index,
                    fd: Some(fd),
                    offset,
                    length: slot.length,
                    format_length: if image_size > 0 { image_size } else { slot.length },
                    mapping: Some(mapping),
                    owner,
                    bytes_used: 0,
                    timestamp_ns: 0,
                });
            }
            Ok(())
        })();
        if let Err(err) = result {
            buffers.clear();
            Self::release_kernel(transport, MemoryKind::Mmap);
            return Err(err);
        }
        Ok(buffers)
    }

    fn allocate_dma(
        &self,
        transport: &mut dyn DeviceTransport,
        allocator: &dyn BufferAllocator,
        count: u32,
        image_size: u32,
        owner: u32,
    ) -> Result<Vec<CaptureBuffer>, DeviceError> {
        let granted = transport.request_buffers(MemoryKind::DmaBuf, count)?;
        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match allocator.allocate(image_size as usize) {
                Ok(dma) => buffers.push(CaptureBuffer {
                    index,
                    offset: dma.phys_addr,
                    length: dma.length,
                    format_length: image_size.min(dma.length),
                    fd: Some(dma.fd),
                    mapping: dma.mapping,
                    owner,
                    bytes_used: 0,
                    timestamp_ns: 0,
                }),
                Err(err) => {
                    buffers.clear();
                    Self::release_kernel(transport, MemoryKind::DmaBuf);
                    return Err(DeviceError::Alloc(err));
                }
            }
        }
        Ok(buffers)
    }

    /// Release all buffers: drop the process side, then the kernel side.
    pub(crate) fn release(
        &self,
        transport: &mut dyn DeviceTransport,
        buffers: &mut Vec<Option<CaptureBuffer>>,
    ) {
        buffers.clear();
        Self::release_kernel(transport, self.memory_kind());
    }

    fn release_kernel(transport: &mut dyn DeviceTransport, memory: MemoryKind) {
        if let Err(err) = transport.request_buffers(memory, 0) {
            if !matches!(err, TransportError::NotOpen) {
                warn!(error = %err, "releasing kernel buffers failed");
            }
        }
    }
}
