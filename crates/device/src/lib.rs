#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod device;
#[cfg(feature = "probe")]
pub mod probe;
pub mod sensor;
pub mod transport;
pub mod v4l2;

pub mod prelude {
    pub use crate::buffer::{AllocError, BufferAllocator, BufferStrategy, CaptureBuffer, DmaBuffer};
    pub use crate::device::{CaptureDevice, DeviceError, DeviceState, DEFAULT_ACQUIRE_TIMEOUT};
    #[cfg(feature = "probe")]
    pub use crate::probe::{probe_nodes, ProbedMode, ProbedNode};
    pub use crate::sensor::{
        BufferingKind, ConfigStreamPolicy, OmitEntry, SensorController, SensorDescriptor,
        SensorError,
    };
    pub use crate::transport::{
        BufferMapping, BufferSlot, DequeuedBuffer, DeviceTransport, FormatRequest, MemoryKind,
        NegotiatedFormat, QueueBacking, QueueSlot, TransportError,
    };
    pub use crate::v4l2::V4l2Transport;
    pub use lethe_core::prelude::*;
}
