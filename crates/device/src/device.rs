//! The capture-device state machine.
//!
//! One `CaptureDevice` owns one kernel video-capture node and its buffer
//! lifecycle: open, configure-and-start, bounded-wait frame acquisition
//! with stall recovery, warm-up frame omission, buffer return, stop.

use std::sync::Arc;
use std::time::Duration;

use lethe_core::prelude::{DeviceMetrics, Resolution, StreamGeometry};
use tracing::{debug, error, info, warn};

use crate::buffer::{AllocError, BufferStrategy, CaptureBuffer};
use crate::sensor::{SensorController, SensorDescriptor, SensorError};
use crate::transport::{DeviceTransport, FormatRequest, NegotiatedFormat, TransportError};

/// Default bounded wait for a completed buffer.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconfigure-and-restart attempts allowed per stall before giving up.
const MAX_RECOVERIES: u32 = 1;

/// Fallback ring depth when the session has not negotiated one.
const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Errors surfaced by a capture device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device node unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device is not streaming")]
    NotRunning,
    #[error("device stalled beyond recovery at {geometry}")]
    Stalled { geometry: StreamGeometry },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("buffer owned by device {owner} returned to device {device}")]
    ForeignBuffer { owner: u32, device: u32 },
    #[error("buffer {0} returned twice")]
    AlreadyReturned(u32),
    #[error("device handed out unknown buffer index {0}")]
    UnknownBuffer(u32),
}

impl DeviceError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::DeviceUnavailable(_) => "device_unavailable",
            DeviceError::NotRunning => "not_running",
            DeviceError::Stalled { .. } => "stalled",
            DeviceError::Transport(_) => "transport",
            DeviceError::Alloc(_) => "alloc",
            DeviceError::Sensor(_) => "sensor",
            DeviceError::ForeignBuffer { .. } => "foreign_buffer",
            DeviceError::AlreadyReturned(_) => "already_returned",
            DeviceError::UnknownBuffer(_) => "unknown_buffer",
        }
    }

    /// Whether the operation may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::DeviceUnavailable(_) | DeviceError::Transport(_)
        )
    }
}

/// Capture-device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Node not open.
    Closed,
    /// Node open, nothing streaming; negotiated geometry may be empty.
    Configured,
    /// Buffers registered and the device streaming.
    Running,
    /// Transient: a stall triggered reconfigure-and-restart.
    Recovering,
}

/// One kernel video-capture node plus its buffer lifecycle.
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use lethe_device::prelude::*;
///
/// let sensor = Arc::new(SensorDescriptor::new(
///     "ov5640",
///     "/dev/video0",
///     BufferingKind::Mmap { mplane: false },
/// ));
/// let mut device = CaptureDevice::new(
///     0,
///     sensor,
///     Box::new(V4l2Transport::new(false)),
///     BufferStrategy::MemoryMapped { mplane: false },
/// );
/// device.open()?;
/// device.configure_and_start(geometry, false)?;
/// let frame = device.acquire_frame()?;
/// device.return_frame(frame)?;
/// device.stop()?;
/// # Ok::<(), lethe_device::device::DeviceError>(())
/// ```
pub struct CaptureDevice {
    id: u32,
    transport: Box<dyn DeviceTransport>,
    strategy: BufferStrategy,
    sensor: Arc<SensorDescriptor>,
    controller: Option<Arc<dyn SensorController>>,
    state: DeviceState,
    geometry: Option<StreamGeometry>,
    negotiated: Option<NegotiatedFormat>,
    /// `None` slots are in flight with the caller.
    buffers: Vec<Option<CaptureBuffer>>,
    buffer_count: u32,
    omit_remaining: u32,
    frames_seen: u64,
    recover_count: u32,
    acquire_timeout: Duration,
    metrics: Arc<DeviceMetrics>,
}

impl CaptureDevice {
    pub fn new(
        id: u32,
        sensor: Arc<SensorDescriptor>,
        transport: Box<dyn DeviceTransport>,
        strategy: BufferStrategy,
    ) -> Self {
        Self {
            id,
            transport,
            strategy,
            sensor,
            controller: None,
            state: DeviceState::Closed,
            geometry: None,
            negotiated: None,
            buffers: Vec::new(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            omit_remaining: 0,
            frames_seen: 0,
            recover_count: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            metrics: Arc::new(DeviceMetrics::default()),
        }
    }

    /// Attach the sensor-control collaborator.
    pub fn with_controller(mut self, controller: Arc<dyn SensorController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Override the acquire timeout (tests, slow transports).
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Geometry the device currently streams, if any.
    pub fn geometry(&self) -> Option<StreamGeometry> {
        self.geometry
    }

    pub fn sensor(&self) -> &Arc<SensorDescriptor> {
        &self.sensor
    }

    /// The attached sensor controller, if any.
    pub fn controller(&self) -> Option<&Arc<dyn SensorController>> {
        self.controller.as_ref()
    }

    pub fn metrics(&self) -> Arc<DeviceMetrics> {
        self.metrics.clone()
    }

    /// Buffers currently acquired by the caller.
    pub fn in_flight(&self) -> usize {
        self.buffers.iter().filter(|slot| slot.is_none()).count()
    }

    /// Ring depth to register at the next configure.
    pub fn set_buffer_count(&mut self, count: u32) {
        self.buffer_count = count.max(2);
    }

    /// Open the node and bind the sensor controller.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        self.open_node()?;
        if let Some(controller) = &self.controller {
            controller.attach(&self.sensor.device_path)?;
        }
        self.state = DeviceState::Configured;
        Ok(())
    }

    /// Stop and close the node.
    pub fn close(&mut self) {
        if matches!(self.state, DeviceState::Running | DeviceState::Recovering) {
            if let Err(err) = self.stop_streaming() {
                warn!(device = self.id, error = %err, "stop during close failed");
            }
        }
        self.transport.close();
        self.state = DeviceState::Closed;
    }

    /// Configure geometry and start streaming.
    ///
    /// Idempotent: when the device is already running the requested
    /// configuration and `recover` is false this performs no device I/O.
    /// Otherwise the device is stopped, reconfigured and restarted; the
    /// node is closed and reopened when recovering or when the strategy
    /// requires it. Any failure leaves the device stopped.
    pub fn configure_and_start(
        &mut self,
        geometry: StreamGeometry,
        recover: bool,
    ) -> Result<(), DeviceError> {
        let geometry = self.apply_platform_override(geometry);

        if self.state == DeviceState::Running && !recover {
            if let Some(current) = &self.geometry {
                if current.same_shape(&geometry) && current.fps == geometry.fps {
                    debug!(device = self.id, %geometry, "already streaming this configuration");
                    return Ok(());
                }
            }
        }

        info!(
            device = self.id,
            current = ?self.geometry.map(|g| g.to_string()),
            requested = %geometry,
            recover,
            "configure and start"
        );

        let mut saved_state = false;
        if matches!(self.state, DeviceState::Running | DeviceState::Recovering) {
            if let Some(controller) = &self.controller {
                controller.save_state();
                saved_state = true;
            }
            self.stop_streaming()?;
            if recover {
                self.transport.close();
            }
        }

        if !self.transport.is_open() {
            self.open_node()?;
        }

        let request = FormatRequest {
            fourcc: geometry.format.to_fourcc(),
            resolution: geometry.resolution,
        };
        let negotiated = self.transport.negotiate_format(request)?;
        let fps = self.pick_fps(&negotiated, geometry.fps);
        self.transport.set_frame_rate(fps)?;

        self.omit_remaining = self.sensor.omit_count(geometry.resolution);
        if self.omit_remaining > 0 {
            info!(
                device = self.id,
                resolution = %geometry.resolution,
                omit = self.omit_remaining,
                "arming warm-up frame omission"
            );
        }

        let buffers = self.strategy.allocate(
            self.transport.as_mut(),
            self.buffer_count,
            negotiated.image_size,
            self.id,
        )?;

        let memory = self.strategy.memory_kind();
        let started = (|| -> Result<(), TransportError> {
            for buffer in &buffers {
                self.transport
                    .queue_buffer(memory, &buffer.queue_slot(memory))?;
            }
            self.transport.stream_on()
        })();
        if let Err(err) = started {
            error!(device = self.id, error = %err, "starting stream failed");
            let mut slots: Vec<Option<CaptureBuffer>> = buffers.into_iter().map(Some).collect();
            self.strategy.release(self.transport.as_mut(), &mut slots);
            return Err(err.into());
        }

        self.buffers = buffers.into_iter().map(Some).collect();
        self.geometry = Some(StreamGeometry { fps, ..geometry });
        self.negotiated = Some(negotiated);
        self.frames_seen = 0;
        self.state = DeviceState::Running;

        if saved_state {
            if let Some(controller) = &self.controller {
                controller.restore_state();
            }
        }

        Ok(())
    }

    /// Stop streaming and release all buffers; a no-op when not running.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.state, DeviceState::Running | DeviceState::Recovering) {
            return Ok(());
        }
        self.stop_streaming()
    }

    /// Block until the device hands over a completed buffer.
    ///
    /// A timed-out wait presumes a stalled device and triggers one
    /// reconfigure-and-restart with the last-known geometry; this is the
    /// only place recovery is triggered. Warm-up frames are requeued
    /// internally until the omit counter reaches zero.
    pub fn acquire_frame(&mut self) -> Result<CaptureBuffer, DeviceError> {
        loop {
            if !matches!(self.state, DeviceState::Running | DeviceState::Recovering) {
                return Err(DeviceError::NotRunning);
            }
            let geometry = self.geometry.ok_or(DeviceError::NotRunning)?;

            if !self.transport.wait_readable(self.acquire_timeout)? {
                self.recover_count += 1;
                if self.recover_count > MAX_RECOVERIES {
                    self.metrics.stall();
                    error!(
                        device = self.id,
                        %geometry,
                        recoveries = self.recover_count - 1,
                        "stall persists after recovery; giving up"
                    );
                    return Err(DeviceError::Stalled { geometry });
                }
                warn!(
                    device = self.id,
                    %geometry,
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    frames = self.frames_seen,
                    recover = self.recover_count,
                    "no frame within timeout, recovering device"
                );
                self.metrics.recovery();
                self.state = DeviceState::Recovering;
                self.configure_and_start(geometry, true)?;
                continue;
            }

            let memory = self.strategy.memory_kind();
            let dequeued = self.transport.dequeue_buffer(memory)?;
            self.frames_seen += 1;
            self.metrics.frame();
            if self.frames_seen == 1 {
                self.recover_count = 0;
                info!(device = self.id, %geometry, "first frame after (re)start");
            }

            let index = dequeued.index as usize;
            if self.omit_remaining > 0 {
                let slot = self
                    .buffers
                    .get(index)
                    .and_then(|b| b.as_ref())
                    .ok_or(DeviceError::UnknownBuffer(dequeued.index))?
                    .queue_slot(memory);
                self.transport.queue_buffer(memory, &slot)?;
                self.omit_remaining -= 1;
                self.metrics.omit();
                debug!(
                    device = self.id,
                    remaining = self.omit_remaining,
                    "omitted warm-up frame"
                );
                continue;
            }

            let mut buffer = self
                .buffers
                .get_mut(index)
                .and_then(Option::take)
                .ok_or(DeviceError::UnknownBuffer(dequeued.index))?;
            buffer.bytes_used = dequeued.bytes_used;
            buffer.timestamp_ns = dequeued.timestamp_ns;
            return Ok(buffer);
        }
    }

    /// Re-enqueue a buffer previously handed out by [`acquire_frame`].
    ///
    /// A kernel-level enqueue failure is reported but does not change
    /// device state; the buffer is back under device ownership either way.
    ///
    /// [`acquire_frame`]: CaptureDevice::acquire_frame
    pub fn return_frame(&mut self, mut buffer: CaptureBuffer) -> Result<(), DeviceError> {
        if buffer.owner != self.id {
            return Err(DeviceError::ForeignBuffer {
                owner: buffer.owner,
                device: self.id,
            });
        }
        let index = buffer.index as usize;
        match self.buffers.get(index) {
            Some(None) => {}
            Some(Some(_)) => return Err(DeviceError::AlreadyReturned(buffer.index)),
            None => return Err(DeviceError::UnknownBuffer(buffer.index)),
        }

        buffer.bytes_used = 0;
        buffer.timestamp_ns = 0;
        let memory = self.strategy.memory_kind();
        let slot = buffer.queue_slot(memory);
        let result = self.transport.queue_buffer(memory, &slot);
        if let Err(err) = &result {
            warn!(device = self.id, index = buffer.index, error = %err, "re-enqueue failed");
        }
        self.buffers[index] = Some(buffer);
        result.map_err(Into::into)
    }

    fn open_node(&mut self) -> Result<(), DeviceError> {
        self.transport
            .open(&self.sensor.device_path)
            .map_err(|err| DeviceError::DeviceUnavailable(err.to_string()))
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        let outstanding = self.in_flight();
        if outstanding > 0 {
            // The caller violated buffer conservation; releasing now leaks
            // the hardware side of those buffers.
            warn!(
                device = self.id,
                outstanding, "stopping with buffers still in flight"
            );
        }
        let result = self.transport.stream_off();
        self.strategy
            .release(self.transport.as_mut(), &mut self.buffers);
        if self.strategy.requires_reopen() {
            self.transport.close();
        }
        self.geometry = None;
        self.negotiated = None;
        self.omit_remaining = 0;
        self.state = if self.transport.is_open() {
            DeviceState::Configured
        } else {
            DeviceState::Closed
        };
        result?;
        Ok(())
    }

    fn pick_fps(&mut self, negotiated: &NegotiatedFormat, requested: u32) -> u32 {
        match self
            .transport
            .frame_rates(negotiated.fourcc, negotiated.resolution)
        {
            Ok(rates) if !rates.is_empty() => {
                let mut picked = requested;
                let mut best_diff = u32::MAX;
                for rate in rates {
                    let diff = rate.abs_diff(requested);
                    if diff < best_diff {
                        best_diff = diff;
                        picked = rate;
                    }
                }
                if picked != requested {
                    info!(
                        device = self.id,
                        requested, picked, "frame rate bounded to enumerated rate"
                    );
                }
                picked
            }
            Ok(_) => requested,
            Err(TransportError::IntervalsUnsupported) => {
                debug!(
                    device = self.id,
                    fallback = self.sensor.default_fps,
                    "device does not enumerate frame intervals"
                );
                self.sensor.default_fps
            }
            Err(err) => {
                warn!(device = self.id, error = %err, "frame-interval enumeration failed");
                self.sensor.default_fps
            }
        }
    }

    fn apply_platform_override(&self, geometry: StreamGeometry) -> StreamGeometry {
        // The imx8mq capture path cannot produce 240p; substitute the next
        // larger advertised geometry.
        if self.sensor.platform.contains("imx8mq")
            && geometry.resolution == Resolution::new(320, 240).unwrap()
        {
            let substituted = StreamGeometry {
                resolution: Resolution::new(640, 480).unwrap(),
                ..geometry
            };
            info!(device = self.id, "imx8mq: substituting 640x480 for 320x240");
            return substituted;
        }
        geometry
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if matches!(self.state, DeviceState::Running | DeviceState::Recovering) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferAllocator, DmaBuffer};
    use crate::sensor::{BufferingKind, OmitEntry};
    use crate::transport::{
        BufferMapping, BufferSlot, DequeuedBuffer, MemoryKind, QueueSlot,
    };
    use lethe_core::prelude::{PixelFormat, UsageFlags};
    use std::collections::VecDeque;
    use std::os::fd::OwnedFd;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn null_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    #[derive(Default)]
    struct FakeState {
        open: bool,
        opens: u32,
        closes: u32,
        ops: Vec<&'static str>,
        ready: VecDeque<bool>,
        queued: VecDeque<u32>,
        query_calls: u32,
        rates: Vec<u32>,
        rates_supported: bool,
        set_fps: Vec<u32>,
    }

    struct FakeTransport {
        state: std::rc::Rc<std::cell::RefCell<FakeState>>,
    }

    // The device owns the transport on one thread; the Rc is only for
    // test-side inspection.
    unsafe impl Send for FakeTransport {}

    fn fake(rates: Vec<u32>) -> (FakeTransport, std::rc::Rc<std::cell::RefCell<FakeState>>) {
        let state = std::rc::Rc::new(std::cell::RefCell::new(FakeState {
            rates_supported: !rates.is_empty(),
            rates,
            ..FakeState::default()
        }));
        (
            FakeTransport {
                state: state.clone(),
            },
            state,
        )
    }

    impl DeviceTransport for FakeTransport {
        fn open(&mut self, _path: &Path) -> Result<(), TransportError> {
            let mut s = self.state.borrow_mut();
            s.open = true;
            s.opens += 1;
            s.ops.push("open");
            Ok(())
        }

        fn close(&mut self) {
            let mut s = self.state.borrow_mut();
            if s.open {
                s.closes += 1;
            }
            s.open = false;
            s.ops.push("close");
        }

        fn is_open(&self) -> bool {
            self.state.borrow().open
        }

        fn negotiate_format(
            &mut self,
            request: FormatRequest,
        ) -> Result<NegotiatedFormat, TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("s_fmt");
            Ok(NegotiatedFormat {
                fourcc: request.fourcc,
                resolution: request.resolution,
                bytes_per_line: request.resolution.width.get() * 2,
                image_size: request.resolution.width.get() * request.resolution.height.get() * 2,
            })
        }

        fn set_frame_rate(&mut self, fps: u32) -> Result<(), TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("s_parm");
            s.set_fps.push(fps);
            Ok(())
        }

        fn frame_rates(
            &mut self,
            _fourcc: lethe_core::prelude::FourCc,
            _resolution: Resolution,
        ) -> Result<Vec<u32>, TransportError> {
            let s = self.state.borrow();
            if !s.rates_supported {
                return Err(TransportError::IntervalsUnsupported);
            }
            Ok(s.rates.clone())
        }

        fn request_buffers(
            &mut self,
            _memory: MemoryKind,
            count: u32,
        ) -> Result<u32, TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("reqbufs");
            if count == 0 {
                s.queued.clear();
            }
            Ok(count)
        }

        fn query_buffer(&mut self, index: u32) -> Result<BufferSlot, TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("querybuf");
            s.query_calls += 1;
            Ok(BufferSlot {
                index,
                offset: 0x1000 * (index as u64 + 1),
                length: 4096,
            })
        }

        fn export_buffer(&mut self, _index: u32) -> Result<OwnedFd, TransportError> {
            self.state.borrow_mut().ops.push("expbuf");
            Ok(null_fd())
        }

        fn map_buffer(&mut self, slot: &BufferSlot) -> Result<BufferMapping, TransportError> {
            self.state.borrow_mut().ops.push("mmap");
            Ok(BufferMapping::from_heap(slot.length as usize))
        }

        fn queue_buffer(
            &mut self,
            _memory: MemoryKind,
            slot: &QueueSlot,
        ) -> Result<(), TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("qbuf");
            s.queued.push_back(slot.index);
            Ok(())
        }

        fn dequeue_buffer(&mut self, _memory: MemoryKind) -> Result<DequeuedBuffer, TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("dqbuf");
            let index = s.queued.pop_front().ok_or(TransportError::Ioctl {
                op: "VIDIOC_DQBUF",
                source: std::io::Error::from_raw_os_error(libc::EAGAIN),
            })?;
            Ok(DequeuedBuffer {
                index,
                bytes_used: 4096,
                timestamp_ns: 1_000,
            })
        }

        fn wait_readable(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
            let mut s = self.state.borrow_mut();
            s.ops.push("wait");
            Ok(s.ready.pop_front().unwrap_or(true))
        }

        fn stream_on(&mut self) -> Result<(), TransportError> {
            self.state.borrow_mut().ops.push("streamon");
            Ok(())
        }

        fn stream_off(&mut self) -> Result<(), TransportError> {
            self.state.borrow_mut().ops.push("streamoff");
            Ok(())
        }
    }

    struct FakeAllocator {
        fail: bool,
        allocated: AtomicU32,
    }

    impl FakeAllocator {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                allocated: AtomicU32::new(0),
            }
        }
    }

    impl BufferAllocator for FakeAllocator {
        fn allocate(&self, length: usize) -> Result<DmaBuffer, AllocError> {
            if self.fail {
                return Err(AllocError::OutOfMemory { len: length });
            }
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Ok(DmaBuffer {
                fd: null_fd(),
                phys_addr: 0xdead_0000,
                length: length as u32,
                mapping: Some(BufferMapping::from_heap(length)),
            })
        }
    }

    #[derive(Default)]
    struct RecordingController {
        saves: AtomicU32,
        restores: AtomicU32,
    }

    impl SensorController for RecordingController {
        fn attach(&self, _device_path: &Path) -> Result<(), SensorError> {
            Ok(())
        }

        fn apply(
            &self,
            _metadata: &lethe_core::prelude::RequestMetadata,
        ) -> Result<(), SensorError> {
            Ok(())
        }

        fn save_state(&self) {
            self.saves.fetch_add(1, Ordering::Relaxed);
        }

        fn restore_state(&self) {
            self.restores.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn geometry(w: u32, h: u32, fps: u32) -> StreamGeometry {
        StreamGeometry {
            format: PixelFormat::Yuyv,
            resolution: Resolution::new(w, h).unwrap(),
            usage: UsageFlags::NONE,
            fps,
        }
    }

    fn sensor() -> SensorDescriptor {
        SensorDescriptor::new("test", "/dev/video9", BufferingKind::Mmap { mplane: false })
    }

    fn mmap_device(
        sensor: SensorDescriptor,
        rates: Vec<u32>,
    ) -> (CaptureDevice, std::rc::Rc<std::cell::RefCell<FakeState>>) {
        let (transport, state) = fake(rates);
        let device = CaptureDevice::new(
            0,
            Arc::new(sensor),
            Box::new(transport),
            BufferStrategy::MemoryMapped { mplane: false },
        )
        .with_acquire_timeout(Duration::from_millis(10));
        (device, state)
    }

    #[test]
    fn identical_configure_is_a_noop() {
        let (mut device, state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        let ops_before = state.borrow().ops.len();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        assert_eq!(state.borrow().ops.len(), ops_before);
        assert_eq!(device.state(), DeviceState::Running);
    }

    #[test]
    fn geometry_change_restarts_the_device() {
        let (mut device, state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        let ops = state.borrow().ops.clone();
        assert!(ops.contains(&"streamoff"));
        assert_eq!(ops.iter().filter(|op| **op == "streamon").count(), 2);
        assert_eq!(
            device.geometry().unwrap().resolution,
            Resolution::new(640, 480).unwrap()
        );
    }

    #[test]
    fn double_query_supplies_the_buffer_offset() {
        let (mut device, state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.set_buffer_count(2);
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        // Two queries per buffer for the non-mplane mmap family.
        assert_eq!(state.borrow().query_calls, 4);
    }

    #[test]
    fn stall_recovers_once_and_preserves_geometry() {
        let (mut device, state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        state.borrow_mut().ready.push_back(false);

        let frame = device.acquire_frame().unwrap();
        assert_eq!(device.metrics().recoveries(), 1);
        assert_eq!(
            device.geometry().unwrap().resolution,
            Resolution::new(1280, 720).unwrap()
        );
        assert_eq!(device.state(), DeviceState::Running);
        // Recovery reopens the node.
        assert_eq!(state.borrow().opens, 2);
        device.return_frame(frame).unwrap();
    }

    #[test]
    fn persistent_stall_fails_after_one_recovery() {
        let (mut device, state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        state.borrow_mut().ready.push_back(false);
        state.borrow_mut().ready.push_back(false);

        match device.acquire_frame() {
            Err(DeviceError::Stalled { geometry }) => {
                assert_eq!(geometry.resolution, Resolution::new(1280, 720).unwrap());
            }
            other => panic!("expected stall, got {other:?}"),
        }
        assert_eq!(device.metrics().recoveries(), 1);
        assert_eq!(device.metrics().stalls(), 1);
    }

    #[test]
    fn omit_frames_are_requeued_not_surfaced() {
        let mut sensor = sensor();
        sensor.omit_table.push(OmitEntry {
            resolution: Resolution::new(1280, 720).unwrap(),
            count: 2,
        });
        let (mut device, _state) = mmap_device(sensor, vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();

        // Buffers 0..3 were enqueued in order; the first two dequeues are
        // consumed by the omit counter.
        let frame = device.acquire_frame().unwrap();
        assert_eq!(frame.index, 2);
        assert_eq!(device.metrics().omitted(), 2);
        device.return_frame(frame).unwrap();

        // Counter is spent; the next acquire surfaces immediately.
        let frame = device.acquire_frame().unwrap();
        assert_eq!(device.metrics().omitted(), 2);
        device.return_frame(frame).unwrap();
    }

    #[test]
    fn omit_count_requires_exact_resolution_match() {
        let mut sensor = sensor();
        sensor.omit_table.push(OmitEntry {
            resolution: Resolution::new(1280, 720).unwrap(),
            count: 2,
        });
        let (mut device, _state) = mmap_device(sensor, vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        let frame = device.acquire_frame().unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!(device.metrics().omitted(), 0);
        device.return_frame(frame).unwrap();
    }

    #[test]
    fn buffers_are_conserved_across_acquire_and_return() {
        let (mut device, _state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();

        let frame = device.acquire_frame().unwrap();
        assert_eq!(device.in_flight(), 1);
        let index = frame.index;
        device.return_frame(frame).unwrap();
        assert_eq!(device.in_flight(), 0);

        // Slot `index` is occupied again, so a second return of the same
        // index is a double return.
        let stolen = CaptureBuffer {
            index,
            fd: None,
            offset: 0,
            length: 0,
            format_length: 0,
            mapping: None,
            owner: 0,
            bytes_used: 0,
            timestamp_ns: 0,
        };
        assert!(matches!(
            device.return_frame(stolen),
            Err(DeviceError::AlreadyReturned(_))
        ));
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let (mut device, _state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        let foreign = CaptureBuffer {
            index: 0,
            fd: None,
            offset: 0,
            length: 0,
            format_length: 0,
            mapping: None,
            owner: 7,
            bytes_used: 0,
            timestamp_ns: 0,
        };
        assert!(matches!(
            device.return_frame(foreign),
            Err(DeviceError::ForeignBuffer { owner: 7, device: 0 })
        ));
    }

    #[test]
    fn requested_fps_clamps_to_enumerated_rates() {
        let (mut device, state) = mmap_device(sensor(), vec![15, 30]);
        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 60), false).unwrap();
        assert_eq!(state.borrow().set_fps.last(), Some(&30));
        assert_eq!(device.geometry().unwrap().fps, 30);
    }

    #[test]
    fn missing_interval_enumeration_falls_back_to_default() {
        let mut sensor = sensor();
        sensor.default_fps = 25;
        let (mut device, state) = mmap_device(sensor, Vec::new());
        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 60), false).unwrap();
        assert_eq!(state.borrow().set_fps.last(), Some(&25));
    }

    #[test]
    fn imx8mq_substitutes_480p_for_240p() {
        let mut sensor = sensor();
        sensor.platform = "imx8mq".into();
        let (mut device, _state) = mmap_device(sensor, vec![30]);
        device.open().unwrap();
        device.configure_and_start(geometry(320, 240, 30), false).unwrap();
        assert_eq!(
            device.geometry().unwrap().resolution,
            Resolution::new(640, 480).unwrap()
        );
    }

    #[test]
    fn usb_strategy_reopens_node_between_runs() {
        let (transport, state) = fake(vec![30]);
        let allocator = Arc::new(FakeAllocator::new(false));
        let mut device = CaptureDevice::new(
            0,
            Arc::new(SensorDescriptor::new(
                "uvc",
                "/dev/video9",
                BufferingKind::UsbDma,
            )),
            Box::new(transport),
            BufferStrategy::UsbDma { allocator },
        )
        .with_acquire_timeout(Duration::from_millis(10));

        device.open().unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        device.stop().unwrap();
        // The USB node cannot stay open while idle.
        assert!(!state.borrow().open);
        assert_eq!(state.borrow().closes, 1);
        assert_eq!(device.state(), DeviceState::Closed);

        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        assert_eq!(state.borrow().opens, 2);
        assert_eq!(device.state(), DeviceState::Running);
    }

    #[test]
    fn allocator_failure_leaves_device_stopped() {
        let (transport, state) = fake(vec![30]);
        let allocator = Arc::new(FakeAllocator::new(true));
        let mut device = CaptureDevice::new(
            0,
            Arc::new(SensorDescriptor::new(
                "dma",
                "/dev/video9",
                BufferingKind::Dma { mplane: false },
            )),
            Box::new(transport),
            BufferStrategy::DmaExported {
                allocator,
                mplane: false,
            },
        );

        device.open().unwrap();
        assert!(matches!(
            device.configure_and_start(geometry(640, 480, 30), false),
            Err(DeviceError::Alloc(_))
        ));
        assert_eq!(device.state(), DeviceState::Configured);
        assert!(device.geometry().is_none());
        // Kernel side was released again.
        assert_eq!(
            state.borrow().ops.iter().filter(|op| **op == "reqbufs").count(),
            2
        );
    }

    #[test]
    fn controller_state_is_saved_and_restored_across_reconfigure() {
        let (transport, _state) = fake(vec![30]);
        let controller = Arc::new(RecordingController::default());
        let mut device = CaptureDevice::new(
            0,
            Arc::new(sensor()),
            Box::new(transport),
            BufferStrategy::MemoryMapped { mplane: false },
        )
        .with_controller(controller.clone());

        device.open().unwrap();
        device.configure_and_start(geometry(1280, 720, 30), false).unwrap();
        device.configure_and_start(geometry(640, 480, 30), false).unwrap();
        assert_eq!(controller.saves.load(Ordering::Relaxed), 1);
        assert_eq!(controller.restores.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn acquire_on_stopped_device_fails() {
        let (mut device, _state) = mmap_device(sensor(), vec![30]);
        device.open().unwrap();
        assert!(matches!(
            device.acquire_frame(),
            Err(DeviceError::NotRunning)
        ));
    }
}
