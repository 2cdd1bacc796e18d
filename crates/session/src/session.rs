//! The capture session and its request dispatcher.
//!
//! One session owns 1..N capture devices (one per physical sensor backing
//! a logical camera), the pipeline-configuration table, the request queue
//! and a single dedicated worker thread. All device I/O happens on that
//! thread; the public entry points synchronize with it only through the
//! queue and the pipeline table lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lethe_core::prelude::{
    CaptureIntent, DrainOutcome, FenceStatus, FrameQueueRx, FrameQueueTx, PixelFormat,
    RequestMetadata, ResultMetadata, SceneMode, SendOutcome, SessionMetrics, StreamGeometry,
    frame_queue,
};
use lethe_device::prelude::{CaptureDevice, DeviceError, DeviceState, SensorDescriptor};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::ShutterClock;
use crate::collaborators::{BlitHint, FrameProcessor, ResultCallback};
use crate::pipeline::{PipelineDescriptor, StreamRequest};
use crate::request::{CaptureRequest, QueuedOutput, QueuedRequest};
use crate::result::{BufferStatus, CaptureResult, PhysicalResult, ResultBuffer};

/// Grace period for in-flight requests at destroy time.
pub const DESTROY_GRACE: Duration = Duration::from_millis(100);

/// Idle wait of the dispatcher when the queue is empty.
pub const QUEUE_WAIT: Duration = Duration::from_millis(100);

/// Bounded wait on an output buffer's acquire fence.
pub const FENCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration-time errors, surfaced synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pipelines already built")]
    AlreadyBuilt,
    #[error("no pipelines configured")]
    NotConfigured,
    #[error("stream combination not supported: {0}")]
    UnsupportedStreamCombination(String),
    #[error("no stream configured to drive the device")]
    NoStreamConfigured,
    #[error("unknown physical camera {0}")]
    UnknownPhysicalCamera(u32),
}

impl ConfigError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::AlreadyBuilt => "already_built",
            ConfigError::NotConfigured => "not_configured",
            ConfigError::UnsupportedStreamCombination(_) => "unsupported_stream_combination",
            ConfigError::NoStreamConfigured => "no_stream_configured",
            ConfigError::UnknownPhysicalCamera(_) => "unknown_physical_camera",
        }
    }
}

/// Errors from `submit_requests`.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("pipelines not built")]
    NotBuilt,
    #[error("session is shutting down")]
    Closed,
}

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical camera id reported in results.
    pub camera_id: u32,
    /// Whether a CPU-side encoder consumes the streams downstream; selects
    /// the shutter clock domain.
    pub use_cpu_encoder: bool,
    pub fence_timeout: Duration,
    pub queue_wait: Duration,
    pub destroy_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            use_cpu_encoder: false,
            fence_timeout: FENCE_TIMEOUT,
            queue_wait: QUEUE_WAIT,
            destroy_grace: DESTROY_GRACE,
        }
    }
}

#[derive(Default)]
struct PipelineTable {
    pipelines: BTreeMap<u32, PipelineDescriptor>,
    next_id: u32,
    built: bool,
}

struct Shared {
    pipelines: Mutex<PipelineTable>,
    metrics: SessionMetrics,
}

/// A camera session: pipeline configuration plus the per-frame request
/// dispatcher.
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use lethe_session::prelude::*;
///
/// let session = CaptureSession::new(SessionConfig::default(), vec![device], processor)?;
/// let pipeline = session.configure_pipeline(0, callback, &streams)?;
/// session.build_pipelines()?;
/// session.submit_requests(0, requests)?;
/// session.destroy_pipelines();
/// # Ok::<(), lethe_session::session::SessionError>(())
/// ```
pub struct CaptureSession {
    camera_id: u32,
    shared: Arc<Shared>,
    tx: FrameQueueTx<QueuedRequest>,
    rx: FrameQueueRx<QueuedRequest>,
    worker: Option<thread::JoinHandle<()>>,
    sensors: Vec<(u32, Arc<SensorDescriptor>)>,
    is_logical: bool,
    config: SessionConfig,
}

/// Errors from session construction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session needs at least one physical device")]
    NoDevices,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("spawning dispatcher thread failed: {0}")]
    Spawn(std::io::Error),
}

impl CaptureSession {
    /// Create a session over the given physical devices and start its
    /// dispatcher thread.
    ///
    /// Devices still closed are opened here. The devices move onto the
    /// dispatcher thread; all further device I/O happens there.
    pub fn new(
        config: SessionConfig,
        mut devices: Vec<CaptureDevice>,
        processor: Arc<dyn FrameProcessor>,
    ) -> Result<Self, SessionError> {
        if devices.is_empty() {
            return Err(SessionError::NoDevices);
        }
        for device in &mut devices {
            if device.state() == DeviceState::Closed {
                device.open()?;
            }
        }

        let sensors: Vec<(u32, Arc<SensorDescriptor>)> = devices
            .iter()
            .map(|device| (device.id(), device.sensor().clone()))
            .collect();
        let is_logical = devices.len() > 1;

        let shared = Arc::new(Shared {
            pipelines: Mutex::new(PipelineTable::default()),
            metrics: SessionMetrics::default(),
        });
        let (tx, rx) = frame_queue();

        let dispatcher = Dispatcher {
            camera_id: config.camera_id,
            devices,
            processor,
            shared: shared.clone(),
            rx: rx.clone(),
            clock: ShutterClock::for_session(config.use_cpu_encoder),
            fence_timeout: config.fence_timeout,
            queue_wait: config.queue_wait,
            last_metadata: RequestMetadata::default(),
            is_logical,
        };
        let worker = thread::Builder::new()
            .name("capture-dispatch".into())
            .spawn(move || dispatcher.run())
            .map_err(SessionError::Spawn)?;

        info!(
            camera = config.camera_id,
            physical = sensors.len(),
            "capture session created"
        );
        Ok(Self {
            camera_id: config.camera_id,
            shared,
            tx,
            rx,
            worker: Some(worker),
            sensors,
            is_logical,
            config,
        })
    }

    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    /// Physical camera ids backing this session.
    pub fn physical_camera_ids(&self) -> Vec<u32> {
        self.sensors.iter().map(|(id, _)| *id).collect()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.shared.metrics
    }

    /// Configure one pipeline: validate the stream combination, classify
    /// roles and store the descriptor.
    pub fn configure_pipeline(
        &self,
        physical_camera_id: u32,
        callback: Arc<dyn ResultCallback>,
        streams: &[StreamRequest],
    ) -> Result<u32, ConfigError> {
        let mut table = self.shared.pipelines.lock();
        if table.built {
            error!("cannot configure pipelines after build");
            return Err(ConfigError::AlreadyBuilt);
        }
        if streams.is_empty() {
            return Err(ConfigError::UnsupportedStreamCombination(
                "no streams requested".into(),
            ));
        }
        for stream in streams {
            self.validate_stream(stream)?;
        }

        let id = table.next_id;
        table.next_id += 1;
        let descriptor = PipelineDescriptor::new(id, physical_camera_id, callback, streams);
        info!(
            pipeline = id,
            physical_camera_id,
            streams = streams.len(),
            "pipeline configured"
        );
        table.pipelines.insert(id, descriptor);
        Ok(id)
    }

    /// Transition Configured → Built. Pure state change, no device I/O.
    pub fn build_pipelines(&self) -> Result<(), ConfigError> {
        let mut table = self.shared.pipelines.lock();
        if table.built {
            return Err(ConfigError::AlreadyBuilt);
        }
        if table.pipelines.is_empty() {
            return Err(ConfigError::NotConfigured);
        }
        table.built = true;
        info!(pipelines = table.pipelines.len(), "pipelines built");
        Ok(())
    }

    /// Tear down all pipelines.
    ///
    /// A no-op when nothing is built. Queued work gets a bounded grace
    /// period to drain; anything still queued afterwards is
    /// force-completed so every submitted buffer goes back to its owner.
    pub fn destroy_pipelines(&self) {
        {
            let table = self.shared.pipelines.lock();
            if !table.built {
                debug!("nothing to destroy");
                return;
            }
        }

        // Bounded grace for queued work and for a batch the dispatcher has
        // drained but not yet delivered.
        let deadline = std::time::Instant::now() + self.config.destroy_grace;
        while !self.rx.is_quiet() {
            if std::time::Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if let DrainOutcome::Data(frames) = self.rx.try_drain() {
            let leftover: usize = frames.values().map(Vec::len).sum();
            warn!(leftover, "force-completing requests still queued at destroy");
            for (frame_number, requests) in frames {
                for request in requests {
                    self.force_complete(frame_number, request);
                }
            }
            self.rx.finish_drain();
        }

        let mut table = self.shared.pipelines.lock();
        table.pipelines.clear();
        table.built = false;
        info!("pipelines destroyed");
    }

    /// Queue requests for one frame and wake the dispatcher.
    ///
    /// Acquire fences are duplicated here so the caller's descriptors stay
    /// independent. Never blocks beyond lock contention.
    pub fn submit_requests(
        &self,
        frame_number: u32,
        requests: Vec<CaptureRequest>,
    ) -> Result<(), SubmitError> {
        {
            let table = self.shared.pipelines.lock();
            if !table.built {
                return Err(SubmitError::NotBuilt);
            }
        }
        let queued: Vec<QueuedRequest> = requests
            .into_iter()
            .map(|request| QueuedRequest::from_submitted(frame_number, request))
            .collect();
        let count = queued.len();
        match self.tx.send(frame_number, queued) {
            SendOutcome::Ok => {
                for _ in 0..count {
                    self.shared.metrics.submitted();
                }
                debug!(frame_number, count, "requests queued");
                Ok(())
            }
            SendOutcome::Closed => Err(SubmitError::Closed),
        }
    }

    fn validate_stream(&self, stream: &StreamRequest) -> Result<(), ConfigError> {
        let resolution = stream.geometry.resolution;
        match stream.physical_camera {
            Some(camera_id) => {
                let sensor = self
                    .sensors
                    .iter()
                    .find(|(id, _)| *id == camera_id)
                    .map(|(_, sensor)| sensor)
                    .ok_or(ConfigError::UnknownPhysicalCamera(camera_id))?;
                if !sensor.advertises(resolution) {
                    return Err(ConfigError::UnsupportedStreamCombination(format!(
                        "{resolution} not advertised by physical camera {camera_id}"
                    )));
                }
            }
            None => {
                if !self
                    .sensors
                    .iter()
                    .any(|(_, sensor)| sensor.advertises(resolution))
                {
                    return Err(ConfigError::UnsupportedStreamCombination(format!(
                        "{resolution} not advertised by any sensor"
                    )));
                }
            }
        }
        Ok(())
    }

    fn force_complete(&self, frame_number: u32, request: QueuedRequest) {
        let callback = {
            let table = self.shared.pipelines.lock();
            table
                .pipelines
                .get(&request.pipeline_id)
                .map(|pipeline| pipeline.callback.clone())
        };
        let Some(callback) = callback else {
            warn!(
                pipeline = request.pipeline_id,
                frame_number, "no pipeline for force-completed request"
            );
            return;
        };

        let timestamp = ShutterClock::for_session(self.config.use_cpu_encoder).now_ns();
        let metadata = ResultMetadata::converged(request.metadata.unwrap_or_default(), timestamp);
        let (owner, physical) = split_outputs(request.outputs, self.is_logical);
        let result = CaptureResult {
            camera_id: self.camera_id,
            pipeline_id: request.pipeline_id,
            frame_number,
            metadata: Some(metadata),
            buffers: owner
                .into_iter()
                .map(|output| ResultBuffer {
                    buffer: output.buffer,
                    status: BufferStatus::Incomplete,
                })
                .collect(),
            physical: physical
                .into_iter()
                .map(|(camera_id, outputs)| PhysicalResult {
                    camera_id,
                    buffers: outputs
                        .into_iter()
                        .map(|output| ResultBuffer {
                            buffer: output.buffer,
                            status: BufferStatus::Incomplete,
                        })
                        .collect(),
                })
                .collect(),
            partial: 1,
        };
        self.shared.metrics.forced();
        callback.deliver_result(result);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.destroy_pipelines();
        self.tx.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

fn split_outputs(
    outputs: impl IntoIterator<Item = QueuedOutput>,
    is_logical: bool,
) -> (Vec<QueuedOutput>, BTreeMap<u32, Vec<QueuedOutput>>) {
    let mut owner = Vec::new();
    let mut physical: BTreeMap<u32, Vec<QueuedOutput>> = BTreeMap::new();
    for output in outputs {
        match output.physical_camera {
            Some(camera_id) if is_logical => physical.entry(camera_id).or_default().push(output),
            _ => owner.push(output),
        }
    }
    (owner, physical)
}

struct Dispatcher {
    camera_id: u32,
    devices: Vec<CaptureDevice>,
    processor: Arc<dyn FrameProcessor>,
    shared: Arc<Shared>,
    rx: FrameQueueRx<QueuedRequest>,
    clock: ShutterClock,
    fence_timeout: Duration,
    queue_wait: Duration,
    last_metadata: RequestMetadata,
    is_logical: bool,
}

impl Dispatcher {
    fn run(mut self) {
        info!(camera = self.camera_id, "dispatcher running");
        loop {
            match self.rx.drain(self.queue_wait) {
                DrainOutcome::Closed => break,
                DrainOutcome::Empty => continue,
                DrainOutcome::Data(frames) => {
                    for (frame_number, requests) in frames {
                        for request in requests {
                            self.process(frame_number, request);
                        }
                    }
                    self.rx.finish_drain();
                }
            }
        }
        for device in &mut self.devices {
            if let Err(err) = device.stop() {
                warn!(device = device.id(), error = %err, "stop at shutdown failed");
            }
            device.close();
        }
        info!(camera = self.camera_id, "dispatcher stopped");
    }

    fn process(&mut self, frame_number: u32, request: QueuedRequest) {
        let pipeline = {
            let table = self.shared.pipelines.lock();
            table.pipelines.get(&request.pipeline_id).cloned()
        };
        let Some(pipeline) = pipeline else {
            warn!(
                pipeline = request.pipeline_id,
                frame_number, "request for unknown pipeline, skipping"
            );
            return;
        };

        // Latest settings carry forward to requests submitted without any.
        if let Some(metadata) = &request.metadata {
            self.last_metadata = metadata.clone();
        }
        let metadata = self.last_metadata.clone();

        if metadata.wants_reconfigure() {
            self.handle_intent(&pipeline, &metadata);
        }

        let timestamp = self.clock.now_ns();
        pipeline
            .callback
            .notify_shutter(pipeline.id, frame_number, timestamp);

        let (owner_outputs, physical_groups) = split_outputs(request.outputs, self.is_logical);

        let primary = self.primary_device_idx(&metadata);
        let owner_buffers = if owner_outputs.is_empty() {
            Vec::new()
        } else {
            self.capture_group(&pipeline, primary, owner_outputs, &metadata)
        };

        let mut physical = Vec::new();
        for (camera_id, outputs) in physical_groups {
            let buffers = match self.device_idx(camera_id) {
                Some(idx) => self.capture_group(&pipeline, idx, outputs, &metadata),
                None => {
                    warn!(camera_id, "outputs target unknown physical camera");
                    outputs
                        .into_iter()
                        .map(|output| {
                            self.shared.metrics.skipped_buffer();
                            ResultBuffer {
                                buffer: output.buffer,
                                status: BufferStatus::Incomplete,
                            }
                        })
                        .collect()
                }
            };
            physical.push(PhysicalResult { camera_id, buffers });
        }

        let result = CaptureResult {
            camera_id: self.camera_id,
            pipeline_id: pipeline.id,
            frame_number,
            metadata: Some(ResultMetadata::converged(metadata, timestamp)),
            buffers: owner_buffers,
            physical,
            partial: 1,
        };
        debug!(
            pipeline = pipeline.id,
            frame_number,
            complete = result.complete(),
            "delivering result"
        );
        pipeline.callback.deliver_result(result);
        self.shared.metrics.completed();
    }

    /// Apply scene-mode/intent/fps changes: resolve the config stream and
    /// reconfigure every physical device whose geometry differs.
    fn handle_intent(&mut self, pipeline: &PipelineDescriptor, metadata: &RequestMetadata) {
        let intent = metadata.capture_intent.unwrap_or(CaptureIntent::Preview);
        let policy = self
            .devices
            .first()
            .map(|device| device.sensor().config_policy)
            .unwrap_or_default();
        let picked = match pipeline.pick_config_stream(intent, policy) {
            Ok(idx) => idx,
            Err(err) => {
                warn!(pipeline = pipeline.id, error = %err, "no usable config stream");
                return;
            }
        };
        let stream = &pipeline.streams[picked];
        let fps = resolve_fps(metadata);
        // The capture engine runs packed YUV 4:2:2 regardless of the output
        // formats; the processor converts per stream.
        let geometry = StreamGeometry {
            format: PixelFormat::Yuyv,
            resolution: stream.geometry.resolution,
            usage: stream.geometry.usage,
            fps,
        };
        let buffer_count = stream.max_buffers + 1;

        for device in &mut self.devices {
            let unchanged = device
                .geometry()
                .map(|current| current.same_shape(&geometry) && current.fps == fps)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            device.set_buffer_count(buffer_count);
            if let Err(err) = device.configure_and_start(geometry, false) {
                error!(
                    device = device.id(),
                    %geometry,
                    error = %err,
                    "reconfigure for intent change failed"
                );
            }
        }
    }

    /// Capture one frame on one physical device and process the outputs
    /// assigned to it.
    fn capture_group(
        &mut self,
        pipeline: &PipelineDescriptor,
        device_idx: usize,
        outputs: Vec<QueuedOutput>,
        metadata: &RequestMetadata,
    ) -> Vec<ResultBuffer> {
        let (frame, source_geometry) = {
            let device = &mut self.devices[device_idx];
            if let Some(controller) = device.controller().cloned() {
                if let Err(err) = controller.apply(metadata) {
                    warn!(device = device.id(), error = %err, "sensor apply failed");
                }
            }
            match device.acquire_frame() {
                Ok(frame) => (frame, device.geometry()),
                Err(err) => {
                    warn!(device = device.id(), error = %err, "frame acquisition failed");
                    return outputs
                        .into_iter()
                        .map(|output| {
                            self.shared.metrics.skipped_buffer();
                            ResultBuffer {
                                buffer: output.buffer,
                                status: BufferStatus::Incomplete,
                            }
                        })
                        .collect();
                }
            }
        };

        let mut results = Vec::with_capacity(outputs.len());
        for output in outputs {
            let buffer = output.buffer;
            let status = self.process_output(pipeline, &frame, source_geometry, output, metadata);
            if status == BufferStatus::Incomplete {
                self.shared.metrics.skipped_buffer();
            }
            results.push(ResultBuffer { buffer, status });
        }

        // The hardware buffer goes back as soon as the hand-off is done,
        // before the next group is touched.
        let device = &mut self.devices[device_idx];
        if let Err(err) = device.return_frame(frame) {
            warn!(device = device.id(), error = %err, "returning capture buffer failed");
        }
        results
    }

    fn process_output(
        &self,
        pipeline: &PipelineDescriptor,
        frame: &lethe_device::prelude::CaptureBuffer,
        source_geometry: Option<StreamGeometry>,
        output: QueuedOutput,
        metadata: &RequestMetadata,
    ) -> BufferStatus {
        if let Some(fence) = &output.fence {
            match fence.wait(self.fence_timeout) {
                Ok(FenceStatus::Signaled) => {}
                Ok(FenceStatus::TimedOut) => {
                    warn!(
                        stream = output.buffer.stream_id,
                        "acquire fence timed out; skipping buffer"
                    );
                    return BufferStatus::Incomplete;
                }
                Err(err) => {
                    warn!(
                        stream = output.buffer.stream_id,
                        error = %err,
                        "acquire fence wait failed; skipping buffer"
                    );
                    return BufferStatus::Incomplete;
                }
            }
        }

        let Some(stream) = pipeline.stream(output.buffer.stream_id) else {
            error!(
                stream = output.buffer.stream_id,
                "output buffer belongs to an unconfigured stream"
            );
            return BufferStatus::Incomplete;
        };

        let processed = match stream.geometry.format {
            PixelFormat::Jpeg => self.processor.encode_jpeg(frame, &output.buffer, metadata),
            _ => {
                let hint = match source_geometry {
                    Some(source)
                        if source.resolution == stream.geometry.resolution
                            && source.format == stream.geometry.format =>
                    {
                        BlitHint::Copy
                    }
                    _ => BlitHint::Convert,
                };
                self.processor.convert(frame, &output.buffer, hint)
            }
        };
        match processed {
            Ok(()) => BufferStatus::Ok,
            Err(err) => {
                warn!(
                    stream = output.buffer.stream_id,
                    error = %err,
                    "frame processing failed"
                );
                BufferStatus::Incomplete
            }
        }
    }

    fn primary_device_idx(&self, metadata: &RequestMetadata) -> usize {
        if let Some(focal) = metadata.focal_length {
            if let Some(idx) = self
                .devices
                .iter()
                .position(|device| (device.sensor().focal_length - focal).abs() < f32::EPSILON)
            {
                return idx;
            }
        }
        0
    }

    fn device_idx(&self, camera_id: u32) -> Option<usize> {
        self.devices.iter().position(|d| d.id() == camera_id)
    }
}

fn resolve_fps(metadata: &RequestMetadata) -> u32 {
    if metadata.scene_mode == Some(SceneMode::Hdr) {
        return 30;
    }
    if let Some(range) = metadata.target_fps {
        if range.max_at_most(15) {
            return 15;
        }
    }
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StreamRequest;
    use crate::request::{OutputBuffer, OutputTarget};
    use lethe_core::prelude::{FourCc, FpsRange, Resolution, UsageFlags};
    use lethe_device::prelude::{
        BufferMapping, BufferSlot, BufferStrategy, BufferingKind, DequeuedBuffer, DeviceTransport,
        FormatRequest, MemoryKind, NegotiatedFormat, QueueSlot, TransportError,
    };
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    /// Always-ready transport: every wait succeeds, dequeues come back in
    /// enqueue order.
    #[derive(Default)]
    struct LoopState {
        open: bool,
        queued: VecDeque<u32>,
        configured: Vec<(FourCc, Resolution, u32)>,
        last_fps: u32,
    }

    struct LoopTransport {
        state: Arc<StdMutex<LoopState>>,
    }

    fn loop_transport() -> (LoopTransport, Arc<StdMutex<LoopState>>) {
        let state = Arc::new(StdMutex::new(LoopState::default()));
        (
            LoopTransport {
                state: state.clone(),
            },
            state,
        )
    }

    impl DeviceTransport for LoopTransport {
        fn open(&mut self, _path: &Path) -> Result<(), TransportError> {
            self.state.lock().unwrap().open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.state.lock().unwrap().open = false;
        }

        fn is_open(&self) -> bool {
            self.state.lock().unwrap().open
        }

        fn negotiate_format(
            &mut self,
            request: FormatRequest,
        ) -> Result<NegotiatedFormat, TransportError> {
            let mut state = self.state.lock().unwrap();
            state
                .configured
                .push((request.fourcc, request.resolution, 0));
            Ok(NegotiatedFormat {
                fourcc: request.fourcc,
                resolution: request.resolution,
                bytes_per_line: request.resolution.width.get() * 2,
                image_size: request.resolution.width.get() * request.resolution.height.get() * 2,
            })
        }

        fn set_frame_rate(&mut self, fps: u32) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.last_fps = fps;
            if let Some(last) = state.configured.last_mut() {
                last.2 = fps;
            }
            Ok(())
        }

        fn frame_rates(
            &mut self,
            _fourcc: FourCc,
            _resolution: Resolution,
        ) -> Result<Vec<u32>, TransportError> {
            Ok(vec![15, 30])
        }

        fn request_buffers(
            &mut self,
            _memory: MemoryKind,
            count: u32,
        ) -> Result<u32, TransportError> {
            if count == 0 {
                self.state.lock().unwrap().queued.clear();
            }
            Ok(count)
        }

        fn query_buffer(&mut self, index: u32) -> Result<BufferSlot, TransportError> {
            Ok(BufferSlot {
                index,
                offset: 0x1000 * (index as u64 + 1),
                length: 4096,
            })
        }

        fn export_buffer(&mut self, _index: u32) -> Result<std::os::fd::OwnedFd, TransportError> {
            Ok(std::fs::File::open("/dev/null").unwrap().into())
        }

        fn map_buffer(&mut self, slot: &BufferSlot) -> Result<BufferMapping, TransportError> {
            Ok(BufferMapping::from_heap(slot.length as usize))
        }

        fn queue_buffer(
            &mut self,
            _memory: MemoryKind,
            slot: &QueueSlot,
        ) -> Result<(), TransportError> {
            self.state.lock().unwrap().queued.push_back(slot.index);
            Ok(())
        }

        fn dequeue_buffer(
            &mut self,
            _memory: MemoryKind,
        ) -> Result<DequeuedBuffer, TransportError> {
            let index = self
                .state
                .lock()
                .unwrap()
                .queued
                .pop_front()
                .ok_or(TransportError::Ioctl {
                    op: "VIDIOC_DQBUF",
                    source: std::io::Error::from_raw_os_error(libc::EAGAIN),
                })?;
            Ok(DequeuedBuffer {
                index,
                bytes_used: 4096,
                timestamp_ns: 1,
            })
        }

        fn wait_readable(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
            Ok(true)
        }

        fn stream_on(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn stream_off(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingProcessor {
        converts: StdMutex<Vec<BlitHint>>,
        encodes: StdMutex<u32>,
    }

    impl FrameProcessor for CountingProcessor {
        fn convert(
            &self,
            _source: &lethe_device::prelude::CaptureBuffer,
            _dest: &OutputBuffer,
            hint: BlitHint,
        ) -> Result<(), crate::collaborators::ProcessError> {
            self.converts.lock().unwrap().push(hint);
            Ok(())
        }

        fn encode_jpeg(
            &self,
            _source: &lethe_device::prelude::CaptureBuffer,
            _dest: &OutputBuffer,
            _metadata: &RequestMetadata,
        ) -> Result<(), crate::collaborators::ProcessError> {
            *self.encodes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        shutters: StdMutex<Vec<(u32, u32, u64)>>,
        results: StdMutex<Vec<CaptureResult>>,
    }

    impl RecordingCallback {
        fn wait_for_results(&self, count: usize, timeout: Duration) -> Vec<CaptureResult> {
            let deadline = Instant::now() + timeout;
            loop {
                {
                    let results = self.results.lock().unwrap();
                    if results.len() >= count {
                        return results.clone();
                    }
                }
                if Instant::now() >= deadline {
                    return self.results.lock().unwrap().clone();
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl ResultCallback for RecordingCallback {
        fn notify_shutter(&self, pipeline_id: u32, frame_number: u32, timestamp_ns: u64) {
            self.shutters
                .lock()
                .unwrap()
                .push((pipeline_id, frame_number, timestamp_ns));
        }

        fn deliver_result(&self, result: CaptureResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    fn res(w: u32, h: u32) -> Resolution {
        Resolution::new(w, h).unwrap()
    }

    fn test_sensor() -> SensorDescriptor {
        let mut sensor = SensorDescriptor::new(
            "test-sensor",
            "/dev/video9",
            BufferingKind::Mmap { mplane: false },
        );
        sensor.preview_resolutions = vec![res(640, 480), res(1280, 720)];
        sensor.picture_resolutions = vec![res(2592, 1944)];
        sensor
    }

    fn test_device(
        id: u32,
        sensor: SensorDescriptor,
    ) -> (CaptureDevice, Arc<StdMutex<LoopState>>) {
        let (transport, state) = loop_transport();
        let device = CaptureDevice::new(
            id,
            Arc::new(sensor),
            Box::new(transport),
            BufferStrategy::MemoryMapped { mplane: false },
        )
        .with_acquire_timeout(Duration::from_millis(50));
        (device, state)
    }

    fn test_session() -> (CaptureSession, Arc<StdMutex<LoopState>>, Arc<CountingProcessor>) {
        let (device, state) = test_device(0, test_sensor());
        let processor = Arc::new(CountingProcessor::default());
        let session =
            CaptureSession::new(SessionConfig::default(), vec![device], processor.clone())
                .unwrap();
        (session, state, processor)
    }

    fn preview_stream(id: i32, w: u32, h: u32) -> StreamRequest {
        StreamRequest {
            id,
            geometry: StreamGeometry {
                format: PixelFormat::Opaque,
                resolution: res(w, h),
                usage: UsageFlags::COMPOSER,
                fps: 30,
            },
            physical_camera: None,
        }
    }

    fn output(stream_id: i32, handle: u64) -> OutputTarget {
        OutputTarget {
            buffer: OutputBuffer {
                stream_id,
                handle,
                size: 1 << 20,
            },
            acquire_fence: None,
            physical_camera: None,
        }
    }

    fn preview_request(pipeline_id: u32, outputs: Vec<OutputTarget>) -> CaptureRequest {
        CaptureRequest {
            pipeline_id,
            metadata: Some(RequestMetadata {
                capture_intent: Some(CaptureIntent::Preview),
                ..RequestMetadata::default()
            }),
            outputs,
        }
    }

    #[test]
    fn pipeline_lifecycle_errors() {
        let (session, _state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());

        // Build without configure.
        assert!(matches!(
            session.build_pipelines(),
            Err(ConfigError::NotConfigured)
        ));

        session
            .configure_pipeline(0, callback.clone(), &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();

        // Second build and late configure both fail.
        assert!(matches!(
            session.build_pipelines(),
            Err(ConfigError::AlreadyBuilt)
        ));
        assert!(matches!(
            session.configure_pipeline(0, callback.clone(), &[preview_stream(1, 640, 480)]),
            Err(ConfigError::AlreadyBuilt)
        ));

        session.destroy_pipelines();
        // Destroy on an idle session is a safe no-op.
        session.destroy_pipelines();

        // The cycle can start again.
        session
            .configure_pipeline(0, callback, &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();
    }

    #[test]
    fn unadvertised_resolution_is_rejected() {
        let (session, _state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());
        let err = session
            .configure_pipeline(0, callback, &[preview_stream(0, 1111, 999)])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsupportedStreamCombination(_)
        ));
    }

    #[test]
    fn submit_before_build_is_rejected() {
        let (session, _state, _processor) = test_session();
        assert!(matches!(
            session.submit_requests(0, vec![preview_request(0, vec![output(0, 1)])]),
            Err(SubmitError::NotBuilt)
        ));
    }

    #[test]
    fn preview_request_round_trip() {
        let (session, state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());

        let pipeline_id = session
            .configure_pipeline(0, callback.clone(), &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();

        session
            .submit_requests(5, vec![preview_request(pipeline_id, vec![output(0, 0xAB)])])
            .unwrap();

        let results = callback.wait_for_results(1, Duration::from_secs(2));
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.frame_number, 5);
        assert_eq!(result.pipeline_id, pipeline_id);
        assert_eq!(result.buffers.len(), 1);
        assert_eq!(result.buffers[0].buffer.handle, 0xAB);
        assert!(result.complete());
        assert!(result.metadata.is_some());

        // Shutter preceded the result and named the same frame.
        let shutters = callback.shutters.lock().unwrap();
        assert_eq!(shutters.len(), 1);
        assert_eq!(shutters[0].0, pipeline_id);
        assert_eq!(shutters[0].1, 5);

        // The device was driven at the preview geometry.
        let configured = state.lock().unwrap().configured.clone();
        assert!(configured
            .iter()
            .any(|(fourcc, resolution, _)| *fourcc == FourCc::new(*b"YUYV")
                && *resolution == res(1280, 720)));
        assert_eq!(session.metrics().submitted_count(), 1);
    }

    #[test]
    fn fps_range_at_or_below_15_clamps_device_rate() {
        let (session, state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());
        let pipeline_id = session
            .configure_pipeline(0, callback.clone(), &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();

        let request = CaptureRequest {
            pipeline_id,
            metadata: Some(RequestMetadata {
                capture_intent: Some(CaptureIntent::Preview),
                target_fps: Some(FpsRange { min: 10, max: 15 }),
                ..RequestMetadata::default()
            }),
            outputs: vec![output(0, 1)],
        };
        session.submit_requests(0, vec![request]).unwrap();
        callback.wait_for_results(1, Duration::from_secs(2));
        assert_eq!(state.lock().unwrap().last_fps, 15);
    }

    #[test]
    fn metadata_carries_forward_to_bare_requests() {
        let (session, _state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());
        let pipeline_id = session
            .configure_pipeline(0, callback.clone(), &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();

        session
            .submit_requests(0, vec![preview_request(pipeline_id, vec![output(0, 1)])])
            .unwrap();
        session
            .submit_requests(
                1,
                vec![CaptureRequest {
                    pipeline_id,
                    metadata: None,
                    outputs: vec![output(0, 2)],
                }],
            )
            .unwrap();

        let results = callback.wait_for_results(2, Duration::from_secs(2));
        assert_eq!(results.len(), 2);
        let bare = results.iter().find(|r| r.frame_number == 1).unwrap();
        let metadata = bare.metadata.as_ref().unwrap();
        assert_eq!(
            metadata.request.capture_intent,
            Some(CaptureIntent::Preview)
        );
    }

    #[test]
    fn destroy_after_submit_delivers_exactly_one_result() {
        let (session, _state, _processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());
        let pipeline_id = session
            .configure_pipeline(0, callback.clone(), &[preview_stream(0, 1280, 720)])
            .unwrap();
        session.build_pipelines().unwrap();

        session
            .submit_requests(7, vec![preview_request(pipeline_id, vec![output(0, 9)])])
            .unwrap();
        session.destroy_pipelines();

        // Whether the dispatcher won the race or the destroy path
        // force-completed it, the buffer came back exactly once.
        let results = callback.wait_for_results(1, Duration::from_secs(2));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].frame_number, 7);
        assert_eq!(results[0].buffers.len(), 1);
        assert_eq!(results[0].buffers[0].buffer.handle, 9);
        assert!(results[0].metadata.is_some());

        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let delivered =
                session.metrics().completed_count() + session.metrics().forced_count();
            if delivered == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "request never accounted for");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn still_capture_stream_is_jpeg_encoded() {
        let (session, _state, processor) = test_session();
        let callback = Arc::new(RecordingCallback::default());

        let streams = [
            preview_stream(0, 1280, 720),
            StreamRequest {
                id: 1,
                geometry: StreamGeometry {
                    format: PixelFormat::Jpeg,
                    resolution: res(2592, 1944),
                    usage: UsageFlags::NONE,
                    fps: 30,
                },
                physical_camera: None,
            },
        ];
        let pipeline_id = session
            .configure_pipeline(0, callback.clone(), &streams)
            .unwrap();
        session.build_pipelines().unwrap();

        let request = CaptureRequest {
            pipeline_id,
            metadata: Some(RequestMetadata {
                capture_intent: Some(CaptureIntent::StillCapture),
                ..RequestMetadata::default()
            }),
            outputs: vec![output(1, 0x77)],
        };
        session.submit_requests(0, vec![request]).unwrap();
        let results = callback.wait_for_results(1, Duration::from_secs(2));
        assert_eq!(results.len(), 1);
        assert!(results[0].complete());
        assert_eq!(*processor.encodes.lock().unwrap(), 1);
    }
}
