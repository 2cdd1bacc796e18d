use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one capture device.
///
/// # Example
/// ```rust
/// use lethe_core::metrics::DeviceMetrics;
///
/// let metrics = DeviceMetrics::default();
/// metrics.frame();
/// assert_eq!(metrics.frames(), 1);
/// ```
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    frames: AtomicU64,
    omitted: AtomicU64,
    recoveries: AtomicU64,
    stalls: AtomicU64,
}

impl DeviceMetrics {
    /// A frame was dequeued from the device.
    pub fn frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A warm-up frame was requeued without being surfaced.
    pub fn omit(&self) {
        self.omitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A stall triggered a reconfigure-and-restart.
    pub fn recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// A stall could not be recovered.
    pub fn stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn omitted(&self) -> u64 {
        self.omitted.load(Ordering::Relaxed)
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

/// Counters for one capture session.
///
/// # Example
/// ```rust
/// use lethe_core::metrics::SessionMetrics;
///
/// let metrics = SessionMetrics::default();
/// metrics.submitted();
/// metrics.completed();
/// assert_eq!(metrics.in_flight(), 0);
/// ```
#[derive(Debug, Default)]
pub struct SessionMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    forced: AtomicU64,
    skipped_buffers: AtomicU64,
}

impl SessionMetrics {
    /// A request was accepted into the queue.
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A request completed through the normal path.
    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was force-completed at destroy time.
    pub fn forced(&self) {
        self.forced.fetch_add(1, Ordering::Relaxed);
    }

    /// An output buffer was skipped (fence timeout, missing stream).
    pub fn skipped_buffer(&self) {
        self.skipped_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn forced_count(&self) -> u64 {
        self.forced.load(Ordering::Relaxed)
    }

    pub fn skipped_buffer_count(&self) -> u64 {
        self.skipped_buffers.load(Ordering::Relaxed)
    }

    /// Requests submitted but not yet completed or force-completed.
    pub fn in_flight(&self) -> u64 {
        self.submitted_count()
            .saturating_sub(self.completed_count() + self.forced_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_accounts_for_forced_completions() {
        let metrics = SessionMetrics::default();
        metrics.submitted();
        metrics.submitted();
        metrics.completed();
        metrics.forced();
        assert_eq!(metrics.in_flight(), 0);
    }
}
