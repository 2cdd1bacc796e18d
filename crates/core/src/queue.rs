//! Frame-ordered request queue.
//!
//! Submissions are grouped by frame number; the consumer drains the whole
//! map in one pass so requests are processed in frame order. The drain
//! side blocks with a bounded wait, which is the worker's idle path — no
//! busy-waiting while the queue is empty.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Result of attempting to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Requests were accepted.
    Ok,
    /// Queue is closed; the session is shutting down.
    Closed,
}

/// Result of attempting to drain.
#[derive(Debug)]
pub enum DrainOutcome<T> {
    /// All currently queued requests, keyed and ordered by frame number.
    Data(BTreeMap<u32, Vec<T>>),
    /// Nothing arrived within the wait.
    Empty,
    /// Queue has been closed and fully drained.
    Closed,
}

struct State<T> {
    frames: BTreeMap<u32, Vec<T>>,
    closed: bool,
    /// Set while a consumer holds a drained batch it has not finished
    /// processing; cleared by [`FrameQueueRx::finish_drain`].
    draining: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

/// Producer handle; used by `submit_requests`.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::{frame_queue, SendOutcome};
///
/// let (tx, _rx) = frame_queue::<u8>();
/// assert_eq!(tx.send(1, vec![7]), SendOutcome::Ok);
/// ```
pub struct FrameQueueTx<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FrameQueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FrameQueueTx<T> {
    /// Append requests for a frame and wake the consumer.
    ///
    /// Never blocks beyond lock contention.
    pub fn send(&self, frame_number: u32, requests: Vec<T>) -> SendOutcome {
        let mut state = self.inner.state.lock();
        if state.closed {
            return SendOutcome::Closed;
        }
        state
            .frames
            .entry(frame_number)
            .or_default()
            .extend(requests);
        self.inner.available.notify_one();
        SendOutcome::Ok
    }

    /// Close the queue; the consumer drains what is left and then sees
    /// `Closed`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.available.notify_all();
    }
}

/// Consumer handle; owned by the dispatcher worker.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use lethe_core::prelude::{frame_queue, DrainOutcome};
///
/// let (tx, rx) = frame_queue::<u8>();
/// tx.send(5, vec![1]);
/// match rx.drain(Duration::from_millis(100)) {
///     DrainOutcome::Data(frames) => assert!(frames.contains_key(&5)),
///     _ => panic!("expected data"),
/// }
/// ```
pub struct FrameQueueRx<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FrameQueueRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FrameQueueRx<T> {
    /// Take everything queued, waiting up to `timeout` when empty.
    pub fn drain(&self, timeout: Duration) -> DrainOutcome<T> {
        let mut state = self.inner.state.lock();
        if state.frames.is_empty() && !state.closed {
            self.inner.available.wait_for(&mut state, timeout);
        }
        self.take_locked(&mut state)
    }

    /// Take everything queued without waiting.
    pub fn try_drain(&self) -> DrainOutcome<T> {
        let mut state = self.inner.state.lock();
        self.take_locked(&mut state)
    }

    fn take_locked(&self, state: &mut State<T>) -> DrainOutcome<T> {
        if !state.frames.is_empty() {
            state.draining = true;
            return DrainOutcome::Data(std::mem::take(&mut state.frames));
        }
        if state.closed {
            DrainOutcome::Closed
        } else {
            DrainOutcome::Empty
        }
    }

    /// Mark the last drained batch as fully processed.
    pub fn finish_drain(&self) {
        self.inner.state.lock().draining = false;
    }

    /// Whether anything is currently queued.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().frames.is_empty()
    }

    /// Whether nothing is queued and no drained batch is being processed.
    ///
    /// The draining mark is taken under the same lock as the drain itself,
    /// so a batch can never be invisible to both checks at once.
    pub fn is_quiet(&self) -> bool {
        let state = self.inner.state.lock();
        state.frames.is_empty() && !state.draining
    }
}

/// Create a frame-ordered queue pair.
///
/// # Example
/// ```rust
/// use lethe_core::prelude::frame_queue;
///
/// let (_tx, rx) = frame_queue::<u32>();
/// assert!(rx.is_empty());
/// ```
pub fn frame_queue<T>() -> (FrameQueueTx<T>, FrameQueueRx<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            frames: BTreeMap::new(),
            closed: false,
            draining: false,
        }),
        available: Condvar::new(),
    });
    (
        FrameQueueTx {
            inner: inner.clone(),
        },
        FrameQueueRx { inner },
    )
}
