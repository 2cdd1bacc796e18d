//! Scoped acquire-fence handles.
//!
//! A fence guards a caller-supplied output buffer: the buffer must not be
//! written until the fence signals. The pipeline duplicates the caller's
//! descriptor so the two lifetimes are independent, and the duplicate is
//! closed on every exit path by the `OwnedFd` drop.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence signaled within the timeout.
    Signaled,
    /// The wait timed out; the buffer is not safe to write.
    TimedOut,
}

/// Owned duplicate of an acquire-fence file descriptor.
///
/// # Example
/// ```rust,ignore
/// use std::time::Duration;
/// use lethe_core::prelude::{Fence, FenceStatus};
///
/// let fence = Fence::duplicate(raw_fd)?;
/// match fence.wait(Duration::from_millis(500))? {
///     FenceStatus::Signaled => { /* write the buffer */ }
///     FenceStatus::TimedOut => { /* skip this buffer */ }
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct Fence {
    fd: OwnedFd,
}

impl Fence {
    /// Duplicate a caller-owned descriptor into a scoped fence.
    ///
    /// The caller keeps ownership of `fd`; closing it does not invalidate
    /// the duplicate.
    pub fn duplicate(fd: RawFd) -> io::Result<Fence> {
        // F_DUPFD_CLOEXEC rather than dup() so the handle does not leak
        // into forked children.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fence {
            fd: unsafe { OwnedFd::from_raw_fd(dup) },
        })
    }

    /// Wrap an already-owned descriptor without duplicating.
    pub fn from_owned(fd: OwnedFd) -> Fence {
        Fence { fd }
    }

    /// Raw descriptor, for handing to a processor that waits itself.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Block until the fence signals or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> io::Result<FenceStatus> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc > 0 {
                return Ok(FenceStatus::Signaled);
            }
            if rc == 0 {
                return Ok(FenceStatus::TimedOut);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn signaled_fence_reports_signaled() {
        let (rx, tx) = pipe();
        let byte = [1u8];
        let written = unsafe { libc::write(tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
        assert_eq!(written, 1);

        let fence = Fence::duplicate(rx.as_raw_fd()).unwrap();
        assert_eq!(
            fence.wait(Duration::from_millis(100)).unwrap(),
            FenceStatus::Signaled
        );
    }

    #[test]
    fn pending_fence_times_out() {
        let (rx, _tx) = pipe();
        let fence = Fence::duplicate(rx.as_raw_fd()).unwrap();
        assert_eq!(
            fence.wait(Duration::from_millis(10)).unwrap(),
            FenceStatus::TimedOut
        );
    }

    #[test]
    fn duplicate_survives_caller_close() {
        let (rx, tx) = pipe();
        let fence = Fence::duplicate(rx.as_raw_fd()).unwrap();
        drop(rx);

        let byte = [1u8];
        let written = unsafe { libc::write(tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
        assert_eq!(written, 1);
        assert_eq!(
            fence.wait(Duration::from_millis(100)).unwrap(),
            FenceStatus::Signaled
        );
    }
}
