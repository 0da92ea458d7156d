//! Poll driver: one blocking wait across the aggregated descriptors
//!
//! The iteration engine flattens every source's descriptors into a single
//! `PollFd` array, computes a composite timeout from the earliest deadline
//! and blocks here. This is the only suspension point in the session core.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;
use tracing::error;

use crate::{Result, SessionError};

/// One poll descriptor owned by an event source: the file descriptor, the
/// events the source asked for, and the readiness reported by the last poll.
#[derive(Debug, Clone, Copy)]
pub struct PollDesc {
    pub fd: RawFd,
    pub events: PollFlags,
    pub(crate) revents: PollFlags,
}

impl PollDesc {
    pub fn new(fd: RawFd, events: PollFlags) -> Self {
        Self {
            fd,
            events,
            revents: PollFlags::empty(),
        }
    }

    /// Readiness reported by the most recent poll.
    pub fn revents(&self) -> PollFlags {
        self.revents
    }
}

/// Composite poll timeout in milliseconds for the earliest deadline
/// `min_due`, as seen from `now` (both monotonic microseconds):
/// `-1` when no source has a finite deadline, `0` when the deadline has
/// already passed, otherwise the remaining time rounded up and clamped
/// to the representable maximum.
pub(crate) fn poll_timeout_ms(min_due: i64, now: i64) -> i32 {
    if min_due == i64::MAX {
        -1
    } else if min_due > now {
        ((min_due - now).saturating_add(999) / 1000).min(i32::MAX as i64) as i32
    } else {
        0
    }
}

/// Block on the flattened descriptor array for at most `timeout_ms`.
///
/// Returns the number of ready descriptors. A signal interruption is a
/// premature wakeup, not an error: it is reported as zero ready
/// descriptors and the iteration proceeds as for a timeout.
pub(crate) fn wait(fds: &mut [PollFd], timeout_ms: i32) -> Result<i32> {
    match poll(fds, timeout_ms) {
        Ok(ready) => Ok(ready),
        Err(Errno::EINTR) => Ok(0),
        Err(errno) => {
            error!("error in poll: {}", errno);
            Err(SessionError::Poll(errno))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn timeout_infinite_without_finite_deadline() {
        assert_eq!(poll_timeout_ms(i64::MAX, 1_000), -1);
    }

    #[test]
    fn timeout_zero_when_overdue() {
        assert_eq!(poll_timeout_ms(500, 1_000), 0);
        assert_eq!(poll_timeout_ms(1_000, 1_000), 0);
    }

    #[test]
    fn timeout_rounds_up_to_next_millisecond() {
        assert_eq!(poll_timeout_ms(1_001, 1_000), 1);
        assert_eq!(poll_timeout_ms(2_000, 1_000), 1);
        assert_eq!(poll_timeout_ms(2_001, 1_000), 2);
    }

    #[test]
    fn timeout_clamps_to_max_milliseconds() {
        assert_eq!(poll_timeout_ms(i64::MAX - 1, 0), i32::MAX);
    }

    #[test]
    fn wait_reports_writable_socket() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let mut fds = [PollFd::new(a.as_raw_fd(), PollFlags::POLLOUT)];
        let ready = wait(&mut fds, 100).expect("poll");
        assert_eq!(ready, 1);
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        assert!(revents.contains(PollFlags::POLLOUT));
    }

    #[test]
    fn wait_times_out_on_idle_socket() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let mut fds = [PollFd::new(a.as_raw_fd(), PollFlags::POLLIN)];
        let ready = wait(&mut fds, 0).expect("poll");
        assert_eq!(ready, 0);
    }
}
