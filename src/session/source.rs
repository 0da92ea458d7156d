//! Event-source registry
//!
//! Each source couples an identity key, an optional re-arming timeout, a
//! deadline on the monotonic clock and the poll descriptors it contributes.
//! Sources own their descriptors; the flat array handed to the poll driver
//! is rebuilt from them before every wait, so descriptor alignment cannot
//! drift when the list is mutated mid-dispatch.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::poll::PollFlags;
use tracing::{debug, error, warn};

use crate::session::clock;
use crate::session::poll::PollDesc;
use crate::session::Session;
use crate::{Result, SessionError};

/// Identity of an event source within one session.
///
/// Keys must be unique per session; removal is identity-based. `Timer` and
/// `Pollable` tokens are allocated by the session, so they can never
/// collide with a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKey {
    /// A source registered for a raw file descriptor (negative for pure
    /// timers registered through [`Session::source_add`]).
    Fd(RawFd),
    /// A session-allocated token for a pure timer source.
    Timer(u64),
    /// A session-allocated token for a multi-descriptor source.
    Pollable(u64),
    /// A source registered for an I/O channel, keyed by its descriptor.
    Channel(RawFd),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceKey::Fd(fd) => write!(f, "fd {}", fd),
            SourceKey::Timer(token) => write!(f, "timer #{}", token),
            SourceKey::Pollable(token) => write!(f, "poll set #{}", token),
            SourceKey::Channel(fd) => write!(f, "channel fd {}", fd),
        }
    }
}

/// Callback invoked when a source fires.
///
/// Receives the session (so it may add or remove sources and feed the
/// datafeed bus), the ready descriptor (`-1` for pure timers and
/// multi-descriptor sources) and the aggregated event mask (empty for a
/// pure timeout). Returns `true` to stay registered.
pub type SourceCallback = dyn FnMut(&Session, RawFd, PollFlags) -> bool;

pub(crate) struct Source {
    pub(crate) key: SourceKey,
    /// Re-arm period in microseconds; `None` fires on I/O only.
    pub(crate) timeout_us: Option<i64>,
    /// Absolute deadline on the monotonic clock; `i64::MAX` when infinite.
    pub(crate) due: i64,
    pub(crate) descs: Vec<PollDesc>,
    pub(crate) cb: Rc<RefCell<SourceCallback>>,
    /// Set when the source has been dispatched in the current iteration,
    /// so the restart after a list mutation cannot fire it twice.
    pub(crate) triggered: bool,
}

impl Session {
    /// Add an event source for a single file descriptor. A negative `fd`
    /// registers a pure timer, which then requires a finite timeout.
    pub fn source_add<F>(
        &self,
        fd: RawFd,
        events: PollFlags,
        timeout: Option<Duration>,
        cb: F,
    ) -> Result<()>
    where
        F: FnMut(&Session, RawFd, PollFlags) -> bool + 'static,
    {
        let descs = if fd < 0 {
            Vec::new()
        } else {
            vec![PollDesc::new(fd, events)]
        };
        self.source_add_inner(descs, timeout, Rc::new(RefCell::new(cb)), SourceKey::Fd(fd))
    }

    /// Add a pure timer source. The key is allocated by the session and
    /// returned for later removal.
    pub fn source_add_timer<F>(&self, timeout: Duration, cb: F) -> Result<SourceKey>
    where
        F: FnMut(&Session, RawFd, PollFlags) -> bool + 'static,
    {
        let key = SourceKey::Timer(self.alloc_token());
        self.source_add_inner(Vec::new(), Some(timeout), Rc::new(RefCell::new(cb)), key)?;
        Ok(key)
    }

    /// Add an event source polling several descriptors at once. The
    /// callback receives `-1` instead of a descriptor when more than one
    /// is registered; it must learn which descriptors are ready on its own.
    pub fn source_add_pollfds<F>(
        &self,
        descs: &[PollDesc],
        timeout: Option<Duration>,
        cb: F,
    ) -> Result<SourceKey>
    where
        F: FnMut(&Session, RawFd, PollFlags) -> bool + 'static,
    {
        let key = SourceKey::Pollable(self.alloc_token());
        self.source_add_inner(descs.to_vec(), timeout, Rc::new(RefCell::new(cb)), key)?;
        Ok(key)
    }

    /// Add an event source for anything exposing a file descriptor, keyed
    /// separately from raw-fd sources so the identities cannot collide.
    pub fn source_add_channel<C, F>(
        &self,
        channel: &C,
        events: PollFlags,
        timeout: Option<Duration>,
        cb: F,
    ) -> Result<()>
    where
        C: AsRawFd,
        F: FnMut(&Session, RawFd, PollFlags) -> bool + 'static,
    {
        let fd = channel.as_raw_fd();
        self.source_add_inner(
            vec![PollDesc::new(fd, events)],
            timeout,
            Rc::new(RefCell::new(cb)),
            SourceKey::Channel(fd),
        )
    }

    fn source_add_inner(
        &self,
        descs: Vec<PollDesc>,
        timeout: Option<Duration>,
        cb: Rc<RefCell<SourceCallback>>,
        key: SourceKey,
    ) -> Result<()> {
        if descs.is_empty() && timeout.is_none() {
            error!("timer source without a timeout would block indefinitely");
            return Err(SessionError::Arg(
                "timer source without a timeout would block indefinitely",
            ));
        }

        let mut sources = self.sources.borrow_mut();
        if sources.iter().any(|source| source.key == key) {
            error!("event source {} already installed", key);
            return Err(SessionError::SourceExists(key));
        }

        debug!(
            "installing event source {} with {} FDs and {:?} timeout",
            key,
            descs.len(),
            timeout
        );
        for desc in &descs {
            debug!(
                "registering poll FD {} with event mask {:?}",
                desc.fd, desc.events
            );
        }

        let (timeout_us, due) = match timeout {
            Some(timeout) => {
                let timeout_us = timeout.as_micros() as i64;
                (Some(timeout_us), clock::monotonic_us().saturating_add(timeout_us))
            }
            None => (None, i64::MAX),
        };

        sources.push(Source {
            key,
            timeout_us,
            due,
            descs,
            cb,
            triggered: false,
        });

        Ok(())
    }

    /// Remove the source registered for the given raw file descriptor.
    pub fn source_remove(&self, fd: RawFd) -> Result<()> {
        self.source_remove_inner(SourceKey::Fd(fd))
    }

    /// Remove a source by the key returned when it was added.
    pub fn source_remove_key(&self, key: SourceKey) -> Result<()> {
        self.source_remove_inner(key)
    }

    /// Remove the source registered for the given channel.
    pub fn source_remove_channel<C: AsRawFd>(&self, channel: &C) -> Result<()> {
        self.source_remove_inner(SourceKey::Channel(channel.as_raw_fd()))
    }

    pub(crate) fn source_remove_inner(&self, key: SourceKey) -> Result<()> {
        let mut sources = self.sources.borrow_mut();
        match sources.iter().position(|source| source.key == key) {
            Some(index) => {
                sources.remove(index);
                drop(sources);
                // The provider's source carries its subsystem: removing it
                // deactivates the deadline hook as well.
                if let Some(provider) = self.ctx.deadline_provider() {
                    if provider.source_key() == key {
                        self.ctx.clear_deadline_provider();
                    }
                }
                debug!("removed event source {}", key);
                Ok(())
            }
            None => {
                // The key may have been reused since the source went away,
                // so this is reported but never treated as fatal.
                warn!("cannot remove non-existing event source {}", key);
                Err(SessionError::UnknownSource(key))
            }
        }
    }

    /// Number of live event sources.
    pub fn source_count(&self) -> usize {
        self.sources.borrow().len()
    }

    fn alloc_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }
}
