//! Cross-thread stop protocol
//!
//! The abort and running flags are the only session state shared across
//! threads, guarded by one dedicated mutex. A foreign thread never touches
//! anything else: it flips the abort flag through a [`StopHandle`] and the
//! session thread observes it at the next callback boundary.

use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct StopState {
    pub(crate) abort: bool,
    pub(crate) running: bool,
}

/// Cloneable, thread-safe request to stop a running session.
///
/// Obtained from [`Session::stop_handle`](crate::Session::stop_handle) and
/// safe to move to any thread. Stopping is cooperative: the flag is read by
/// the session thread after every source callback, so the worst-case stop
/// latency is one callback's duration plus one poll cycle.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<Mutex<StopState>>,
}

impl StopHandle {
    pub(crate) fn new(state: Arc<Mutex<StopState>>) -> Self {
        Self { state }
    }

    /// Ask the session to stop. Non-blocking; returns immediately.
    pub fn stop(&self) {
        self.state.lock().unwrap().abort = true;
    }
}
