//! Session core of a signal-acquisition framework
//!
//! This library provides the event loop that sits between acquisition device
//! drivers and data consumers: a registry of timer-and-descriptor event
//! sources multiplexed through a single poll, a datafeed bus that threads
//! packets through an ordered transform chain before fanning them out to
//! subscribers, and a cooperative cross-thread stop protocol.
//!
//! # Architecture
//!
//! - **Session**: root aggregate owning devices, event sources, transforms
//!   and subscriber callbacks; strictly single-threaded apart from the
//!   shared stop flag
//! - **Event sources**: timers, file descriptors or descriptor sets, each
//!   with a monotonic-clock deadline and a callback
//! - **Datafeed**: typed packets (`Header`, `Logic`, `Analog`, ...) rewritten
//!   by transforms and broadcast to subscribers in registration order
//! - **StopHandle**: cloneable, thread-safe request to end a running session
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//! use sigflow::{Context, Device, Session};
//!
//! let session = Session::new(Rc::new(Context::new()));
//! session.dev_add(&Device::new(None, vec![]))?;
//! session.source_add_timer(Duration::from_millis(40), |_, _, _| true)?;
//! session.run()?;
//! # Ok::<(), sigflow::SessionError>(())
//! ```

use thiserror::Error;

pub mod context;
pub mod datafeed;
pub mod device;
pub mod session;
pub mod trigger;

pub use context::{Context, DeadlineProvider};
pub use datafeed::transform::Transform;
pub use datafeed::{
    Analog2Payload, AnalogPayload, ConfigKey, DatafeedCallback, FeedHeader, LogicPayload,
    MetaEntry, MetaPayload, MetaValue, MqFlags, Packet, Quantity, Rational, Unit,
};
pub use device::{ChannelKind, Device, Driver, SignalChannel};
pub use session::{PollDesc, Session, SourceCallback, SourceKey, StopHandle};
pub use trigger::{MatchKind, Trigger, TriggerMatch, TriggerStage};

// The event mask type is the host poll convention, re-exported so callers
// do not need a direct nix dependency.
pub use nix::poll::PollFlags;

/// Broad classification of a [`SessionError`], mirroring the framework's
/// return-code taxonomy: bad caller input, internal invariant breach, or
/// operational failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Argument,
    Internal,
    Operational,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller-supplied invalid input.
    #[error("invalid argument: {0}")]
    Arg(&'static str),

    /// An event source with the same identity is already installed.
    #[error("event source {0} is already installed")]
    SourceExists(SourceKey),

    /// Removal of an event source that is not registered. Never fatal:
    /// source identities may be reused after removal.
    #[error("no event source registered for {0}")]
    UnknownSource(SourceKey),

    #[error("session has no devices")]
    NoDevices,

    #[error("device {0} has no enabled channels")]
    NoEnabledChannels(String),

    #[error("invalid trigger: {0}")]
    Trigger(&'static str),

    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error("external deadline provider: {0}")]
    Deadline(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("device error: {0}")]
    Device(String),

    /// Internal invariant breach. Logged loudly, returned, never a panic.
    #[error("internal error: {0}")]
    Bug(&'static str),
}

impl SessionError {
    /// Which part of the taxonomy this error falls into.
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Arg(_)
            | SessionError::SourceExists(_)
            | SessionError::NoDevices
            | SessionError::NoEnabledChannels(_)
            | SessionError::Trigger(_) => ErrorClass::Argument,
            SessionError::UnknownSource(_) | SessionError::Bug(_) => ErrorClass::Internal,
            SessionError::Poll(_)
            | SessionError::Deadline(_)
            | SessionError::Transform(_)
            | SessionError::Device(_) => ErrorClass::Operational,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
