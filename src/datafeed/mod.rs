//! Datafeed packet model and codec
//!
//! Packets are the unit of exchange on the session bus: drivers produce
//! them, transforms rewrite them, subscribers consume them. Each variant
//! has its own copy semantics, implemented through `Clone`:
//!
//! - `Trigger`, `End`, `FrameBegin`, `FrameEnd`: tag only, no payload
//! - `Header`: the fixed-size header struct is duplicated
//! - `Meta`: the entry list is duplicated; each entry's value is shared
//!   immutable data, so only its reference count is bumped
//! - `Logic`: the raw sample bytes are duplicated
//! - `Analog`/`Analog2`: the sample buffer is duplicated; the channel list
//!   is shared by reference
//!
//! Dropping a packet releases owned buffers and decrements shared values.

pub mod transform;

use std::rc::Rc;
use std::time::SystemTime;
use tracing::debug;

use crate::device::{Device, SignalChannel};

/// Subscriber callback on the datafeed bus.
pub type DatafeedCallback = dyn FnMut(&Rc<Device>, &Packet);

/// Fixed header sent once at the start of every acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedHeader {
    pub feed_version: i32,
    /// Wall-clock time the acquisition started. Informational only; all
    /// deadlines use the monotonic clock.
    pub start_time: SystemTime,
}

/// Exact rational, used for scale factors and meta values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub p: i64,
    pub q: u64,
}

/// Configuration key a meta entry reports a new value for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    SampleRate,
    LimitSamples,
    LimitMsec,
    CaptureRatio,
    AveragingSamples,
}

/// Value of a meta entry. Shared immutable data: copies of a meta packet
/// reference the same value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    Uint64(u64),
    Float(f64),
    Rational(Rational),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaEntry {
    pub key: ConfigKey,
    pub value: Rc<MetaValue>,
}

/// Device configuration changes announced mid-acquisition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaPayload {
    pub entries: Vec<MetaEntry>,
}

/// A block of logic samples: `data` holds consecutive units of
/// `unitsize` bytes, one unit per sample across all logic channels.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicPayload {
    pub unitsize: u16,
    pub data: Box<[u8]>,
}

impl LogicPayload {
    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Measured quantity of an analog payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Frequency,
    Temperature,
    Time,
}

/// Unit the samples are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Hertz,
    Celsius,
    Second,
}

bitflags::bitflags! {
    /// Modifier flags for a measured quantity.
    pub struct MqFlags: u32 {
        const AC = 0x01;
        const DC = 0x02;
        const RMS = 0x04;
        const RELATIVE = 0x08;
        const HOLD = 0x10;
    }
}

/// Analog samples with their measurement metadata. The channel list is
/// shared with the device; copies alias it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPayload {
    pub channels: Vec<Rc<SignalChannel>>,
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
    pub data: Box<[f32]>,
}

impl AnalogPayload {
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }
}

/// Second-generation analog payload carrying the sample encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Analog2Payload {
    pub channels: Vec<Rc<SignalChannel>>,
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
    /// Significant digits after the decimal point.
    pub digits: i8,
    pub scale: Rational,
    pub offset: Rational,
    pub data: Box<[f32]>,
}

impl Analog2Payload {
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }
}

/// One datafeed packet. The tag determines the payload shape; tags without
/// payloads carry no body.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Header(FeedHeader),
    End,
    Meta(MetaPayload),
    Trigger,
    Logic(LogicPayload),
    Analog(AnalogPayload),
    Analog2(Analog2Payload),
    FrameBegin,
    FrameEnd,
}

impl Packet {
    /// Tag name for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Header(_) => "HEADER",
            Packet::End => "END",
            Packet::Meta(_) => "META",
            Packet::Trigger => "TRIGGER",
            Packet::Logic(_) => "LOGIC",
            Packet::Analog(_) => "ANALOG",
            Packet::Analog2(_) => "ANALOG2",
            Packet::FrameBegin => "FRAME_BEGIN",
            Packet::FrameEnd => "FRAME_END",
        }
    }
}

/// Debug helper: log every packet crossing the bus.
pub(crate) fn dump(packet: &Packet) {
    match packet {
        Packet::Logic(logic) => debug!(
            "bus: received LOGIC packet ({} bytes, unitsize = {})",
            logic.len(),
            logic.unitsize
        ),
        Packet::Analog(analog) => debug!(
            "bus: received ANALOG packet ({} samples)",
            analog.num_samples()
        ),
        Packet::Analog2(analog) => debug!(
            "bus: received ANALOG2 packet ({} samples)",
            analog.num_samples()
        ),
        other => debug!("bus: received {} packet", other.kind()),
    }
}
