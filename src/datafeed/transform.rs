//! Transform stages on the datafeed bus
//!
//! Transforms run in registration order between the producing device and
//! the subscribers. Each stage receives the current packet and yields the
//! packet to forward, or nothing to silently end delivery of this packet.

use crate::Result;

use super::Packet;

/// A packet-rewriting stage.
pub trait Transform {
    /// Short identifier used in log messages.
    fn id(&self) -> &str;

    /// Receive one packet. `Ok(Some(out))` forwards `out` to the next
    /// stage, `Ok(None)` drops the packet (delivery succeeds with no
    /// output), an error aborts delivery and is reported to the sender.
    fn receive(&mut self, packet: &Packet) -> Result<Option<Packet>>;
}
