//! Monotonic microsecond clock for event-source deadlines
//!
//! All deadlines in the session core are absolute values on this clock.
//! Wall-clock time is never consulted; adjustments to the system clock
//! cannot move a deadline.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed on the monotonic clock since the first call in
/// this process. Non-decreasing.
pub fn monotonic_us() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_micros() as i64
}
