//! Monotonic epoch-nanosecond clock.
//!
//! Batch plans carry absolute deadlines in nanoseconds since the Unix epoch,
//! stamped by the external scheduler. Timers compare those deadlines against
//! the local clock, so the local clock must be (a) epoch-based and (b)
//! monotonic — `SystemTime` alone can step backwards under NTP adjustment.
//! The anchor pairs one `SystemTime` reading with an `Instant` and derives
//! all later readings from the monotonic side.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Anchor {
    base: Instant,
    epoch_ns: u64,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

/// Nanoseconds since the Unix epoch, monotonic within this process.
pub fn now_ns() -> u64 {
    let anchor = ANCHOR.get_or_init(|| Anchor {
        base: Instant::now(),
        epoch_ns: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    });
    anchor.epoch_ns + anchor.base.elapsed().as_nanos() as u64
}
