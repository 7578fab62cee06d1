//! Monotonic clock and absolute-time sleeps for the work loops.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on the process-wide monotonic clock.
pub fn now_ns() -> i64 {
    i64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Sleep until the monotonic clock reaches `deadline_ns`.
///
/// Returns immediately if the deadline has already passed.
pub fn sleep_until_ns(deadline_ns: i64) {
    let remaining = deadline_ns - now_ns();
    if remaining > 0 {
        std::thread::sleep(Duration::from_nanos(remaining.unsigned_abs()));
    }
}

pub fn relative_sleep_ns(nanos: i64) {
    if nanos > 0 {
        std::thread::sleep(Duration::from_nanos(nanos.unsigned_abs()));
    }
}
