//! Monotonic millisecond time source.
//!
//! Every timestamp the scheduler ever compares (timer expiry, bus-refresh
//! timeouts) goes through this module, so the whole crate only has one
//! notion of "now" and it is guaranteed monotonic, unlike `SystemTime`.

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since the process-wide epoch.
///
/// The absolute value is meaningless; only differences between two calls
/// are. This matches the source's `get_timestamp_ms_current`.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// `now_ms() + delta_ms`, i.e. an absolute deadline `delta_ms` in the future.
pub fn deadline_ms(delta_ms: u64) -> u64 {
    now_ms().saturating_add(delta_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn monotonic() {
        let a = now_ms();
        sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn deadline_is_in_the_future() {
        let now = now_ms();
        let deadline = deadline_ms(50);
        assert!(deadline >= now + 50);
    }
}
