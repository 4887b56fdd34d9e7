//! Monotonic clock shared by timeouts and tick bookkeeping.
//!
//! All reactor timestamps are milliseconds since a process-wide monotonic
//! origin. Wall-clock time never feeds timeout arithmetic.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
///
/// The origin is pinned lazily, so the first reading is 0. Monotonic by
/// construction; safe to subtract.
pub fn now_ms() -> u64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(15));
        let b = now_ms();
        assert!(b >= a + 10, "clock went backwards or stalled: {a} -> {b}");
    }
}
