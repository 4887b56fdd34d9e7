//! Tuning constants and start-up arguments for the reactor.
//!
//! The constants mirror the knobs a production deployment actually turns:
//! outgoing-buffer throttling, the per-write chunk size, the connection
//! timeout ceiling and the shutdown grace window.

/// Hard ceiling for per-connection inactivity timeouts, in seconds.
/// A protocol timeout of 0 means "use the ceiling".
pub const TIMEOUT_MAX_SECS: u32 = 600;

/// Grace window after `stop()` during which connections may flush
/// buffered data before being force-closed.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Outgoing-queue size above which `on_data` delivery is paused for a
/// connection until the queue drains back below the limit.
pub const THROTTLE_LIMIT: u64 = 1 << 20;

/// Default bind target when a listen URL is empty.
pub const DEFAULT_LISTEN_URL: &str = "tcp://0.0.0.0:3000";

/// Stack buffer used per drain pass when flushing the outgoing stream.
pub(crate) const WRITE_CHUNK: usize = 1 << 16;

/// Reactor tick length while running. Shutdown spins with a zero tick.
pub(crate) const POLL_TICK_MS: u64 = 1000;

/// Events collected per poller review.
pub(crate) const POLL_MAX_EVENTS: usize = 96;

/// Cap applied to CPU core auto-detection.
pub(crate) const CPU_CORES_LIMIT: i16 = 32;

/// Core count assumed when auto-detection fails.
pub(crate) const CPU_CORES_FALLBACK: i16 = 8;

/// Listener accept backlog.
pub(crate) const LISTEN_BACKLOG: i32 = 1024;

/// Arguments for [`crate::Reactor::start`].
///
/// A positive value is taken literally. Negative values denote a fraction
/// of the detected CPU cores (`-2` is half the cores, floored at 1). Zeros
/// auto-tune: with both at zero the reactor runs one worker process with
/// `cores - 1` threads (one core is left for the kernel when more than
/// three are available).
#[derive(Debug, Clone, Copy, Default)]
pub struct StartArgs {
    /// User-queue threads per worker process.
    pub threads: i16,
    /// Worker processes forked by the master. 0 keeps everything in a
    /// single process (the master is then also the worker).
    pub workers: i16,
}
