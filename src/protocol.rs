//! The protocol interface: how connections react to events.
//!
//! A protocol is the set of callbacks governing a family of connections.
//! The reactor holds a shared reference; one protocol instance typically
//! serves every connection attached with it, so implementations keep
//! per-connection state in the connection's `udata` or env.
//!
//! Callback discipline: for any single connection, at most one of
//! `on_data` / `on_ready` / `on_shutdown` / `on_timeout` runs at a time
//! (the connection's task lock serializes them), and `on_close` runs
//! exactly once, strictly after every other callback for that connection.

use crate::conn::Io;
use std::any::Any;
use std::sync::Arc;

/// Opaque per-connection user data, swappable at any time.
pub type UserData = Option<Arc<dyn Any + Send + Sync>>;

/// User-supplied callbacks for a family of connections.
///
/// Every method has a default, so implementations override only what
/// they react to.
pub trait Protocol: Send + Sync {
    /// Data is waiting on the socket. Call [`Io::read`] until it returns
    /// 0; readiness is re-armed after this returns.
    fn on_data(&self, io: &Io) {
        let _ = io;
    }

    /// Every queued write has been handed to the OS.
    fn on_ready(&self, io: &Io) {
        let _ = io;
    }

    /// The connection is gone: fd closed, env unwound. Receives the
    /// connection's final `udata`. Guaranteed exactly once per attach.
    fn on_close(&self, udata: UserData) {
        let _ = udata;
    }

    /// The reactor is shutting down. Return `true` to keep this
    /// connection open past the shutdown grace window (it is still
    /// closed when the reactor exits); `false` closes it once its
    /// outgoing stream drains.
    fn on_shutdown(&self, io: &Io) -> bool {
        let _ = io;
        false
    }

    /// The connection has been idle for [`Protocol::timeout`] seconds.
    /// The default closes it; keep-alive protocols send a ping or call
    /// [`ping_eternal`] instead.
    fn on_timeout(&self, io: &Io) {
        io.close();
    }

    /// Inactivity timeout in seconds, sampled when a connection is
    /// attached. Capped at [`crate::config::TIMEOUT_MAX_SECS`]; 0 means
    /// the cap itself.
    fn timeout(&self) -> u32 {
        0
    }
}

/// An `on_timeout` body that refreshes the activity clock instead of
/// closing, permanently disabling timeouts for the connection.
pub fn ping_eternal(io: &Io) {
    io.touch();
}
