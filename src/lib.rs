//! evio: a single-process / multi-process evented networking reactor.
//!
//! The reactor owns a readiness poller (epoll or kqueue through mio), a
//! user-space outgoing stream with backpressure, and two task queues: an
//! io-core queue drained on the reactor thread and a user queue drained
//! by worker threads. Connections bind a file descriptor to a
//! [`Protocol`], a table of `on_data` / `on_ready` / `on_close` /
//! `on_shutdown` / `on_timeout` callbacks, and the reactor guarantees
//! each connection's callbacks never run concurrently and that
//! `on_close` fires exactly once, last.
//!
//! In cluster mode the master forks worker processes and respawns any
//! that crash; [`Phase`] state callbacks hook every step of that
//! lifecycle.
//!
//! ```no_run
//! use evio::{ListenArgs, Protocol, Reactor, StartArgs};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&self, io: &evio::Io) {
//!         let mut buf = [0u8; 4096];
//!         loop {
//!             let n = io.read(&mut buf);
//!             if n == 0 {
//!                 break;
//!             }
//!             io.write(&buf[..n]);
//!         }
//!     }
//! }
//!
//! let reactor = Reactor::new();
//! let echo: Arc<dyn Protocol> = Arc::new(Echo);
//! reactor
//!     .listen(ListenArgs::new("tcp://0.0.0.0:3000", move |fd, r| {
//!         let _ = r.attach_fd(fd, echo.clone(), None, None);
//!     }))
//!     .unwrap();
//! reactor.start(StartArgs { threads: 2, workers: 0 });
//! ```

#![cfg(unix)]

pub mod config;

mod clock;
mod conn;
mod env;
mod listener;
mod poller;
mod protocol;
mod queue;
mod reactor;
mod registry;
mod signals;
mod state;
mod stream;
mod supervisor;
mod tasks;

pub use config::{StartArgs, DEFAULT_LISTEN_URL, SHUTDOWN_TIMEOUT_SECS, THROTTLE_LIMIT, TIMEOUT_MAX_SECS};
pub use conn::{ConnState, Io, Transport};
pub use env::{EnvCloseFn, Name};
pub use listener::{BoundAddr, ListenArgs, UrlError};
pub use protocol::{ping_eternal, Protocol, UserData};
pub use reactor::Reactor;
pub use registry::ConnHandle;
pub use state::{Phase, StateFn};
pub use stream::Packet;
