//! Readiness poller with one-shot semantics.
//!
//! Wraps `mio::Poll` (epoll on Linux, kqueue on the BSDs and macOS) and
//! layers one-shot delivery on top: an event consumes the interest that
//! produced it, and the owner re-arms after handling it. Re-registration
//! resets the kernel's edge state, so a socket that is still ready
//! re-reports as soon as it is re-armed.
//!
//! The poller is owned by the reactor thread; every arm/disarm runs there.
//! Other threads nudge a blocked `review` through the [`mio::Waker`] held
//! by the core.

use crate::config::POLL_MAX_EVENTS;
use crate::conn::{Conn, ConnState};
use crate::reactor::Core;
use crate::tasks;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

/// The backend mio selected for this platform.
pub(crate) fn engine() -> &'static str {
    if cfg!(target_os = "linux") {
        "epoll"
    } else {
        "kqueue"
    }
}

struct Registration {
    conn: Arc<Conn>,
    fd: libc::c_int,
    interest: u8,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    regs: Slab<Registration>,
}

impl Poller {
    /// Build the poller plus the waker other threads use to interrupt a
    /// blocked review.
    pub(crate) fn new() -> io::Result<(Poller, mio::Waker)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok((
            Poller {
                poll,
                events: Events::with_capacity(POLL_MAX_EVENTS),
                regs: Slab::new(),
            },
            waker,
        ))
    }

    fn mio_interest(bits: u8) -> Interest {
        match (bits & INTEREST_READ != 0, bits & INTEREST_WRITE != 0) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    fn arm(&mut self, conn: &Arc<Conn>, bits: u8) {
        let fd = conn.fd();
        if fd < 0 || conn.state() == ConnState::Closed {
            return;
        }
        let token = conn.poll_token.load(Ordering::Relaxed);
        if let Some(reg) = self.regs.get_mut(token) {
            reg.interest |= bits;
            let interest = Self::mio_interest(reg.interest);
            if let Err(err) =
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(token), interest)
            {
                debug!(fd, error = %err, "poller re-arm failed");
            }
            return;
        }
        let entry = self.regs.vacant_entry();
        let token = entry.key();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), Self::mio_interest(bits))
        {
            Ok(()) => {
                entry.insert(Registration {
                    conn: Arc::clone(conn),
                    fd,
                    interest: bits,
                });
                conn.poll_token.store(token, Ordering::Relaxed);
            }
            Err(err) => debug!(fd, error = %err, "poller registration failed"),
        }
    }

    pub(crate) fn add_read(&mut self, conn: &Arc<Conn>) {
        self.arm(conn, INTEREST_READ);
    }

    pub(crate) fn add_write(&mut self, conn: &Arc<Conn>) {
        self.arm(conn, INTEREST_WRITE);
    }

    pub(crate) fn add_rw(&mut self, conn: &Arc<Conn>) {
        self.arm(conn, INTEREST_READ | INTEREST_WRITE);
    }

    /// Drop every registration for the connection. Idempotent.
    pub(crate) fn remove(&mut self, conn: &Arc<Conn>) {
        let token = conn.poll_token.swap(usize::MAX, Ordering::Relaxed);
        if let Some(reg) = self.regs.try_remove(token) {
            let _ = self.poll.registry().deregister(&mut SourceFd(&reg.fd));
        }
    }

    /// Consume the fired interest; deregister when nothing remains armed.
    fn consume(&mut self, token: usize, bits: u8, hangup: bool) {
        let (remaining, fd) = match self.regs.get_mut(token) {
            Some(reg) => {
                reg.interest &= !bits;
                (reg.interest, reg.fd)
            }
            None => return,
        };
        if hangup || remaining == 0 {
            let reg = self.regs.remove(token);
            reg.conn.poll_token.store(usize::MAX, Ordering::Relaxed);
            let _ = self.poll.registry().deregister(&mut SourceFd(&reg.fd));
        } else {
            let _ = self.poll.registry().reregister(
                &mut SourceFd(&fd),
                Token(token),
                Self::mio_interest(remaining),
            );
        }
    }

    /// Block up to `timeout_ms` for readiness, then dispatch: readable
    /// schedules `on_data`, writable schedules a stream drain, hangup or
    /// error closes and suppresses the fd's other events this cycle.
    /// Returns the number of events dispatched (waker pokes included).
    pub(crate) fn review(&mut self, core: &Arc<Core>, timeout_ms: u64) -> usize {
        match self
            .poll
            .poll(&mut self.events, Some(Duration::from_millis(timeout_ms)))
        {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return 0,
            Err(err) => {
                debug!(error = %err, "poll failed");
                return 0;
            }
        }

        let mut fired: Vec<(usize, bool, bool, bool)> = Vec::new();
        let mut count = 0usize;
        for event in self.events.iter() {
            count += 1;
            if event.token() == WAKER_TOKEN {
                trace!("woken for queued work");
                continue;
            }
            let closed =
                event.is_error() || event.is_read_closed() || event.is_write_closed();
            fired.push((
                event.token().0,
                event.is_readable(),
                event.is_writable(),
                closed,
            ));
        }

        for (token, readable, writable, closed) in fired {
            let conn = match self.regs.get(token) {
                Some(reg) => Arc::clone(&reg.conn),
                None => continue,
            };

            if closed {
                self.consume(token, INTEREST_READ | INTEREST_WRITE, true);
                conn.mark_closed_in_loop(core, self);
                continue;
            }

            let mut consumed = 0u8;
            if readable {
                consumed |= INTEREST_READ;
            }
            if writable {
                consumed |= INTEREST_WRITE;
            }
            self.consume(token, consumed, false);

            if writable {
                tasks::schedule_drain(core, &conn);
            }
            if readable {
                match conn.state() {
                    ConnState::Open if !conn.is_throttled() => {
                        tasks::schedule_on_data(core, &conn);
                    }
                    // Suspended or throttled: the registration is spent;
                    // resume/unthrottle re-arms.
                    _ => {}
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::Reactor;

    struct Nop;
    impl Protocol for Nop {}

    fn socketpair() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair failed");
        (fds[0], fds[1])
    }

    /// Attach a conn and run the queued arm task against a local poller.
    fn attach(reactor: &Reactor, poller: &mut Poller, fd: libc::c_int) -> crate::ConnHandle {
        let handle = reactor
            .attach_fd(fd, Arc::new(Nop), None, None)
            .expect("attach");
        while let Some(task) = reactor.core.io_tasks.pop() {
            task(&reactor.core, poller);
        }
        handle
    }

    #[test]
    fn test_readable_event_schedules_on_data() {
        let reactor = Reactor::new();
        let (mut poller, _waker) = Poller::new().unwrap();
        let (ours, theirs) = socketpair();
        let _handle = attach(&reactor, &mut poller, ours);

        let before = reactor.core.user_tasks.len();
        let wrote =
            unsafe { libc::write(theirs, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(wrote, 1);

        let events = poller.review(&reactor.core, 1000);
        assert!(events >= 1, "readable event not reported");
        assert!(
            reactor.core.user_tasks.len() > before,
            "readable must queue an on_data task"
        );
        unsafe { libc::close(theirs) };
    }

    #[test]
    fn test_hangup_invalidates_the_connection() {
        let reactor = Reactor::new();
        let (mut poller, _waker) = Poller::new().unwrap();
        let (ours, theirs) = socketpair();
        let handle = attach(&reactor, &mut poller, ours);

        unsafe { libc::close(theirs) };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while reactor.core.registry.lock().unwrap().resolve(handle).is_some() {
            assert!(std::time::Instant::now() < deadline, "hangup not delivered");
            poller.review(&reactor.core, 100);
            while let Some(task) = reactor.core.io_tasks.pop() {
                task(&reactor.core, &mut poller);
            }
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let reactor = Reactor::new();
        let (mut poller, _waker) = Poller::new().unwrap();
        let (ours, theirs) = socketpair();
        let handle = attach(&reactor, &mut poller, ours);

        let conn = reactor
            .core
            .registry
            .lock()
            .unwrap()
            .resolve(handle)
            .expect("live");
        poller.remove(&conn);
        poller.remove(&conn);
        unsafe { libc::close(theirs) };
    }
}
