//! Connection state machine and the `Io` surface handed to callbacks.
//!
//! A `Conn` owns one socket: its fd, outgoing stream, env, protocol
//! binding, activity clock and task lock. Memory is `Arc`-shared, but the
//! *lifecycle* is governed by an explicit task refcount: every scheduled
//! task holds a reference, and teardown runs only when the count reaches
//! zero with the state already `Closed`. That is what guarantees the fd
//! closes exactly once and `on_close` fires strictly after every other
//! callback for the connection.

use crate::clock;
use crate::config::{THROTTLE_LIMIT, TIMEOUT_MAX_SECS, WRITE_CHUNK};
use crate::env::{EnvCloseFn, EnvStore, Name};
use crate::poller::Poller;
use crate::protocol::{Protocol, UserData};
use crate::reactor::{Core, Reactor};
use crate::registry::ConnHandle;
use crate::stream::{OutStream, Packet};
use crate::tasks;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Lifecycle of a connection. `Open` and `Suspended` trade places; once
/// `Closing` or `Closed` is reached there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Open = 0,
    Suspended = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Open,
            1 => ConnState::Suspended,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Byte-level transport hook. The reactor calls these instead of raw
/// syscalls, so a TLS layer can interpose on both directions.
pub trait Transport: Send + Sync {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
}

/// Plain `read(2)` / `write(2)`.
pub(crate) struct RawTransport;

impl Transport for RawTransport {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let r = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }
}

/// Non-blocking mutex serializing user callbacks on one connection.
/// Contention never blocks: the loser reschedules itself.
pub(crate) struct TaskLock(AtomicBool);

impl TaskLock {
    fn new() -> Self {
        TaskLock(AtomicBool::new(false))
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub(crate) struct Conn {
    handle: OnceLock<ConnHandle>,
    fd: AtomicI32,
    state: AtomicU8,
    protocol: Mutex<Arc<dyn Protocol>>,
    pub(crate) transport: Arc<dyn Transport>,
    udata: Mutex<UserData>,
    pub(crate) out: Mutex<OutStream>,
    env: Mutex<EnvStore>,
    active_ms: AtomicU64,
    timeout_ms: u64,
    pub(crate) task_lock: TaskLock,
    refs: AtomicUsize,
    pub(crate) throttled: AtomicBool,
    need_ready: AtomicBool,
    pub(crate) shutdown_scheduled: AtomicBool,
    pub(crate) keep_past_shutdown: AtomicBool,
    /// Poller slot index, owned by the reactor thread. `usize::MAX` when
    /// unregistered.
    pub(crate) poll_token: AtomicUsize,
    peer: String,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        protocol: Arc<dyn Protocol>,
        udata: UserData,
        transport: Arc<dyn Transport>,
        peer: String,
    ) -> Arc<Conn> {
        let timeout_s = match protocol.timeout() {
            0 => TIMEOUT_MAX_SECS,
            t => t.min(TIMEOUT_MAX_SECS),
        };
        Arc::new(Conn {
            handle: OnceLock::new(),
            fd: AtomicI32::new(fd),
            state: AtomicU8::new(ConnState::Open as u8),
            protocol: Mutex::new(protocol),
            transport,
            udata: Mutex::new(udata),
            out: Mutex::new(OutStream::new()),
            env: Mutex::new(EnvStore::new()),
            active_ms: AtomicU64::new(clock::now_ms()),
            timeout_ms: timeout_s as u64 * 1000,
            task_lock: TaskLock::new(),
            refs: AtomicUsize::new(1),
            throttled: AtomicBool::new(false),
            need_ready: AtomicBool::new(false),
            shutdown_scheduled: AtomicBool::new(false),
            keep_past_shutdown: AtomicBool::new(false),
            poll_token: AtomicUsize::new(usize::MAX),
            peer,
        })
    }

    pub(crate) fn set_handle(&self, handle: ConnHandle) {
        let _ = self.handle.set(handle);
    }

    pub(crate) fn handle(&self) -> ConnHandle {
        *self.handle.get().expect("handle set at attach")
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn touch(&self) {
        self.active_ms.store(clock::now_ms(), Ordering::SeqCst);
    }

    pub(crate) fn timed_out(&self, now_ms: u64) -> bool {
        matches!(self.state(), ConnState::Open | ConnState::Suspended)
            && now_ms.saturating_sub(self.active_ms.load(Ordering::SeqCst)) >= self.timeout_ms
    }

    /// One reference per scheduled task.
    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference; the last one out tears the connection down.
    pub(crate) fn release(self: &Arc<Self>, core: &Arc<Core>) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug_assert_eq!(self.state(), ConnState::Closed);
            self.destroy(core);
        }
    }

    /// First-wins transition into `Closed`. Pending writes are discarded.
    fn transition_closed(&self) -> bool {
        let prev = self.state.swap(ConnState::Closed as u8, Ordering::SeqCst);
        if prev == ConnState::Closed as u8 {
            return false;
        }
        self.out.lock().unwrap().clear();
        true
    }

    /// Close from any thread: queue the poller detach, then let the task
    /// refcount finish the job.
    pub(crate) fn mark_closed(self: &Arc<Self>, core: &Arc<Core>) {
        if !self.transition_closed() {
            return;
        }
        let conn = Arc::clone(self);
        core.io_tasks.push(Box::new(move |core, poller| {
            poller.remove(&conn);
            conn.release(core);
        }));
        core.wake_poller();
    }

    /// Close while already on the reactor thread with the poller in hand.
    pub(crate) fn mark_closed_in_loop(self: &Arc<Self>, core: &Arc<Core>, poller: &mut Poller) {
        if !self.transition_closed() {
            return;
        }
        poller.remove(self);
        self.release(core);
    }

    /// Flush-then-close: the outgoing stream drains first.
    pub(crate) fn close(self: &Arc<Self>, core: &Arc<Core>) {
        if self.state() == ConnState::Closed {
            return;
        }
        if self.out.lock().unwrap().is_empty() {
            self.mark_closed(core);
            return;
        }
        let _ = self.transition(ConnState::Open, ConnState::Closing)
            || self.transition(ConnState::Suspended, ConnState::Closing);
        tasks::schedule_drain(core, self);
    }

    pub(crate) fn suspend(&self) {
        self.transition(ConnState::Open, ConnState::Suspended);
    }

    pub(crate) fn resume(self: &Arc<Self>, core: &Arc<Core>) {
        if self.transition(ConnState::Suspended, ConnState::Open) {
            tasks::schedule_rearm_read(core, self);
        }
    }

    pub(crate) fn protocol(&self) -> Arc<dyn Protocol> {
        self.protocol.lock().unwrap().clone()
    }

    pub(crate) fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self.protocol.lock().unwrap() = protocol;
    }

    pub(crate) fn swap_udata(&self, udata: UserData) -> UserData {
        std::mem::replace(&mut *self.udata.lock().unwrap(), udata)
    }

    pub(crate) fn udata(&self) -> UserData {
        self.udata.lock().unwrap().clone()
    }

    /// Queue a packet and schedule a drain pass.
    pub(crate) fn write2(self: &Arc<Self>, core: &Arc<Core>, packet: Packet) {
        match self.state() {
            ConnState::Closing | ConnState::Closed => return,
            _ => {}
        }
        let queued = {
            let mut out = self.out.lock().unwrap();
            out.push(packet);
            out.len()
        };
        if queued > THROTTLE_LIMIT {
            self.throttled.store(true, Ordering::SeqCst);
        }
        self.need_ready.store(true, Ordering::SeqCst);
        tasks::schedule_drain(core, self);
    }

    /// Flush the head of the outgoing stream. Runs only on the reactor
    /// thread. Re-arms writability on would-block; schedules `on_ready`
    /// when the stream empties while the connection is open.
    pub(crate) fn drain_out(self: &Arc<Self>, core: &Arc<Core>, poller: &mut Poller) {
        if self.state() == ConnState::Closed {
            return;
        }
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        let mut buf = [0u8; WRITE_CHUNK];
        loop {
            let n = match self.out.lock().unwrap().peek(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    debug!(fd, error = %err, "outgoing stream failed");
                    self.mark_closed_in_loop(core, poller);
                    return;
                }
            };
            if n == 0 {
                if self.out.lock().unwrap().is_empty() {
                    break;
                }
                // Interrupted file read; try again on the next writable.
                self.maybe_unthrottle(poller);
                poller.add_write(self);
                return;
            }
            match self.transport.write(fd, &buf[..n]) {
                Ok(0) => {
                    self.maybe_unthrottle(poller);
                    poller.add_write(self);
                    return;
                }
                Ok(written) => {
                    self.out.lock().unwrap().advance(written as u64);
                    self.touch();
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    self.maybe_unthrottle(poller);
                    poller.add_write(self);
                    return;
                }
                Err(err) => {
                    debug!(fd, error = %err, "socket write failed");
                    self.mark_closed_in_loop(core, poller);
                    return;
                }
            }
        }
        // Stream is empty.
        self.maybe_unthrottle(poller);
        match self.state() {
            ConnState::Closing => self.mark_closed_in_loop(core, poller),
            ConnState::Open => {
                if self.need_ready.swap(false, Ordering::SeqCst) {
                    tasks::schedule_on_ready(core, self);
                }
            }
            _ => {}
        }
    }

    /// Resume `on_data` delivery once the queue is back under the limit.
    fn maybe_unthrottle(self: &Arc<Self>, poller: &mut Poller) {
        if self.out.lock().unwrap().len() <= THROTTLE_LIMIT
            && self.throttled.swap(false, Ordering::SeqCst)
            && self.state() == ConnState::Open
        {
            poller.add_read(self);
        }
    }

    pub(crate) fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    /// Final teardown: close the fd, unwind the env, deliver `on_close`.
    fn destroy(self: &Arc<Self>, core: &Arc<Core>) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        let entries = self.env.lock().unwrap().drain();
        let protocol = self.protocol();
        let udata = self.swap_udata(None);
        // The handle goes stale before on_close can be observed.
        if let Some(handle) = self.handle.get() {
            core.registry.lock().unwrap().remove(*handle);
        }
        // One task keeps the ordering airtight: env callbacks unwind in
        // reverse insertion order, then `on_close`, regardless of how many
        // drainer threads are live.
        core.user_tasks.push(Box::new(move |_core| {
            for entry in entries.into_iter().rev() {
                entry.fire();
            }
            protocol.on_close(udata);
        }));
        core.parker.wake_one();
        debug!(fd, "connection destroyed");
    }

    pub(crate) fn env_set(
        self: &Arc<Self>,
        core: &Arc<Core>,
        type_id: i64,
        name: Name,
        udata: UserData,
        on_close: Option<EnvCloseFn>,
    ) {
        let replaced = self.env.lock().unwrap().set(type_id, name, udata, on_close);
        if let Some(entry) = replaced {
            core.user_tasks.push_urgent(Box::new(move |_| entry.fire()));
            core.parker.wake_one();
        }
    }

    pub(crate) fn env_unset(&self, type_id: i64, name: &Name) -> bool {
        self.env.lock().unwrap().take(type_id, name).is_some()
    }

    pub(crate) fn env_remove(&self, core: &Arc<Core>, type_id: i64, name: &Name) -> bool {
        match self.env.lock().unwrap().take(type_id, name) {
            Some(entry) => {
                core.user_tasks.push_urgent(Box::new(move |_| entry.fire()));
                core.parker.wake_one();
                true
            }
            None => false,
        }
    }

    pub(crate) fn env_get(&self, type_id: i64, name: &Name) -> Option<UserData> {
        self.env.lock().unwrap().get(type_id, name)
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Conn> {
        struct Nop;
        impl Protocol for Nop {}
        Conn::new(-1, Arc::new(Nop), None, Arc::new(RawTransport), String::new())
    }
}

/// The connection surface handed to protocol callbacks and deferred
/// tasks. Cheap to clone; holding one does not keep the connection open.
pub struct Io {
    pub(crate) core: Arc<Core>,
    pub(crate) conn: Arc<Conn>,
}

impl Io {
    pub(crate) fn new(core: Arc<Core>, conn: Arc<Conn>) -> Io {
        Io { core, conn }
    }

    /// Non-blocking read. Returns the bytes read; 0 means "no data right
    /// now", never EOF. On EOF or a fatal error the connection closes
    /// and `on_close` is scheduled.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let fd = self.conn.fd();
        if fd < 0 || self.conn.state() == ConnState::Closed || buf.is_empty() {
            return 0;
        }
        loop {
            match self.conn.transport.read(fd, buf) {
                Ok(0) => {
                    self.conn.mark_closed(&self.core);
                    return 0;
                }
                Ok(n) => {
                    self.conn.touch();
                    return n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return 0,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(fd, error = %err, "socket read failed");
                    self.conn.mark_closed(&self.core);
                    return 0;
                }
            }
        }
    }

    /// Copy `data` into the outgoing stream. O(1) enqueue; delivery is
    /// asynchronous and ordered.
    pub fn write(&self, data: &[u8]) {
        self.write2(Packet::from(data));
    }

    /// Queue a packet (owned bytes or a file slice) for delivery.
    pub fn write2(&self, packet: Packet) {
        self.conn.write2(&self.core, packet);
    }

    /// Close once the outgoing stream drains.
    pub fn close(&self) {
        self.conn.close(&self.core);
    }

    /// Close immediately, discarding queued writes.
    pub fn close_now(&self) {
        self.conn.mark_closed(&self.core);
    }

    /// Pause `on_data` delivery until [`Io::resume`].
    pub fn suspend(&self) {
        self.conn.suspend();
    }

    /// Undo [`Io::suspend`].
    pub fn resume(&self) {
        self.conn.resume(&self.core);
    }

    /// Reset the inactivity clock.
    pub fn touch(&self) {
        self.conn.touch();
    }

    /// Best-effort probe of the task lock. The answer may be stale by the
    /// time it returns.
    pub fn is_busy(&self) -> bool {
        self.conn.task_lock.is_locked()
    }

    /// Take an extra reference so the connection outlives the current
    /// callback. Balance with [`Io::undup`].
    pub fn dup(&self) -> ConnHandle {
        self.conn.acquire();
        self.conn.handle()
    }

    /// Release a reference taken with [`Io::dup`].
    pub fn undup(&self) {
        self.conn.release(&self.core);
    }

    pub fn udata(&self) -> UserData {
        self.conn.udata()
    }

    /// Swap the opaque user pointer, returning the old value.
    pub fn udata_set(&self, udata: UserData) -> UserData {
        self.conn.swap_udata(udata)
    }

    pub fn protocol(&self) -> Arc<dyn Protocol> {
        self.conn.protocol()
    }

    /// Replace the protocol. A callback already running keeps the old
    /// protocol for the rest of that call.
    pub fn protocol_set(&self, protocol: Arc<dyn Protocol>) {
        self.conn.set_protocol(protocol);
    }

    /// Link a resource to this connection's lifetime. Replacing an entry
    /// fires the displaced entry's callback asynchronously.
    pub fn env_set(
        &self,
        type_id: i64,
        name: impl Into<Name>,
        udata: UserData,
        on_close: Option<EnvCloseFn>,
    ) {
        self.conn
            .env_set(&self.core, type_id, name.into(), udata, on_close);
    }

    /// Unlink without firing the callback. Returns whether it existed.
    pub fn env_unset(&self, type_id: i64, name: impl Into<Name>) -> bool {
        self.conn.env_unset(type_id, &name.into())
    }

    /// Unlink and fire the callback. Returns whether it existed.
    pub fn env_remove(&self, type_id: i64, name: impl Into<Name>) -> bool {
        self.conn.env_remove(&self.core, type_id, &name.into())
    }

    pub fn env_get(&self, type_id: i64, name: impl Into<Name>) -> Option<UserData> {
        self.conn.env_get(type_id, &name.into())
    }

    pub fn handle(&self) -> ConnHandle {
        self.conn.handle()
    }

    /// Presentation-form remote address, when known.
    pub fn peer_addr(&self) -> &str {
        &self.conn.peer
    }

    /// The reactor this connection belongs to.
    pub fn reactor(&self) -> Reactor {
        Reactor::from_core(Arc::clone(&self.core))
    }
}

/// fd option helpers shared by attach and the listeners.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Disable Nagle. Fails silently on non-TCP sockets.
pub(crate) fn set_nodelay(fd: RawFd) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

pub(crate) fn peer_addr_string(fd: RawFd) -> String {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&borrowed);
    match sock.peer_addr() {
        Ok(addr) => addr
            .as_socket()
            .map(|s| s.to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}
