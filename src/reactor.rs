//! The reactor: core state, the event loop, and the public surface.
//!
//! One reactor thread per process runs the cycle: review the poller,
//! update the tick, drain signals, detect idleness, check the master is
//! alive, wake a user drainer, and run every queued io-core task. User
//! callbacks run on the user queue: on dedicated drainer threads when
//! `threads > 0`, interleaved into the reactor loop otherwise.

use crate::clock;
use crate::config::{StartArgs, POLL_TICK_MS, SHUTDOWN_TIMEOUT_SECS};
use crate::conn::{self, Conn, Io, RawTransport, Transport};
use crate::env::{EnvCloseFn, EnvStore, Name};
use crate::listener::{self, BoundAddr, ListenArgs, ListenerCfg};
use crate::poller::{self, Poller};
use crate::protocol::{Protocol, UserData};
use crate::queue::{TaskQueue, ThreadParker};
use crate::registry::{ConnHandle, ConnRegistry};
use crate::signals::{self, SignalFn};
use crate::state::{Phase, StateCallbacks, StateFn};
use crate::supervisor;
use crate::tasks;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

/// Work for the reactor thread; runs with the poller in hand and must
/// never block on user code.
pub(crate) type IoTask = Box<dyn FnOnce(&Arc<Core>, &mut Poller) + Send>;

/// Work for the user queue; may block inside callbacks.
pub(crate) type UserTask = Box<dyn FnOnce(&Arc<Core>) + Send>;

/// Shared state of one reactor.
pub(crate) struct Core {
    pub(crate) registry: Mutex<ConnRegistry>,
    pub(crate) io_tasks: TaskQueue<IoTask>,
    pub(crate) user_tasks: TaskQueue<UserTask>,
    pub(crate) parker: ThreadParker,
    waker: Mutex<Option<mio::Waker>>,
    pub(crate) env: Mutex<EnvStore>,
    pub(crate) state: StateCallbacks,
    pub(crate) listeners: Mutex<Vec<Arc<ListenerCfg>>>,
    tick_ms: AtomicU64,
    running: AtomicBool,
    is_master: AtomicBool,
    is_worker: AtomicBool,
    master_pid: AtomicI32,
    pub(crate) threads: AtomicU16,
    pub(crate) workers: AtomicU16,
    pub(crate) signal_forwarded: AtomicBool,
    was_busy: AtomicBool,
    pub(crate) fork_lock: Mutex<()>,
    last_timeout_scan: AtomicU64,
}

/// Unrecoverable process invariant broke (poller or pipe creation).
fn fatal(context: &str, err: io::Error) -> ! {
    error!(error = %err, "{context}");
    std::process::exit(1);
}

impl Core {
    fn new() -> Arc<Core> {
        let parker = match ThreadParker::new() {
            Ok(p) => p,
            Err(err) => fatal("couldn't initialize the drainer park pipe", err),
        };
        Arc::new(Core {
            registry: Mutex::new(ConnRegistry::new()),
            io_tasks: TaskQueue::new(),
            user_tasks: TaskQueue::new(),
            parker,
            waker: Mutex::new(None),
            env: Mutex::new(EnvStore::new()),
            state: StateCallbacks::new(),
            listeners: Mutex::new(Vec::new()),
            tick_ms: AtomicU64::new(0),
            running: AtomicBool::new(false),
            is_master: AtomicBool::new(true),
            is_worker: AtomicBool::new(true),
            master_pid: AtomicI32::new(unsafe { libc::getpid() }),
            threads: AtomicU16::new(0),
            workers: AtomicU16::new(0),
            signal_forwarded: AtomicBool::new(false),
            was_busy: AtomicBool::new(false),
            fork_lock: Mutex::new(()),
            last_timeout_scan: AtomicU64::new(0),
        })
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub(crate) fn is_worker(&self) -> bool {
        self.is_worker.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_child(&self) {
        self.is_master.store(false, Ordering::SeqCst);
        self.is_worker.store(true, Ordering::SeqCst);
    }

    pub(crate) fn master_pid(&self) -> libc::pid_t {
        self.master_pid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_waker(&self, waker: mio::Waker) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    /// Interrupt a blocked poller review so queued io-core work runs.
    pub(crate) fn wake_poller(&self) {
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            let _ = waker.wake();
        }
    }

    /// Run `f` (the fork itself) with every cross-thread lock held, so
    /// the child never inherits a mutex locked by a thread that does not
    /// exist there. The forking thread releases them on both sides.
    pub(crate) fn with_fork_locks<R>(&self, f: impl FnOnce() -> R) -> R {
        let _registry = self.registry.lock().unwrap();
        let _io = self.io_tasks.guard();
        let _user = self.user_tasks.guard();
        let _parker = self.parker.guard();
        let _waker = self.waker.lock().unwrap();
        let _env = self.env.lock().unwrap();
        let _listeners = self.listeners.lock().unwrap();
        f()
    }
}

/// Run state callbacks for a phase from core-level code.
pub(crate) fn force_state(core: &Arc<Core>, phase: Phase) {
    let reactor = Reactor::from_core(Arc::clone(core));
    core.state.force(&reactor, phase);
}

/// A handle to a reactor. Cloning is cheap; every clone drives the same
/// reactor.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) core: Arc<Core>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Reactor {
        let reactor = Reactor { core: Core::new() };
        reactor.core.state.force(&reactor, Phase::OnInitialize);
        reactor.core.state.mark_initialized();
        reactor
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Reactor {
        Reactor { core }
    }

    /// Bind a listening socket described by a URL (`tcp://`, `tls://`,
    /// `unix://`). Accepting starts with the reactor; `on_open` receives
    /// each accepted fd and either attaches it or closes it.
    pub fn listen(&self, args: ListenArgs) -> io::Result<BoundAddr> {
        listener::listen(&self.core, args)
    }

    /// Run the reactor until it is stopped. Blocks the calling thread;
    /// with `workers > 0` the calling process becomes the master and
    /// forks that many worker processes.
    pub fn start(&self, args: StartArgs) {
        let core = &self.core;
        let mut threads = args.threads;
        let mut workers = args.workers;
        Self::expected_concurrency(&mut threads, &mut workers);
        core.threads.store(threads as u16, Ordering::SeqCst);
        core.workers.store(workers as u16, Ordering::SeqCst);
        core.master_pid
            .store(unsafe { libc::getpid() }, Ordering::SeqCst);
        core.signal_forwarded.store(false, Ordering::SeqCst);
        core.running.store(true, Ordering::SeqCst);

        self.install_stop_handlers();
        force_state(core, Phase::PreStart);

        info!(
            mode = if workers > 0 { "cluster" } else { "single process" },
            engine = poller::engine(),
            workers,
            threads,
            pid = core.master_pid(),
            "reactor starting"
        );

        if workers > 0 {
            core.is_worker.store(false, Ordering::SeqCst);
            self.install_restart_handler();
            for _ in 0..workers {
                supervisor::spawn_worker(core);
            }
            // The master runs io-core and housekeeping only; its user
            // queue serves master-only listeners.
            process_body(core, 0, false);
            supervisor::wait_for_children(core);
        } else {
            process_body(core, threads as usize, true);
        }

        force_state(core, Phase::OnFinish);
        force_state(core, Phase::AtExit);
        for entry in core.env.lock().unwrap().drain().into_iter().rev() {
            entry.fire();
        }
        signals::reset();
        core.running.store(false, Ordering::SeqCst);
        info!(pid = unsafe { libc::getpid() }, "shutdown complete");
    }

    fn install_stop_handlers(&self) {
        let weak = Arc::downgrade(&self.core);
        let stop: SignalFn = Arc::new(move |signum| {
            if let Some(core) = weak.upgrade() {
                info!(pid = unsafe { libc::getpid() }, signum, "received shutdown signal");
                core.stop_running();
                if core.is_master()
                    && core.workers.load(Ordering::SeqCst) > 0
                    && !core.signal_forwarded.swap(true, Ordering::SeqCst)
                {
                    unsafe { libc::kill(0, signum) };
                }
                core.wake_poller();
            }
        });
        if let Err(err) = signals::monitor(libc::SIGINT, stop.clone()) {
            warn!(error = %err, "couldn't install SIGINT handler");
        }
        if let Err(err) = signals::monitor(libc::SIGTERM, stop) {
            warn!(error = %err, "couldn't install SIGTERM handler");
        }
    }

    fn install_restart_handler(&self) {
        let weak = Arc::downgrade(&self.core);
        let restart: SignalFn = Arc::new(move |signum| {
            if let Some(core) = weak.upgrade() {
                if core.workers.load(Ordering::SeqCst) == 0 || !core.running() {
                    return;
                }
                if core.is_worker() {
                    info!(pid = unsafe { libc::getpid() }, "received worker restart signal");
                    core.stop_running();
                    core.wake_poller();
                } else if !core.signal_forwarded.swap(true, Ordering::SeqCst) {
                    info!("forwarding worker restart signal");
                    unsafe { libc::kill(0, signum) };
                }
            }
        });
        if let Err(err) = signals::monitor(libc::SIGUSR1, restart) {
            warn!(error = %err, "couldn't install SIGUSR1 handler");
        }
    }

    /// Ask the reactor to shut down. Callable from any thread; in
    /// cluster mode the master notifies its workers.
    pub fn stop(&self) {
        self.core.stop_running();
        if self.core.is_master() && self.core.workers.load(Ordering::SeqCst) > 0 {
            self.core.signal_forwarded.store(true, Ordering::SeqCst);
            unsafe { libc::kill(0, libc::SIGINT) };
        }
        self.core.wake_poller();
    }

    pub fn is_running(&self) -> bool {
        self.core.running()
    }

    pub fn is_master(&self) -> bool {
        self.core.is_master()
    }

    pub fn is_worker(&self) -> bool {
        self.core.is_worker()
    }

    pub fn master_pid(&self) -> i32 {
        self.core.master_pid()
    }

    /// Monotonic milliseconds of the last poller review.
    pub fn last_tick(&self) -> u64 {
        self.core.tick_ms.load(Ordering::SeqCst)
    }

    /// Which readiness backend this build uses ("epoll" or "kqueue").
    pub fn engine() -> &'static str {
        poller::engine()
    }

    /// Resolve `threads`/`workers` the way `start` will: negatives are
    /// core fractions, zeros auto-tune. The inputs are overwritten with
    /// the result.
    pub fn expected_concurrency(threads: &mut i16, workers: &mut i16) {
        supervisor::expected_concurrency(threads, workers);
    }

    /// Reap zombie children globally (SIGCHLD). For applications that
    /// spawn processes of their own; the worker sentinels wait on their
    /// children regardless.
    pub fn reap_children(&self) {
        let action: SignalFn = Arc::new(|_| unsafe {
            let mut status = 0;
            while libc::waitpid(-1, &mut status, libc::WNOHANG) > 0 {}
        });
        if let Err(err) = signals::monitor(libc::SIGCHLD, action) {
            warn!(error = %err, "couldn't install SIGCHLD handler");
        }
    }

    /// Restore every signal disposition the reactor replaced.
    pub fn signal_handler_reset(&self) {
        signals::reset();
    }

    /// Attach an open socket to the reactor under `protocol`. The fd is
    /// made non-blocking and close-on-exec, Nagle is disabled for TCP,
    /// and readiness is armed in both directions.
    pub fn attach_fd(
        &self,
        fd: RawFd,
        protocol: Arc<dyn Protocol>,
        udata: UserData,
        transport: Option<Arc<dyn Transport>>,
    ) -> io::Result<ConnHandle> {
        conn::set_nonblocking(fd)?;
        conn::set_cloexec(fd)?;
        conn::set_nodelay(fd);
        let peer = conn::peer_addr_string(fd);
        let transport = transport.unwrap_or_else(|| Arc::new(RawTransport));
        let conn = Conn::new(fd, protocol, udata, transport, peer);
        let handle = self.core.registry.lock().unwrap().insert(Arc::clone(&conn));
        conn.set_handle(handle);

        conn.acquire();
        let armed = Arc::clone(&conn);
        self.core.io_tasks.push(Box::new(move |core, poller| {
            poller.add_rw(&armed);
            armed.release(core);
        }));
        self.core.wake_poller();
        debug!(fd, peer = conn.peer(), "connection attached");
        Ok(handle)
    }

    /// Borrow the `Io` surface for a live connection. `None` for stale
    /// handles.
    pub fn io(&self, handle: ConnHandle) -> Option<Io> {
        self.core
            .registry
            .lock()
            .unwrap()
            .resolve(handle)
            .map(|conn| Io::new(Arc::clone(&self.core), conn))
    }

    /// Schedule a task on the user queue.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        self.core.user_tasks.push(Box::new(move |_| task()));
        self.core.parker.wake_one();
    }

    /// Schedule a connection task: it runs under the connection's task
    /// lock and is dropped silently if the handle went stale.
    pub fn defer_io(&self, handle: ConnHandle, task: impl FnOnce(&Io) + Send + 'static) {
        match self.core.registry.lock().unwrap().resolve(handle) {
            Some(conn) => tasks::schedule_io_task(&self.core, conn, Box::new(task)),
            None => debug!("defer_io on a stale connection handle"),
        }
    }

    /// Link a resource to the process's lifetime; its callback fires at
    /// exit, after `AtExit` state callbacks, in reverse insertion order.
    pub fn env_set(
        &self,
        type_id: i64,
        name: impl Into<Name>,
        udata: UserData,
        on_close: Option<EnvCloseFn>,
    ) {
        let replaced = self
            .core
            .env
            .lock()
            .unwrap()
            .set(type_id, name.into(), udata, on_close);
        if let Some(entry) = replaced {
            self.core
                .user_tasks
                .push_urgent(Box::new(move |_| entry.fire()));
            self.core.parker.wake_one();
        }
    }

    pub fn env_unset(&self, type_id: i64, name: impl Into<Name>) -> bool {
        self.core
            .env
            .lock()
            .unwrap()
            .take(type_id, &name.into())
            .is_some()
    }

    pub fn env_remove(&self, type_id: i64, name: impl Into<Name>) -> bool {
        match self.core.env.lock().unwrap().take(type_id, &name.into()) {
            Some(entry) => {
                self.core
                    .user_tasks
                    .push_urgent(Box::new(move |_| entry.fire()));
                self.core.parker.wake_one();
                true
            }
            None => false,
        }
    }

    pub fn env_get(&self, type_id: i64, name: impl Into<Name>) -> Option<UserData> {
        self.core.env.lock().unwrap().get(type_id, &name.into())
    }

    pub fn state_callback_add(&self, phase: Phase, callback: StateFn) {
        self.core.state.add(self, phase, callback);
    }

    pub fn state_callback_remove(&self, phase: Phase, callback: &StateFn) -> bool {
        self.core.state.remove(phase, callback)
    }

    pub fn state_callback_clear(&self, phase: Phase) {
        self.core.state.clear(phase);
    }

    pub fn state_callback_force(&self, phase: Phase) {
        self.core.state.force(self, phase);
    }
}

/// One process's reactor run: poller setup, listener attach, drainer
/// threads, the main loop, then the shutdown cycle and final cleanup.
pub(crate) fn process_body(core: &Arc<Core>, threads: usize, is_worker_process: bool) {
    let (mut poller, waker) = match Poller::new() {
        Ok(pair) => pair,
        Err(err) => fatal("couldn't initialize the poller backend", err),
    };
    core.set_waker(waker);
    listener::attach_eligible(core);

    let mut drainers = Vec::new();
    if is_worker_process {
        force_state(core, Phase::OnStart);
        for i in 0..threads {
            let core2 = Arc::clone(core);
            match thread::Builder::new()
                .name(format!("evio-user-{i}"))
                .spawn(move || user_thread_cycle(core2))
            {
                Ok(handle) => drainers.push(handle),
                Err(err) => error!(error = %err, "user thread creation failed"),
            }
        }
    }
    let drain_user_inline = drainers.is_empty();

    while core.running() {
        housekeeping(core, &mut poller, POLL_TICK_MS);
        perform_io(core, &mut poller);
        if drain_user_inline {
            perform_user(core);
        }
    }

    core.parker.wake_all(drainers.len().max(1));
    for handle in drainers {
        let _ = handle.join();
    }

    shutdown_cycle(core, &mut poller);
    final_cleanup(core, &mut poller);
}

fn user_thread_cycle(core: Arc<Core>) {
    while core.running() {
        perform_user(&core);
        if core.running() {
            core.parker.park();
        }
    }
}

fn perform_io(core: &Arc<Core>, poller: &mut Poller) {
    while let Some(task) = core.io_tasks.pop() {
        task(core, poller);
    }
}

fn perform_user(core: &Arc<Core>) {
    while let Some(task) = core.user_tasks.pop() {
        task(core);
    }
}

/// One housekeeping pass: poll, tick, signals, idle edge, master
/// liveness, a drainer wake and the timeout review.
fn housekeeping(core: &Arc<Core>, poller: &mut Poller, tick_ms: u64) {
    let mut events = poller.review(core, tick_ms);
    core.tick_ms.store(clock::now_ms(), Ordering::SeqCst);
    events += signals::review();

    if events == 0 {
        if core.was_busy.swap(false, Ordering::SeqCst) {
            force_state(core, Phase::OnIdle);
            core.signal_forwarded.store(false, Ordering::SeqCst);
        }
        if !core.is_master() && core.running() {
            let parent = unsafe { libc::getppid() };
            if parent != core.master_pid() {
                error!(
                    pid = unsafe { libc::getpid() },
                    parent, "master process seems to have crashed"
                );
                force_state(core, Phase::OnParentCrush);
                core.stop_running();
            }
        }
    } else {
        core.was_busy.store(true, Ordering::SeqCst);
    }

    core.parker.wake_one();
    review_timeouts(core);
}

/// Walk live connections once a second and fire `on_timeout` for any
/// whose inactivity window lapsed.
fn review_timeouts(core: &Arc<Core>) {
    let now = clock::now_ms();
    if now.saturating_sub(core.last_timeout_scan.load(Ordering::SeqCst)) < 1000 {
        return;
    }
    core.last_timeout_scan.store(now, Ordering::SeqCst);
    for conn in core.registry.lock().unwrap().snapshot() {
        if conn.timed_out(now) {
            tasks::schedule_on_timeout(core, &conn);
        }
    }
}

/// The grace window after `running` flips off: every live connection
/// gets `on_shutdown` once; those that decline to stay are closed as
/// their streams drain, force-closed when the window expires.
fn shutdown_cycle(core: &Arc<Core>, poller: &mut Poller) {
    info!(pid = unsafe { libc::getpid() }, "shutting down");
    force_state(core, Phase::OnShutdown);
    for conn in core.registry.lock().unwrap().snapshot() {
        tasks::schedule_on_shutdown(core, &conn);
    }

    let deadline = clock::now_ms() + SHUTDOWN_TIMEOUT_SECS * 1000;
    let mut grace_expired = false;
    loop {
        poller.review(core, 0);
        perform_io(core, poller);
        perform_user(core);

        let pending = core
            .registry
            .lock()
            .unwrap()
            .snapshot()
            .into_iter()
            .filter(|c| !c.keep_past_shutdown.load(Ordering::SeqCst))
            .count();
        if pending == 0 {
            break;
        }
        let now = clock::now_ms();
        if now >= deadline && !grace_expired {
            grace_expired = true;
            warn!(pending, "shutdown grace expired, discarding unsent data");
            for conn in core.registry.lock().unwrap().snapshot() {
                if !conn.keep_past_shutdown.load(Ordering::SeqCst) {
                    conn.mark_closed_in_loop(core, poller);
                }
            }
        }
        if now >= deadline + 1000 {
            // Something still holds references; final cleanup deals with it.
            break;
        }
    }
}

/// Close whatever is left (kept connections included), then drain both
/// queues to empty so every `on_close` lands before the process moves on.
fn final_cleanup(core: &Arc<Core>, poller: &mut Poller) {
    loop {
        for conn in core.registry.lock().unwrap().snapshot() {
            conn.mark_closed_in_loop(core, poller);
        }
        perform_io(core, poller);
        perform_user(core);
        if core.io_tasks.is_empty() && core.user_tasks.is_empty() {
            break;
        }
    }
    let leaked = core.registry.lock().unwrap().len();
    if leaked > 0 {
        debug!(leaked, "connections still referenced at exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_defaults() {
        let reactor = Reactor::new();
        assert!(!reactor.is_running());
        assert!(reactor.is_master());
        assert!(reactor.is_worker());
        assert_eq!(reactor.master_pid(), unsafe { libc::getpid() });
    }

    #[test]
    fn test_engine_reports_backend() {
        let engine = Reactor::engine();
        assert!(engine == "epoll" || engine == "kqueue");
    }

    #[test]
    fn test_process_env_roundtrip() {
        let reactor = Reactor::new();
        reactor.env_set(0, "global", Some(Arc::new(42u32)), None);
        let value = reactor.env_get(0, "global").flatten().unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 42);
        assert!(reactor.env_unset(0, "global"));
        assert!(!reactor.env_unset(0, "global"));
    }
}
