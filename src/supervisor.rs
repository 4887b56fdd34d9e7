//! Worker supervision: concurrency tuning, fork, crash respawn.
//!
//! The master never forks from its event loop. Each worker gets a
//! sentinel thread that runs the fork dance under the fork lock (so
//! `BeforeFork`/`AfterFork` pairs never interleave), then waits on the
//! child. Any exit while the reactor is running produces a replacement,
//! which is also what makes SIGUSR1 a graceful worker restart; an
//! abnormal exit additionally fires `OnChildCrush`.

use crate::config::{CPU_CORES_FALLBACK, CPU_CORES_LIMIT};
use crate::reactor::{self, force_state, Core};
use crate::state::Phase;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

fn detect_cores() -> i16 {
    match thread::available_parallelism() {
        Ok(n) => {
            let n = n.get() as i16;
            if n > CPU_CORES_LIMIT {
                warn!(
                    detected = n,
                    cap = CPU_CORES_LIMIT,
                    "capping CPU core auto-detection; set threads/workers explicitly to avoid this"
                );
                CPU_CORES_LIMIT
            } else {
                n
            }
        }
        Err(_) => {
            warn!("CPU core count auto-detection failed");
            CPU_CORES_FALLBACK
        }
    }
}

/// Resolve thread/worker counts. Positive values pass through. Negative
/// values are core fractions (`-2` is half the cores), floored at 1. A
/// zero paired with a negative mirrors the negative's magnitude on the
/// other axis. Both zero auto-tunes to one worker with `cores - 1`
/// threads, leaving a core for the kernel when more than three exist.
pub(crate) fn expected_concurrency(threads: &mut i16, workers: &mut i16) {
    if *threads == 0 && *workers == 0 {
        let cores = detect_cores();
        *workers = 1;
        *threads = if cores > 3 { cores - 1 } else { cores.max(1) };
        return;
    }
    if *workers == 0 && *threads < 0 {
        *workers = -*threads;
    }
    if *threads == 0 && *workers < 0 {
        *threads = -*workers;
    }
    if *threads < 0 || *workers < 0 {
        let cores = detect_cores();
        if *threads < 0 {
            *threads = (cores / -*threads).max(1);
        }
        if *workers < 0 {
            *workers = (cores / -*workers).max(1);
        }
    }
    *threads = (*threads).clamp(1, CPU_CORES_LIMIT);
    *workers = (*workers).min(CPU_CORES_LIMIT);
}

/// Fork one worker through a sentinel thread. Master-only; a worker
/// asked to spawn quietly declines.
pub(crate) fn spawn_worker(core: &Arc<Core>) {
    if !core.is_master() {
        return;
    }
    let core = Arc::clone(core);
    if let Err(err) = thread::Builder::new()
        .name("evio-sentinel".into())
        .spawn(move || sentinel(core))
    {
        error!(error = %err, "sentinel thread creation failed, no worker will be spawned");
    }
}

fn sentinel(core: Arc<Core>) {
    let pid = {
        let _guard = core.fork_lock.lock().unwrap();
        force_state(&core, Phase::BeforeFork);
        let pid = core.with_fork_locks(|| unsafe { libc::fork() });
        if pid < 0 {
            error!(error = %io::Error::last_os_error(), "fork failed");
            return;
        }
        force_state(&core, Phase::AfterFork);
        if pid != 0 {
            force_state(&core, Phase::InMaster);
        }
        pid
    };

    if pid == 0 {
        child_main(&core);
    }

    let mut status: libc::c_int = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            break;
        }
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if core.running() {
                error!(error = %err, "waitpid failed, worker re-spawning might fail");
            }
            break;
        }
    }

    if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
        warn!(worker = pid, "abnormal worker exit detected");
        force_state(&core, Phase::OnChildCrush);
    }
    if core.running() {
        core.io_tasks.push(Box::new(|core, _poller| {
            spawn_worker(core);
        }));
        core.wake_poller();
    }
}

/// The forked child: shed the master's identity and inherited
/// connections, run a worker lifetime, exit.
fn child_main(core: &Arc<Core>) -> ! {
    core.enter_child();
    force_state(core, Phase::InChild);
    core.signal_forwarded.store(false, Ordering::SeqCst);
    if let Err(err) = core.parker.rebuild() {
        error!(error = %err, "couldn't rebuild the park pipe in the worker");
        std::process::exit(1);
    }
    // Connections inherited from the master are not ours to serve.
    for conn in core.registry.lock().unwrap().snapshot() {
        conn.mark_closed(core);
    }

    let pid = unsafe { libc::getpid() };
    info!(pid, "worker starting up");
    let threads = core.threads.load(Ordering::SeqCst) as usize;
    reactor::process_body(core, threads, true);

    force_state(core, Phase::OnFinish);
    force_state(core, Phase::AtExit);
    for entry in core.env.lock().unwrap().drain().into_iter().rev() {
        entry.fire();
    }
    info!(pid, "worker shutdown complete");
    std::process::exit(0);
}

/// Master-side lingering: the sentinels own the respawn logic, this just
/// holds the master alive until its direct children are gone.
pub(crate) fn wait_for_children(core: &Arc<Core>) {
    for _ in 0..core.workers.load(Ordering::SeqCst) {
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(-1, &mut status, 0) } < 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_values_pass_through() {
        let (mut threads, mut workers) = (3i16, 2i16);
        expected_concurrency(&mut threads, &mut workers);
        assert_eq!((threads, workers), (3, 2));
    }

    #[test]
    fn test_both_zero_auto_tunes_to_one_worker() {
        let (mut threads, mut workers) = (0i16, 0i16);
        expected_concurrency(&mut threads, &mut workers);
        assert_eq!(workers, 1);
        assert!(threads >= 1);
        let cores = detect_cores();
        if cores > 3 {
            assert_eq!(threads, cores - 1, "one core stays free for the kernel");
        }
    }

    #[test]
    fn test_explicit_single_process_is_preserved() {
        let (mut threads, mut workers) = (2i16, 0i16);
        expected_concurrency(&mut threads, &mut workers);
        assert_eq!((threads, workers), (2, 0));
    }

    #[test]
    fn test_negative_threads_mirror_into_workers() {
        let (mut threads, mut workers) = (-2i16, 0i16);
        expected_concurrency(&mut threads, &mut workers);
        assert_eq!(workers, 2);
        assert!(threads >= 1);
        assert!(threads <= detect_cores().max(1));
    }

    #[test]
    fn test_negative_fraction_floors_at_one() {
        let (mut threads, mut workers) = (-128i16, 1i16);
        expected_concurrency(&mut threads, &mut workers);
        assert_eq!(threads, 1);
        assert_eq!(workers, 1);
    }
}
