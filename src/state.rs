//! Lifecycle state callbacks.
//!
//! Seventeen fixed phases cover the reactor's life: initialization,
//! pre-start, the fork dance, worker start, idle detection, shutdown and
//! exit. Each phase owns an ordered set of callbacks. Build-up phases run
//! in registration order; teardown phases (everything from `OnUsrReverse`
//! on) run in reverse, so cleanup unwinds the way setup wound.

use crate::reactor::Reactor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Phase {
    /// Once, when the reactor object is created. Late registrations run
    /// immediately.
    OnInitialize,
    /// Before the reactor starts its loop.
    PreStart,
    /// In the master, before each worker fork.
    BeforeFork,
    /// After each fork, in both parent and child.
    AfterFork,
    /// After each fork, in the child only.
    InChild,
    /// After each fork, in the master only.
    InMaster,
    /// Every time a worker process starts.
    OnStart,
    /// For pub/sub engines to signal a backend (re)connect.
    OnPubsubConnect,
    /// For pub/sub engines to signal a backend error.
    OnPubsubError,
    /// Free for user events; runs in registration order.
    OnUsr,
    /// When the reactor transitions from busy to idle.
    OnIdle,
    /// Free for user events; runs in reverse registration order.
    OnUsrReverse,
    /// When the shutdown sequence begins.
    OnShutdown,
    /// Just before a process finishes (worker and master alike).
    OnFinish,
    /// In a worker that detects its master died.
    OnParentCrush,
    /// In the master after a worker exited abnormally.
    OnChildCrush,
    /// The reactor's stand-in for `atexit`.
    AtExit,
}

pub(crate) const PHASE_COUNT: usize = Phase::AtExit as usize + 1;

/// A registered state callback. Identity is the `Arc` allocation:
/// registering the same `Arc` twice is a no-op, and removal takes the
/// same `Arc` that was added.
pub type StateFn = Arc<dyn Fn(&Reactor) + Send + Sync>;

pub(crate) struct StateCallbacks {
    slots: [Mutex<Vec<StateFn>>; PHASE_COUNT],
    initialized: AtomicBool,
}

impl StateCallbacks {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(Vec::new())),
            initialized: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add(&self, reactor: &Reactor, phase: Phase, callback: StateFn) {
        {
            let mut slot = self.slots[phase as usize].lock().unwrap();
            if slot.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
                return;
            }
            slot.push(callback.clone());
        }
        if phase == Phase::OnInitialize && self.initialized.load(Ordering::SeqCst) {
            // Initialization already happened; run without delay.
            callback(reactor);
        }
    }

    pub(crate) fn remove(&self, phase: Phase, callback: &StateFn) -> bool {
        let mut slot = self.slots[phase as usize].lock().unwrap();
        let before = slot.len();
        slot.retain(|existing| !Arc::ptr_eq(existing, callback));
        slot.len() != before
    }

    pub(crate) fn clear(&self, phase: Phase) {
        self.slots[phase as usize].lock().unwrap().clear();
    }

    /// Run every callback for the phase as if the event occurred.
    /// Registrations changed mid-run are not observed: the list is
    /// snapshotted under the lock, then executed outside it.
    pub(crate) fn force(&self, reactor: &Reactor, phase: Phase) {
        let snapshot: Vec<StateFn> = self.slots[phase as usize].lock().unwrap().clone();
        if (phase as usize) <= (Phase::OnIdle as usize) {
            for callback in snapshot.iter() {
                callback(reactor);
            }
        } else {
            for callback in snapshot.iter().rev() {
                callback(reactor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> StateFn {
        let log = Arc::clone(log);
        Arc::new(move |_r: &Reactor| log.lock().unwrap().push(id))
    }

    #[test]
    fn test_buildup_phase_runs_in_order() {
        let reactor = Reactor::new();
        let cbs = StateCallbacks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            cbs.add(&reactor, Phase::OnStart, recorder(&log, id));
        }
        cbs.force(&reactor, Phase::OnStart);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_teardown_phase_runs_in_reverse() {
        let reactor = Reactor::new();
        let cbs = StateCallbacks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            cbs.add(&reactor, Phase::OnShutdown, recorder(&log, id));
        }
        cbs.force(&reactor, Phase::OnShutdown);
        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_same_callback_registers_once() {
        let reactor = Reactor::new();
        let cbs = StateCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb: StateFn = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_r: &Reactor| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        cbs.add(&reactor, Phase::OnUsr, cb.clone());
        cbs.add(&reactor, Phase::OnUsr, cb.clone());
        cbs.force(&reactor, Phase::OnUsr);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let reactor = Reactor::new();
        let cbs = StateCallbacks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = recorder(&log, 1);
        let gone = recorder(&log, 2);
        cbs.add(&reactor, Phase::OnIdle, keep.clone());
        cbs.add(&reactor, Phase::OnIdle, gone.clone());

        assert!(cbs.remove(Phase::OnIdle, &gone));
        assert!(!cbs.remove(Phase::OnIdle, &gone), "second removal misses");

        cbs.force(&reactor, Phase::OnIdle);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        cbs.clear(Phase::OnIdle);
        cbs.force(&reactor, Phase::OnIdle);
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_late_on_initialize_runs_immediately() {
        let reactor = Reactor::new();
        let cbs = StateCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        cbs.mark_initialized();
        let cb: StateFn = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_r: &Reactor| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        cbs.add(&reactor, Phase::OnInitialize, cb);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
