//! Signal plumbing: async-signal-safe capture, reactor-thread delivery.
//!
//! The installed handler does exactly one thing: set a pending flag.
//! That is all POSIX allows it to do safely. The reactor drains the
//! flags once per housekeeping cycle and runs the registered actions on
//! its own thread, where they are ordinary code. Previous dispositions
//! are saved so `reset` can restore the pre-reactor state.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const MAX_SIGNAL: usize = 64;

static PENDING: [AtomicBool; MAX_SIGNAL] = [const { AtomicBool::new(false) }; MAX_SIGNAL];

pub(crate) type SignalFn = Arc<dyn Fn(i32) + Send + Sync>;

struct OldAction(libc::sigaction);

// Plain saved kernel data; carried across threads only under the table
// mutex.
unsafe impl Send for OldAction {}

struct Slot {
    signum: i32,
    action: SignalFn,
    old: OldAction,
}

static SLOTS: Mutex<Vec<Slot>> = Mutex::new(Vec::new());

extern "C" fn on_signal(signum: libc::c_int) {
    let idx = signum as usize;
    if idx < MAX_SIGNAL {
        PENDING[idx].store(true, Ordering::Release);
    }
}

/// Route `signum` through the pending-flag ring to `action`, which runs
/// on the reactor thread during review. Re-monitoring a signal replaces
/// its action without reinstalling the handler.
pub(crate) fn monitor(signum: i32, action: SignalFn) -> io::Result<()> {
    if !(0..MAX_SIGNAL as i32).contains(&signum) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "signal out of range"));
    }
    let mut slots = SLOTS.lock().unwrap();
    if let Some(slot) = slots.iter_mut().find(|s| s.signum == signum) {
        slot.action = action;
        return Ok(());
    }
    let old = unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_signal;
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signum, &sa, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        old
    };
    slots.push(Slot {
        signum,
        action,
        old: OldAction(old),
    });
    Ok(())
}

/// Drain pending flags and run their actions. Returns how many fired.
pub(crate) fn review() -> usize {
    let snapshot: Vec<(i32, SignalFn)> = SLOTS
        .lock()
        .unwrap()
        .iter()
        .map(|s| (s.signum, s.action.clone()))
        .collect();
    let mut fired = 0;
    for (signum, action) in snapshot {
        if PENDING[signum as usize].swap(false, Ordering::AcqRel) {
            action(signum);
            fired += 1;
        }
    }
    fired
}

/// Stop monitoring `signum`, restoring the disposition that was in place
/// before `monitor`.
pub(crate) fn forget(signum: i32) {
    let mut slots = SLOTS.lock().unwrap();
    if let Some(pos) = slots.iter().position(|s| s.signum == signum) {
        let slot = slots.remove(pos);
        unsafe {
            libc::sigaction(signum, &slot.old.0, std::ptr::null_mut());
        }
        PENDING[signum as usize].store(false, Ordering::Release);
    }
}

/// Restore every signal the reactor touches.
pub(crate) fn reset() {
    forget(libc::SIGCHLD);
    forget(libc::SIGUSR1);
    forget(libc::SIGINT);
    forget(libc::SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_monitor_review_forget_roundtrip() {
        let hits = Arc::new(AtomicUsize::new(0));
        let action: SignalFn = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        monitor(libc::SIGUSR2, action).unwrap();

        assert_eq!(review(), 0, "nothing pending yet");

        unsafe { libc::raise(libc::SIGUSR2) };
        assert_eq!(review(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Flag is consumed; a second review is a no-op.
        assert_eq!(review(), 0);

        forget(libc::SIGUSR2);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let action: SignalFn = Arc::new(|_| {});
        assert!(monitor(-1, action.clone()).is_err());
        assert!(monitor(MAX_SIGNAL as i32, action).is_err());
    }
}
