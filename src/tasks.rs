//! Deferred task wrappers around protocol callbacks.
//!
//! Every wrapper follows the same discipline: hold a connection
//! reference for the task's lifetime, short-circuit if the connection
//! closed while the task sat in the queue, and take the task lock before
//! entering user code, rescheduling at the back of the queue instead of
//! blocking when another callback holds it.

use crate::conn::{Conn, ConnState, Io};
use crate::reactor::Core;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Queue a drain pass for the connection's outgoing stream.
pub(crate) fn schedule_drain(core: &Arc<Core>, conn: &Arc<Conn>) {
    conn.acquire();
    let conn = Arc::clone(conn);
    core.io_tasks.push(Box::new(move |core, poller| {
        conn.drain_out(core, poller);
        conn.release(core);
    }));
    core.wake_poller();
}

/// Re-arm readability once the current callback or suspension ends.
pub(crate) fn schedule_rearm_read(core: &Arc<Core>, conn: &Arc<Conn>) {
    conn.acquire();
    let conn = Arc::clone(conn);
    core.io_tasks.push(Box::new(move |core, poller| {
        if conn.state() == ConnState::Open && !conn.is_throttled() {
            poller.add_read(&conn);
        }
        conn.release(core);
    }));
    core.wake_poller();
}

pub(crate) fn schedule_on_data(core: &Arc<Core>, conn: &Arc<Conn>) {
    conn.acquire();
    let conn = Arc::clone(conn);
    core.user_tasks
        .push(Box::new(move |core| ev_on_data(core, conn)));
    core.parker.wake_one();
}

fn ev_on_data(core: &Arc<Core>, conn: Arc<Conn>) {
    if conn.state() != ConnState::Open {
        conn.release(core);
        return;
    }
    if !conn.task_lock.try_lock() {
        core.user_tasks
            .push(Box::new(move |core| ev_on_data(core, conn)));
        return;
    }
    let protocol = conn.protocol();
    let io = Io::new(Arc::clone(core), Arc::clone(&conn));
    protocol.on_data(&io);
    conn.task_lock.unlock();
    schedule_rearm_read(core, &conn);
    conn.release(core);
}

pub(crate) fn schedule_on_ready(core: &Arc<Core>, conn: &Arc<Conn>) {
    conn.acquire();
    let conn = Arc::clone(conn);
    core.user_tasks
        .push_urgent(Box::new(move |core| ev_on_ready(core, conn)));
    core.parker.wake_one();
}

fn ev_on_ready(core: &Arc<Core>, conn: Arc<Conn>) {
    if conn.state() != ConnState::Open {
        conn.release(core);
        return;
    }
    if !conn.task_lock.try_lock() {
        core.user_tasks
            .push_urgent(Box::new(move |core| ev_on_ready(core, conn)));
        return;
    }
    let protocol = conn.protocol();
    let io = Io::new(Arc::clone(core), Arc::clone(&conn));
    protocol.on_ready(&io);
    conn.task_lock.unlock();
    conn.release(core);
}

/// Fire `on_timeout` and restart the inactivity window immediately, so
/// the callback runs at most once per window whether or not it acts.
pub(crate) fn schedule_on_timeout(core: &Arc<Core>, conn: &Arc<Conn>) {
    conn.touch();
    conn.acquire();
    let conn = Arc::clone(conn);
    core.user_tasks
        .push(Box::new(move |core| ev_on_timeout(core, conn)));
    core.parker.wake_one();
}

fn ev_on_timeout(core: &Arc<Core>, conn: Arc<Conn>) {
    if !matches!(conn.state(), ConnState::Open | ConnState::Suspended) {
        conn.release(core);
        return;
    }
    if !conn.task_lock.try_lock() {
        core.user_tasks
            .push(Box::new(move |core| ev_on_timeout(core, conn)));
        return;
    }
    let protocol = conn.protocol();
    let io = Io::new(Arc::clone(core), Arc::clone(&conn));
    protocol.on_timeout(&io);
    conn.task_lock.unlock();
    conn.release(core);
}

/// Single-shot shutdown notice. The boolean return decides whether the
/// connection survives the grace window.
pub(crate) fn schedule_on_shutdown(core: &Arc<Core>, conn: &Arc<Conn>) {
    if conn.shutdown_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    conn.acquire();
    let conn = Arc::clone(conn);
    core.user_tasks
        .push(Box::new(move |core| ev_on_shutdown(core, conn)));
    core.parker.wake_one();
}

fn ev_on_shutdown(core: &Arc<Core>, conn: Arc<Conn>) {
    if conn.state() == ConnState::Closed {
        conn.release(core);
        return;
    }
    if !conn.task_lock.try_lock() {
        core.user_tasks
            .push(Box::new(move |core| ev_on_shutdown(core, conn)));
        return;
    }
    let protocol = conn.protocol();
    let io = Io::new(Arc::clone(core), Arc::clone(&conn));
    let keep = protocol.on_shutdown(&io);
    conn.task_lock.unlock();
    if keep {
        conn.keep_past_shutdown.store(true, Ordering::SeqCst);
    } else {
        conn.close(core);
    }
    conn.release(core);
}

/// A user-supplied connection task from `defer_io`: validity was checked
/// at scheduling time, liveness and the task lock here.
pub(crate) fn schedule_io_task(
    core: &Arc<Core>,
    conn: Arc<Conn>,
    task: Box<dyn FnOnce(&Io) + Send>,
) {
    conn.acquire();
    core.user_tasks
        .push(Box::new(move |core| run_io_task(core, conn, task)));
    core.parker.wake_one();
}

fn run_io_task(core: &Arc<Core>, conn: Arc<Conn>, task: Box<dyn FnOnce(&Io) + Send>) {
    if conn.state() == ConnState::Closed {
        conn.release(core);
        return;
    }
    if !conn.task_lock.try_lock() {
        core.user_tasks
            .push(Box::new(move |core| run_io_task(core, conn, task)));
        return;
    }
    let io = Io::new(Arc::clone(core), Arc::clone(&conn));
    task(&io);
    conn.task_lock.unlock();
    conn.release(core);
}
