//! Task queues bridging the reactor thread and user threads.
//!
//! Two instances exist per reactor core: the io-core queue, consumed only
//! by the reactor thread and never allowed to block on user code, and the
//! user queue, drained by worker threads that may block inside callbacks.
//! Idle drainers park on a byte pipe; the reactor writes one wake token
//! per thread it wants running.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A lock-protected MPMC FIFO.
///
/// `push_urgent` jumps the line; it is reserved for ordering-sensitive
/// work such as `on_ready` delivery and connection teardown.
pub(crate) struct TaskQueue<T> {
    q: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: T) {
        self.q.lock().unwrap().push_back(task);
    }

    pub(crate) fn push_urgent(&self, task: T) {
        self.q.lock().unwrap().push_front(task);
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.q.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.q.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hold the queue lock. Used to keep the queue consistent across
    /// `fork`: the forking thread owns the lock on both sides.
    pub(crate) fn guard(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.q.lock().unwrap()
    }
}

/// Pipe-based parking for user-queue drainers.
///
/// The write end is non-blocking so wakes degrade to no-ops when the pipe
/// is already full of tokens; the read end blocks, which is the park.
/// Rebuilt in a child process after fork so siblings don't steal tokens.
pub(crate) struct ThreadParker {
    fds: Mutex<(libc::c_int, libc::c_int)>,
}

impl ThreadParker {
    pub(crate) fn new() -> std::io::Result<Self> {
        let fds = Self::open_pipe()?;
        Ok(Self {
            fds: Mutex::new(fds),
        })
    }

    fn open_pipe() -> std::io::Result<(libc::c_int, libc::c_int)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe {
            // Wake tokens are droppable; only the park may block.
            let flags = libc::fcntl(fds[1], libc::F_GETFL);
            libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok((fds[0], fds[1]))
    }

    /// Block until a wake token arrives.
    pub(crate) fn park(&self) {
        let rd = self.fds.lock().unwrap().0;
        let mut buf = [0u8; 1];
        loop {
            let r = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            if r >= 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    /// Release one parked drainer, if any.
    pub(crate) fn wake_one(&self) {
        let wr = self.fds.lock().unwrap().1;
        let buf = [0u8; 1];
        unsafe {
            libc::write(wr, buf.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Release up to `n` parked drainers.
    pub(crate) fn wake_all(&self, n: usize) {
        for _ in 0..n {
            self.wake_one();
        }
    }

    /// Hold the fd lock across `fork` (see `TaskQueue::guard`).
    pub(crate) fn guard(&self) -> std::sync::MutexGuard<'_, (libc::c_int, libc::c_int)> {
        self.fds.lock().unwrap()
    }

    /// Replace the pipe pair. Called in a freshly forked child so wake
    /// tokens written by the parent are not consumed here.
    pub(crate) fn rebuild(&self) -> std::io::Result<()> {
        let mut fds = self.fds.lock().unwrap();
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
        *fds = Self::open_pipe()?;
        Ok(())
    }
}

impl Drop for ThreadParker {
    fn drop(&mut self) {
        let fds = self.fds.lock().unwrap();
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_order() {
        let q: TaskQueue<u32> = TaskQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_queue_urgent_jumps_line() {
        let q: TaskQueue<&str> = TaskQueue::new();
        q.push("second");
        q.push_urgent("first");
        assert_eq!(q.pop(), Some("first"));
        assert_eq!(q.pop(), Some("second"));
    }

    #[test]
    fn test_parker_wake_then_park() {
        let parker = ThreadParker::new().unwrap();
        parker.wake_one();
        // The token is already queued, so this must not block.
        parker.park();
    }

    #[test]
    fn test_parker_wake_does_not_block_when_full() {
        let parker = ThreadParker::new().unwrap();
        // Far more tokens than any pipe buffer holds.
        parker.wake_all(1 << 18);
        parker.park();
    }
}
