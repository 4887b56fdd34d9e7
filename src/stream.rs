//! Outgoing byte stream: the per-connection write queue.
//!
//! A stream is a FIFO of packets awaiting delivery. A packet is either a
//! chunk of bytes or a lazy slice of an open file that is read with
//! `pread` only while flushing, so large files never sit in memory. The
//! stream tracks its queued byte count; the reactor uses it for
//! backpressure throttling.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

/// One queued write.
#[derive(Debug)]
pub enum Packet {
    /// In-memory bytes. `Bytes` payloads are shared without copying;
    /// anything borrowed is copied at construction.
    Bytes(Bytes),
    /// A slice of an open file, flushed chunk by chunk.
    File(FileSlice),
}

/// A `(fd, offset, len)` window into an open file.
#[derive(Debug)]
pub struct FileSlice {
    fd: RawFd,
    offset: u64,
    len: u64,
    close_on_done: bool,
}

impl Packet {
    /// Queue a file slice. `len == 0` means "until EOF", resolved here so
    /// the stream's byte accounting stays exact. With `close_on_done` the
    /// fd is closed once the slice is fully sent or discarded.
    pub fn file(fd: RawFd, offset: u64, len: u64, close_on_done: bool) -> io::Result<Packet> {
        let len = if len == 0 {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                if close_on_done {
                    unsafe { libc::close(fd) };
                }
                return Err(err);
            }
            (st.st_size as u64).saturating_sub(offset)
        } else {
            len
        };
        Ok(Packet::File(FileSlice {
            fd,
            offset,
            len,
            close_on_done,
        }))
    }

    fn len(&self) -> u64 {
        match self {
            Packet::Bytes(b) => b.len() as u64,
            Packet::File(f) => f.len,
        }
    }
}

impl From<Bytes> for Packet {
    fn from(b: Bytes) -> Self {
        Packet::Bytes(b)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(v: Vec<u8>) -> Self {
        Packet::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Packet {
    fn from(b: &[u8]) -> Self {
        Packet::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<&str> for Packet {
    fn from(s: &str) -> Self {
        Packet::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl Drop for FileSlice {
    fn drop(&mut self) {
        if self.close_on_done {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// FIFO of packets plus a cursor into the head packet.
pub(crate) struct OutStream {
    queue: VecDeque<Packet>,
    /// Bytes of the head packet already consumed.
    head: u64,
    /// Bytes remaining across the whole queue.
    queued: u64,
}

impl OutStream {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            head: 0,
            queued: 0,
        }
    }

    pub(crate) fn push(&mut self, packet: Packet) {
        self.queued += packet.len();
        self.queue.push_back(packet);
    }

    /// Remaining bytes queued for delivery.
    pub(crate) fn len(&self) -> u64 {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Copy bytes from the head packet into `buf` without consuming them.
    /// Returns 0 only when the stream is empty. File errors surface so the
    /// caller can fail the connection.
    pub(crate) fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(packet) = self.queue.front() else {
            return Ok(0);
        };
        match packet {
            Packet::Bytes(bytes) => {
                let start = self.head as usize;
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                Ok(n)
            }
            Packet::File(file) => {
                let remaining = file.len - self.head;
                let n = (buf.len() as u64).min(remaining) as usize;
                let r = unsafe {
                    libc::pread(
                        file.fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        n,
                        (file.offset + self.head) as libc::off_t,
                    )
                };
                if r < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        return Ok(0);
                    }
                    return Err(err);
                }
                if r == 0 && n > 0 {
                    // File shrank underneath the queued slice.
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shorter than queued slice",
                    ));
                }
                Ok(r as usize)
            }
        }
    }

    /// Consume `n` bytes (the amount the OS actually accepted).
    pub(crate) fn advance(&mut self, mut n: u64) {
        self.queued = self.queued.saturating_sub(n);
        while n > 0 {
            let Some(packet) = self.queue.front_mut() else {
                self.head = 0;
                return;
            };
            let remaining = packet.len() - self.head;
            if n < remaining {
                self.head += n;
                return;
            }
            n -= remaining;
            if let Packet::File(file) = packet {
                if file.close_on_done {
                    unsafe { libc::close(file.fd) };
                    file.close_on_done = false;
                }
            }
            self.queue.pop_front();
            self.head = 0;
        }
    }

    /// Discard everything queued. File fds marked close-on-done are
    /// released by their `Drop`.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.head = 0;
        self.queued = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn test_peek_then_advance_in_order() {
        let mut s = OutStream::new();
        s.push(Packet::from(&b"hello "[..]));
        s.push(Packet::from(&b"world"[..]));
        assert_eq!(s.len(), 11);

        let mut buf = [0u8; 64];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello ");

        s.advance(n as u64);
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        s.advance(n as u64);

        assert!(s.is_empty());
        assert_eq!(s.len(), 0);
        assert_eq!(s.peek(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_partial_advance_keeps_cursor() {
        let mut s = OutStream::new();
        s.push(Packet::from(&b"abcdef"[..]));

        s.advance(2);
        let mut buf = [0u8; 3];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"cde");

        s.advance(4);
        assert!(s.is_empty());
    }

    #[test]
    fn test_advance_spans_packets() {
        let mut s = OutStream::new();
        s.push(Packet::from(&b"ab"[..]));
        s.push(Packet::from(&b"cd"[..]));
        s.advance(3);
        let mut buf = [0u8; 8];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"d");
    }

    #[test]
    fn test_file_packet_reads_lazily() {
        let path = std::env::temp_dir().join(format!("evio-stream-test-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        let fd = std::fs::File::open(&path).unwrap().into_raw_fd();
        let mut s = OutStream::new();
        s.push(Packet::file(fd, 2, 0, true).unwrap());
        assert_eq!(s.len(), 8, "len 0 resolves to rest-of-file");

        let mut buf = [0u8; 5];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"23456");
        s.advance(n as u64);

        let mut buf = [0u8; 8];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"789");
        s.advance(n as u64);
        assert!(s.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_clear_discards_pending() {
        let mut s = OutStream::new();
        s.push(Packet::from(&b"data"[..]));
        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_bytes_packet_shares_without_copy() {
        let payload = Bytes::from_static(b"static payload");
        let mut s = OutStream::new();
        s.push(Packet::from(payload.clone()));
        let mut buf = [0u8; 32];
        let n = s.peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload.as_ref());
    }
}
