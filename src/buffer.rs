//! Half-duplex stream buffers: `in`, `out`, `err`.
//!
//! Each carries a fixed-capacity payload and flips between reading from one
//! descriptor and writing to another, never both at once. See
//! `Buffer::do_read`/`Buffer::do_write` for the transition table.

use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::select::FdSet;
use nix::sys::stat::fstat;
use nix::unistd::{close, pipe2, read, write};

use crate::logbuf;

/// Capacity of a stream buffer's payload region.
pub const BUF_CAP: usize = 2048;

/// The half-duplex direction a stream buffer currently operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufOp {
    Idle,
    Reading,
    Writing,
}

/// One of `in`, `out`, or `err`: a pipe carrier with independent read and
/// write endpoints, a fixed payload region, and a tag used when its
/// content is copied into the log.
pub struct Buffer {
    pub read_end: Option<RawFd>,
    pub write_end: Option<RawFd>,
    data: [u8; BUF_CAP],
    size: usize,
    off: usize,
    op: BufOp,
    sign: u8,
    name: &'static str,
}

impl Buffer {
    /// Create a buffer with both ends absent and `op = Idle`.
    pub fn new(name: &'static str, sign: u8) -> Self {
        Self {
            read_end: None,
            write_end: None,
            data: [0; BUF_CAP],
            size: 0,
            off: 0,
            op: BufOp::Idle,
            sign,
            name,
        }
    }

    /// Open a fresh pipe pair for this buffer.
    pub fn open_pipe(&mut self) -> Result<()> {
        let (r, w) = pipe2(OFlag::empty()).context("pipe2")?;
        self.read_end = Some(r);
        self.write_end = Some(w);
        Ok(())
    }

    pub fn op(&self) -> BufOp {
        self.op
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Move the buffer from `Idle` into its initial `Reading` state.
    pub fn start(&mut self) {
        self.op = BufOp::Reading;
    }

    /// Close the read end, unless it aliases the launcher's own stdin.
    pub fn close_read(&mut self) {
        if let Some(fd) = self.read_end.take() {
            if fd != libc::STDIN_FILENO {
                let _ = close(fd);
            }
        }
    }

    /// Drain any pending write, then close the write end, unless it
    /// aliases the launcher's own stdout/stderr.
    pub fn close_write(&mut self) {
        if let Some(fd) = self.write_end.take() {
            if self.op == BufOp::Writing && self.off < self.size {
                let _ = write(fd, &self.data[self.off..self.size]);
            }
            if fd != libc::STDOUT_FILENO && fd != libc::STDERR_FILENO {
                let _ = close(fd);
            }
        }
    }

    /// Close both ends.
    pub fn close(&mut self) {
        self.close_read();
        self.close_write();
    }

    /// The descriptor to arm for read-readiness, if any.
    pub fn armed_read(&self) -> Option<RawFd> {
        if self.op == BufOp::Reading {
            self.read_end
        } else {
            None
        }
    }

    /// The descriptor to arm for write-readiness, if any.
    pub fn armed_write(&self) -> Option<RawFd> {
        if self.op == BufOp::Writing {
            self.write_end
        } else {
            None
        }
    }

    /// Whether this buffer can still make progress in its current
    /// direction, i.e. whether the event loop must keep it alive.
    pub fn progressing(&self) -> bool {
        match self.op {
            BufOp::Writing => self.write_end.is_some(),
            BufOp::Reading => self.read_end.is_some(),
            BufOp::Idle => false,
        }
    }

    /// Read into the payload if armed and ready; append a tagged copy to
    /// the log; flip to `Writing`, or drop the payload if the write end
    /// is already closed. Returns whether bytes moved.
    fn do_read(&mut self) -> bool {
        let fd = match (self.op, self.read_end) {
            (BufOp::Reading, Some(fd)) => fd,
            _ => return false,
        };
        match read(fd, &mut self.data) {
            Ok(0) => {
                self.close();
                self.op = BufOp::Idle;
                false
            }
            Ok(n) => {
                self.size = n;
                self.off = 0;
                logbuf::log_add(self.sign, &self.data[..n]);
                if self.write_end.is_some() {
                    self.op = BufOp::Writing;
                } else {
                    self.size = 0;
                }
                true
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => false,
            Err(_) => {
                self.close();
                self.op = BufOp::Idle;
                false
            }
        }
    }

    /// Write the remaining pending bytes if armed and ready; flip back to
    /// `Reading` once drained, unless the read end is already closed.
    fn do_write(&mut self) -> bool {
        let fd = match (self.op, self.write_end) {
            (BufOp::Writing, Some(fd)) => fd,
            _ => return false,
        };
        if self.size <= self.off {
            return false;
        }
        match write(fd, &self.data[self.off..self.size]) {
            Ok(n) if n > 0 => {
                self.off += n;
                if self.off >= self.size {
                    self.size = 0;
                    self.off = 0;
                    if self.read_end.is_some() {
                        self.op = BufOp::Reading;
                    }
                }
                true
            }
            Ok(_) => {
                self.close();
                self.op = BufOp::Idle;
                false
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => false,
            Err(_) => {
                self.close();
                self.op = BufOp::Idle;
                false
            }
        }
    }

    /// Run `do_read` only if this buffer's read end is in `readfds`.
    pub fn do_read_if(&mut self, readfds: &FdSet) -> bool {
        match self.armed_read() {
            Some(fd) if readfds.contains(fd) => self.do_read(),
            _ => false,
        }
    }

    /// Run `do_write` only if this buffer's write end is in `writefds`.
    pub fn do_write_if(&mut self, writefds: &FdSet) -> bool {
        match self.armed_write() {
            Some(fd) if writefds.contains(fd) => self.do_write(),
            _ => false,
        }
    }

    /// Probe both ends with `fstat`; close any end the kernel no longer
    /// knows about. A resilience measure against losing track of a
    /// descriptor that was closed out from under the engine.
    pub fn may_close(&mut self) {
        if let Some(fd) = self.read_end {
            if fstat(fd).is_err() {
                self.close_read();
            }
        }
        if let Some(fd) = self.write_end {
            if fstat(fd).is_err() {
                self.close_write();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::unistd::pipe;

    fn set_nonblocking(fd: RawFd) {
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).unwrap();
    }

    /// A buffer wired to two independent pipes, one feeding `read_end` and
    /// one draining `write_end`, the way a real stream buffer ends up once
    /// the engine aliases it to distinct descriptors. Returns the buffer
    /// plus the test-side ends: `src_w` feeds input, `dst_r` observes
    /// output.
    fn wired_buffer() -> (Buffer, RawFd, RawFd) {
        let (src_r, src_w) = pipe().unwrap();
        let (dst_r, dst_w) = pipe().unwrap();
        set_nonblocking(src_r);
        set_nonblocking(dst_w);
        let mut buf = Buffer::new("test", b'#');
        buf.read_end = Some(src_r);
        buf.write_end = Some(dst_w);
        buf.start();
        (buf, src_w, dst_r)
    }

    #[test]
    fn start_transitions_idle_to_reading() {
        let mut buf = Buffer::new("test", b'#');
        assert_eq!(buf.op(), BufOp::Idle);
        buf.start();
        assert_eq!(buf.op(), BufOp::Reading);
    }

    #[test]
    fn do_read_fills_payload_and_flips_to_writing() {
        let (mut buf, src_w, dst_r) = wired_buffer();
        write(src_w, b"hi").unwrap();

        let mut readfds = FdSet::new();
        readfds.insert(buf.read_end.unwrap());
        assert!(buf.do_read_if(&readfds));
        assert_eq!(buf.op(), BufOp::Writing);
        assert_eq!(buf.size, 2);
        assert_eq!(buf.off, 0);

        let mut writefds = FdSet::new();
        writefds.insert(buf.write_end.unwrap());
        assert!(buf.do_write_if(&writefds));
        let mut out = [0u8; 8];
        let n = read(dst_r, &mut out).unwrap();
        assert_eq!(&out[..n], b"hi");

        let _ = close(src_w);
        let _ = close(dst_r);
        buf.close();
    }

    #[test]
    fn do_read_drops_payload_when_write_end_already_closed() {
        let (src_r, src_w) = pipe().unwrap();
        set_nonblocking(src_r);
        let mut buf = Buffer::new("test", b'#');
        buf.read_end = Some(src_r);
        buf.start();

        write(src_w, b"x").unwrap();
        let mut readfds = FdSet::new();
        readfds.insert(src_r);
        assert!(buf.do_read_if(&readfds));
        // No write end to flip to: stays Reading, payload dropped.
        assert_eq!(buf.op(), BufOp::Reading);
        assert_eq!(buf.size, 0);

        let _ = close(src_w);
        buf.close_read();
    }

    #[test]
    fn do_write_stays_in_writing_when_read_end_closed_after_drain() {
        let (dst_r, dst_w) = pipe().unwrap();
        set_nonblocking(dst_w);
        let mut buf = Buffer::new("test", b'#');
        buf.write_end = Some(dst_w);
        // No read end: simulates the last payload a now-closed read side
        // handed off before going away.
        buf.op = BufOp::Writing;
        buf.data[0] = b'y';
        buf.size = 1;
        buf.off = 0;

        let mut writefds = FdSet::new();
        writefds.insert(dst_w);
        assert!(buf.do_write_if(&writefds));
        assert_eq!(buf.op(), BufOp::Writing);
        assert_eq!(buf.size, 0);
        assert_eq!(buf.off, 0);

        // Drained and inert: re-entering Writing moves nothing further.
        assert!(!buf.do_write_if(&writefds));

        let mut out = [0u8; 4];
        let n = read(dst_r, &mut out).unwrap();
        assert_eq!(&out[..n], b"y");

        let _ = close(dst_r);
        buf.close_write();
    }

    #[test]
    fn do_read_eof_closes_both_ends_and_goes_idle() {
        let (src_r, src_w) = pipe().unwrap();
        set_nonblocking(src_r);
        let mut buf = Buffer::new("test", b'#');
        buf.read_end = Some(src_r);
        buf.start();
        close(src_w).unwrap();

        let mut readfds = FdSet::new();
        readfds.insert(src_r);
        assert!(!buf.do_read_if(&readfds));
        assert_eq!(buf.op(), BufOp::Idle);
        assert!(buf.read_end.is_none());
        assert!(buf.write_end.is_none());
    }

    #[test]
    fn eagain_on_read_is_a_silent_no_op() {
        let (src_r, src_w) = pipe().unwrap();
        set_nonblocking(src_r);
        let mut buf = Buffer::new("test", b'#');
        buf.read_end = Some(src_r);
        buf.start();

        let mut readfds = FdSet::new();
        readfds.insert(src_r);
        assert!(!buf.do_read_if(&readfds));
        assert_eq!(buf.op(), BufOp::Reading);
        assert_eq!(buf.size, 0);

        buf.close_read();
        let _ = close(src_w);
    }
}
