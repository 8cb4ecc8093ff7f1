//! The log buffer: an append-only, tag-framed annotation sink shared
//! between the event loop and the signal handler.
//!
//! The handler must be able to append without being passed any context, so
//! the underlying storage is a process-wide singleton. Appends are
//! signal-safe: no allocation, no locks, just a bounded compare-and-add
//! reservation into a fixed byte region.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use anyhow::Result;
use nix::errno::Errno;
use nix::unistd::{close, write};

/// Capacity of the in-memory log buffer; bounds the burst of annotations
/// produced between two successful log file writes.
pub const LOG_CAP: usize = 2048;

/// Tag bytes used to frame a block in the log, one per logical source.
pub const TAG_STDIN: u8 = b'<';
pub const TAG_STDOUT: u8 = b'>';
pub const TAG_STDERR: u8 = b'!';
pub const TAG_LOG: u8 = b'=';
pub const TAG_SIGNAL: u8 = b'*';
const TAG_NONE: u8 = b'?';

struct Shared {
    data: UnsafeCell<[u8; LOG_CAP]>,
    size: AtomicUsize,
    last_tag: AtomicU8,
    child_gone: AtomicBool,
}

// SAFETY: every byte slot in `data` is written through exactly one call to
// `reserve_one`, which hands out each index to exactly one writer via a
// compare-exchange loop on `size`. Readers only ever look at `[0..n)` for
// an `n` previously observed from `size.load`, and only from the main
// thread, which is the only reader.
unsafe impl Sync for Shared {}

static SHARED: Shared = Shared {
    data: UnsafeCell::new([0u8; LOG_CAP]),
    size: AtomicUsize::new(0),
    last_tag: AtomicU8::new(TAG_NONE),
    child_gone: AtomicBool::new(false),
};

/// Reserve the next free byte slot, or `None` if the buffer is full.
/// Safe to call from a signal handler.
fn reserve_one() -> Option<usize> {
    let mut cur = SHARED.size.load(Ordering::Relaxed);
    loop {
        if cur >= LOG_CAP {
            return None;
        }
        match SHARED
            .size
            .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return Some(cur),
            Err(actual) => cur = actual,
        }
    }
}

fn push_byte(b: u8) -> bool {
    match reserve_one() {
        Some(idx) => {
            // SAFETY: `idx` was exclusively reserved above.
            unsafe { (*SHARED.data.get())[idx] = b };
            true
        }
        None => false,
    }
}

/// Append raw bytes without going through the tag-framing state machine.
/// Used for the initial command-line entry and the trailing newline.
pub fn log_add_internal(bytes: &[u8]) {
    for &b in bytes {
        if !push_byte(b) {
            break;
        }
    }
}

/// Append bytes tagged `tag`, framing consecutive same-tag runs as a
/// single block: a `LF tag tag SP` prefix precedes the first byte of a new
/// tag, an embedded LF is elided and resets the framing state instead of
/// being copied verbatim.
pub fn log_add(tag: u8, bytes: &[u8]) {
    for &b in bytes {
        if SHARED.size.load(Ordering::Relaxed) >= LOG_CAP {
            break;
        }
        let prev = SHARED.last_tag.load(Ordering::Acquire);
        if prev != tag {
            SHARED.last_tag.store(tag, Ordering::Release);
            let prefix = [b'\n', tag, tag, b' '];
            if prefix.iter().any(|&p| !push_byte(p)) {
                break;
            }
        }
        if b == b'\n' {
            SHARED.last_tag.store(TAG_NONE, Ordering::Release);
        } else if !push_byte(b) {
            break;
        }
    }
}

/// Current number of committed bytes in the log buffer.
pub fn size() -> usize {
    SHARED.size.load(Ordering::Acquire)
}

/// Borrow the committed byte range `[start, end)`. Callers must only ask
/// for indices already returned by `size()`.
pub fn bytes(start: usize, end: usize) -> &'static [u8] {
    // SAFETY: only indices below a previously observed `size()` are ever
    // requested, and those slots are fully written before `size` advances
    // past them.
    unsafe { &(*SHARED.data.get())[start..end] }
}

/// Flag set by the signal handler on `SIGCHLD`.
pub fn mark_child_gone() {
    SHARED.child_gone.store(true, Ordering::Release);
}

/// Whether `SIGCHLD` has been observed since startup.
pub fn child_gone() -> bool {
    SHARED.child_gone.load(Ordering::Acquire)
}

/// The asymmetric log buffer: no read end, `size` lives in the shared
/// singleton above, `off`/`write_end` are owned by the event loop alone.
pub struct LogBuffer {
    write_end: Option<RawFd>,
    off: usize,
}

impl LogBuffer {
    /// Take ownership of an already-open log file descriptor.
    pub fn new(write_end: RawFd) -> Self {
        Self {
            write_end: Some(write_end),
            off: 0,
        }
    }

    /// The log buffer is pinned in WRITE and is armed whenever its write
    /// end is open, matching how the stream buffers are armed purely by
    /// `op` rather than by whether bytes are actually pending.
    pub fn armed_write(&self) -> Option<RawFd> {
        self.write_end
    }

    /// Whether there are committed bytes not yet written to the log file.
    pub fn pending(&self) -> bool {
        self.write_end.is_some() && self.off < size()
    }

    /// Attempt one write of the remaining pending bytes.
    pub fn flush_once(&mut self) -> Result<usize> {
        let fd = match self.write_end {
            Some(fd) => fd,
            None => return Ok(0),
        };
        let total = size();
        if self.off >= total {
            return Ok(0);
        }
        match write(fd, bytes(self.off, total)) {
            Ok(0) => {
                self.close();
                Ok(0)
            }
            Ok(n) => {
                self.off += n;
                Ok(n)
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => Ok(0),
            Err(_) => {
                self.close();
                Ok(0)
            }
        }
    }

    /// Call `flush_once` only if `fd` is in the ready set.
    pub fn do_write_if(&mut self, writefds: &nix::sys::select::FdSet) -> bool {
        match self.write_end {
            Some(fd) if writefds.contains(fd) => self.flush_once().unwrap_or(0) > 0,
            _ => false,
        }
    }

    /// Drain any pending bytes before closing; on a still-pending write
    /// this also emits one bonus trailing LF directly to the descriptor.
    pub fn close(&mut self) {
        if let Some(fd) = self.write_end.take() {
            let total = size();
            if self.off < total {
                let _ = write(fd, bytes(self.off, total));
                let _ = write(fd, b"\n");
            }
            let _ = close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The log buffer is a process-wide singleton; serialize tests that
    // touch it so they don't observe each other's appends.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn reset() {
        SHARED.size.store(0, Ordering::SeqCst);
        SHARED.last_tag.store(TAG_NONE, Ordering::SeqCst);
        SHARED.child_gone.store(false, Ordering::SeqCst);
    }

    #[test]
    fn frames_tag_switch_with_prefix() {
        let _g = TEST_LOCK.lock().unwrap();
        reset();
        log_add(TAG_STDIN, b"hi");
        log_add(TAG_STDOUT, b"yo");
        let n = size();
        assert_eq!(bytes(0, n), b"\n<< hi\n>> yo");
    }

    #[test]
    fn elides_embedded_lf_and_resets_tag() {
        let _g = TEST_LOCK.lock().unwrap();
        reset();
        log_add(TAG_STDIN, b"hello\n");
        log_add(TAG_STDOUT, b"hello\n");
        let n = size();
        assert_eq!(bytes(0, n), b"\n<< hello\n>> hello");
    }

    #[test]
    fn coalesces_runs_of_the_same_tag() {
        let _g = TEST_LOCK.lock().unwrap();
        reset();
        log_add(TAG_STDOUT, b"ab");
        log_add(TAG_STDOUT, b"cd");
        let n = size();
        assert_eq!(bytes(0, n), b"\n>> abcd");
    }

    #[test]
    fn overflow_is_silently_dropped_without_corrupting_prior_bytes() {
        let _g = TEST_LOCK.lock().unwrap();
        reset();
        let filler = vec![b'x'; LOG_CAP];
        log_add_internal(&filler);
        assert_eq!(size(), LOG_CAP);
        log_add(TAG_SIGNAL, b"overflow");
        assert_eq!(size(), LOG_CAP);
        assert_eq!(bytes(0, 4), b"xxxx");
    }

    #[test]
    fn child_gone_flag_round_trips() {
        let _g = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!child_gone());
        mark_child_gone();
        assert!(child_gone());
    }
}
