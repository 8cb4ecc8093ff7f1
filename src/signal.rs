//! Signal intake: a single handler installed for every signal in
//! `SIGHUP..=SIGSYS` that annotates the log buffer and flags `SIGCHLD` for
//! the event loop. Performs no descriptor I/O and no allocation.

use std::convert::TryFrom;
use std::io::Write as _;

use anyhow::Result;
use log::debug;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::logbuf::{self, TAG_SIGNAL};

/// Signal name table indexed by number, covering `SIGHUP` (1) through
/// `SIGSYS` (31). Numbers absent from the table fall back to a bare digit.
const SIGNAL_NAMES: &[(i32, &str)] = &[
    (1, "SIGHUP"),
    (2, "SIGINT"),
    (3, "SIGQUIT"),
    (4, "SIGILL"),
    (5, "SIGTRAP"),
    (6, "SIGABRT"),
    (7, "SIGBUS"),
    (8, "SIGFPE"),
    (9, "SIGKILL"),
    (10, "SIGUSR1"),
    (11, "SIGSEGV"),
    (12, "SIGUSR2"),
    (13, "SIGPIPE"),
    (14, "SIGALRM"),
    (15, "SIGTERM"),
    (16, "SIGSTKFLT"),
    (17, "SIGCHLD"),
    (18, "SIGCONT"),
    (19, "SIGSTOP"),
    (20, "SIGTSTP"),
    (21, "SIGTTIN"),
    (22, "SIGTTOU"),
    (23, "SIGURG"),
    (24, "SIGXCPU"),
    (25, "SIGXFSZ"),
    (26, "SIGVTALRM"),
    (27, "SIGPROF"),
    (28, "SIGWINCH"),
    (29, "SIGIO"),
    (30, "SIGPWR"),
    (31, "SIGSYS"),
];

extern "C" fn handle_signal(signum: libc::c_int) {
    let mut buf = [0u8; 32];
    let n = format_signal(signum, &mut buf);
    logbuf::log_add(TAG_SIGNAL, &buf[..n]);
    if signum == libc::SIGCHLD {
        logbuf::mark_child_gone();
    }
}

/// Format ` signal=<NAME> (<n>)\n` into `buf`, falling back to
/// ` signal=<n>\n` when `signum` is outside the fixed name table. Returns
/// the number of bytes written. Stack-only, allocation-free, signal-safe.
fn format_signal(signum: i32, buf: &mut [u8; 32]) -> usize {
    let cap = buf.len();
    let mut cursor: &mut [u8] = buf;
    let name = SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == signum)
        .map(|(_, name)| *name);
    let result = match name {
        Some(name) => write!(cursor, " signal={} ({})\n", name, signum),
        None => write!(cursor, " signal={}\n", signum),
    };
    match result {
        Ok(()) => cap - cursor.len(),
        Err(_) => 0,
    }
}

/// Install `handle_signal` for every signal in `SIGHUP..=SIGSYS`. Signals
/// that cannot be caught (`SIGKILL`, `SIGSTOP`) are skipped silently, as
/// the kernel rejects them.
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for (num, name) in SIGNAL_NAMES {
        let signal = match Signal::try_from(*num) {
            Ok(s) => s,
            Err(_) => continue,
        };
        // SAFETY: `handle_signal` only appends to the signal-safe log
        // buffer and sets an atomic flag.
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            debug!("could not install handler for {}: {}", name, e);
        }
    }
    Ok(())
}
