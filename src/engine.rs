//! The multiplexing I/O engine: spawn, event loop, and shutdown.
//!
//! This is the core of the launcher: four bounded buffers (`in`, `out`,
//! `err`, `log`), a descriptor-driven event loop with a 1ms readiness
//! poll, opportunistic child reaping, and the shutdown sequence that
//! drains the log and translates the child's exit disposition into this
//! process's own exit code.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::stat::Mode;
use nix::sys::time::{TimeVal, TimeValLike};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup, dup2, execvp, fork, unlink, ForkResult, Pid};

use crate::buffer::Buffer;
use crate::config::Config;
use crate::logbuf::{self, LogBuffer, TAG_LOG};
use crate::signal;

/// Idle-spin cap: if a readiness wait reports ready but no transfer moved
/// a byte, sleep this long before resuming.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// The running engine: the three stream buffers, the log buffer, and the
/// reaped child's pid.
pub struct Engine {
    in_buf: Buffer,
    out_buf: Buffer,
    err_buf: Buffer,
    log_buf: LogBuffer,
    child: Pid,
}

impl Engine {
    /// Open the log file, create the three stream pipes, fork and exec
    /// the configured child, and assemble the parent-side engine.
    pub fn spawn(config: &Config) -> Result<Self> {
        let _ = unlink(config.logfile());
        let log_fd = open(
            config.logfile(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o644),
        )
        .with_context(|| format!("open log file {}", config.logfile().display()))?;

        let mut command_line = config.exec().display().to_string();
        for arg in config.args() {
            command_line.push(' ');
            command_line.push_str(arg);
        }
        command_line.push_str("\n\n");
        logbuf::log_add(TAG_LOG, command_line.as_bytes());
        let log_buf = LogBuffer::new(log_fd);

        let mut in_buf = Buffer::new("stdin", logbuf::TAG_STDIN);
        let mut out_buf = Buffer::new("stdout", logbuf::TAG_STDOUT);
        let mut err_buf = Buffer::new("stderr", logbuf::TAG_STDERR);
        in_buf.open_pipe().context("open stdin pipe")?;
        out_buf.open_pipe().context("open stdout pipe")?;
        err_buf.open_pipe().context("open stderr pipe")?;

        match unsafe { fork() }.context("fork")? {
            ForkResult::Child => Self::exec_child(config, in_buf, out_buf, err_buf),
            ForkResult::Parent { child } => {
                // Parent role: alias the real standard streams over the
                // ends the child doesn't use, matching spec.md §4.1.
                in_buf.close_read();
                in_buf.read_end = Some(libc::STDIN_FILENO);
                out_buf.close_write();
                out_buf.write_end = Some(libc::STDOUT_FILENO);
                err_buf.close_write();
                err_buf.write_end = Some(libc::STDERR_FILENO);

                signal::install().context("install signal handlers")?;

                in_buf.start();
                out_buf.start();
                err_buf.start();

                debug!("spawned child pid={}", child);
                Ok(Self {
                    in_buf,
                    out_buf,
                    err_buf,
                    log_buf,
                    child,
                })
            }
        }
    }

    /// Child role: replace descriptors 0/1/2 with the pipe ends the child
    /// should use, close the parent-side ends, and exec the configured
    /// program with `argv[0]` replaced. Restores the original standard
    /// descriptors and reports a diagnostic if exec fails.
    fn exec_child(config: &Config, mut in_buf: Buffer, mut out_buf: Buffer, mut err_buf: Buffer) -> ! {
        let stdin_copy = dup(libc::STDIN_FILENO).ok();
        let stdout_copy = dup(libc::STDOUT_FILENO).ok();
        let stderr_copy = dup(libc::STDERR_FILENO).ok();

        let child_stdin = in_buf.read_end;
        in_buf.close_write();
        if let Some(fd) = child_stdin {
            let _ = dup2(fd, libc::STDIN_FILENO);
        }

        let child_stdout = out_buf.write_end;
        out_buf.close_read();
        if let Some(fd) = child_stdout {
            let _ = dup2(fd, libc::STDOUT_FILENO);
        }

        let child_stderr = err_buf.write_end;
        err_buf.close_read();
        if let Some(fd) = child_stderr {
            let _ = dup2(fd, libc::STDERR_FILENO);
        }

        let exec_path = CString::new(config.exec().as_os_str().as_bytes())
            .unwrap_or_else(|_| CString::new("/bin/sh").unwrap());
        let mut argv = vec![exec_path.clone()];
        argv.extend(config.args().iter().filter_map(|a| CString::new(a.as_str()).ok()));

        let err = execvp(exec_path.as_c_str(), &argv).unwrap_err();

        if let Some(fd) = stdin_copy {
            let _ = dup2(fd, libc::STDIN_FILENO);
        }
        if let Some(fd) = stdout_copy {
            let _ = dup2(fd, libc::STDOUT_FILENO);
        }
        if let Some(fd) = stderr_copy {
            let _ = dup2(fd, libc::STDERR_FILENO);
        }
        eprintln!(
            "iolog: execvp(\"{}\", ...) failed: {}",
            config.exec().display(),
            err
        );
        std::process::exit(libc::EXIT_FAILURE);
    }

    /// Run the event loop to completion, returning the exit code to
    /// propagate to the launcher's own process.
    pub fn run(mut self) -> Result<i32> {
        let mut reaped_status: Option<WaitStatus> = None;

        loop {
            let mut readfds = FdSet::new();
            let mut writefds = FdSet::new();
            let mut max_fd: Option<RawFd> = None;
            let mut arm = |fd: RawFd, set: &mut FdSet, max_fd: &mut Option<RawFd>| {
                set.insert(fd);
                *max_fd = Some(max_fd.map_or(fd, |m| m.max(fd)));
            };

            for fd in self
                .in_buf
                .armed_read()
                .into_iter()
                .chain(self.out_buf.armed_read())
                .chain(self.err_buf.armed_read())
            {
                arm(fd, &mut readfds, &mut max_fd);
            }
            for fd in self
                .in_buf
                .armed_write()
                .into_iter()
                .chain(self.out_buf.armed_write())
                .chain(self.err_buf.armed_write())
                .chain(self.log_buf.armed_write())
            {
                arm(fd, &mut writefds, &mut max_fd);
            }

            if max_fd.is_none() {
                break;
            }

            let mut timeout = TimeVal::milliseconds(1);
            let ready = match select(None, &mut readfds, &mut writefds, None, &mut timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!("select failed: {}", e);
                    break;
                }
            };

            let mut moved = false;
            if ready > 0 {
                moved |= self.in_buf.do_read_if(&readfds);
                moved |= self.out_buf.do_read_if(&readfds);
                moved |= self.err_buf.do_read_if(&readfds);
                moved |= self.in_buf.do_write_if(&writefds);
                moved |= self.out_buf.do_write_if(&writefds);
                moved |= self.err_buf.do_write_if(&writefds);
                moved |= self.log_buf.do_write_if(&writefds);
            }

            self.in_buf.may_close();
            self.out_buf.may_close();
            self.err_buf.may_close();
            if logbuf::child_gone() {
                self.in_buf.close_read();
            }

            // A waitpid error mid-loop is treated the same as "still
            // alive": only a terminal status (not StillAlive) marks the
            // child gone, matching the accepted source quirk that an
            // error here never short-circuits the loop.
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => reaped_status = Some(status),
                Err(e) => debug!("waitpid failed: {}", e),
            }

            if self.should_stop(reaped_status.is_some()) {
                break;
            }

            if ready > 0 && !moved {
                sleep(IDLE_SLEEP);
            }
        }

        let status = match reaped_status {
            Some(s) => s,
            None => waitpid(self.child, None).context("final waitpid")?,
        };
        let code = exit_code_from_status(&status);
        debug!("exit code will be {}", code);

        logbuf::log_add_internal(b"\n");
        let _ = self.log_buf.flush_once();

        self.in_buf.close();
        self.out_buf.close();
        self.err_buf.close();
        self.log_buf.close();

        Ok(code)
    }

    /// The loop exits only once every stream buffer is inert, the log
    /// buffer has nothing pending (or its write end is closed), and the
    /// child has been reaped.
    fn should_stop(&self, child_gone: bool) -> bool {
        let streams_done = !self.in_buf.progressing()
            && !self.out_buf.progressing()
            && !self.err_buf.progressing();
        let log_done = !self.log_buf.pending();
        streams_done && log_done && child_gone
    }
}

/// Translate a child's wait disposition into this process's exit code.
fn exit_code_from_status(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, sig, _) => 128 + *sig as i32,
        WaitStatus::Stopped(_, sig) => 128 + *sig as i32,
        _ => 128,
    }
}
