//! PTY creation and management.
//!
//! Spawns a login shell for each session inside a pseudo-terminal and
//! exposes the small set of operations the engine needs on the master side:
//! non-blocking reads, writes, resize, signalling and reaping.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execvpe, fork, setsid};
use std::ffi::CString;
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to set window size: {0}")]
    Resize(#[source] nix::Error),

    #[error("command is empty")]
    EmptyCommand,

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] std::ffi::NulError),

    #[error("working directory does not exist: {}", .0.display())]
    MissingCwd(PathBuf),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to write to PTY: {0}")]
    Write(#[source] nix::Error),
}

/// Read outcome of a single non-blocking poll of the master side.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// The slave side is gone (EIO); the child has most likely exited.
    Closed,
}

/// A process running in a PTY.
pub struct PtyProcess {
    /// The master side of the PTY.
    pub master: OwnedFd,
    /// The child process ID.
    pub pid: Pid,
    /// Terminal size.
    pub size: Winsize,
}

impl PtyProcess {
    /// Process ID as an unsigned value for display.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // PIDs are always positive
    pub fn pid_u32(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Check if the child process has exited without blocking.
    /// Returns `Some(exit_code)` if exited, None if still running.
    pub fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
            // All other states (StillAlive, Stopped, Continued, etc.) mean not exited yet
            _ => Ok(None),
        }
    }

    /// Wait for the child process to exit (blocking).
    pub fn wait(&self) -> Result<i32, PtyError> {
        match waitpid(self.pid, None).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
            status => {
                tracing::warn!(?status, "unexpected wait status");
                Ok(-1)
            }
        }
    }

    /// Non-blocking read from the master side.
    pub fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        // SAFETY: the fd is owned by self and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) };
        match nix::unistd::read(fd, buf) {
            Ok(0) | Err(nix::Error::EIO) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(nix::Error::EAGAIN) => ReadOutcome::Empty,
            Err(e) => {
                tracing::warn!(pid = %self.pid, %e, "PTY read error");
                ReadOutcome::Empty
            }
        }
    }

    /// Write all bytes to the master side.
    ///
    /// The master is non-blocking, so a full kernel buffer is retried
    /// briefly before giving up.
    pub fn write_all(&self, mut data: &[u8]) -> Result<(), PtyError> {
        // SAFETY: the fd is owned by self and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) };
        let mut retries = 0;
        while !data.is_empty() {
            match nix::unistd::write(fd, data) {
                Ok(n) => data = &data[n..],
                Err(nix::Error::EAGAIN) if retries < 50 => {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(PtyError::Write(e)),
            }
        }
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // TIOCSWINSZ ioctl
        unsafe {
            let ret = libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize);
            if ret < 0 {
                return Err(PtyError::Resize(nix::Error::last()));
            }
        }
        self.size = winsize;
        Ok(())
    }

    /// Hang up the child, escalate to SIGKILL after `grace`, and reap it.
    ///
    /// Blocks the calling thread; callers on the runtime should wrap this in
    /// `spawn_blocking`.
    pub fn terminate(self, grace: Duration) -> Option<i32> {
        if let Ok(Some(code)) = self.try_wait() {
            return Some(code);
        }
        // The shell is a session leader, so hang up the whole group.
        if let Err(e) = signal::killpg(self.pid, Signal::SIGHUP) {
            tracing::debug!(pid = %self.pid, %e, "SIGHUP to process group failed");
            self.signal(Signal::SIGHUP).ok();
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => return None,
            }
        }
        signal::killpg(self.pid, Signal::SIGKILL).ok();
        self.signal(Signal::SIGKILL).ok();
        self.wait().ok()
    }
}

/// Environment configuration for spawning.
#[derive(Debug, Default)]
pub struct SpawnEnv {
    /// Environment variables to set (key, value pairs).
    pub vars: Vec<(String, String)>,
    /// If true, clear the environment before setting vars.
    pub clear: bool,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
}

impl SpawnEnv {
    /// The child's environment as `KEY=value` strings.
    fn envp(&self) -> Result<Vec<CString>, PtyError> {
        let mut entries: Vec<Vec<u8>> = Vec::new();
        if !self.clear {
            entries.extend(
                std::env::vars_os()
                    .filter(|(key, _)| !self.vars.iter().any(|(k, _)| key.as_bytes() == k.as_bytes()))
                    .map(|(key, value)| [key.as_bytes(), b"=".as_slice(), value.as_bytes()].concat()),
            );
        }
        entries.extend(
            self.vars
                .iter()
                .map(|(key, value)| [key.as_bytes(), b"=".as_slice(), value.as_bytes()].concat()),
        );
        entries
            .into_iter()
            .map(CString::new)
            .collect::<Result<_, _>>()
            .map_err(PtyError::InvalidCommand)
    }
}

/// Spawn an interactive shell in `cwd`.
///
/// Agents are launched by typing into this shell, so the shell outlives the
/// agent and the user can keep working in the same terminal afterwards.
pub fn spawn_shell(
    shell: &str,
    cwd: &Path,
    rows: u16,
    cols: u16,
    vars: Vec<(String, String)>,
) -> Result<PtyProcess, PtyError> {
    let env = SpawnEnv {
        vars,
        clear: false,
        cwd: Some(cwd.to_path_buf()),
    };
    spawn_with_env(&[shell.to_string()], rows, cols, &env)
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), PtyError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(PtyError::OpenPty)
}

/// Close every descriptor above stderr. Runs in the forked child.
#[allow(clippy::cast_possible_truncation)]
fn close_inherited_fds() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain syscall, no allocation
        let ret = unsafe { libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32) };
        if ret == 0 {
            return;
        }
    }
    // SAFETY: closing descriptors we are about to lose on exec anyway
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max > 0 { max.min(65_536) } else { 1024 };
    for fd in 3..max {
        unsafe {
            libc::close(fd as libc::c_int);
        }
    }
}

/// Exit the forked child without running atexit handlers or flushing
/// buffers shared with the parent.
fn child_exit(code: libc::c_int) -> ! {
    // SAFETY: _exit is async-signal-safe
    unsafe { libc::_exit(code) }
}

/// Spawn a command in a new PTY with custom environment.
///
/// Everything the child needs is prepared before the fork; afterwards the
/// child only makes async-signal-safe calls until `exec`.
///
/// # Returns
///
/// A `PtyProcess` containing the master FD and child PID.
pub fn spawn_with_env(
    cmd: &[String],
    rows: u16,
    cols: u16,
    env: &SpawnEnv,
) -> Result<PtyProcess, PtyError> {
    if cmd.is_empty() {
        return Err(PtyError::EmptyCommand);
    }
    if let Some(cwd) = &env.cwd
        && !cwd.is_dir()
    {
        return Err(PtyError::MissingCwd(cwd.clone()));
    }

    let prog = CString::new(cmd[0].as_str()).map_err(PtyError::InvalidCommand)?;
    let args: Vec<CString> = cmd
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()
        .map_err(PtyError::InvalidCommand)?;
    let envp = env.envp()?;
    let cwd = env
        .cwd
        .as_ref()
        .map(|dir| CString::new(dir.as_os_str().as_bytes()))
        .transpose()
        .map_err(PtyError::InvalidCommand)?;

    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // Open a new PTY pair. Neither end may leak into shells forked later
    // for other sessions.
    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;
    set_cloexec(&master)?;
    set_cloexec(&slave)?;

    // Fork the process
    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            // Parent: close slave, keep master
            drop(slave);

            // Set master to non-blocking mode for async I/O
            let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
            let mut flags = OFlag::from_bits_retain(flags);
            flags.insert(OFlag::O_NONBLOCK);
            fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

            Ok(PtyProcess {
                master,
                pid: child,
                size: winsize,
            })
        }
        ForkResult::Child => {
            drop(master);
            // Closed wholesale below
            let slave_fd = slave.into_raw_fd();

            if setsid().is_err() {
                child_exit(1);
            }

            // SAFETY: raw libc calls on descriptors this process owns
            unsafe {
                // Set the slave as the controlling terminal
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                    child_exit(1);
                }
                // dup2 clears close-on-exec on the copies
                for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                    if libc::dup2(slave_fd, target) < 0 {
                        child_exit(1);
                    }
                }
            }
            close_inherited_fds();

            if let Some(cwd) = &cwd
                && unsafe { libc::chdir(cwd.as_ptr()) } < 0
            {
                child_exit(1);
            }

            let _ = execvpe(&prog, &args, &envp);
            // execvpe only returns on error
            child_exit(127)
        }
    }
}
