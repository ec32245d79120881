// Licensed under the Apache-2.0 license

//! A child process driven over a pseudo-terminal, with pattern matching on
//! its output.

use crate::error::{ConsoleError, Result};
use crate::multiplexed_log::command_line;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::unistd::{setsid, Pid};
use regex::bytes::Regex;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 4096;
const CLOSE_POLLS: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a spawn was shut down by [`Spawn::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseType {
    /// The process exited by itself once the terminal was hung up.
    Normal,
    /// The process had to be killed with SIGKILL.
    Killed,
}

/// Result of [`Spawn::check_alive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Liveness {
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub description: String,
}

/// Describe how a process terminated, e.g. `status 1` or `signal 2 (SIGINT)`.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("status {code}")
    } else if let Some(sig) = status.signal() {
        match Signal::try_from(sig) {
            Ok(name) => format!("signal {sig} ({})", name.as_str()),
            Err(_) => format!("signal {sig}"),
        }
    } else {
        "unknown".to_string()
    }
}

/// Escape sequences removed from the output. Final bytes may be either case.
const VT100_PATTERN: &str = r"(?i-u)(?:\x1b\[|\x9b)[^@-_]*[@-_]|\x1b[@-_]";
/// An escape sequence cut off at the end of a read.
const VT100_PARTIAL_PATTERN: &str = r"(?i-u)(?:(?:\x1b\[|\x9b)[^@-_]*|\x1b)\z";

fn nix_err(err: Errno) -> ConsoleError {
    ConsoleError::Io(err.into())
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ConsoleError::Protocol(e.to_string()))
}

/// Open a pseudo-terminal in raw mode. Returns the master and slave ends.
fn open_raw_pty() -> Result<(OwnedFd, OwnedFd)> {
    let pty = openpty(None, None).map_err(nix_err)?;
    // SAFETY: openpty returned two newly opened descriptors owned by nothing
    // else.
    let (master, slave) = unsafe {
        (
            OwnedFd::from_raw_fd(pty.master),
            OwnedFd::from_raw_fd(pty.slave),
        )
    };
    for fd in [&master, &slave] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(nix_err)?;
    }
    let mut termios = tcgetattr(slave.as_raw_fd()).map_err(nix_err)?;
    cfmakeraw(&mut termios);
    tcsetattr(slave.as_raw_fd(), SetArg::TCSANOW, &termios).map_err(nix_err)?;
    Ok((master, slave))
}

/// Owns a child process running on a pseudo-terminal, which forms the byte
/// channel to a DUT.
///
/// The terminal is in raw mode, so bytes pass unchanged in both directions
/// and any echo comes from the DUT itself. Output is collected by a reader
/// thread and delivered in arrival order, so `expect` never blocks longer
/// than its timeout.
pub struct Spawn {
    child: Child,
    writer: Option<File>,
    rx: Receiver<Vec<u8>>,
    vt100: Regex,
    vt100_partial: Regex,
    /// Start of an escape sequence waiting for the rest of its bytes.
    escape_tail: Vec<u8>,
    buf: Vec<u8>,
    before: Vec<u8>,
    after: Vec<u8>,
    output: Vec<u8>,
    exit: Option<ExitStatus>,
    close_type: Option<CloseType>,
    /// Receives a copy of every byte read from the child.
    pub logfile_read: Option<Box<dyn Write + Send>>,
}

impl Spawn {
    /// Start `cmd` in a new session whose controlling terminal is a fresh
    /// pseudo-terminal, with stdin, stdout and stderr all attached to it.
    pub fn new(cmd: &mut Command) -> Result<Self> {
        let cmdline = command_line(cmd);
        log::debug!("spawning {cmdline}");
        let (master, slave) = open_raw_pty()?;
        cmd.stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        // SAFETY: the hook only makes async-signal-safe system calls.
        unsafe {
            cmd.pre_exec(|| {
                setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let res = cmd.spawn();
        // The command holds its copies of the slave until they are replaced;
        // the master only sees a hangup once every copy is closed.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = res.map_err(|e| ConsoleError::SpawnFailure(format!("{cmdline}: {e}")))?;

        let (tx, rx) = mpsc::channel();
        let reader = File::from(master.try_clone()?);
        thread::spawn(move || pump(reader, tx));

        Ok(Self {
            writer: Some(File::from(master)),
            child,
            rx,
            vt100: compile(VT100_PATTERN)?,
            vt100_partial: compile(VT100_PARTIAL_PATTERN)?,
            escape_tail: vec![],
            buf: vec![],
            before: vec![],
            after: vec![],
            output: vec![],
            exit: None,
            close_type: None,
            logfile_read: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write `data` to the child. Each call is written in full before
    /// returning.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(ConsoleError::Eof("terminal closed".into()));
        };
        let res = writer.write_all(data).and_then(|_| writer.flush());
        match res {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    || e.raw_os_error() == Some(Errno::EIO as i32) =>
            {
                Err(ConsoleError::Eof(self.exit_description()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait up to `timeout` for one chunk of output and append it to the
    /// pending buffer.
    fn fill(&mut self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                if let Some(logfile) = self.logfile_read.as_mut() {
                    logfile.write_all(&chunk)?;
                }
                let mut data = std::mem::take(&mut self.escape_tail);
                data.extend_from_slice(&chunk);
                if let Some(m) = self.vt100_partial.find(&data) {
                    self.escape_tail = data.split_off(m.start());
                }
                let text = self.vt100.replace_all(&data, &b""[..]);
                self.buf.extend_from_slice(&text);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ConsoleError::Eof(self.exit_description()))
            }
        }
    }

    /// Return up to `max` bytes of pending output, waiting up to `timeout`
    /// if there is none.
    pub fn read_nonblocking(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        if self.buf.is_empty() {
            self.fill(timeout)?;
        }
        if self.buf.is_empty() {
            return Err(ConsoleError::Timeout {
                waiting_for: "output".into(),
                timeout,
            });
        }
        let n = max.min(self.buf.len());
        let data: Vec<u8> = self.buf.drain(..n).collect();
        self.output.extend_from_slice(&data);
        Ok(data)
    }

    /// Wait until one of `patterns` matches the pending output.
    ///
    /// Returns the index of the pattern whose match starts earliest; equal
    /// starts go to the pattern listed first. Text before the match is
    /// available from [`Spawn::before`] and the match from [`Spawn::after`].
    ///
    /// A `timeout` too large to represent as a deadline, such as
    /// [`Duration::MAX`], waits forever.
    pub fn expect(&mut self, patterns: &[&Regex], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let mut earliest: Option<(usize, usize, usize)> = None;
            for (i, pattern) in patterns.iter().enumerate() {
                if let Some(m) = pattern.find(&self.buf) {
                    if earliest.map_or(true, |(_, start, _)| m.start() < start) {
                        earliest = Some((i, m.start(), m.end()));
                    }
                }
            }
            if let Some((i, start, end)) = earliest {
                self.before = self.buf[..start].to_vec();
                self.after = self.buf[start..end].to_vec();
                self.output.extend(self.buf.drain(..end));
                return Ok(i);
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Err(ConsoleError::Timeout {
                    waiting_for: patterns
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" | "),
                    timeout,
                });
            }
            self.fill(remaining)?;
        }
    }

    /// Output preceding the last match.
    pub fn before(&self) -> &[u8] {
        &self.before
    }

    /// Text of the last match.
    pub fn after(&self) -> &[u8] {
        &self.after
    }

    /// Output received but not yet consumed by `expect`.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Discard unconsumed output, keeping it in the output history.
    pub fn clear_pending(&mut self) {
        self.output.append(&mut self.buf);
    }

    /// Everything consumed since the process was started.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Deliver `sig` to the child. Does nothing if it has already exited.
    pub fn kill(&mut self, sig: Signal) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        log::debug!("sending {sig} to pid {}", self.pid());
        kill(Pid::from_raw(self.pid() as i32), sig).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    pub fn check_alive(&mut self) -> Liveness {
        let alive = self.is_alive();
        Liveness {
            alive,
            exit_code: self.exit.and_then(|s| s.code()),
            description: self.exit_description(),
        }
    }

    fn exit_description(&mut self) -> String {
        // Output closes slightly before the process can be reaped.
        for _ in 0..10 {
            if !self.is_alive() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        match &self.exit {
            Some(status) => describe_exit(status),
            None => "running".to_string(),
        }
    }

    /// Close the terminal, send SIGHUP and reap the child, killing it if it
    /// does not exit within 10 seconds. Calling this again returns the first
    /// result.
    pub fn close(&mut self) -> Result<CloseType> {
        if let Some(close_type) = self.close_type {
            return Ok(close_type);
        }
        self.writer = None;
        // A closed terminal hangs up its session.
        self.kill(Signal::SIGHUP)?;
        let mut close_type = CloseType::Normal;
        for _ in 0..CLOSE_POLLS {
            if !self.is_alive() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        if self.is_alive() {
            self.kill(Signal::SIGKILL)?;
            close_type = CloseType::Killed;
        }
        if self.exit.is_none() {
            self.exit = Some(self.child.wait()?);
        }
        self.close_type = Some(close_type);
        Ok(close_type)
    }

    pub fn is_closed(&self) -> bool {
        self.close_type.is_some()
    }
}

impl Drop for Spawn {
    fn drop(&mut self) {
        if self.close_type.is_some() {
            return;
        }
        self.writer = None;
        if self.is_alive() {
            let _ = self.kill(Signal::SIGKILL);
        }
        let _ = self.child.wait();
    }
}

fn pump(mut src: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match src.read(&mut buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the last holder of the slave side has gone.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}
