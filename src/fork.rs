//! Connections to forked helper processes.
//!
//! The child's stdout carries ordinary protocol records, stderr is logged line by line and
//! stdin is optional. The child runs in its own process group so a deadline kill takes its
//! descendants down with it.

use crate::connection::{ConnId, Connections, PeerKind};
use crate::error::{Error, Result};
use crate::protocol::{LineBuffer, MAX_RECORD_SIZE};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, AccessFlags, Pid};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Command, Stdio};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

/// How a forked child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
    /// Killed by us after its deadline.
    TimedOut,
    /// The exit status could not be collected.
    Lost,
}

impl ChildExit {
    pub fn is_success(self) -> bool {
        self == ChildExit::Exited(0)
    }
}

/// Hooks for code that owns a forked helper.
pub trait ForkObserver {
    /// Called exactly once, however the child ended.
    fn child_end(&mut self, _exit: &ChildExit) {}

    fn error_line(&mut self, _line: &str) {}
}

struct LogOnly;

impl ForkObserver for LogOnly {}

#[derive(Debug, Clone)]
pub struct ForkSpec {
    pub name: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Wall-clock limit, independent of the connection's silence timeout.
    pub timeout: Option<Duration>,
    pub with_stdin: bool,
}

impl ForkSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
            with_stdin: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_stdin(mut self) -> Self {
        self.with_stdin = true;
        self
    }
}

/// Process-side state of a forked connection.
pub struct ForkState {
    pid: i32,
    path: String,
    deadline: Option<Instant>,
    stdin: bool,
    ended: bool,
    reaped: bool,
    stderr: Option<pipe::Receiver>,
    stderr_lines: LineBuffer,
    observer: Box<dyn ForkObserver>,
}

impl ForkState {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the child reads commands on its stdin.
    pub fn has_stdin(&self) -> bool {
        self.stdin
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    pub(crate) fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    pub(crate) fn deadline_passed(&self, now: Instant) -> bool {
        !self.ended && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Report the end to the observer. Returns false when it was already reported.
    pub(crate) fn end(&mut self, exit: ChildExit) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        self.observer.child_end(&exit);
        true
    }

    pub(crate) fn kill_group(&self) {
        if let Err(e) = killpg(Pid::from_raw(self.pid), Signal::SIGKILL) {
            debug!(pid = self.pid, "killpg failed: {}", e);
        }
    }

    pub fn stop(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid), Signal::SIGSTOP)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid), Signal::SIGCONT)?;
        Ok(())
    }

    pub fn term(&self) -> Result<()> {
        killpg(Pid::from_raw(self.pid), Signal::SIGKILL)?;
        Ok(())
    }

    pub(crate) fn poll_stderr(&mut self, cx: &mut Context<'_>, conn: ConnId) -> Poll<()> {
        let mut progress = false;
        let mut buf = [0u8; 1024];
        while let Some(stderr) = self.stderr.as_mut() {
            let mut read_buf = ReadBuf::new(&mut buf);
            match Pin::new(stderr).poll_read(cx, &mut read_buf) {
                Poll::Pending => break,
                Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                    self.stderr = None;
                    progress = true;
                }
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    self.stderr_lines.push(&buf[..n]);
                    progress = true;
                }
                Poll::Ready(Err(e)) => {
                    debug!(%conn, pid = self.pid, "stderr read failed: {}", e);
                    self.stderr = None;
                    progress = true;
                }
            }
        }

        while let Some(line) = self.stderr_lines.next_line() {
            match line {
                Ok(line) => {
                    warn!(%conn, pid = self.pid, "{} error stream: {}", self.path, line);
                    self.observer.error_line(&line);
                }
                Err(e) => debug!(%conn, pid = self.pid, "unreadable stderr line: {}", e),
            }
        }

        if progress {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for ForkState {
    fn drop(&mut self) {
        if !self.ended && !self.reaped {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGINT);
        }
    }
}

/// Byte stream over the child's stdout and, when requested, its stdin.
pub struct ForkLink {
    stdout: pipe::Receiver,
    stdin: Option<pipe::Sender>,
}

impl AsyncRead for ForkLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ForkLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            // Without stdin there is nobody to read replies.
            None => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Start the child described by `spec`. Must run inside a tokio runtime.
pub fn spawn(spec: &ForkSpec, observer: Option<Box<dyn ForkObserver>>) -> Result<(ForkLink, ForkState)> {
    let path = spec.path.display().to_string();
    let spawn_error = |reason: String| Error::Spawn {
        path: path.clone(),
        reason,
    };

    access(&spec.path, AccessFlags::X_OK).map_err(|e| spawn_error(e.to_string()))?;

    let mut command = Command::new(&spec.path);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
    let pid = i32::try_from(child.id()).map_err(|e| spawn_error(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error("stderr not captured".to_string()))?;
    let stdout = pipe::Receiver::from_file(File::from(OwnedFd::from(stdout)))?;
    let stderr = pipe::Receiver::from_file(File::from(OwnedFd::from(stderr)))?;
    let stdin = match child.stdin.take() {
        Some(stdin) => Some(pipe::Sender::from_file(File::from(OwnedFd::from(stdin)))?),
        None => None,
    };

    info!(pid, "started {} {}", path, spec.args.join(" "));

    let has_stdin = stdin.is_some();
    let link = ForkLink { stdout, stdin };
    let state = ForkState {
        pid,
        path,
        deadline: spec.timeout.map(|timeout| Instant::now() + timeout),
        stdin: has_stdin,
        ended: false,
        reaped: false,
        stderr: Some(stderr),
        stderr_lines: LineBuffer::new(MAX_RECORD_SIZE),
        observer: observer.unwrap_or_else(|| Box::new(LogOnly)),
    };
    Ok((link, state))
}

/// Collect the exit status of `pid` without blocking.
pub fn try_reap(pid: i32) -> Option<ChildExit> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(ChildExit::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(ChildExit::Signaled(signal)),
        Ok(_) => None,
        Err(Errno::ECHILD) => Some(ChildExit::Lost),
        Err(e) => {
            warn!(pid, "waitpid failed: {}", e);
            None
        }
    }
}

/// Environment describing every tracked peer: `<peer>_state` plus one `<peer>_<VALUE>` per
/// mirrored value, with non-alphanumeric characters in value names replaced by `_`.
/// Central servers are numbered `centrald1`, `centrald2`, ...
pub fn environment(connections: &Connections) -> Vec<(String, String)> {
    let mut env = Vec::new();
    let mut centrald = 0;
    for conn in connections
        .iter()
        .filter(|c| !c.is_closed() && c.kind() != PeerKind::Fork)
    {
        let prefix = if conn.kind() == PeerKind::Centrald {
            centrald += 1;
            format!("centrald{centrald}")
        } else {
            conn.name().to_string()
        };
        env.push((format!("{prefix}_state"), conn.status().bits().to_string()));
        for mirror in conn.mirrors().values() {
            env.push((
                format!("{prefix}_{}", env_name(mirror.name())),
                mirror.display_value(),
            ));
        }
    }
    env
}

pub fn env_name(value_name: &str) -> String {
    value_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
