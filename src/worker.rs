//! Worker handle: ownership of one child process and its pipes.

use std::io::{BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

use crate::protocol::{self, SetupError};

/// Lifecycle of a worker as the supervisor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawned, handshake not yet complete.
    Starting,
    /// Handshake done, no record in flight.
    Ready,
    /// Exactly one record in flight.
    Busy,
    /// Process gone or stream broken; about to be removed.
    Dead,
}

/// One child worker process with piped stdin/stdout/stderr.
pub struct Worker {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<ChildStderr>,
    pub status: WorkerStatus,
}

impl Worker {
    /// Spawn a worker process from an argv vector.
    ///
    /// The default SIGINT disposition is installed around the spawn so the
    /// child inherits it instead of the supervisor's handler, then the
    /// previous disposition is restored.
    pub fn launch(argv: &[String]) -> std::io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| std::io::Error::other("empty worker command"))?;

        // SAFETY: signal(2) with SIG_DFL/previous handler; no handler code
        // of ours runs, we only swap dispositions around the spawn.
        let previous = unsafe { libc::signal(libc::SIGINT, libc::SIG_DFL) };
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        unsafe {
            libc::signal(libc::SIGINT, previous);
        }

        let mut child = spawned?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout not piped"))?;
        let stderr = child.stderr.take();
        debug!(pid, "spawned worker");

        Ok(Worker {
            child,
            pid,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            status: WorkerStatus::Starting,
        })
    }

    /// Run the startup handshake; on success the worker is Ready.
    pub fn handshake(&mut self, spec_line: &str) -> Result<(), SetupError> {
        let Worker {
            stdin,
            stdout,
            stderr,
            ..
        } = self;
        let Some(stdin) = stdin.as_mut() else {
            return Err(SetupError::new("writing spec to worker", "stdin closed"));
        };
        let res = match stderr.as_mut() {
            Some(stderr) => protocol::handshake(stdin, stdout, stderr, spec_line),
            None => protocol::handshake(stdin, stdout, &mut std::io::empty(), spec_line),
        };
        match res {
            Ok(()) => {
                self.status = WorkerStatus::Ready;
                Ok(())
            }
            Err(err) => {
                self.status = WorkerStatus::Dead;
                Err(err)
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Identity of this worker in the supervisor's map: its stdout fd.
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.get_ref().as_raw_fd()
    }

    pub fn stdout(&mut self) -> &mut BufReader<ChildStdout> {
        &mut self.stdout
    }

    /// Write one record to the worker's stdin (single trailing newline
    /// guaranteed). The worker is Busy afterwards.
    pub fn seed(&mut self, record: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin closed",
            ));
        };
        protocol::write_line(stdin, record)?;
        self.status = WorkerStatus::Busy;
        Ok(())
    }

    /// Close the worker's stdin: the end-of-work signal of the protocol.
    pub fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush();
        }
    }

    /// Signal the worker: SIGINT when `soft`, SIGTERM otherwise.
    pub fn terminate(&mut self, soft: bool) {
        let signum = if soft { libc::SIGINT } else { libc::SIGTERM };
        send_signal(self.pid, signum);
    }

    /// Wait for the worker to exit. With a timeout, a worker still alive at
    /// the deadline is SIGKILLed and then reaped unconditionally so no
    /// zombie remains.
    pub fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<ExitStatus> {
        self.status = WorkerStatus::Dead;
        match timeout {
            None => self.child.wait(),
            Some(limit) => match self.child.wait_timeout(limit)? {
                Some(status) => Ok(status),
                None => {
                    debug!(pid = self.pid, "worker ignored termination, killing");
                    send_signal(self.pid, libc::SIGKILL);
                    self.child.wait()
                }
            },
        }
    }

    /// Non-blocking liveness probe.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

fn send_signal(pid: u32, signum: libc::c_int) {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal
    // number. ESRCH (process already gone) is fine here.
    unsafe {
        libc::kill(pid as libc::pid_t, signum);
    }
}
