use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use crate::shmem::{TraceMap, SHM_ENV_VAR};

/// Control-channel descriptor the target expects (harness to target).
pub const FORKSRV_CTL_FD: i32 = 198;
/// Status-channel descriptor the target expects (target to harness).
pub const FORKSRV_ST_FD: i32 = 199;

/// Synthetic wait status reported when the harness kills a hung child.
pub const TIMEOUT_STATUS: i32 = 9;

/// How long to wait for the 4-byte hello after spawning the target.
const HELLO_TIMEOUT_MS: i32 = 10_000;
/// Grace period for the status write of a child we just SIGKILLed.
const KILL_DRAIN_TIMEOUT_MS: i32 = 5_000;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to spawn target {0:?}: {1}")]
    Spawn(PathBuf, std::io::Error),

    #[error("forkserver handshake failed: {0}")]
    Handshake(String),

    #[error("forkserver channel failure: {0}")]
    Channel(String),

    #[error("forkserver did not survive a respawn: {0}")]
    RespawnFailed(String),

    #[error("failed to stage input: {0}")]
    StageInput(#[from] std::io::Error),
}

/// Raw result of one target execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    /// Wait-style status as written by the forkserver, or [`TIMEOUT_STATUS`].
    pub status: i32,
    /// Wall clock from just before the fork request to just after the
    /// status read, or to the timeout.
    pub elapsed: Duration,
}

enum ReadFailure {
    TimedOut,
    Eof,
    Io(std::io::Error),
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::TimedOut => write!(f, "timed out"),
            ReadFailure::Eof => write!(f, "unexpected EOF"),
            ReadFailure::Io(e) => write!(f, "{e}"),
        }
    }
}

/// Owns the long-lived target process and its control channel.
///
/// The target is spawned once and forks a fresh child per execution. The
/// harness talks to it over two pipes mapped to fds 198/199 in the child,
/// all messages exactly 4 bytes in native order. The staged input file is
/// held open for the whole session: its file description is the target's
/// stdin, so truncate-write-rewind makes every forked child read the fresh
/// input from offset zero.
pub struct ForkserverExecutor {
    target: PathBuf,
    target_args: Vec<String>,
    timeout: Duration,
    shm: TraceMap,
    input_file: File,
    child: Child,
    ctl: File,
    st: File,
}

impl ForkserverExecutor {
    /// Spawns the forkserver and completes the hello handshake.
    pub fn spawn(
        target: &Path,
        target_args: &[String],
        current_input: &Path,
        timeout: Duration,
        shm: TraceMap,
    ) -> Result<Self, ExecutorError> {
        let input_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(current_input)?;

        let (child, ctl, st) = Self::spawn_target(target, target_args, &input_file, &shm)?;
        let mut executor = Self {
            target: target.to_path_buf(),
            target_args: target_args.to_vec(),
            timeout,
            shm,
            input_file,
            child,
            ctl,
            st,
        };
        executor.read_hello()?;
        Ok(executor)
    }

    fn spawn_target(
        target: &Path,
        target_args: &[String],
        input_file: &File,
        shm: &TraceMap,
    ) -> Result<(Child, File, File), ExecutorError> {
        let (ctl_read, ctl_write) =
            nix::unistd::pipe().map_err(|e| ExecutorError::Channel(format!("ctl pipe: {e}")))?;
        let (st_read, st_write) =
            nix::unistd::pipe().map_err(|e| ExecutorError::Channel(format!("st pipe: {e}")))?;

        let stdin = input_file
            .try_clone()
            .map_err(|e| ExecutorError::Spawn(target.to_path_buf(), e))?;

        let child_ctl = ctl_read.as_raw_fd();
        let child_st = st_write.as_raw_fd();

        let mut cmd = Command::new(target);
        cmd.args(target_args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(SHM_ENV_VAR, shm.id().to_string());
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(child_ctl, FORKSRV_CTL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(child_st, FORKSRV_ST_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(child_ctl);
                libc::close(child_st);
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Spawn(target.to_path_buf(), e))?;

        // The child holds its own copies now.
        drop(ctl_read);
        drop(st_write);

        Ok((child, File::from(ctl_write), File::from(st_read)))
    }

    fn read_hello(&mut self) -> Result<(), ExecutorError> {
        let mut hello = [0u8; 4];
        self.read_exact_deadline(&mut hello, Instant::now(), HELLO_TIMEOUT_MS)
            .map_err(|e| ExecutorError::Handshake(e.to_string()))?;
        log::debug!("forkserver is up (pid {})", self.child.id());
        Ok(())
    }

    /// Rewrites the staged input in place and rewinds the shared offset so
    /// the next forked child reads it from the start.
    pub fn stage_input(&mut self, bytes: &[u8]) -> Result<(), ExecutorError> {
        self.input_file.seek(SeekFrom::Start(0))?;
        self.input_file.set_len(0)?;
        self.input_file.write_all(bytes)?;
        self.input_file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Runs the target once on the currently staged input.
    ///
    /// On a channel failure the forkserver is respawned once and the round
    /// retried; a second failure is fatal.
    pub fn run_once(&mut self) -> Result<ExecResult, ExecutorError> {
        self.input_file.seek(SeekFrom::Start(0))?;
        self.shm.clear();
        match self.exec_round() {
            Ok(result) => Ok(result),
            Err(err) => {
                log::warn!("forkserver channel failure ({err}), respawning target");
                self.respawn()
                    .map_err(|e| ExecutorError::RespawnFailed(e.to_string()))?;
                self.input_file.seek(SeekFrom::Start(0))?;
                self.shm.clear();
                self.exec_round()
                    .map_err(|e| ExecutorError::RespawnFailed(e.to_string()))
            }
        }
    }

    fn exec_round(&mut self) -> Result<ExecResult, ExecutorError> {
        let timeout_ms = self.timeout.as_millis() as i32;
        let started = Instant::now();

        self.ctl
            .write_all(&[0u8; 4])
            .map_err(|e| ExecutorError::Channel(format!("fork request: {e}")))?;

        let mut pid_buf = [0u8; 4];
        self.read_exact_deadline(&mut pid_buf, started, timeout_ms)
            .map_err(|e| ExecutorError::Channel(format!("child pid: {e}")))?;
        let pid = i32::from_ne_bytes(pid_buf);
        if pid <= 0 {
            return Err(ExecutorError::Channel(format!("bogus child pid {pid}")));
        }

        let mut status_buf = [0u8; 4];
        match self.read_exact_deadline(&mut status_buf, started, timeout_ms) {
            Ok(()) => Ok(ExecResult {
                status: i32::from_ne_bytes(status_buf),
                elapsed: started.elapsed(),
            }),
            Err(ReadFailure::TimedOut) => {
                let elapsed = started.elapsed();
                // ESRCH just means the child already died.
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                self.read_exact_deadline(&mut status_buf, Instant::now(), KILL_DRAIN_TIMEOUT_MS)
                    .map_err(|e| ExecutorError::Channel(format!("post-kill status: {e}")))?;
                Ok(ExecResult {
                    status: TIMEOUT_STATUS,
                    elapsed,
                })
            }
            Err(other) => Err(ExecutorError::Channel(format!("exit status: {other}"))),
        }
    }

    /// Reads exactly `buf.len()` bytes from the status pipe, giving up once
    /// `budget_ms` has passed since `started`.
    fn read_exact_deadline(
        &mut self,
        buf: &mut [u8],
        started: Instant,
        budget_ms: i32,
    ) -> Result<(), ReadFailure> {
        let mut filled = 0;
        while filled < buf.len() {
            let spent = started.elapsed().as_millis() as i64;
            let remaining = budget_ms as i64 - spent;
            if remaining <= 0 {
                return Err(ReadFailure::TimedOut);
            }
            if !self.poll_status(remaining as i32)? {
                return Err(ReadFailure::TimedOut);
            }
            match self.st.read(&mut buf[filled..]) {
                Ok(0) => return Err(ReadFailure::Eof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReadFailure::Io(e)),
            }
        }
        Ok(())
    }

    fn poll_status(&self, timeout_ms: i32) -> Result<bool, ReadFailure> {
        let mut pfd = libc::pollfd {
            fd: self.st.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rv = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rv < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReadFailure::Io(err));
            }
            return Ok(rv > 0);
        }
    }

    fn respawn(&mut self) -> Result<(), ExecutorError> {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let (child, ctl, st) =
            Self::spawn_target(&self.target, &self.target_args, &self.input_file, &self.shm)?;
        self.child = child;
        self.ctl = ctl;
        self.st = st;
        self.read_hello()
    }

    /// The coverage bitmap written by the last execution.
    pub fn trace_bits(&self) -> &[u8] {
        self.shm.as_slice()
    }

    /// Pid of the long-lived forkserver process.
    pub fn target_pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for ForkserverExecutor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
