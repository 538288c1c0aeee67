//! Engine process supervision.
//!
//! Launches the engine in a pseudo-terminal session with its stdin, stdout
//! and stderr re-bound to three anonymous pipes. The stdout (results) and
//! stderr (log) read ends are non-blocking so the completion detector can
//! interleave them without ever parking on one.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, info, warn};

use tether_types::{EngineConfig, TetherError};

use crate::streams::EngineIo;

/// Exit status used by the child when `execv` fails, so a launch failure
/// can be told apart from anything the engine reports itself.
pub const LAUNCH_FAILURE_STATUS: i32 = -6;

/// Flags appended to every launch: maximal page size, no windowing system,
/// stdio interaction, interactive terminal, no syntax-check mode, and the
/// empty trailing token.
pub const FIXED_FLAGS: [&str; 7] = [
    "-pagesize",
    "MAX",
    "-nodms",
    "-stdio",
    "-terminal",
    "-nosyntaxcheck",
    "",
];

/// How an engine process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    /// The engine exited with this status.
    Exited(i32),
    /// The engine was killed by a signal.
    Signaled(Signal),
    /// `execv` failed in the child; the engine never ran.
    LaunchFailed,
    /// The process could not be found any more (already reaped elsewhere).
    Vanished,
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exited with status {code}"),
            ExitState::Signaled(sig) => write!(f, "killed by {sig}"),
            ExitState::LaunchFailed => write!(f, "engine program could not be executed"),
            ExitState::Vanished => write!(f, "process no longer exists"),
        }
    }
}

/// Build the launch argument vector.
///
/// Remote sessions become `[shell, "-t", host, engine, ...]`; the first
/// element is always the program handed to `execv`.
pub fn build_argv(engine: &EngineConfig) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(shell) = &engine.remote_shell {
        argv.push(shell.display().to_string());
        argv.push("-t".to_string());
        argv.push(engine.remote_host.clone().unwrap_or_default());
    }
    argv.push(engine.engine_path.display().to_string());
    argv.extend(engine.options.iter().cloned());
    argv.extend(FIXED_FLAGS.iter().map(|f| f.to_string()));
    argv
}

/// A running engine process and the parent's ends of its three pipes.
pub struct EngineProcess {
    /// Master side of the pty; held so the engine keeps a controlling terminal.
    _pty_master: OwnedFd,
    stdin: File,
    stdout: OwnedFd,
    stderr: OwnedFd,
    pid: Option<Pid>,
    exit: Option<ExitState>,
}

impl EngineProcess {
    /// Launch the engine described by `engine`.
    ///
    /// A missing executable is not detected here: the child exits with
    /// [`LAUNCH_FAILURE_STATUS`] and the first liveness check reports
    /// [`ExitState::LaunchFailed`].
    pub fn spawn(engine: &EngineConfig) -> Result<Self, TetherError> {
        let argv = build_argv(engine);
        let c_args = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TetherError::StartupFailure(format!("invalid argument: {e}")))?;
        let program = c_args
            .first()
            .cloned()
            .ok_or_else(|| TetherError::StartupFailure("empty argument vector".into()))?;

        let pty = openpty(None, None)
            .map_err(|e| TetherError::StartupFailure(format!("openpty failed: {e}")))?;
        let (stdin_read, stdin_write) = make_pipe("stdin")?;
        let (stdout_read, stdout_write) = make_pipe("stdout")?;
        let (stderr_read, stderr_write) = make_pipe("stderr")?;

        // Safety: the child only rewires descriptors and calls execv.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                // Errors must end in _exit(), never return: returning would run
                // the caller's code in the child.
                let err = (|| -> Result<(), String> {
                    drop(pty.master);

                    unistd::setsid().map_err(|e| format!("setsid failed: {e}"))?;

                    unsafe {
                        if libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                            let err = std::io::Error::last_os_error();
                            eprintln!("tether: TIOCSCTTY failed: {err}");
                        }
                        signal::signal(Signal::SIGINT, SigHandler::SigDfl)
                            .map_err(|e| format!("reset SIGINT: {e}"))?;
                    }

                    unistd::dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO)
                        .map_err(|e| format!("dup2 stdin: {e}"))?;
                    unistd::dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO)
                        .map_err(|e| format!("dup2 stdout: {e}"))?;
                    unistd::dup2(stderr_write.as_raw_fd(), libc::STDERR_FILENO)
                        .map_err(|e| format!("dup2 stderr: {e}"))?;

                    drop(pty.slave);
                    drop(stdin_read);
                    drop(stdin_write);
                    drop(stdout_read);
                    drop(stdout_write);
                    drop(stderr_read);
                    drop(stderr_write);

                    unistd::execv(&program, &c_args).map_err(|e| format!("exec failed: {e}"))?;

                    Ok(())
                })();

                if let Err(e) = err {
                    eprintln!("tether: engine launch failed: {e}");
                }
                unsafe { libc::_exit(LAUNCH_FAILURE_STATUS) };
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                drop(stdin_read);
                drop(stdout_write);
                drop(stderr_write);

                set_nonblocking(&stdout_read)?;
                set_nonblocking(&stderr_read)?;

                info!(pid = child.as_raw(), argv = ?argv, "engine process started");

                Ok(Self {
                    _pty_master: pty.master,
                    stdin: File::from(stdin_write),
                    stdout: stdout_read,
                    stderr: stderr_read,
                    pid: Some(child),
                    exit: None,
                })
            }
            Err(e) => Err(TetherError::StartupFailure(format!("fork failed: {e}"))),
        }
    }

    /// Zero-wait reap of the child.
    ///
    /// The first time the child is found gone its pid is cleared and the
    /// exit state recorded; later calls return `false` without a syscall.
    pub fn check_alive(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        let state = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return true,
            Ok(WaitStatus::Exited(_, code)) if code == LAUNCH_FAILURE_STATUS & 0xff => {
                ExitState::LaunchFailed
            }
            Ok(WaitStatus::Exited(_, code)) => ExitState::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ExitState::Signaled(sig),
            // Stopped, continued, traced: still there.
            Ok(_) => return true,
            Err(Errno::EINTR) => return true,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "waitpid failed, treating engine as gone");
                ExitState::Vanished
            }
        };
        info!(pid = pid.as_raw(), state = %state, "engine process exited");
        self.pid = None;
        self.exit = Some(state);
        false
    }

    fn signal(&self, sig: Signal) -> Result<(), TetherError> {
        let Some(pid) = self.pid else {
            return Err(TetherError::ProcessTerminated(self.describe_exit()));
        };
        signal::kill(pid, sig).map_err(|e| TetherError::Io(format!("kill {sig}: {e}")))
    }

    fn describe_exit(&self) -> String {
        self.exit
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no engine process attached".into())
    }
}

impl EngineIo for EngineProcess {
    fn read_results(&mut self, buf: &mut [u8]) -> Result<usize, TetherError> {
        read_nonblocking(&self.stdout, buf)
    }

    fn read_log(&mut self, buf: &mut [u8]) -> Result<usize, TetherError> {
        read_nonblocking(&self.stderr, buf)
    }

    fn write_input(&mut self, data: &[u8]) -> Result<(), TetherError> {
        self.stdin
            .write_all(data)
            .and_then(|()| self.stdin.flush())
            .map_err(|e| TetherError::Io(format!("engine stdin: {e}")))
    }

    fn interrupt(&mut self) -> Result<(), TetherError> {
        self.signal(Signal::SIGINT)
    }

    fn kill(&mut self) -> Result<(), TetherError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        self.signal(Signal::SIGKILL)?;
        // SIGKILL cannot be caught, so this reap returns promptly.
        let state = match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => ExitState::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ExitState::Signaled(sig),
            Ok(_) | Err(_) => ExitState::Signaled(Signal::SIGKILL),
        };
        warn!(pid = pid.as_raw(), state = %state, "engine process killed");
        self.pid = None;
        self.exit = Some(state);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.check_alive()
    }

    fn exit_state(&self) -> Option<ExitState> {
        self.exit.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid.and_then(|p| u32::try_from(p.as_raw()).ok())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        // Best effort: a session normally shuts the engine down gracefully
        // before this runs.
        if self.check_alive() {
            let _ = self.kill();
        }
    }
}

fn make_pipe(name: &str) -> Result<(OwnedFd, OwnedFd), TetherError> {
    unistd::pipe().map_err(|e| TetherError::StartupFailure(format!("{name} pipe: {e}")))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), TetherError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| TetherError::StartupFailure(format!("fcntl F_GETFL: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(|e| TetherError::StartupFailure(format!("fcntl F_SETFL: {e}")))?;
    Ok(())
}

/// Read whatever is available; "nothing right now" and end-of-stream both
/// come back as `Ok(0)`. Liveness is decided by the reaper, not by EOF.
fn read_nonblocking(fd: &OwnedFd, buf: &mut [u8]) -> Result<usize, TetherError> {
    match unistd::read(fd.as_raw_fd(), buf) {
        Ok(n) => Ok(n),
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
        Err(e) => Err(TetherError::Io(format!("pipe read: {e}"))),
    }
}
