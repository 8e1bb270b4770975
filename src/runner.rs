//! # Command runner.
//!
//! Starts one job: wires up the control pipe, fork-execs this binary in
//! trampoline mode, hands off the [`ControlMessage`], and returns a
//! [`CommandHandle`] owning the child and the cancellation scope of its
//! two log pumps.
//!
//! ## Descriptor discipline
//! The control pipe is created close-on-exec; the trampoline receives it
//! by `dup2` onto fd 3 in `pre_exec` (the dup'd descriptor does not carry
//! the flag). The parent drops the read end right after spawn and drops
//! the write end right after encoding the control message, so every IPC
//! descriptor is closed on both the success and failure paths.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::process::{ExitStatus, Stdio};

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Group, Pid, User};
use tokio::process::{Child, Command as TokioCommand};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::child::{ControlMessage, CONTROL_FD};
use crate::config::Command;
use crate::error::SpawnError;
use crate::logging::{pump_stream, Logger, StreamKind};

/// Spawns children with a shared resolved environment.
pub struct CommandRunner {
    pub logger: Logger,
    pub tracker: TaskTracker,
    pub base: CancellationToken,
    pub environment: Vec<String>,
}

impl CommandRunner {
    /// Starts the job described by `spec` and returns its handle.
    ///
    /// On any failure after the fork the partially-started child is
    /// terminated before the error is returned.
    pub fn run(&self, spec: &Command) -> Result<CommandHandle, SpawnError> {
        let token = self.base.child_token();

        let (ctrl_read, ctrl_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::ControlPipe)?;

        let exe = std::env::current_exe().map_err(SpawnError::Spawn)?;
        let mut cmd = TokioCommand::new(exe);
        cmd.arg("--mode")
            .arg("child")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let raw_ctrl = ctrl_read.as_raw_fd();
        // SAFETY: dup2 is async-signal-safe; raw_ctrl stays open in the
        // parent until after spawn returns.
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(raw_ctrl, CONTROL_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                token.cancel();
                return Err(SpawnError::Spawn(err));
            }
        };
        // The child owns its copy now.
        drop(ctrl_read);

        let pid = match child.id() {
            Some(id) => Pid::from_raw(id as i32),
            None => {
                token.cancel();
                return Err(SpawnError::Spawn(std::io::Error::other(
                    "child exited before its pid could be recorded",
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            self.tracker.spawn(pump_stream(
                stdout,
                spec.name.clone(),
                StreamKind::Stdout,
                self.logger.clone(),
                token.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.tracker.spawn(pump_stream(
                stderr,
                spec.name.clone(),
                StreamKind::Stderr,
                self.logger.clone(),
                token.clone(),
            ));
        }

        let handle = CommandHandle {
            child,
            pid,
            kill_signal: spec.kill_signal,
            token,
        };

        let user = match resolve_uid(&spec.run_as_user) {
            Ok(uid) => uid,
            Err(err) => {
                let _ = handle.terminate();
                return Err(err);
            }
        };
        let group = match resolve_gid(&spec.run_as_group) {
            Ok(gid) => gid,
            Err(err) => {
                let _ = handle.terminate();
                return Err(err);
            }
        };

        let message = ControlMessage {
            command: spec.command.clone(),
            environment: self.environment.clone(),
            user,
            group,
        };
        let mut writer = std::fs::File::from(ctrl_write);
        if let Err(err) = serde_json::to_writer(&mut writer, &message) {
            let _ = handle.terminate();
            return Err(SpawnError::ControlWrite(err));
        }
        let _ = writer.flush();
        // Dropping the writer half-closes the pipe; the trampoline reads
        // to EOF.
        drop(writer);

        Ok(handle)
    }
}

fn resolve_uid(name: &str) -> Result<u32, SpawnError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(SpawnError::UserLookup {
            user: name.to_string(),
        }),
    }
}

fn resolve_gid(name: &str) -> Result<u32, SpawnError> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(SpawnError::GroupLookup {
            group: name.to_string(),
        }),
    }
}

/// Handle to one running child.
///
/// Owns the child process, the kill signal from its spec, and the
/// cancellation scope of its two log pumps. Cleanup cancels the scope,
/// which ends the pumps and closes the parent-side pipe read ends they
/// hold.
pub struct CommandHandle {
    child: Child,
    pid: Pid,
    kill_signal: Signal,
    token: CancellationToken,
}

impl CommandHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Forwards an arbitrary signal to the child.
    pub fn signal(&self, sig: Signal) -> Result<(), nix::errno::Errno> {
        kill(self.pid, sig)
    }

    /// Sends the configured kill signal, then cleans up.
    pub fn terminate(&self) -> Result<(), nix::errno::Errno> {
        let result = kill(self.pid, self.kill_signal);
        self.cleanup();
        result
    }

    /// Cancels the log pumps; their pipe ends close as the tasks end.
    pub fn cleanup(&self) {
        self.token.cancel();
    }

    /// Waits for the child to exit. Used only for init jobs, which run
    /// serially before the reaper takes over.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Maps an [`ExitStatus`] to the supervisor's exit-code convention:
/// the literal code, or `128 + signo` for signal deaths.
pub fn exit_status_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => status.signal().map(|sig| 128 + sig).unwrap_or(1),
    }
}
