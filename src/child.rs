//! # Child trampoline.
//!
//! Second execution mode of this binary (`--mode child`). The parent
//! forks the trampoline with a control pipe on fd 3, and the trampoline's
//! only job is to read one [`ControlMessage`], apply identity and session,
//! and replace itself with the target program.
//!
//! The control message travels over the inherited pipe rather than argv so
//! secret material never appears on the process table. The trampoline runs
//! before any log pipeline exists from its point of view, so diagnostics
//! go straight to stdout.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::BufReader;
use std::os::fd::{FromRawFd, RawFd};

use nix::errno::Errno;
use nix::unistd::{execvpe, setgid, setsid, setuid, Gid, Uid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The control pipe appears in the child on this descriptor.
pub const CONTROL_FD: RawFd = 3;

/// Wire record handed from the parent to the trampoline, one per child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "Command")]
    pub command: Vec<String>,
    #[serde(rename = "Environment")]
    pub environment: Vec<String>,
    #[serde(rename = "User")]
    pub user: u32,
    #[serde(rename = "Group")]
    pub group: u32,
}

#[derive(Error, Debug)]
enum TrampolineError {
    #[error("unable to open parent pipe on fd 3")]
    FdMissing,
    #[error("error decoding control message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("control message has an empty command")]
    EmptyCommand,
    #[error("command contains an interior nul byte")]
    BadArgument,
    #[error("error applying identity: {0}")]
    Identity(#[source] Errno),
    #[error("error starting session: {0}")]
    Session(#[source] Errno),
    #[error("error executing command: {0}")]
    Exec(#[source] Errno),
}

/// Entry point for `--mode child`. Never returns: on success the process
/// image is replaced, on failure the process exits 1.
pub fn run() -> ! {
    if let Err(err) = exec_child() {
        println!("child: {err}");
        std::process::exit(1);
    }
    unreachable!("exec returned without error");
}

fn exec_child() -> Result<Infallible, TrampolineError> {
    // SAFETY: fcntl only inspects the descriptor.
    if unsafe { libc::fcntl(CONTROL_FD, libc::F_GETFD) } == -1 {
        return Err(TrampolineError::FdMissing);
    }
    // SAFETY: fd 3 is the inherited control pipe, owned by nothing else in
    // this process; File takes ownership and closes it on drop.
    let pipe = unsafe { File::from_raw_fd(CONTROL_FD) };
    let msg: ControlMessage =
        serde_json::from_reader(BufReader::new(pipe)).map_err(TrampolineError::Decode)?;

    // The child keeps no way to read from the supervisor's terminal.
    // SAFETY: closing stdin affects only this process.
    unsafe { libc::close(libc::STDIN_FILENO) };

    // Group first: once the uid is dropped the process may no longer have
    // the privilege to change its gid.
    setgid(Gid::from_raw(msg.group)).map_err(TrampolineError::Identity)?;
    setuid(Uid::from_raw(msg.user)).map_err(TrampolineError::Identity)?;

    // New session so signals sent to the supervisor's process group are
    // delivered to the child only through explicit proxying, and shells
    // get correct terminal-control semantics.
    setsid().map_err(TrampolineError::Session)?;

    if msg.command.is_empty() {
        return Err(TrampolineError::EmptyCommand);
    }
    let argv = to_cstrings(&msg.command)?;
    let envp = to_cstrings(&msg.environment)?;

    execvpe(&argv[0], &argv, &envp).map_err(TrampolineError::Exec)
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>, TrampolineError> {
    items
        .iter()
        .map(|item| CString::new(item.as_bytes()).map_err(|_| TrampolineError::BadArgument))
        .collect()
}
