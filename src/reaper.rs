//! # Non-blocking reaper for terminated descendants.
//!
//! As a sub-reaper the supervisor inherits grandchildren whose parents
//! exited first; a single `waitpid(-1, WNOHANG)` drain collects direct
//! children and adopted orphans alike. The drain is called once per
//! control-loop tick and one final time at shutdown; it never blocks and
//! never waits for a specific pid.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Exit statuses of children killed by a signal are reported as
/// `128 + signo`, mirroring shell conventions.
const SIGNAL_EXIT_OFFSET: i32 = 128;

/// One reaped descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: i32,
}

/// Drains every descendant that has terminated since the last call.
///
/// Returns the collected `(pid, status)` events; an empty vector means no
/// child was ready. `ECHILD` (no children at all) is not an error.
pub fn reap_children() -> Result<Vec<ChildExit>, Errno> {
    let mut exits = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => exits.push(ChildExit { pid, status: code }),
            Ok(WaitStatus::Signaled(pid, sig, _core)) => exits.push(ChildExit {
                pid,
                status: SIGNAL_EXIT_OFFSET + sig as i32,
            }),
            // Stop/continue events are not terminations.
            Ok(WaitStatus::StillAlive) => return Ok(exits),
            Ok(_) => continue,
            Err(Errno::ECHILD) => return Ok(exits),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}
