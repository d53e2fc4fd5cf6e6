//! Graceful process termination: SIGTERM,
//! poll for exit, SIGKILL if the grace period elapses.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::constants::{TERMINATE_GRACE_PERIOD, TERMINATE_KILL_LINGER, TERMINATE_POLL_INTERVAL};
use crate::error::{Error, Result};

/// How a termination request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The process was already gone before we signaled anything.
    AlreadyExited,
    /// SIGTERM was enough; the process exited within the grace period.
    ExitedGracefully,
    /// The process ignored SIGTERM and was forced with SIGKILL.
    Killed,
}

/// Sends SIGTERM to `pid`, polling liveness every
/// [`TERMINATE_POLL_INTERVAL`] for up to [`TERMINATE_GRACE_PERIOD`]; escalates
/// to SIGKILL if the process is still alive afterward.
///
/// A pid of 0, or a pid that is already dead when first probed, is treated
/// as a pre-existing success rather than an error: termination is meant to
/// be idempotent against a process that raced its own exit.
///
/// # Errors
///
/// Returns [`Error::ProcessSignalFailed`] if a signal send fails for a
/// reason other than the process already being gone (`ESRCH`).
pub async fn terminate_gracefully(pid: u32) -> Result<Outcome> {
    if pid == 0 || !is_alive(pid) {
        return Ok(Outcome::AlreadyExited);
    }

    send_signal(pid, Signal::SIGTERM)?;

    let deadline = tokio::time::Instant::now() + TERMINATE_GRACE_PERIOD;
    loop {
        if !is_alive(pid) {
            return Ok(Outcome::ExitedGracefully);
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
    }

    if !is_alive(pid) {
        return Ok(Outcome::ExitedGracefully);
    }

    send_signal(pid, Signal::SIGKILL)?;
    tokio::time::sleep(TERMINATE_KILL_LINGER).await;
    Ok(Outcome::Killed)
}

/// Probes liveness with signal 0: no signal is actually delivered, but the
/// kernel still validates the pid exists and is reachable.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(Error::ProcessSignalFailed {
            session_id: None,
            source: Box::new(source),
        }),
    }
}
