//! OS-level process liveness probing beyond a plain signal-0 check.
//!
//! [`crate::terminator::is_alive`] answers true for a zombie too: the
//! kernel keeps a process-table entry for an exited child until its parent
//! reaps it, and that entry still responds to a signal-0 probe. The session
//! manager additionally consults `/proc`/`ps` process state so a session
//! whose child became an unreaped zombie (most commonly after a server
//! restart, when nothing is left holding the original `Child` handle) is
//! not reported as still running.

#[cfg(target_os = "macos")]
use std::process::Command;

/// True if `pid` is a zombie process (exited but not yet reaped).
///
/// Returns `false` on platforms this crate cannot inspect, and for any pid
/// it fails to read state for — the conservative choice, since callers
/// already fall back to the signal-0 liveness check for anything this
/// returns `false` for.
#[must_use]
pub fn is_zombie(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let stat_path = format!("/proc/{pid}/stat");
        let Ok(stat) = std::fs::read_to_string(&stat_path) else {
            return false;
        };
        // Format: "pid (comm) state ...". comm may contain spaces or
        // parens, so split on the *last* ')' rather than whitespace.
        let Some((_, after_comm)) = stat.rsplit_once(')') else {
            return false;
        };
        after_comm.split_whitespace().next() == Some("Z")
    }

    #[cfg(target_os = "macos")]
    {
        let Ok(output) = Command::new("ps")
            .arg("-o")
            .arg("state=")
            .arg("-p")
            .arg(pid.to_string())
            .output()
        else {
            return false;
        };
        String::from_utf8_lossy(&output.stdout).trim().starts_with('Z')
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        false
    }
}
