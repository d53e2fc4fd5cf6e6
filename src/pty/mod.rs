//! PTY runtime: fork/exec under a pseudo-terminal, termios configuration,
//! window size, and signal delivery.

pub mod termios;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::error::{Error, Result};

/// Parameters for spawning a new session's child process.
pub struct SpawnConfig<'a> {
    /// Argv of the command to run; `argv[0]` is resolved on `PATH`.
    pub argv: &'a [String],
    /// Working directory for the child.
    pub cwd: &'a Path,
    /// Extra environment variables layered over the inherited environment.
    pub env: &'a HashMap<String, String>,
    /// `TERM` value to present to the child.
    pub term: &'a str,
    /// Initial terminal width in columns.
    pub cols: u16,
    /// Initial terminal height in rows.
    pub rows: u16,
}

/// A live PTY: the master side the multiplexer drives, plus the spawned child.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl Pty {
    /// Allocates a PTY pair, configures termios on the master, and spawns
    /// `config.argv` with the slave as its controlling terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PTYCreationFailed`] if the pair cannot be allocated,
    /// [`Error::PTYConfigFailed`] if termios setup fails, or
    /// [`Error::SessionStartFailed`] if the child cannot be spawned.
    pub fn spawn(config: &SpawnConfig<'_>) -> Result<Self> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|source| Error::PTYCreationFailed {
                session_id: None,
                source: source.into(),
            })?;

        if let Some(raw) = pair.master.as_raw_fd() {
            // SAFETY: `raw` is owned by `pair.master`, which outlives this
            // call; the borrow does not escape `termios::configure`.
            let fd = unsafe { BorrowedFd::borrow_raw(raw) };
            termios::configure(fd)?;
        }

        let mut cmd = CommandBuilder::new(&config.argv[0]);
        for arg in &config.argv[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(config.cwd);
        cmd.env("TERM", config.term);
        for (key, value) in config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|source| Error::SessionStartFailed {
                session_id: None,
                source: source.into(),
            })?;
        // Drop the slave end in the parent; the child keeps its own copy via dup2.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child,
        })
    }

    /// Clones a reader over the PTY master for the I/O multiplexer's read loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PTYCreationFailed`] if the underlying clone fails.
    pub fn try_clone_reader(&self) -> Result<Box<dyn std::io::Read + Send>> {
        self.master
            .try_clone_reader()
            .map_err(|source| Error::PTYCreationFailed {
                session_id: None,
                source: source.into(),
            })
    }

    /// Takes the writer for forwarding stdin bytes to the child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PTYCreationFailed`] if a writer has already been taken.
    pub fn take_writer(&self) -> Result<Box<dyn std::io::Write + Send>> {
        self.master
            .take_writer()
            .map_err(|source| Error::PTYCreationFailed {
                session_id: None,
                source: source.into(),
            })
    }

    /// Updates the PTY window size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PTYResizeFailed`] on failure.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|source| Error::PTYResizeFailed {
                session_id: None,
                source: source.into(),
            })
    }

    /// OS process id of the spawned child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Polls whether the child has exited, returning its exit code if so.
    /// Never blocks.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.exit_code() as i32)),
            Ok(None) => Ok(None),
            Err(source) => Err(Error::Internal {
                message: format!("waiting on child: {source}"),
            }),
        }
    }

    /// Forcibly kills the child, reaping it to avoid a zombie.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            log::warn!("[pty] kill failed: {e}");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn spawn_echo_and_read_output() {
        let env = HashMap::new();
        let config = SpawnConfig {
            argv: &["/bin/sh".to_string(), "-c".to_string(), "printf hello".to_string()],
            cwd: Path::new("/tmp"),
            env: &env,
            term: "xterm-256color",
            cols: 80,
            rows: 24,
        };
        let mut pty = Pty::spawn(&config).expect("spawn");
        let mut reader = pty.try_clone_reader().expect("reader");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            use std::io::Read;
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
            if buf.len() >= 5 {
                break;
            }
        }
        drop(reader);
        for _ in 0..50 {
            if pty.try_wait().unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(String::from_utf8_lossy(&buf).contains("hello"));
    }

    #[test]
    fn resize_does_not_error() {
        let env = HashMap::new();
        let config = SpawnConfig {
            argv: &["/bin/sh".to_string()],
            cwd: Path::new("/tmp"),
            env: &env,
            term: "xterm-256color",
            cols: 80,
            rows: 24,
        };
        let mut pty = Pty::spawn(&config).expect("spawn");
        pty.resize(100, 30).expect("resize");
        pty.kill();
    }
}
