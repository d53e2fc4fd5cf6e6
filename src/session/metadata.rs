//! On-disk session metadata (`session.json`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle status of a session. Transitions are monotone:
/// `Starting` -> `Running` -> `Exited`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The PTY and child process are being set up.
    Starting,
    /// The child process is alive and attached to its PTY.
    Running,
    /// The child process has terminated.
    Exited,
}

impl Status {
    /// True if `self -> next` is an allowed transition (including a no-op).
    #[must_use]
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::{Exited, Running, Starting};
        matches!(
            (self, next),
            (Starting, Starting)
                | (Starting, Running)
                | (Starting, Exited)
                | (Running, Running)
                | (Running, Exited)
                | (Exited, Exited)
        )
    }
}

/// Persisted, serializable record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// 36-character UUID string identity.
    pub id: String,
    /// Human-assigned name, defaults to the id if not given.
    pub name: String,
    /// Argv of the spawned command.
    pub cmdline: Vec<String>,
    /// Working directory the command was spawned in.
    pub cwd: PathBuf,
    /// Child process id once spawned.
    pub pid: Option<u32>,
    /// Current lifecycle status.
    pub status: Status,
    /// Exit code, populated once `status == Exited`.
    pub exit_code: Option<i32>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// `TERM` value presented to the child.
    pub term: String,
    /// Current terminal width in columns.
    pub width: u16,
    /// Current terminal height in rows.
    pub height: u16,
    /// Extra environment variables passed to the child.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, String>,
}

impl Metadata {
    /// Path to this session's metadata file given its directory.
    #[must_use]
    pub fn path(session_dir: &Path) -> PathBuf {
        session_dir.join("session.json")
    }

    /// Loads and parses `session.json` from `session_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlFileCorrupted`] if the file exists but does
    /// not parse, or [`Error::SessionNotFound`] if it is absent.
    pub fn load(session_dir: &Path) -> Result<Self> {
        let path = Self::path(session_dir);
        let content = std::fs::read_to_string(&path).map_err(|_| Error::SessionNotFound {
            session_id: dir_name(session_dir),
        })?;
        serde_json::from_str(&content).map_err(|source| Error::ControlFileCorrupted {
            session_id: dir_name(session_dir),
            source,
        })
    }

    /// Atomically rewrites `session.json`: write to a temp file in the same
    /// directory, then rename over the target. A reader never observes a
    /// partially written file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the temp file cannot be
    /// written or the rename fails.
    pub fn save(&self, session_dir: &Path) -> Result<()> {
        let path = Self::path(session_dir);
        let tmp_path = session_dir.join("session.json.tmp");
        let body = serde_json::to_string_pretty(self).map_err(|source| Error::Internal {
            message: format!("serializing session metadata: {source}"),
        })?;
        std::fs::write(&tmp_path, body).map_err(|source| Error::StreamWriteFailed {
            session_id: Some(self.id.clone()),
            source,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|source| Error::StreamWriteFailed {
            session_id: Some(self.id.clone()),
            source,
        })
    }

    /// Moves this record to `next`, rejecting a backward transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the transition is not monotone.
    pub fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal {
                message: format!("illegal status transition {:?} -> {:?}", self.status, next),
            });
        }
        self.status = next;
        Ok(())
    }
}

fn dir_name(dir: &Path) -> Option<String> {
    dir.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample(dir: &Path) -> Metadata {
        Metadata {
            id: "11111111-1111-1111-1111-111111111111".into(),
            name: "test".into(),
            cmdline: vec!["/bin/sh".into()],
            cwd: dir.to_path_buf(),
            pid: Some(1234),
            status: Status::Starting,
            exit_code: None,
            started_at: Utc::now(),
            term: "xterm-256color".into(),
            width: 80,
            height: 24,
            env: HashMap::new(),
        }
    }

    #[test]
    fn monotone_transitions_are_allowed() {
        assert!(Status::Starting.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Exited));
        assert!(Status::Exited.can_transition_to(Status::Exited));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!Status::Running.can_transition_to(Status::Starting));
        assert!(!Status::Exited.can_transition_to(Status::Running));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample(dir.path());
        meta.save(dir.path()).unwrap();
        let loaded = Metadata::load(dir.path()).unwrap();
        assert_eq!(loaded.id, meta.id);
        assert_eq!(loaded.width, 80);
        assert_eq!(loaded.status, Status::Starting);
    }

    #[test]
    fn transition_rejects_backward_move() {
        let mut meta = sample(Path::new("/tmp"));
        meta.status = Status::Exited;
        assert!(meta.transition(Status::Running).is_err());
        assert_eq!(meta.status, Status::Exited);
    }

    #[test]
    fn load_missing_file_is_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Metadata::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }
}
