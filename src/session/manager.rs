//! Concurrency-safe session registry.
//!
//! Owns the on-disk session directory lifecycle — creation, status
//! reconciliation, removal — and keeps an in-memory map of the
//! [`mux::SessionHandle`] for every session it started, for direct access
//! (raw subscription, shutdown) without re-reading `session.json`.

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

use crate::cast::event::Header;
use crate::config::Config;
use crate::constants::CONTROL_FIFO_WRITE_TIMEOUT;
use crate::error::{short_id, Error, Result};
use crate::process;
use crate::pty::{Pty, SpawnConfig};
use crate::session::fifo;
use crate::session::metadata::{Metadata, Status};
use crate::session::mux::{self, SessionHandle};
use crate::subscription::RawReceiver;
use crate::terminator::{self, Outcome};

/// Parameters for starting a new session.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Argv of the command to run.
    pub cmdline: Vec<String>,
    /// Working directory for the child.
    pub cwd: std::path::PathBuf,
    /// Human name; defaults to the generated id if not given.
    pub name: Option<String>,
    /// Terminal width; defaults to the manager's configured default.
    pub cols: Option<u16>,
    /// Terminal height; defaults to the manager's configured default.
    pub rows: Option<u16>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
}

/// Owns every session's on-disk directory and, for ones it started itself,
/// the in-memory handle to its running I/O loop.
pub struct SessionManager {
    config: Config,
    running: Mutex<HashMap<String, SessionHandle>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("control_root", &self.config.control_root)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager rooted at `config.control_root`. Does not touch disk.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// The directory every session's subdirectory lives under.
    #[must_use]
    pub fn control_root(&self) -> &Path {
        &self.config.control_root
    }

    /// Creates a session directory (mode 0755), writes the initial
    /// `session.json`, spawns the PTY, and starts its I/O loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty command, or
    /// [`Error::InvalidArgument`] for a non-positive width/height. Returns
    /// [`Error::SessionStartFailed`] if the directory, FIFOs, or PTY cannot
    /// be created.
    pub async fn create(&self, spec: CreateSpec) -> Result<Metadata> {
        if spec.cmdline.is_empty() {
            return Err(Error::InvalidInput {
                message: "command must not be empty".to_string(),
            });
        }
        let cols = spec.cols.unwrap_or(self.config.default_cols);
        let rows = spec.rows.unwrap_or(self.config.default_rows);
        if cols == 0 || rows == 0 {
            return Err(Error::InvalidArgument {
                message: "cols and rows must be positive".to_string(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = spec.name.unwrap_or_else(|| id.clone());
        let session_dir = self.config.session_dir(&id);

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&session_dir)
            .map_err(|source| Error::SessionStartFailed {
                session_id: Some(id.clone()),
                source: Box::new(source),
            })?;
        fifo::create(&session_dir.join("stdin"))?;
        fifo::create(&session_dir.join("control"))?;

        let mut meta = Metadata {
            id: id.clone(),
            name,
            cmdline: spec.cmdline.clone(),
            cwd: spec.cwd.clone(),
            pid: None,
            status: Status::Starting,
            exit_code: None,
            started_at: chrono::Utc::now(),
            term: self.config.default_term.clone(),
            width: cols,
            height: rows,
            env: spec.env.clone(),
        };
        meta.save(&session_dir)?;

        let pty_config = SpawnConfig {
            argv: &spec.cmdline,
            cwd: &spec.cwd,
            env: &spec.env,
            term: &self.config.default_term,
            cols,
            rows,
        };
        let pty = Pty::spawn(&pty_config).map_err(|err| err.with_session(&id))?;
        let pid = pty.pid();

        let header = Header {
            version: 2,
            width: cols,
            height: rows,
            timestamp: chrono::Utc::now().timestamp(),
            command: Some(spec.cmdline.join(" ")),
            title: None,
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
        };
        let handle =
            mux::spawn(session_dir.clone(), id.clone(), pty, header).map_err(|err| err.with_session(&id))?;

        meta.pid = pid;
        meta.transition(Status::Running)?;
        meta.save(&session_dir)?;

        self.running.lock().await.insert(id.clone(), handle);
        log::info!("[session] {} started: {}", short_id(&id), meta.cmdline.join(" "));
        Ok(meta)
    }

    /// Enumerates every session directory, reconciling status against
    /// observed process liveness as it goes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the control root exists but cannot be
    /// read; a missing control root is treated as zero sessions.
    pub async fn list(&self) -> Result<Vec<Metadata>> {
        let entries = match std::fs::read_dir(&self.config.control_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::Internal {
                    message: format!("listing sessions: {source}"),
                })
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(mut meta) = Metadata::load(&dir) else {
                continue;
            };
            reconcile_liveness(&dir, &mut meta);
            sessions.push(meta);
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    /// Resolves `query` against every session's id, exact name, then
    /// unambiguous id prefix, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if nothing matches, or if an id
    /// prefix matches more than one session.
    pub async fn get(&self, query: &str) -> Result<Metadata> {
        let sessions = self.list().await?;
        if let Some(meta) = sessions.iter().find(|m| m.id == query) {
            return Ok(meta.clone());
        }
        if let Some(meta) = sessions.iter().find(|m| m.name == query) {
            return Ok(meta.clone());
        }
        let mut prefix_matches = sessions.iter().filter(|m| m.id.starts_with(query));
        match (prefix_matches.next(), prefix_matches.next()) {
            (Some(meta), None) => Ok(meta.clone()),
            _ => Err(Error::SessionNotFound { session_id: None }),
        }
    }

    /// Deletes a session's entire on-disk directory and drops any in-memory
    /// handle for it. Does not itself terminate a still-running child; call
    /// [`terminate`](Self::terminate) first if that matters to the caller.
    ///
    /// # Errors
    ///
    /// Returns whatever [`get`](Self::get) returns if `query` does not
    /// resolve, or [`Error::Internal`] if the directory cannot be removed.
    pub async fn remove(&self, query: &str) -> Result<()> {
        let meta = self.get(query).await?;
        self.running.lock().await.remove(&meta.id);
        std::fs::remove_dir_all(self.config.session_dir(&meta.id)).map_err(|source| Error::Internal {
            message: format!("removing session directory: {source}"),
        })
    }

    /// Removes every exited session's directory, returning the ids removed.
    ///
    /// Idempotent: a second call with no newly-exited sessions removes
    /// nothing further.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the control root cannot be read.
    pub async fn cleanup_exited(&self) -> Result<Vec<String>> {
        let sessions = self.list().await?;
        let mut removed = Vec::new();
        for meta in sessions.into_iter().filter(|m| m.status == Status::Exited) {
            self.running.lock().await.remove(&meta.id);
            if std::fs::remove_dir_all(self.config.session_dir(&meta.id)).is_ok() {
                removed.push(meta.id);
            }
        }
        Ok(removed)
    }

    /// Sends SIGTERM (escalating to SIGKILL) to the session's recorded PID.
    ///
    /// The I/O loop observes the exit on its own process-liveness poll and
    /// finalizes `session.json`; this call does not wait for that.
    ///
    /// # Errors
    ///
    /// Returns whatever [`get`](Self::get) returns if `query` does not
    /// resolve, or [`Error::ProcessSignalFailed`] if a signal send fails.
    pub async fn terminate(&self, query: &str) -> Result<Outcome> {
        let meta = self.get(query).await?;
        let Some(pid) = meta.pid else {
            return Ok(Outcome::AlreadyExited);
        };
        terminator::terminate_gracefully(pid).await.map_err(|err| err.with_session(&meta.id))
    }

    /// Registers a raw-byte subscriber on a still-running session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if `query` does not resolve, or
    /// [`Error::SessionNotRunning`] if the session exited (and so has no
    /// in-memory handle left to subscribe to).
    pub async fn subscribe_raw(&self, query: &str) -> Result<RawReceiver> {
        let meta = self.get(query).await?;
        let running = self.running.lock().await;
        let handle = running.get(&meta.id).ok_or(Error::SessionNotRunning {
            session_id: Some(meta.id.clone()),
        })?;
        Ok(handle.subscribe_raw().await)
    }

    /// Forwards `bytes` to a running session's PTY via its stdin FIFO.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotRunning`] if the session has exited, or
    /// [`Error::Timeout`]/[`Error::StdinWriteFailed`] if the FIFO cannot be
    /// written within [`CONTROL_FIFO_WRITE_TIMEOUT`].
    pub async fn write_input(&self, query: &str, bytes: &[u8]) -> Result<()> {
        let meta = self.get(query).await?;
        if meta.status != Status::Running {
            return Err(Error::SessionNotRunning {
                session_id: Some(meta.id),
            });
        }
        let path = self.config.session_dir(&meta.id).join("stdin");
        write_fifo(&path, bytes, meta.id).await
    }

    /// Resizes a running session: validates bounds, updates the PTY and
    /// `session.json` via the control FIFO handled by its I/O loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `cols`/`rows` fall outside
    /// `1..=1000`, [`Error::SessionNotRunning`] if the session has exited,
    /// or a FIFO write error as in [`write_input`](Self::write_input).
    pub async fn resize(&self, query: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 || cols > 1000 || rows > 1000 {
            return Err(Error::InvalidArgument {
                message: "cols and rows must be in 1..=1000".to_string(),
            });
        }
        let meta = self.get(query).await?;
        if meta.status != Status::Running {
            return Err(Error::SessionNotRunning {
                session_id: Some(meta.id),
            });
        }
        let path = self.config.session_dir(&meta.id).join("control");
        let command = serde_json::json!({"cmd": "resize", "cols": cols, "rows": rows});
        write_fifo(&path, format!("{command}\n").as_bytes(), meta.id).await
    }

    /// Stops every in-memory session's I/O loop (but not the child
    /// processes themselves) and drops their handles. Called on daemon
    /// shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.running.lock().await.drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

fn reconcile_liveness(session_dir: &Path, meta: &mut Metadata) {
    if meta.status != Status::Running {
        return;
    }
    let alive = meta
        .pid
        .is_some_and(|pid| terminator::is_alive(pid) && !process::is_zombie(pid));
    if alive {
        return;
    }
    if meta.transition(Status::Exited).is_ok() {
        meta.exit_code.get_or_insert(0);
        if let Err(err) = meta.save(session_dir) {
            log::warn!("[session] saving reconciled status for {} failed: {err}", short_id(&meta.id));
        }
    }
}

/// Opens `path` for writing (retrying while no reader is present) and
/// writes `bytes`, failing with [`Error::Timeout`] if neither step
/// completes within [`CONTROL_FIFO_WRITE_TIMEOUT`].
async fn write_fifo(path: &Path, bytes: &[u8], session_id: String) -> Result<()> {
    let deadline = tokio::time::Instant::now() + CONTROL_FIFO_WRITE_TIMEOUT;
    let mut sender = loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => break sender,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(_) => return Err(Error::Timeout { session_id: Some(session_id) }),
        }
    };
    tokio::time::timeout(CONTROL_FIFO_WRITE_TIMEOUT, sender.write_all(bytes))
        .await
        .map_err(|_| Error::Timeout {
            session_id: Some(session_id.clone()),
        })?
        .map_err(|source| Error::StdinWriteFailed {
            session_id: Some(session_id),
            source,
        })
}
