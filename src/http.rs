//! HTTP surface: request/response DTOs and framework-agnostic handler
//! functions for every endpoint the core exposes. Router wiring,
//! the HTTP server itself, and the WebSocket upgrade handshake are the
//! embedder's job; this module only does the work behind each route.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::cell::{Attrs, Cell, Color};
use crate::buffer::manager::snapshot_once;
use crate::buffer::snapshot::BufferSnapshot;
use crate::cast::event::{exit_record, parse_exit_record, Event, EventType};
use crate::cast::tailer::Tailer;
use crate::error::{Error, Result};
use crate::session::manager::{CreateSpec, SessionManager};
use crate::session::metadata::{Metadata, Status};

// ============================================================================
// Sessions
// ============================================================================

/// One session as returned by `GET /api/sessions`.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: std::path::PathBuf,
    pub pid: Option<u32>,
    pub status: Status,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub term: String,
    pub width: u16,
    pub height: u16,
}

impl From<Metadata> for SessionSummary {
    fn from(meta: Metadata) -> Self {
        Self {
            id: meta.id,
            name: meta.name,
            cmdline: meta.cmdline,
            cwd: meta.cwd,
            pid: meta.pid,
            status: meta.status,
            exit_code: meta.exit_code,
            started_at: meta.started_at,
            term: meta.term,
            width: meta.width,
            height: meta.height,
        }
    }
}

/// `GET /api/sessions`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the control root cannot be read.
pub async fn list_sessions(manager: &SessionManager) -> Result<Vec<SessionSummary>> {
    Ok(manager.list().await?.into_iter().map(SessionSummary::from).collect())
}

/// Body of `POST /api/sessions`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: std::path::PathBuf,
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Response of `POST /api/sessions`.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `POST /api/sessions`.
///
/// # Errors
///
/// See [`SessionManager::create`].
pub async fn create_session(manager: &SessionManager, req: CreateSessionRequest) -> Result<CreateSessionResponse> {
    let meta = manager
        .create(CreateSpec {
            cmdline: req.command,
            cwd: req.working_dir,
            name: req.name,
            cols: req.cols,
            rows: req.rows,
            env: req.env,
        })
        .await?;
    Ok(CreateSessionResponse { session_id: meta.id })
}

/// `DELETE /api/sessions/:id` — sends SIGTERM (escalating to SIGKILL).
///
/// # Errors
///
/// See [`SessionManager::terminate`].
pub async fn delete_session(manager: &SessionManager, id: &str) -> Result<()> {
    manager.terminate(id).await?;
    Ok(())
}

/// `DELETE /api/sessions/:id/cleanup` — removes an exited session's files.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the session has not yet exited; the
/// closed error-kind set has no dedicated variant for this case.
pub async fn cleanup_session(manager: &SessionManager, id: &str) -> Result<()> {
    let meta = manager.get(id).await?;
    if meta.status != Status::Exited {
        return Err(Error::InvalidInput {
            message: "cannot clean up a session that has not exited".to_string(),
        });
    }
    manager.remove(&meta.id).await
}

/// Response of `POST /api/cleanup-exited`.
#[derive(Debug, Serialize)]
pub struct CleanupExitedResponse {
    pub removed: Vec<String>,
}

/// `POST /api/cleanup-exited` — sweeps every exited session.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the control root cannot be read.
pub async fn cleanup_exited(manager: &SessionManager) -> Result<CleanupExitedResponse> {
    Ok(CleanupExitedResponse {
        removed: manager.cleanup_exited().await?,
    })
}

/// Body of `POST /api/sessions/:id/input`.
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

/// `POST /api/sessions/:id/input`. `text` is sent verbatim unless it
/// exactly matches one of the recognized special-key names, in which case
/// it is translated to a fixed byte sequence first.
///
/// # Errors
///
/// See [`SessionManager::write_input`].
pub async fn write_input(manager: &SessionManager, id: &str, req: InputRequest) -> Result<()> {
    let bytes = translate_special_key(&req.text)
        .map(<[u8]>::to_vec)
        .unwrap_or_else(|| req.text.into_bytes());
    manager.write_input(id, &bytes).await
}

fn translate_special_key(text: &str) -> Option<&'static [u8]> {
    match text {
        "arrow_up" => Some(b"\x1b[A"),
        "arrow_down" => Some(b"\x1b[B"),
        "arrow_left" => Some(b"\x1b[D"),
        "arrow_right" => Some(b"\x1b[C"),
        "escape" => Some(b"\x1b"),
        "enter" => Some(b"\r"),
        "ctrl_enter" => Some(b"\n"),
        "shift_enter" => Some(b"\r"),
        _ => None,
    }
}

/// Body of `POST /api/sessions/:id/resize`.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/sessions/:id/resize`.
///
/// # Errors
///
/// See [`SessionManager::resize`].
pub async fn resize_session(manager: &SessionManager, id: &str, req: ResizeRequest) -> Result<()> {
    manager.resize(id, req.cols, req.rows).await
}

// ============================================================================
// SSE stream
// ============================================================================

/// Opens a replay-then-follow line stream for `GET /api/sessions/:id/stream`,
/// first checking that the session's cast file actually exists.
///
/// # Errors
///
/// Returns [`Error::StreamReadFailed`] if `stream-out` does not exist.
pub async fn open_session_stream(
    control_root: &Path,
    session_id: &str,
) -> Result<impl futures_util::Stream<Item = String>> {
    let session_dir = control_root.join(session_id);
    let stream_path = session_dir.join("stream-out");
    if tokio::fs::metadata(&stream_path).await.is_err() {
        return Err(Error::StreamReadFailed {
            session_id: Some(session_id.to_string()),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "stream-out missing"),
        });
    }
    Ok(stream_session(session_dir, session_id.to_string()))
}

/// Replays `stream-out` from the beginning, then keeps polling for new
/// lines until the session ends, synthesizing a final `["exit",...]` line
/// if the writer's own one is not observed.
fn stream_session(session_dir: std::path::PathBuf, session_id: String) -> impl futures_util::Stream<Item = String> {
    async_stream::stream! {
        let stream_path = session_dir.join("stream-out");
        let mut tailer = Tailer::new();
        let mut header_sent = false;

        loop {
            let Ok(lines) = tailer.poll(&stream_path).await else { return };
            let mut saw_exit = false;
            for line in lines {
                if !header_sent {
                    header_sent = true;
                    yield line;
                    continue;
                }
                if parse_exit_record(&line).is_some() {
                    saw_exit = true;
                }
                yield line;
            }
            if saw_exit {
                return;
            }

            if header_sent && !session_alive(&session_dir) {
                if let Ok(trailing) = tailer.poll(&stream_path).await {
                    for line in trailing {
                        if parse_exit_record(&line).is_some() {
                            saw_exit = true;
                        }
                        yield line;
                    }
                }
                if !saw_exit {
                    let code = Metadata::load(&session_dir).ok().and_then(|m| m.exit_code).unwrap_or(0);
                    yield exit_record(code, &session_id);
                }
                return;
            }

            tokio::time::sleep(crate::constants::TAIL_POLL_INTERVAL).await;
        }
    }
}

fn session_alive(session_dir: &Path) -> bool {
    matches!(
        Metadata::load(session_dir).map(|m| m.status),
        Ok(Status::Running | Status::Starting)
    )
}

// ============================================================================
// Snapshot (cast replay) and buffer stats
// ============================================================================

/// `GET /api/sessions/:id/snapshot` — the header plus every event since the
/// most recent full-screen clear (`ESC[2J`, `ESC[3J`, or `ESC c`), so a
/// client reconnecting mid-session doesn't have to replay a full scrollback
/// to reconstruct the visible screen.
///
/// # Errors
///
/// Returns [`Error::StreamReadFailed`] if `stream-out` cannot be read.
pub async fn snapshot_text(control_root: &Path, session_id: &str) -> Result<String> {
    let stream_path = control_root.join(session_id).join("stream-out");
    let content = tokio::fs::read_to_string(&stream_path)
        .await
        .map_err(|source| Error::StreamReadFailed {
            session_id: Some(session_id.to_string()),
            source,
        })?;

    let mut lines = content.lines();
    let header_line = lines.next().unwrap_or_default();
    let event_lines: Vec<&str> = lines.collect();

    let mut last_clear = None;
    for (idx, line) in event_lines.iter().enumerate() {
        if let Some(event) = Event::parse(line) {
            if event.kind == EventType::Output && contains_full_clear(&event.payload) {
                last_clear = Some(idx);
            }
        }
    }

    let start = last_clear.unwrap_or(0);
    let mut out = String::with_capacity(content.len());
    out.push_str(header_line);
    out.push('\n');
    for line in &event_lines[start..] {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

fn contains_full_clear(payload: &str) -> bool {
    payload.contains("\x1b[2J") || payload.contains("\x1b[3J") || payload.contains("\x1bc")
}

/// Response of `GET /api/sessions/:id/buffer/stats`.
#[derive(Debug, Serialize)]
pub struct BufferStatsResponse {
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "totalRows")]
    pub total_rows: u16,
    #[serde(rename = "lastModified")]
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

/// `GET /api/sessions/:id/buffer/stats`. There is no scrollback in this
/// buffer model, so `totalRows` always equals `rows`.
///
/// # Errors
///
/// Returns [`Error::SessionNotFound`] if no such session exists, or
/// [`Error::StreamReadFailed`] if `stream-out`'s metadata cannot be read.
pub async fn buffer_stats(control_root: &Path, session_id: &str) -> Result<BufferStatsResponse> {
    let session_dir = control_root.join(session_id);
    let meta = Metadata::load(&session_dir)?;
    let stream_path = session_dir.join("stream-out");
    let modified = tokio::fs::metadata(&stream_path)
        .await
        .and_then(|m| m.modified())
        .map_err(|source| Error::StreamReadFailed {
            session_id: Some(session_id.to_string()),
            source,
        })?;
    Ok(BufferStatsResponse {
        cols: meta.width,
        rows: meta.height,
        total_rows: meta.height,
        last_modified: chrono::DateTime::<chrono::Utc>::from(modified),
    })
}

// ============================================================================
// Buffer snapshot (JSON or binary)
// ============================================================================

/// JSON-serializable color, mirroring [`Color`].
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ColorDto {
    Default,
    Indexed { index: u8 },
    Rgb { r: u8, g: u8, b: u8 },
}

impl From<Color> for ColorDto {
    fn from(color: Color) -> Self {
        match color {
            Color::Default => ColorDto::Default,
            Color::Indexed(index) => ColorDto::Indexed { index },
            Color::Rgb(r, g, b) => ColorDto::Rgb { r, g, b },
        }
    }
}

/// JSON-serializable cell, flattening [`Attrs`] bitflags into named booleans.
#[derive(Debug, Serialize)]
pub struct CellDto {
    pub ch: char,
    pub width: u8,
    pub fg: ColorDto,
    pub bg: ColorDto,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub dim: bool,
    pub inverse: bool,
    pub invisible: bool,
    pub strikethrough: bool,
}

impl From<Cell> for CellDto {
    fn from(cell: Cell) -> Self {
        Self {
            ch: cell.ch,
            width: cell.width,
            fg: cell.fg.into(),
            bg: cell.bg.into(),
            bold: cell.attrs.contains(Attrs::BOLD),
            italic: cell.attrs.contains(Attrs::ITALIC),
            underline: cell.attrs.contains(Attrs::UNDERLINE),
            dim: cell.attrs.contains(Attrs::DIM),
            inverse: cell.attrs.contains(Attrs::INVERSE),
            invisible: cell.attrs.contains(Attrs::INVISIBLE),
            strikethrough: cell.attrs.contains(Attrs::STRIKETHROUGH),
        }
    }
}

/// JSON-serializable snapshot, mirroring [`BufferSnapshot`].
#[derive(Debug, Serialize)]
pub struct BufferSnapshotDto {
    pub cols: u32,
    pub rows: u32,
    #[serde(rename = "viewportY")]
    pub viewport_y: i32,
    #[serde(rename = "cursorX")]
    pub cursor_x: i32,
    #[serde(rename = "cursorY")]
    pub cursor_y: i32,
    pub cells: Vec<Vec<CellDto>>,
}

impl From<BufferSnapshot> for BufferSnapshotDto {
    fn from(snap: BufferSnapshot) -> Self {
        Self {
            cols: snap.cols,
            rows: snap.rows,
            viewport_y: snap.viewport_y,
            cursor_x: snap.cursor_x,
            cursor_y: snap.cursor_y,
            cells: snap
                .cells
                .into_iter()
                .map(|row| row.into_iter().map(CellDto::from).collect())
                .collect(),
        }
    }
}

/// Requested wire format for `GET /api/sessions/:id/buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    Json,
    Binary,
}

/// Either half of the format-dependent response body for
/// `GET /api/sessions/:id/buffer`.
pub enum BufferSnapshotBody {
    Json(BufferSnapshotDto),
    Binary(Vec<u8>),
}

/// `GET /api/sessions/:id/buffer?lines=N[&format=json|binary]` — a one-off
/// replay of the entire cast stream into a fresh terminal buffer, optionally
/// clipped to the last `lines` rows.
///
/// # Errors
///
/// Returns [`Error::SessionNotFound`] if no such session exists, or
/// [`Error::StreamReadFailed`] if `stream-out` cannot be read.
pub async fn buffer_snapshot(
    control_root: &Path,
    session_id: &str,
    lines: Option<u32>,
    format: BufferFormat,
) -> Result<BufferSnapshotBody> {
    let meta = Metadata::load(&control_root.join(session_id))?;
    let mut snapshot = snapshot_once(control_root, session_id, meta.width, meta.height).await?;
    if let Some(n) = lines {
        truncate_to_last_rows(&mut snapshot, n);
    }
    Ok(match format {
        BufferFormat::Binary => BufferSnapshotBody::Binary(snapshot.encode()),
        BufferFormat::Json => BufferSnapshotBody::Json(snapshot.into()),
    })
}

fn truncate_to_last_rows(snapshot: &mut BufferSnapshot, n: u32) {
    let n = n.min(snapshot.rows) as usize;
    let start = snapshot.cells.len().saturating_sub(n);
    snapshot.cells.drain(..start);
    snapshot.rows = snapshot.cells.len() as u32;
}

// ============================================================================
// Health
// ============================================================================

/// Response of `GET /health` and `GET /api/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// `GET /health`, `GET /api/health` — 200 once the core is initialized,
/// which is unconditionally true once a `SessionManager` exists to call this.
#[must_use]
pub fn health() -> HealthResponse {
    HealthResponse { status: "ok" }
}
