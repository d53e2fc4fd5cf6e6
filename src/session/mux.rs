//! Per-session I/O multiplexer: one task owns the PTY, reads
//! its output in 32 KiB chunks, fans bytes out to the cast writer and any
//! raw subscribers, and drains the stdin/control FIFOs.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cast::event::{exit_record, Header};
use crate::cast::writer::CastWriter;
use crate::error::{short_id, Error, Result};
use crate::pty::Pty;
use crate::session::metadata::{Metadata, Status};
use crate::subscription::{raw_channel, RawReceiver, RawSender};

const READ_CHUNK: usize = 32 * 1024;

/// Handle to a running session's I/O loop, held by the session manager.
pub struct SessionHandle {
    raw_subscribers: Arc<Mutex<Vec<RawSender>>>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Registers a new raw-byte subscriber, fed every chunk read from the
    /// PTY master from this point on.
    pub async fn subscribe_raw(&self) -> RawReceiver {
        let (tx, rx) = raw_channel();
        self.raw_subscribers.lock().await.push(tx);
        rx
    }

    /// Requests the loop stop and waits for it to finish. Does not touch
    /// the child process; callers terminate it separately.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}

/// Spawns the per-session I/O loop for an already-started PTY.
///
/// # Errors
///
/// Returns an error if the cast writer or FIFOs cannot be opened.
pub fn spawn(session_dir: PathBuf, session_id: String, pty: Pty, header: Header) -> Result<SessionHandle> {
    let cast_writer = CastWriter::create(&session_dir.join("stream-out"), &header)?;

    let raw_subscribers: Arc<Mutex<Vec<RawSender>>> = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(Notify::new());

    let task = {
        let raw_subscribers = Arc::clone(&raw_subscribers);
        let stop = Arc::clone(&stop);
        tokio::spawn(run(session_dir, session_id, pty, cast_writer, raw_subscribers, stop))
    };

    Ok(SessionHandle { raw_subscribers, stop, task })
}

/// One chunk read from the PTY master, or `None` for EOF/child exit.
type PtyChunk = Option<Vec<u8>>;

fn spawn_pty_reader(mut pty_reader: Box<dyn std::io::Read + Send>) -> mpsc::Receiver<PtyChunk> {
    let (tx, rx) = mpsc::channel::<PtyChunk>(4);
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match pty_reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(None);
                    return;
                }
                Ok(n) => {
                    if tx.blocking_send(Some(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    // EIO and similar: the slave side went away, same as EOF.
                    let _ = tx.blocking_send(None);
                    return;
                }
            }
        }
    });
    rx
}

async fn run(
    session_dir: PathBuf,
    session_id: String,
    mut pty: Pty,
    mut cast_writer: CastWriter,
    raw_subscribers: Arc<Mutex<Vec<RawSender>>>,
    stop: Arc<Notify>,
) {
    let short = short_id(&session_id).to_string();

    let pty_reader = match pty.try_clone_reader() {
        Ok(reader) => reader,
        Err(err) => {
            log::error!("[mux] {short}: cloning pty reader failed: {err}");
            return;
        }
    };
    let mut pty_rx = spawn_pty_reader(pty_reader);

    let mut control_rx = open_control_fifo(&session_dir.join("control")).await;

    let pty_writer = match pty.take_writer() {
        Ok(writer) => Some(Arc::new(std::sync::Mutex::new(writer))),
        Err(err) => {
            log::error!("[mux] {short}: taking pty writer failed: {err}");
            None
        }
    };
    let stdin_task = pty_writer
        .clone()
        .map(|writer| spawn_stdin_forwarder(session_dir.join("stdin"), writer));

    let loop_exit = loop {
        tokio::select! {
            biased;

            () = stop.notified() => {
                break LoopExit::Stopped;
            }

            Some(code) = poll_child_exit(&mut pty) => {
                break LoopExit::ChildExited(Some(code));
            }

            chunk = pty_rx.recv() => {
                match chunk {
                    Some(Some(bytes)) => {
                        if let Err(err) = cast_writer.write_output(&bytes) {
                            log::warn!("[mux] {short}: cast write failed: {err}");
                        }
                        broadcast(&raw_subscribers, Bytes::from(bytes)).await;
                    }
                    Some(None) | None => break LoopExit::ChildExited(poll_exit_code_blocking(&mut pty)),
                }
            }

            line = recv_control(&mut control_rx) => {
                if let Some(line) = line {
                    handle_control_line(&session_dir, &mut pty, &mut cast_writer, &line).await;
                }
            }
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }

    let Some(code) = loop_exit.exit_code() else {
        // The loop was stopped by the session manager (e.g. daemon
        // shutdown), not by the child exiting or the PTY hitting EOF. The
        // child may still be alive; don't write a synthetic exit record or
        // flip `session.json` to `Exited` — that would misrepresent a
        // running process as finished.
        log::info!("[mux] {short}: session loop stopped without a child exit");
        return;
    };

    if let Err(err) = cast_writer.write_raw_json(&exit_record(code, &session_id)) {
        log::warn!("[mux] {short}: writing exit record failed: {err}");
    }
    if let Err(err) = cast_writer.close() {
        log::warn!("[mux] {short}: closing cast writer failed: {err}");
    }
    finalize_metadata(&session_dir, code);
    log::info!("[mux] {short}: session loop exited with code {code}");
}

/// Why the session's `tokio::select!` loop terminated.
enum LoopExit {
    /// Requested externally via [`SessionHandle::shutdown`]; the child may
    /// still be running.
    Stopped,
    /// The child process exited or the PTY master hit EOF. Carries the exit
    /// code when it could be recovered, `None` when it could not (the
    /// `exit_code = 0` sentinel is applied by the caller in that case).
    ChildExited(Option<i32>),
}

impl LoopExit {
    /// The exit code to record, or `None` if the loop did not end because
    /// the child exited.
    fn exit_code(&self) -> Option<i32> {
        match self {
            LoopExit::Stopped => None,
            LoopExit::ChildExited(code) => Some(code.unwrap_or(0)),
        }
    }
}

async fn poll_child_exit(pty: &mut Pty) -> Option<i32> {
    // Cheap poll, re-armed by select! on every loop iteration; avoids a busy
    // spin by yielding back to the scheduler between checks.
    tokio::time::sleep(crate::constants::IO_POLL_INTERVAL).await;
    pty.try_wait().ok().flatten()
}

fn poll_exit_code_blocking(pty: &mut Pty) -> Option<i32> {
    for _ in 0..20 {
        if let Ok(Some(code)) = pty.try_wait() {
            return Some(code);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    None
}

async fn recv_control(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn open_control_fifo(path: &std::path::Path) -> Option<mpsc::Receiver<String>> {
    let receiver = match pipe::OpenOptions::new().open_receiver(path) {
        Ok(receiver) => receiver,
        Err(err) => {
            log::warn!("[mux] opening control fifo {} failed: {err}", path.display());
            return None;
        }
    };
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(receiver).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    });
    Some(rx)
}

fn spawn_stdin_forwarder(
    path: PathBuf,
    writer: Arc<std::sync::Mutex<Box<dyn std::io::Write + Send>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let receiver = match pipe::OpenOptions::new().open_receiver(&path) {
            Ok(receiver) => receiver,
            Err(err) => {
                log::warn!("[mux] opening stdin fifo {} failed: {err}", path.display());
                return;
            }
        };
        let mut receiver = receiver;
        let mut buf = vec![0u8; 8192];
        loop {
            use tokio::io::AsyncReadExt;
            match receiver.read(&mut buf).await {
                Ok(0) => continue,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let writer = Arc::clone(&writer);
                    let result = tokio::task::spawn_blocking(move || {
                        let mut guard = writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        guard.write_all(&chunk)
                    })
                    .await;
                    if matches!(result, Err(_) | Ok(Err(_))) {
                        log::warn!("[mux] writing stdin to pty failed");
                    }
                }
                Err(err) => {
                    log::warn!("[mux] reading stdin fifo failed: {err}");
                    return;
                }
            }
        }
    })
}

async fn handle_control_line(
    session_dir: &std::path::Path,
    pty: &mut Pty,
    cast_writer: &mut CastWriter,
    line: &str,
) {
    let Ok(command) = serde_json::from_str::<serde_json::Value>(line) else {
        log::warn!("[mux] malformed control line: {line}");
        return;
    };
    let Some(cmd) = command.get("cmd").and_then(serde_json::Value::as_str) else {
        return;
    };
    if cmd == "resize" {
        let cols = command.get("cols").and_then(serde_json::Value::as_u64).unwrap_or(0) as u16;
        let rows = command.get("rows").and_then(serde_json::Value::as_u64).unwrap_or(0) as u16;
        if cols == 0 || rows == 0 {
            return;
        }
        if let Err(err) = pty.resize(cols, rows) {
            log::warn!("[mux] pty resize failed: {err}");
            return;
        }
        if let Err(err) = cast_writer.write_resize(cols, rows) {
            log::warn!("[mux] writing resize record failed: {err}");
        }
        if let Ok(mut meta) = Metadata::load(session_dir) {
            meta.width = cols;
            meta.height = rows;
            let _ = meta.save(session_dir);
        }
    }
}

async fn broadcast(subscribers: &Arc<Mutex<Vec<RawSender>>>, chunk: Bytes) {
    let subs = subscribers.lock().await;
    for tx in subs.iter() {
        tx.send(chunk.clone());
    }
}

fn finalize_metadata(session_dir: &std::path::Path, exit_code: i32) {
    match Metadata::load(session_dir) {
        Ok(mut meta) => {
            if meta.transition(Status::Exited).is_ok() {
                meta.exit_code = Some(exit_code);
                if let Err(err) = meta.save(session_dir) {
                    log::warn!("[mux] saving final metadata failed: {err}");
                }
            }
        }
        Err(err) => log::warn!("[mux] loading metadata to finalize failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::SpawnConfig;
    use std::collections::HashMap;

    fn session_dir_with_metadata() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let id = "sess-1".to_string();
        let session_dir = dir.path().join(&id);
        std::fs::create_dir_all(&session_dir).unwrap();
        let meta = Metadata {
            id: id.clone(),
            name: id.clone(),
            cmdline: vec!["/bin/sh".into()],
            cwd: session_dir.clone(),
            pid: None,
            status: Status::Starting,
            exit_code: None,
            started_at: chrono::Utc::now(),
            term: "xterm-256color".into(),
            width: 80,
            height: 24,
            env: HashMap::new(),
        };
        meta.save(&session_dir).unwrap();
        (dir, id)
    }

    #[tokio::test]
    async fn full_session_loop_records_output_and_exit() {
        let (root, id) = session_dir_with_metadata();
        let session_dir = root.path().join(&id);
        crate::session::fifo::create(&session_dir.join("stdin")).unwrap();
        crate::session::fifo::create(&session_dir.join("control")).unwrap();

        let env = HashMap::new();
        let config = SpawnConfig {
            argv: &["/bin/sh".to_string(), "-c".to_string(), "printf hi".to_string()],
            cwd: &session_dir,
            env: &env,
            term: "xterm-256color",
            cols: 80,
            rows: 24,
        };
        let pty = Pty::spawn(&config).unwrap();
        let header = Header {
            version: 2,
            width: 80,
            height: 24,
            timestamp: 0,
            command: Some("/bin/sh".into()),
            title: None,
            env: None,
        };
        let handle = spawn(session_dir.clone(), id.clone(), pty, header).unwrap();
        // Let the child exit and the loop observe it before requesting
        // shutdown, so this exercises the child-exit path deterministically
        // rather than racing it against the stop notification.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        handle.shutdown().await;

        let content = std::fs::read_to_string(session_dir.join("stream-out")).unwrap();
        assert!(content.contains("hi"));
        let meta = Metadata::load(&session_dir).unwrap();
        assert_eq!(meta.status, Status::Exited);
    }

    #[tokio::test]
    async fn shutdown_of_still_running_session_does_not_mark_it_exited() {
        let (root, id) = session_dir_with_metadata();
        let session_dir = root.path().join(&id);
        crate::session::fifo::create(&session_dir.join("stdin")).unwrap();
        crate::session::fifo::create(&session_dir.join("control")).unwrap();

        let env = HashMap::new();
        let config = SpawnConfig {
            argv: &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                "trap '' TERM; sleep 10".to_string(),
            ],
            cwd: &session_dir,
            env: &env,
            term: "xterm-256color",
            cols: 80,
            rows: 24,
        };
        let pty = Pty::spawn(&config).unwrap();
        let header = Header {
            version: 2,
            width: 80,
            height: 24,
            timestamp: 0,
            command: Some("/bin/sh".into()),
            title: None,
            env: None,
        };
        let handle = spawn(session_dir.clone(), id.clone(), pty, header).unwrap();
        // Requested while the child is still alive: this must be the
        // shutdown-requested path, not the child-exit path.
        handle.shutdown().await;

        let meta = Metadata::load(&session_dir).unwrap();
        assert_eq!(meta.status, Status::Starting);
        assert_eq!(meta.exit_code, None);
    }
}
