//! Lazy, tailing terminal-buffer fan-out.
//!
//! Each buffer-subscribed session gets exactly one [`TerminalBuffer`] and
//! one tailer task, shared by any number of subscribers. The last
//! unsubscribe stops the tailer and drops the buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::buffer::grid::TerminalBuffer;
use crate::buffer::snapshot::BufferSnapshot;
use crate::cast::event::{parse_exit_record, Event, EventType};
use crate::cast::tailer::Tailer;
use crate::constants::{LIVENESS_CHECK_INTERVAL, TAIL_POLL_INTERVAL};
use crate::error::{short_id, Result};
use crate::file_watcher::spawn_change_notifier;
use crate::session::metadata::{Metadata, Status};
use crate::subscription::{snapshot_channel, SnapshotReceiver, SnapshotSender};

type SubscriberMap = Arc<Mutex<HashMap<String, SnapshotSender>>>;

struct SessionEntry {
    subscribers: SubscriberMap,
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// Owns the live terminal buffers backing the `/buffers` subscription surface.
pub struct BufferManager {
    control_root: PathBuf,
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager").finish_non_exhaustive()
    }
}

impl BufferManager {
    /// Creates a manager rooted at the same control directory sessions live under.
    #[must_use]
    pub fn new(control_root: PathBuf) -> Self {
        Self {
            control_root,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to `session_id`'s buffer, lazily starting its tailer task
    /// on the first subscriber. Returns a subscription id (pass to
    /// [`unsubscribe`](Self::unsubscribe)) and the receiver half.
    pub async fn subscribe(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> (String, SnapshotReceiver) {
        let sub_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = snapshot_channel();

        let mut entries = self.entries.lock().await;
        match entries.get(session_id) {
            Some(entry) => {
                entry.subscribers.lock().await.insert(sub_id.clone(), tx);
            }
            None => {
                let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
                subscribers.lock().await.insert(sub_id.clone(), tx);
                let stop = Arc::new(Notify::new());
                let task = spawn_tailer(
                    self.control_root.clone(),
                    session_id.to_string(),
                    cols,
                    rows,
                    Arc::clone(&subscribers),
                    Arc::clone(&stop),
                );
                entries.insert(
                    session_id.to_string(),
                    SessionEntry {
                        subscribers,
                        task,
                        stop,
                    },
                );
            }
        }
        (sub_id, rx)
    }

    /// Releases one subscription. The last one for a session stops its
    /// tailer task and frees the buffer. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, session_id: &str, sub_id: &str) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(session_id) else {
            return;
        };
        let became_empty = {
            let mut subs = entry.subscribers.lock().await;
            subs.remove(sub_id);
            subs.is_empty()
        };
        if became_empty {
            if let Some(entry) = entries.remove(session_id) {
                entry.stop.notify_one();
                entry.task.abort();
            }
        }
    }

    /// Number of subscribers currently registered for a session (0 if none).
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let entries = self.entries.lock().await;
        match entries.get(session_id) {
            Some(entry) => entry.subscribers.lock().await.len(),
            None => 0,
        }
    }
}

fn spawn_tailer(
    control_root: PathBuf,
    session_id: String,
    cols: u16,
    rows: u16,
    subscribers: SubscriberMap,
    stop: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = TerminalBuffer::new(cols, rows);
        let session_dir = control_root.join(&session_id);
        let stream_path = session_dir.join("stream-out");
        let mut tailer = Tailer::new();
        let mut last_liveness_check = tokio::time::Instant::now();
        let mut interval = tokio::time::interval(TAIL_POLL_INTERVAL);

        // Best-available wake mechanism: an OS file-change notification
        // wakes this loop immediately on a write; the interval tick above
        // is the polling fallback for platforms or races the watcher misses.
        let change_notifier = spawn_change_notifier(&session_dir);
        let changed = change_notifier.as_ref().ok().map(|(_watcher, notify)| Arc::clone(notify));
        if let Err(err) = &change_notifier {
            log::warn!(
                "[buffer] falling back to polling only for session {}: {err}",
                short_id(&session_id)
            );
        }

        loop {
            match &changed {
                Some(notify) => {
                    tokio::select! {
                        () = stop.notified() => return,
                        () = notify.notified() => {}
                        _ = interval.tick() => {}
                    }
                }
                None => {
                    tokio::select! {
                        () = stop.notified() => return,
                        _ = interval.tick() => {}
                    }
                }
            }

            match tailer.poll(&stream_path).await {
                Ok(lines) => {
                    let mut exited = false;
                    for line in lines {
                        if parse_exit_record(&line).is_some() {
                            exited = true;
                            continue;
                        }
                        if let Some(event) = Event::parse(&line) {
                            apply_event(&mut buffer, &event);
                        }
                    }
                    publish(&subscribers, buffer.snapshot()).await;
                    if exited {
                        return;
                    }
                }
                Err(err) => {
                    log::warn!(
                        "[buffer] tail error for session {}: {err}",
                        short_id(&session_id)
                    );
                }
            }

            if last_liveness_check.elapsed() >= LIVENESS_CHECK_INTERVAL {
                last_liveness_check = tokio::time::Instant::now();
                if !session_alive(&control_root, &session_id) {
                    return;
                }
            }
        }
    })
}

fn apply_event(buffer: &mut TerminalBuffer, event: &Event) {
    match event.kind {
        EventType::Output => buffer.process(event.payload.as_bytes()),
        EventType::Resize => {
            if let Some((cols, rows)) = parse_dims(&event.payload) {
                buffer.resize(cols, rows);
            }
        }
        EventType::Input | EventType::Marker => {}
    }
}

async fn publish(subscribers: &SubscriberMap, snapshot: BufferSnapshot) {
    let subs = subscribers.lock().await;
    for tx in subs.values() {
        tx.send(snapshot.clone());
    }
}

fn parse_dims(payload: &str) -> Option<(u16, u16)> {
    let (cols, rows) = payload.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

fn session_alive(control_root: &Path, session_id: &str) -> bool {
    let dir = control_root.join(session_id);
    match Metadata::load(&dir) {
        Ok(meta) => meta.status != Status::Exited,
        Err(_) => false,
    }
}

/// Computes a one-off snapshot by replaying a session's entire `stream-out`
/// file, for callers that want a point-in-time view without maintaining a
/// live subscription (the HTTP `GET .../buffer` endpoint).
///
/// # Errors
///
/// Returns [`Error::StreamReadFailed`](crate::error::Error::StreamReadFailed)
/// if `stream-out` cannot be read.
pub async fn snapshot_once(
    control_root: &Path,
    session_id: &str,
    cols: u16,
    rows: u16,
) -> Result<BufferSnapshot> {
    let stream_path = control_root.join(session_id).join("stream-out");
    let content = tokio::fs::read_to_string(&stream_path)
        .await
        .map_err(|source| crate::error::Error::StreamReadFailed {
            session_id: Some(session_id.to_string()),
            source,
        })?;

    let mut buffer = TerminalBuffer::new(cols, rows);
    for line in content.lines() {
        if parse_exit_record(line).is_some() {
            continue;
        }
        if let Some(event) = Event::parse(line) {
            apply_event(&mut buffer, &event);
        }
    }
    Ok(buffer.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::event::{exit_record, Header};
    use std::io::Write;

    fn write_stream(dir: &Path, session_id: &str, lines: &[String]) {
        let session_dir = dir.join(session_id);
        std::fs::create_dir_all(&session_dir).unwrap();
        let header = Header {
            version: 2,
            width: 5,
            height: 2,
            timestamp: 0,
            command: None,
            title: None,
            env: None,
        };
        let mut file = std::fs::File::create(session_dir.join("stream-out")).unwrap();
        writeln!(file, "{}", serde_json::to_string(&header).unwrap()).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[tokio::test]
    async fn snapshot_once_replays_output_events() {
        let dir = tempfile::tempdir().unwrap();
        let event = Event {
            time: 0.0,
            kind: EventType::Output,
            payload: "hi".to_string(),
        };
        write_stream(dir.path(), "sess", &[event.to_json_line()]);

        let snap = snapshot_once(dir.path(), "sess", 5, 2).await.unwrap();
        assert_eq!(snap.cells[0][0].ch, 'h');
        assert_eq!(snap.cells[0][1].ch, 'i');
    }

    #[tokio::test]
    async fn snapshot_once_applies_resize_events() {
        let dir = tempfile::tempdir().unwrap();
        let resize = Event {
            time: 0.0,
            kind: EventType::Resize,
            payload: "3x1".to_string(),
        };
        write_stream(dir.path(), "sess", &[resize.to_json_line()]);

        let snap = snapshot_once(dir.path(), "sess", 5, 2).await.unwrap();
        assert_eq!(snap.cols, 3);
        assert_eq!(snap.rows, 1);
    }

    #[tokio::test]
    async fn snapshot_once_ignores_exit_record() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), "sess", &[exit_record(0, "sess")]);
        let snap = snapshot_once(dir.path(), "sess", 5, 2).await.unwrap();
        assert!(snap.cells[0].iter().all(crate::buffer::cell::Cell::is_blank));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_releases_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_stream(dir.path(), "sess", &[]);
        let manager = BufferManager::new(dir.path().to_path_buf());

        let (sub_id, _rx) = manager.subscribe("sess", 5, 2).await;
        assert_eq!(manager.subscriber_count("sess").await, 1);

        manager.unsubscribe("sess", &sub_id).await;
        assert_eq!(manager.subscriber_count("sess").await, 0);
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let event = Event {
            time: 0.0,
            kind: EventType::Output,
            payload: "x".to_string(),
        };
        write_stream(dir.path(), "sess", &[event.to_json_line()]);
        let session_dir = dir.path().join("sess");
        let meta_path = session_dir.join("session.json");
        std::fs::write(
            &meta_path,
            serde_json::json!({
                "id": "sess", "name": "sess", "cmdline": ["/bin/sh"], "cwd": "/",
                "pid": null, "status": "running", "exit_code": null,
                "started_at": "2024-01-01T00:00:00Z", "term": "xterm-256color",
                "width": 5, "height": 2, "env": {}
            })
            .to_string(),
        )
        .unwrap();

        let manager = BufferManager::new(dir.path().to_path_buf());
        let (_id1, mut rx1) = manager.subscribe("sess", 5, 2).await;
        let (_id2, mut rx2) = manager.subscribe("sess", 5, 2).await;

        let snap1 = tokio::time::timeout(std::time::Duration::from_secs(2), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let snap2 = tokio::time::timeout(std::time::Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap1.cells[0][0].ch, 'x');
        assert_eq!(snap2.cells[0][0].ch, 'x');
    }
}
