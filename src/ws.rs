//! `/buffers` WebSocket surface: clients subscribe to one or more sessions'
//! terminal buffers and receive coalesced binary snapshots as they change.
//!
//! The HTTP upgrade handshake itself is the embedder's job; this module
//! takes an already-established [`WebSocketStream`] and runs its lifetime.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{select_all, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::buffer::manager::BufferManager;
use crate::buffer::snapshot::BufferSnapshot;
use crate::constants::{WS_PING_INTERVAL, WS_PONG_TIMEOUT};
use crate::subscription::SnapshotReceiver;

/// Binary frame tag: `0xBF | u32_le sessionIdLen | sessionId | snapshot bytes`.
const SNAPSHOT_FRAME_TAG: u8 = 0xBF;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Error { message: String },
}

struct Subscription {
    session_id: String,
    sub_id: String,
    rx: SnapshotReceiver,
}

/// Runs the `/buffers` protocol over an already-upgraded WebSocket
/// connection until the client disconnects or the pong timeout elapses.
///
/// `cols`/`rows` size every buffer this connection subscribes to; a client
/// wanting a different size reconnects.
///
/// # Errors
///
/// Returns the underlying [`tokio_tungstenite`] error if the socket itself
/// fails. A malformed control message never surfaces as one of these — it
/// is reported to the client as a JSON error frame instead.
pub async fn serve_buffers<S>(
    stream: WebSocketStream<S>,
    buffer_manager: Arc<BufferManager>,
    cols: u16,
    rows: u16,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let mut subs: Vec<Subscription> = Vec::new();
    let mut ping_tick = tokio::time::interval(WS_PING_INTERVAL);
    ping_tick.tick().await; // first tick fires immediately; consume it
    let mut last_pong = Instant::now();

    let result = loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    log::info!("[ws] closing idle connection (no pong within {WS_PONG_TIMEOUT:?})");
                    break Ok(());
                }
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    break Err(err);
                }
            }

            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_control(&text, &buffer_manager, cols, rows, &mut subs, &mut sink).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(err),
                }
            }

            (session_id, sub_id, snapshot) = next_snapshot(&mut subs) => {
                match snapshot {
                    Some(snapshot) => {
                        let frame = encode_frame(&session_id, &snapshot.encode());
                        if let Err(err) = sink.send(Message::Binary(frame)).await {
                            break Err(err);
                        }
                    }
                    None => {
                        // Sender side went away from under us (its tailer
                        // task stopped); drop this one subscription.
                        subs.retain(|s| s.sub_id != sub_id);
                    }
                }
            }
        }
    };

    for sub in subs {
        buffer_manager.unsubscribe(&sub.session_id, &sub.sub_id).await;
    }
    result
}

/// Races every subscription's next snapshot. Rebuilt each call since the
/// subscription set changes as clients (un)subscribe; `select_all` panics
/// on an empty list, so this awaits forever instead when there is nothing
/// to race, letting the ping/incoming-frame branches keep driving the loop.
async fn next_snapshot(subs: &mut [Subscription]) -> (String, String, Option<BufferSnapshot>) {
    if subs.is_empty() {
        std::future::pending().await
    } else {
        let futures: Vec<BoxFuture<'_, (String, String, Option<BufferSnapshot>)>> = subs
            .iter_mut()
            .map(|sub| {
                let session_id = sub.session_id.clone();
                let sub_id = sub.sub_id.clone();
                let fut: BoxFuture<'_, _> = Box::pin(async move {
                    let snapshot = sub.rx.recv().await;
                    (session_id, sub_id, snapshot)
                });
                fut
            })
            .collect();
        let (result, _idx, _rest) = select_all(futures).await;
        result
    }
}

async fn handle_control<S>(
    text: &str,
    buffer_manager: &Arc<BufferManager>,
    cols: u16,
    rows: u16,
    subs: &mut Vec<Subscription>,
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            send_error(sink, format!("invalid control message: {err}")).await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { session_id } => {
            let (sub_id, rx) = buffer_manager.subscribe(&session_id, cols, rows).await;
            log::info!("[ws] subscribed to {session_id} ({sub_id})");
            subs.push(Subscription { session_id, sub_id, rx });
        }
        ClientMessage::Unsubscribe { session_id } => {
            let mut removed = Vec::new();
            subs.retain(|sub| {
                if sub.session_id == session_id {
                    removed.push(sub.sub_id.clone());
                    false
                } else {
                    true
                }
            });
            for sub_id in removed {
                buffer_manager.unsubscribe(&session_id, &sub_id).await;
            }
        }
    }
}

async fn send_error<S>(sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>, message: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(body) = serde_json::to_string(&ServerMessage::Error { message }) else {
        return;
    };
    let _ = sink.send(Message::Text(body)).await;
}

fn encode_frame(session_id: &str, snapshot_bytes: &[u8]) -> Vec<u8> {
    let id_bytes = session_id.as_bytes();
    let mut frame = Vec::with_capacity(1 + 4 + id_bytes.len() + snapshot_bytes.len());
    frame.push(SNAPSHOT_FRAME_TAG);
    frame.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(id_bytes);
    frame.extend_from_slice(snapshot_bytes);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http;
    use crate::session::manager::SessionManager;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    #[test]
    fn encode_frame_matches_the_documented_layout() {
        let frame = encode_frame("abc", &[1, 2, 3]);
        assert_eq!(frame[0], 0xBF);
        assert_eq!(&frame[1..5], &3u32.to_le_bytes());
        assert_eq!(&frame[5..8], b"abc");
        assert_eq!(&frame[8..], &[1, 2, 3]);
    }

    fn test_config(control_root: &std::path::Path) -> Config {
        Config {
            control_root: control_root.to_path_buf(),
            default_cols: 20,
            default_rows: 5,
            default_term: "xterm-256color".to_string(),
            liveness_check_interval_ms: 5000,
            terminate_grace_period_ms: 3000,
        }
    }

    #[tokio::test]
    async fn client_receives_a_binary_snapshot_after_subscribing() {
        let dir = tempfile::tempdir().unwrap();
        let session_manager = SessionManager::new(test_config(dir.path()));
        let created = http::create_session(
            &session_manager,
            http::CreateSessionRequest {
                command: vec!["/bin/sh".to_string(), "-c".to_string(), "printf hi; sleep 2".to_string()],
                working_dir: dir.path().to_path_buf(),
                name: None,
                cols: Some(20),
                rows: Some(5),
                env: HashMap::new(),
            },
        )
        .await
        .unwrap();

        let buffer_manager = Arc::new(BufferManager::new(dir.path().to_path_buf()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_buffer_manager = Arc::clone(&buffer_manager);
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            serve_buffers(ws, server_buffer_manager, 20, 5).await.unwrap();
        });

        let (mut client, _) = connect_async(format!("ws://{addr}/buffers")).await.unwrap();
        let subscribe = serde_json::json!({"type": "subscribe", "sessionId": created.session_id});
        client.send(Message::Text(subscribe.to_string())).await.unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match client.next().await.unwrap().unwrap() {
                    Message::Binary(bytes) => break bytes,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(frame[0], 0xBF);
        let id_len = u32::from_le_bytes(frame[1..5].try_into().unwrap()) as usize;
        let id = String::from_utf8(frame[5..5 + id_len].to_vec()).unwrap();
        assert_eq!(id, created.session_id);
        let snapshot = BufferSnapshot::decode(&frame[5 + id_len..]).unwrap();
        assert_eq!(snapshot.cells[0][0].ch, 'h');

        client.close(None).await.unwrap();
        let _ = server.await;
    }
}
