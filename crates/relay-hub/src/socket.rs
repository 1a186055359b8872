//! Per-peer socket lifecycle: register, pump frames both ways, tear down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use relay_core::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEngine;
use crate::connection::PeerConnection;

/// Serve one accepted WebSocket until either side ends it.
///
/// Registers a session for `peer`, then runs a writer task (queued frames
/// plus keepalive pings) and a reader task (acks). Returns once the socket
/// closes, a read fails, or the registry drops the session.
pub async fn serve_peer(
    socket: WebSocket,
    peer: PeerId,
    engine: Arc<BroadcastEngine>,
    send_queue: usize,
    heartbeat: Duration,
) {
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(send_queue.max(1));
    let connection = Arc::new(PeerConnection::new(peer.clone(), tx));
    let conn_id = connection.id();
    let session = engine.registry().register(connection);
    info!(peer_id = %peer, conn = %conn_id, "peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: queued frames and pings out; exits when the session is dropped.
    let writer_peer = peer.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                () = session.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.to_string().into())).await {
                        warn!(peer_id = %writer_peer, error = %e, "write failed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(peer_id = %writer_peer, "sent ping");
                }
            }
        }
    });

    // Reader: acks in.
    let reader_engine = Arc::clone(&engine);
    let reader_peer = peer.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if let Err(e) = reader_engine.handle_frame(&reader_peer, conn_id, text.as_str()) {
                        warn!(peer_id = %reader_peer, error = %e, "malformed frame, closing");
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {} // pings are answered by axum; binary is ignored
                Err(e) => {
                    debug!(peer_id = %reader_peer, error = %e, "read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {}
    }
    reader.abort();
    writer.abort();

    let _ = engine.registry().remove_connection(&peer, conn_id);
    info!(peer_id = %peer, conn = %conn_id, "peer disconnected");
}
