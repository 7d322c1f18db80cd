//! One WebSocket client from upgrade to disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::router::ChatRouter;

/// Run a session until the socket closes.
///
/// Outbound events go through a bounded queue drained by a writer task, so
/// the router never waits on this socket. Inbound text frames (and binary
/// frames carrying UTF-8) are handed to the router in arrival order.
#[instrument(skip_all)]
pub async fn run_ws_session(socket: WebSocket, router: Arc<ChatRouter>, queue: usize) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<String>(queue.max(1));
    let conn = router.connect(send_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = send_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = %conn, error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => router.handle_frame(conn, &text).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => router.handle_frame(conn, text).await,
                Err(_) => debug!(conn = %conn, len = data.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Message::Close(_) => {
                debug!(conn = %conn, "Client sent close frame");
                break;
            }
            // axum answers pings itself.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    router.disconnect(conn).await;
    writer.abort();
    info!(conn = %conn, "Client disconnected");
}
