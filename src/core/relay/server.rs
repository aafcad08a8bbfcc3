//! WebSocket front end of the relay.
//!
//! One task per accepted socket: the read half feeds [`RelayEvent`]s to the
//! actor, the write half drains the connection's outbox.

use super::{spawn_relay, ConnId, RelayEvent, RelayHandle};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Run the relay on `listener` until `sos` is cancelled.
pub async fn serve(listener: TcpListener, sos: SignalOfStop) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(event = "relay_listening", addr = %addr, "Signaling relay listening");

    let relay = spawn_relay(sos.clone());
    let next_conn = Arc::new(AtomicU64::new(1));

    while let Some(accepted) = sos.select(listener.accept()).await {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(event = "relay_accept_failure", error = %e, "Accept failed");
                continue;
            }
        };
        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
        debug!(event = "relay_tcp_accept", conn, peer = %peer, "TCP connection accepted");

        let relay = relay.clone();
        let sos = sos.child();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn, stream, relay, sos).await {
                debug!(event = "relay_conn_error", conn, error = %e, "Connection ended with error");
            }
        });
    }

    info!(event = "relay_shutdown", "Signaling relay stopped");
    Ok(())
}

async fn handle_connection(
    conn: ConnId,
    stream: TcpStream,
    relay: RelayHandle,
    sos: SignalOfStop,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();

    if !relay.send(RelayEvent::Connected { conn, outbox }) {
        return Ok(());
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(Some(msg)) = sos.select(ws_rx.next()).await {
        match msg {
            Ok(Message::Text(text)) => {
                if !relay.send(RelayEvent::Frame { conn, text }) {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by tungstenite while reading.
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_ws_error", conn, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    // The actor drops the outbox on Disconnected, which ends the writer.
    relay.send(RelayEvent::Disconnected { conn });
    let _ = writer.await;
    Ok(())
}
