//! Outbound half of a client WebSocket
//!
//! Every transport writes JSON control messages (signaling, buffer status) from
//! several tasks. They all go through one bounded queue drained by a single
//! writer task that owns the socket sink.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::constants::OUTBOUND_QUEUE_DEPTH;
use crate::protocol::Outbound;

/// Client WebSocket as returned by `connect_async`
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Longest wait for the close handshake to flush
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to the writer task of one WebSocket
pub struct ControlWriter {
    tx: mpsc::Sender<Outbound>,
    shutdown: Option<oneshot::Sender<Option<Outbound>>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlWriter {
    pub fn spawn(sink: SplitSink<WsStream, Message>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(write_loop(sink, rx, shutdown_rx));
        Self {
            tx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queue for control messages; callers use `try_send`
    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }

    /// Send `farewell` (if any), close the socket and wait for the writer.
    /// Safe to call more than once.
    pub async fn close(&mut self, farewell: Option<Outbound>) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(farewell);
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
                tracing::debug!("Control writer did not finish closing, aborted");
            }
        }
    }
}

impl Drop for ControlWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: oneshot::Receiver<Option<Outbound>>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = send_json(&mut sink, &msg).await {
                    tracing::debug!(error = %e, "Control write failed");
                    break;
                }
            }
            farewell = &mut shutdown => {
                if let Ok(Some(msg)) = farewell {
                    let _ = send_json(&mut sink, &msg).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn send_json(
    sink: &mut SplitSink<WsStream, Message>,
    msg: &Outbound,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match msg.to_json() {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode control message");
            Ok(())
        }
    }
}
