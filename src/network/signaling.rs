//! WebRTC signaling over a WebSocket
//!
//! Offers, answers and trickle candidates are JSON text frames. Inbound frames
//! are parsed into [`SignalingMessage`]s; anything unparseable is skipped.

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::network::control::{ControlWriter, WsStream};
use crate::protocol::{Outbound, SignalingMessage};

/// Open signaling session
pub struct SignalingChannel {
    writer: ControlWriter,
    inbound: mpsc::Receiver<SignalingMessage>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Connect without a deadline; callers wrap this in a timeout
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = ws.split();
        let (inbound_tx, inbound) = mpsc::channel(64);

        tracing::debug!(url, "Signaling connected");
        Ok(Self {
            writer: ControlWriter::spawn(sink),
            inbound,
            reader: Some(tokio::spawn(read_loop(stream, inbound_tx))),
        })
    }

    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.writer.sender()
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        self.writer
            .sender()
            .send(Outbound::Signal(msg))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next message from the remote; `None` once the socket is gone
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.recv().await
    }

    /// Split off the inbound queue for a supervisor task
    pub fn take_inbound(&mut self) -> mpsc::Receiver<SignalingMessage> {
        let (_closed_tx, closed_rx) = mpsc::channel(1);
        std::mem::replace(&mut self.inbound, closed_rx)
    }

    /// Send `close`, then shut the socket. Idempotent.
    pub async fn close(&mut self) {
        self.writer
            .close(Some(Outbound::Signal(SignalingMessage::Close)))
            .await;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<SignalingMessage>) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Signaling socket error");
                break;
            }
        };
        match serde_json::from_str::<SignalingMessage>(&text) {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring unparseable signaling message"),
        }
    }
    tracing::debug!("Signaling reader finished");
}
