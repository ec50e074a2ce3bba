//! Fallback transport: raw PCM over a WebSocket
//!
//! The producer sends one `audio_config` text frame, then binary frames of
//! interleaved s16le. Binary frames seen before a valid configuration are
//! dropped here; the ingest task never sees them.

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::network::control::{ControlWriter, WsStream};
use crate::network::manager::LossNotifier;
use crate::protocol::{IngestMessage, Outbound, StreamFormat, UpstreamMessage};

/// Turns stream frames into ingest events
#[derive(Debug, Default)]
pub struct FrameDecoder {
    format: Option<StreamFormat>,
    /// Binary frames dropped for lack of a configuration
    pub discarded: u64,
}

impl FrameDecoder {
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn on_text(&mut self, text: &str) -> Option<IngestMessage> {
        let msg = match serde_json::from_str::<UpstreamMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unparseable control frame");
                return None;
            }
        };
        if msg == UpstreamMessage::Unknown {
            tracing::debug!(text, "Ignoring unknown control frame");
            return None;
        }
        match msg.into_format() {
            Ok(format) => {
                tracing::info!(
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Received audio_config"
                );
                self.format = Some(format);
                Some(IngestMessage::Config(format))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected audio_config");
                None
            }
        }
    }

    pub fn on_binary(&mut self, data: Vec<u8>) -> Option<IngestMessage> {
        if self.format.is_none() {
            self.discarded += 1;
            tracing::debug!(len = data.len(), "Dropping PCM before audio_config");
            return None;
        }
        Some(IngestMessage::Pcm(Bytes::from(data)))
    }
}

/// Connected PCM stream
pub struct PcmStream {
    writer: ControlWriter,
    reader: Option<JoinHandle<()>>,
}

impl PcmStream {
    /// Connect without a deadline; the manager bounds this with a timeout
    pub async fn connect(
        url: &str,
        ingest_tx: mpsc::Sender<IngestMessage>,
        notifier: LossNotifier,
    ) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = ws.split();
        tracing::info!(url, "PCM stream connected");

        Ok(Self {
            writer: ControlWriter::spawn(sink),
            reader: Some(tokio::spawn(read_loop(stream, ingest_tx, notifier))),
        })
    }

    pub fn control_sender(&self) -> mpsc::Sender<Outbound> {
        self.writer.sender()
    }

    /// Tear down; the reader goes first so this is not reported as a loss
    pub async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.writer.close(None).await;
    }
}

impl Drop for PcmStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    ingest_tx: mpsc::Sender<IngestMessage>,
    notifier: LossNotifier,
) {
    let mut decoder = FrameDecoder::default();
    let reason = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => decoder.on_text(&text),
            Some(Ok(Message::Binary(data))) => decoder.on_binary(data),
            Some(Ok(Message::Close(_))) => break "closed by remote".to_string(),
            Some(Ok(_)) => None,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };
        if let Some(event) = event {
            if ingest_tx.send(event).await.is_err() {
                tracing::debug!("Ingest gone, stopping PCM reader");
                return;
            }
        }
    };
    tracing::warn!(%reason, discarded = decoder.discarded, "PCM stream lost");
    notifier.lost();
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{"type":"audio_config","sample_rate":44100,"channels":2,"chunk_frames":1024}"#;

    #[test]
    fn test_binary_before_config_dropped() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.on_binary(vec![0; 8]).is_none());
        assert!(decoder.on_binary(vec![0; 8]).is_none());
        assert_eq!(decoder.discarded, 2);
        assert!(decoder.format().is_none());
    }

    #[test]
    fn test_config_then_pcm() {
        let mut decoder = FrameDecoder::default();
        match decoder.on_text(CONFIG) {
            Some(IngestMessage::Config(format)) => assert_eq!(format.sample_rate, 44100),
            other => panic!("unexpected {:?}", other),
        }
        match decoder.on_binary(vec![1, 2, 3, 4]) {
            Some(IngestMessage::Pcm(bytes)) => assert_eq!(&bytes[..], &[1, 2, 3, 4]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbage_and_unknown_text_ignored() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.on_text("not json").is_none());
        assert!(decoder.on_text(r#"{"type":"hello","x":1}"#).is_none());
        assert!(decoder.on_text(r#"{"type":"audio_config","sample_rate":1,"channels":2}"#).is_none());
        assert!(decoder.format().is_none());
    }

    #[test]
    fn test_reconfiguration_replaces_format() {
        let mut decoder = FrameDecoder::default();
        decoder.on_text(CONFIG);
        let next = r#"{"type":"audio_config","sample_rate":48000,"channels":1}"#;
        assert!(matches!(decoder.on_text(next), Some(IngestMessage::Config(_))));
        assert_eq!(decoder.format().unwrap().sample_rate, 48000);
    }
}
