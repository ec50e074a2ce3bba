//! Ingest channel
//!
//! Consumes [`IngestMessage`]s from whichever transport is active, normalizes
//! payloads to f32 and writes them into the adaptive buffer. A configuration
//! or reset builds a fresh buffer and hands its reader to the audio sink.

use crossbeam_channel::Sender;
use tokio::sync::mpsc;

use crate::audio::controller::{create_adaptive_buffer, BufferWriter, StatusReport};
use crate::audio::playback::AudioSink;
use crate::audio::render::RenderCallback;
use crate::codec::decode_s16le;
use crate::config::{BufferTuning, ReportConfig};
use crate::error::{Error, ProtocolError};
use crate::protocol::{IngestMessage, StreamFormat};

/// Ingest counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub configs: u64,
    pub chunks: u64,
    pub samples: u64,
    /// Samples dropped by the buffer on overflow or retention
    pub dropped: u64,
    /// Payloads that arrived before any configuration
    pub discarded: u64,
    /// Payloads rejected as truncated or misaligned
    pub rejected: u64,
}

/// Control-side owner of the buffer writer
pub struct IngestChannel {
    tuning: BufferTuning,
    status_interval_ms: u64,
    status_tx: Sender<StatusReport>,
    sink: Box<dyn AudioSink>,
    writer: Option<BufferWriter>,
    scratch: Vec<f32>,
    stats: IngestStats,
}

impl IngestChannel {
    pub fn new(
        tuning: BufferTuning,
        report: &ReportConfig,
        sink: Box<dyn AudioSink>,
        status_tx: Sender<StatusReport>,
    ) -> Self {
        Self {
            tuning,
            status_interval_ms: report.status_interval_ms(),
            status_tx,
            sink,
            writer: None,
            scratch: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    /// Apply one event
    pub fn handle(&mut self, msg: IngestMessage) -> Result<(), Error> {
        match msg {
            IngestMessage::Config(format) => {
                format.validate()?;
                self.reconfigure(format)
            }
            IngestMessage::Reset => match self.format() {
                Some(format) => self.reconfigure(format),
                None => Ok(()),
            },
            IngestMessage::Pcm(bytes) => {
                if bytes.is_empty() {
                    return Ok(());
                }
                if self.writer.is_none() {
                    return self.discard_unconfigured(bytes.len());
                }
                if let Err(e) = decode_s16le(&bytes, &mut self.scratch) {
                    self.stats.rejected += 1;
                    return Err(e.into());
                }
                let samples = std::mem::take(&mut self.scratch);
                let result = self.write(&samples);
                self.scratch = samples;
                result
            }
            IngestMessage::Samples(samples) => {
                if samples.is_empty() {
                    return Ok(());
                }
                if self.writer.is_none() {
                    return self.discard_unconfigured(samples.len());
                }
                self.write(&samples)
            }
        }
    }

    /// Drain `rx` until every sender is gone, then release the output.
    ///
    /// Sink attach and detach open devices and join threads, so the loop
    /// runs on the blocking pool rather than a runtime worker.
    pub async fn run(self, rx: mpsc::Receiver<IngestMessage>) -> IngestStats {
        let span = tracing::Span::current();
        let task = tokio::task::spawn_blocking(move || span.in_scope(|| self.run_blocking(rx)));
        match task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Ingest thread failed");
                IngestStats::default()
            }
        }
    }

    fn run_blocking(mut self, mut rx: mpsc::Receiver<IngestMessage>) -> IngestStats {
        while let Some(msg) = rx.blocking_recv() {
            if let Err(e) = self.handle(msg) {
                tracing::warn!(error = %e, "Ingest rejected message");
            }
        }
        self.sink.detach();
        tracing::debug!(stats = ?self.stats, "Ingest finished");
        self.stats
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.writer.as_ref().map(|w| w.format())
    }

    pub fn status(&self) -> Option<StatusReport> {
        self.writer.as_ref().map(|w| w.status())
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    fn reconfigure(&mut self, format: StreamFormat) -> Result<(), Error> {
        // Held until the sink has let go of the old reader, so the old storage
        // is freed here rather than on the audio side
        let previous = self.writer.take();

        let (writer, reader) = create_adaptive_buffer(&self.tuning, format);
        let callback = RenderCallback::new(reader, self.status_tx.clone(), self.status_interval_ms);
        let attached = self.sink.attach(format, callback);
        drop(previous);
        attached?;

        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            chunk_frames = ?format.chunk_frames,
            target_ms = writer.status().target_ms,
            "Stream configured"
        );
        self.writer = Some(writer);
        self.stats.configs += 1;
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), Error> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        match writer.write(samples) {
            Ok(report) => {
                self.stats.chunks += 1;
                self.stats.samples += report.stored as u64;
                self.stats.dropped += report.dropped as u64;
                if report.started {
                    tracing::debug!(buffer_ms = writer.status().buffer_ms, "Playback gate opened");
                }
                Ok(())
            }
            Err(e) => {
                self.stats.rejected += 1;
                Err(e.into())
            }
        }
    }

    fn discard_unconfigured(&mut self, len: usize) -> Result<(), Error> {
        self.stats.discarded += 1;
        tracing::debug!(len, error = %ProtocolError::MissingConfig, "Discarding payload");
        Ok(())
    }
}
