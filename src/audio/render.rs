//! Real-time render callback
//!
//! Runs on the platform audio thread. Everything here is allocation-free and
//! lock-free: it reads from the buffer, applies the decay policy, and every
//! `status_interval` of rendered audio drops a [`StatusReport`] into a bounded
//! queue for the control side.

use crossbeam_channel::Sender;

use crate::audio::controller::{BufferReader, ReadOutcome, StatusReport};
use crate::protocol::StreamFormat;

/// Counters kept by the callback itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub blocks: u64,
    pub frames: u64,
    pub reports_sent: u64,
    /// Reports lost because the queue was full
    pub reports_dropped: u64,
}

/// Consumer side of the pipeline, driven by the audio clock
pub struct RenderCallback {
    reader: BufferReader,
    status_tx: Sender<StatusReport>,
    frames_per_report: u64,
    frames_since_report: u64,
    stats: RenderStats,
}

impl RenderCallback {
    pub fn new(reader: BufferReader, status_tx: Sender<StatusReport>, status_interval_ms: u64) -> Self {
        let frames_per_report = reader
            .format()
            .frames_for_ms(status_interval_ms as f32)
            .max(1) as u64;
        Self {
            reader,
            status_tx,
            frames_per_report,
            frames_since_report: 0,
            stats: RenderStats::default(),
        }
    }

    /// Render one interleaved output block
    pub fn render(&mut self, out: &mut [f32]) -> ReadOutcome {
        let outcome = self.reader.read(out);
        self.reader.settle();

        let frames = match outcome {
            ReadOutcome::Gated { frames } | ReadOutcome::Played { frames } => frames,
            ReadOutcome::Underrun {
                real_frames,
                silent_frames,
            } => real_frames + silent_frames,
        } as u64;
        self.stats.blocks += 1;
        self.stats.frames += frames;

        self.frames_since_report += frames;
        if self.frames_since_report >= self.frames_per_report {
            self.frames_since_report = 0;
            match self.status_tx.try_send(self.reader.status()) {
                Ok(()) => self.stats.reports_sent += 1,
                Err(_) => self.stats.reports_dropped += 1,
            }
        }
        outcome
    }

    pub fn format(&self) -> StreamFormat {
        self.reader.format()
    }

    pub fn status(&self) -> StatusReport {
        self.reader.status()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }
}
