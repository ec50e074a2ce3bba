//! Adaptive jitter buffer controller
//!
//! Owns the sample ring and decides when playback starts, how much latency to
//! hold, and how to recover from underruns.
//!
//! ```text
//!   Idle ──write──▶ Filling ──buffered ≥ target──▶ Playing
//!                     ▲                               │
//!                     └──────write──── Underrun ◀─────┘ read short
//! ```
//!
//! The controller is split into a [`BufferWriter`] for the ingest task and a
//! [`BufferReader`] for the render thread. Shared state is atomics only.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::audio::ring::{self, RingReader, RingWriter};
use crate::config::BufferTuning;
use crate::error::BufferError;
use crate::protocol::{StatusMessage, StreamFormat};

/// Playback phase of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferPhase {
    /// Nothing written yet
    Idle = 0,
    /// Accumulating toward the target
    Filling = 1,
    /// Start gate open
    Playing = 2,
    /// Last read came up short; waiting for data
    Underrun = 3,
}

impl BufferPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BufferPhase::Filling,
            2 => BufferPhase::Playing,
            3 => BufferPhase::Underrun,
            _ => BufferPhase::Idle,
        }
    }
}

/// Snapshot of buffer health
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub buffer_ms: f32,
    pub target_ms: f32,
    pub underruns: u64,
    pub dropped: u64,
    pub started: bool,
}

impl StatusReport {
    pub fn to_message(&self) -> StatusMessage {
        StatusMessage::BufferStatus {
            buffer_ms: self.buffer_ms as f64,
            target_ms: Some(self.target_ms as f64),
            underruns: self.underruns,
        }
    }
}

/// Result of a single write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub stored: usize,
    /// Samples dropped by overflow or the retention ceiling
    pub dropped: usize,
    /// This write opened the start gate
    pub started: bool,
}

/// Result of a single read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Start gate closed; output is silence and nothing was consumed
    Gated { frames: usize },
    /// Request fully served
    Played { frames: usize },
    /// Request came up short; real audio was faded out and padded
    Underrun { real_frames: usize, silent_frames: usize },
}

struct BufferState {
    format: StreamFormat,
    tuning: BufferTuning,
    /// f32 bits
    target_ms: AtomicU32,
    started: AtomicBool,
    /// Last non-playing phase; `started` overrides it
    phase: AtomicU8,
    underruns: AtomicU64,
    dropped: AtomicU64,
}

impl BufferState {
    fn target_ms(&self) -> f32 {
        f32::from_bits(self.target_ms.load(Ordering::Acquire))
    }

    fn set_target_ms(&self, ms: f32) {
        let ms = ms.clamp(self.tuning.min_ms, self.tuning.max_ms);
        self.target_ms.store(ms.to_bits(), Ordering::Release);
    }

    fn phase(&self) -> BufferPhase {
        if self.started.load(Ordering::Acquire) {
            BufferPhase::Playing
        } else {
            BufferPhase::from_u8(self.phase.load(Ordering::Acquire))
        }
    }

    fn report(&self, available: usize) -> StatusReport {
        StatusReport {
            buffer_ms: self.format.samples_to_ms(available),
            target_ms: self.target_ms(),
            underruns: self.underruns.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            started: self.started.load(Ordering::Acquire),
        }
    }
}

/// Allocate a fresh controller for one negotiated format
pub fn create_adaptive_buffer(
    tuning: &BufferTuning,
    format: StreamFormat,
) -> (BufferWriter, BufferReader) {
    let capacity_ms = tuning.capacity_ms.max(tuning.max_ms + tuning.headroom_ms);
    let (ring_writer, ring_reader) =
        ring::allocate(format.frames_for_ms(capacity_ms), format.channels);

    let initial = tuning.initial_target_ms.clamp(tuning.min_ms, tuning.max_ms);
    let state = Arc::new(BufferState {
        format,
        tuning: tuning.clone(),
        target_ms: AtomicU32::new(initial.to_bits()),
        started: AtomicBool::new(false),
        phase: AtomicU8::new(BufferPhase::Idle as u8),
        underruns: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });

    let writer = BufferWriter {
        ring: ring_writer,
        state: state.clone(),
    };
    let reader = BufferReader {
        ring: ring_reader,
        stable_frames: format.frames_for_ms(tuning.stable_ms) as u64,
        cooldown_frames: format.frames_for_ms(tuning.cooldown_ms) as u64,
        fade_frames: format.frames_for_ms(tuning.fade_ms).max(1),
        frames_since_underrun: 0,
        frames_since_decrease: None,
        state,
    };
    (writer, reader)
}

/// Ingest-side half of the controller
pub struct BufferWriter {
    ring: RingWriter,
    state: Arc<BufferState>,
}

impl BufferWriter {
    /// Write normalized interleaved samples.
    ///
    /// Overflow and the retention ceiling drop the oldest audio. Misaligned
    /// chunks are rejected with no state change.
    pub fn write(&mut self, samples: &[f32]) -> Result<WriteReport, BufferError> {
        if samples.is_empty() {
            return Ok(WriteReport::default());
        }
        let outcome = self.ring.write(samples)?;
        let state = &*self.state;
        let format = state.format;
        let mut dropped = outcome.dropped;

        let target_ms = state.target_ms();
        let ceiling = self
            .ring
            .capacity()
            .min(format.samples_for_ms(target_ms + state.tuning.headroom_ms));
        let available = self.ring.available();
        if available > ceiling {
            dropped += self.ring.discard(available - ceiling);
        }
        if dropped > 0 {
            state.dropped.fetch_add(dropped as u64, Ordering::AcqRel);
        }

        let mut started = false;
        if !state.started.load(Ordering::Acquire) {
            let _ = state.phase.compare_exchange(
                BufferPhase::Idle as u8,
                BufferPhase::Filling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            let _ = state.phase.compare_exchange(
                BufferPhase::Underrun as u8,
                BufferPhase::Filling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            // Reloaded after `started` so an underrun's growth is seen
            if self.ring.available() >= format.samples_for_ms(state.target_ms()) {
                state.started.store(true, Ordering::Release);
                started = true;
            }
        }

        Ok(WriteReport {
            stored: outcome.stored,
            dropped,
            started,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.state.format
    }

    pub fn phase(&self) -> BufferPhase {
        self.state.phase()
    }

    pub fn status(&self) -> StatusReport {
        self.state.report(self.ring.available())
    }
}

/// Render-side half of the controller
pub struct BufferReader {
    ring: RingReader,
    state: Arc<BufferState>,
    stable_frames: u64,
    cooldown_frames: u64,
    fade_frames: usize,
    frames_since_underrun: u64,
    /// `None` until the first decrease
    frames_since_decrease: Option<u64>,
}

impl BufferReader {
    /// Fill `out` (interleaved) for one render block.
    ///
    /// Never allocates, locks or blocks.
    pub fn read(&mut self, out: &mut [f32]) -> ReadOutcome {
        let channels = self.state.format.channels as usize;
        let requested = out.len() - out.len() % channels;
        let frames = requested / channels;
        out[requested..].fill(0.0);

        if !self.state.started.load(Ordering::Acquire) {
            out[..requested].fill(0.0);
            return ReadOutcome::Gated { frames };
        }

        let got = self.ring.read(&mut out[..requested]);
        if got == requested {
            self.frames_since_underrun += frames as u64;
            if let Some(since) = self.frames_since_decrease.as_mut() {
                *since += frames as u64;
            }
            return ReadOutcome::Played { frames };
        }

        let real_frames = got / channels;
        self.fade_out(&mut out[..got], real_frames);

        // Grown target and phase must be visible before the gate closes, or
        // the writer could reopen it against the old target
        let state = &*self.state;
        state.set_target_ms(state.target_ms() * state.tuning.growth_factor);
        state.underruns.fetch_add(1, Ordering::AcqRel);
        state.phase.store(BufferPhase::Underrun as u8, Ordering::Release);
        state.started.store(false, Ordering::Release);
        self.frames_since_underrun = 0;

        ReadOutcome::Underrun {
            real_frames,
            silent_frames: frames - real_frames,
        }
    }

    /// Apply the recovery decay once the link has been stable long enough.
    /// Returns the new target when it was lowered.
    pub fn settle(&mut self) -> Option<f32> {
        if self.frames_since_underrun < self.stable_frames {
            return None;
        }
        if self
            .frames_since_decrease
            .is_some_and(|since| since < self.cooldown_frames)
        {
            return None;
        }
        let state = &*self.state;
        let current = state.target_ms();
        let lowered = (current - state.tuning.decay_step_ms).max(state.tuning.min_ms);
        if lowered >= current {
            return None;
        }
        state.set_target_ms(lowered);
        self.frames_since_decrease = Some(0);
        Some(lowered)
    }

    /// Linear fade to silence over the last `fade_frames` of real audio
    fn fade_out(&self, samples: &mut [f32], real_frames: usize) {
        let channels = self.state.format.channels as usize;
        let len = self.fade_frames.min(real_frames);
        let first = real_frames - len;
        for j in 0..len {
            let gain = (len - j) as f32 / (len + 1) as f32;
            let frame = first + j;
            for sample in &mut samples[frame * channels..(frame + 1) * channels] {
                *sample *= gain;
            }
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.state.format
    }

    /// Buffered samples (all channels)
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn phase(&self) -> BufferPhase {
        self.state.phase()
    }

    pub fn status(&self) -> StatusReport {
        self.state.report(self.ring.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stereo_44k() -> StreamFormat {
        StreamFormat::new(44100, 2)
    }

    fn tuning() -> BufferTuning {
        BufferTuning {
            initial_target_ms: 120.0,
            ..BufferTuning::default()
        }
    }

    fn frames(n: usize, value: f32) -> Vec<f32> {
        vec![value; n * 2]
    }

    #[test]
    fn test_start_gate_opens_at_target() {
        // Wide headroom so the retention ceiling stays out of the way.
        let tuning = BufferTuning {
            headroom_ms: 500.0,
            ..tuning()
        };
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning, stereo_44k());
        assert_eq!(writer.phase(), BufferPhase::Idle);

        let first = writer.write(&frames(4096, 0.1)).unwrap();
        assert!(!first.started);
        assert_eq!(writer.phase(), BufferPhase::Filling);

        let second = writer.write(&frames(4096, 0.1)).unwrap();
        assert!(second.started, "8192 frames covers the 5292-frame target");
        let third = writer.write(&frames(4096, 0.1)).unwrap();
        assert!(!third.started);
        assert_eq!(writer.phase(), BufferPhase::Playing);

        let mut out = vec![0.0f32; 512 * 2];
        assert_eq!(reader.read(&mut out), ReadOutcome::Played { frames: 512 });
        assert_eq!(reader.status().underruns, 0);
        assert!(out.iter().all(|&s| s == 0.1));
    }

    #[test]
    fn test_gate_flips_exactly_at_threshold() {
        let (mut writer, _reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        assert!(!writer.write(&frames(5291, 0.0)).unwrap().started);
        assert!(writer.write(&frames(1, 0.0)).unwrap().started);
    }

    #[test]
    fn test_gated_read_outputs_silence_without_consuming() {
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        writer.write(&frames(1000, 0.5)).unwrap();

        let mut out = vec![1.0f32; 256 * 2];
        assert_eq!(reader.read(&mut out), ReadOutcome::Gated { frames: 256 });
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(reader.status().underruns, 0);
        assert!((reader.status().buffer_ms - 1000.0 * 1000.0 / 44100.0).abs() < 0.01);
    }

    #[test]
    fn test_underrun_fades_and_pads() {
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        writer.write(&frames(5292, 1.0)).unwrap();
        let mut drain = vec![0.0f32; 5192 * 2];
        assert_eq!(reader.read(&mut drain), ReadOutcome::Played { frames: 5192 });
        assert_eq!(reader.available(), 200);

        let target_before = reader.status().target_ms;
        let mut out = vec![9.0f32; 1024 * 2];
        let outcome = reader.read(&mut out);
        assert_eq!(
            outcome,
            ReadOutcome::Underrun {
                real_frames: 100,
                silent_frames: 924
            }
        );

        let real = &out[..200];
        assert!(real.iter().all(|&s| s > 0.0 && s < 1.0));
        assert!(real.chunks(2).zip(real.chunks(2).skip(1)).all(|(a, b)| a[0] > b[0]));
        assert!(out[200..].iter().all(|&s| s == 0.0));

        let status = reader.status();
        assert_eq!(status.underruns, 1);
        assert!(!status.started);
        assert_eq!(reader.phase(), BufferPhase::Underrun);
        assert!(status.target_ms > target_before);
    }

    #[test]
    fn test_underrun_growth_clamped_to_max() {
        let tuning = BufferTuning {
            initial_target_ms: 800.0,
            max_ms: 1000.0,
            ..tuning()
        };
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning, stereo_44k());
        writer.write(&frames(44100, 0.2)).unwrap();
        let mut out = vec![0.0f32; 64 * 1024];
        while !matches!(reader.read(&mut out), ReadOutcome::Underrun { .. }) {}
        assert_eq!(reader.status().target_ms, 1000.0);
    }

    #[test]
    fn test_refill_after_underrun_reopens_gate() {
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        writer.write(&frames(6000, 0.3)).unwrap();
        let mut out = vec![0.0f32; 8000 * 2];
        assert!(matches!(reader.read(&mut out), ReadOutcome::Underrun { .. }));

        // Target grew to 180 ms, so 120 ms of data no longer opens the gate.
        assert!(!writer.write(&frames(5292, 0.3)).unwrap().started);
        assert_eq!(writer.phase(), BufferPhase::Filling);
        assert!(writer.write(&frames(2646, 0.3)).unwrap().started);
    }

    #[test]
    fn test_concurrent_underruns_keep_state_consistent() {
        let tuning = BufferTuning {
            initial_target_ms: 60.0,
            min_ms: 60.0,
            max_ms: 2000.0,
            growth_factor: 1.1,
            ..tuning()
        };
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning, stereo_44k());
        let done = Arc::new(AtomicBool::new(false));

        // Reader drains faster than the writer fills, so underruns keep racing writes
        let render = {
            let done = done.clone();
            std::thread::spawn(move || {
                let mut out = vec![0.0f32; 256 * 2];
                let mut underruns = 0u64;
                while !done.load(Ordering::SeqCst) {
                    if let ReadOutcome::Underrun { .. } = reader.read(&mut out) {
                        underruns += 1;
                    }
                }
                (underruns, reader)
            })
        };

        let mut opened = 0u64;
        for _ in 0..20_000 {
            if writer.write(&frames(64, 0.2)).unwrap().started {
                opened += 1;
            }
        }
        done.store(true, Ordering::SeqCst);
        let (underruns, reader) = render.join().unwrap();

        let status = reader.status();
        assert_eq!(status.underruns, underruns);
        assert!(opened >= underruns);
        let expected = (60.0 * 1.1f32.powi(underruns as i32)).min(2000.0);
        assert!((status.target_ms - expected).abs() <= expected * 1e-3);
    }

    #[test]
    fn test_retention_ceiling_bounds_latency() {
        let tuning = BufferTuning {
            headroom_ms: 100.0,
            ..tuning()
        };
        let (mut writer, _reader) = create_adaptive_buffer(&tuning, stereo_44k());
        let report = writer.write(&frames(44100, 0.0)).unwrap();

        let ceiling = stereo_44k().samples_for_ms(220.0);
        assert_eq!(report.dropped, 44100 * 2 - ceiling);
        assert_eq!(writer.status().dropped, report.dropped as u64);
        assert!(writer.status().buffer_ms <= 220.0 + 0.1);
    }

    #[test]
    fn test_misaligned_chunk_rejected_without_mutation() {
        let (mut writer, _reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        let before = writer.status();
        assert!(writer.write(&[0.1, 0.2, 0.3]).is_err());
        assert_eq!(writer.status(), before);
        assert_eq!(writer.phase(), BufferPhase::Idle);
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let (mut writer, _reader) = create_adaptive_buffer(&tuning(), stereo_44k());
        assert_eq!(writer.write(&[]).unwrap(), WriteReport::default());
        assert_eq!(writer.phase(), BufferPhase::Idle);
    }

    #[test]
    fn test_decay_after_stable_interval_with_cooldown() {
        let tuning = BufferTuning {
            initial_target_ms: 200.0,
            min_ms: 60.0,
            stable_ms: 100.0,
            cooldown_ms: 50.0,
            decay_step_ms: 10.0,
            headroom_ms: 1000.0,
            ..tuning()
        };
        let format = StreamFormat::new(1000, 1);
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning, format);
        writer.write(&vec![0.0; 1000]).unwrap();

        let mut out = vec![0.0f32; 10];
        for _ in 0..9 {
            reader.read(&mut out);
            assert_eq!(reader.settle(), None);
        }
        reader.read(&mut out);
        assert_eq!(reader.settle(), Some(190.0));

        // Cooldown: 50 frames must pass before the next step.
        for _ in 0..4 {
            reader.read(&mut out);
            assert_eq!(reader.settle(), None);
        }
        reader.read(&mut out);
        assert_eq!(reader.settle(), Some(180.0));
    }

    #[test]
    fn test_decay_never_goes_below_min() {
        let tuning = BufferTuning {
            initial_target_ms: 65.0,
            min_ms: 60.0,
            stable_ms: 1.0,
            cooldown_ms: 1.0,
            decay_step_ms: 10.0,
            ..tuning()
        };
        let format = StreamFormat::new(1000, 1);
        let (mut writer, mut reader) = create_adaptive_buffer(&tuning, format);
        writer.write(&vec![0.0; 100]).unwrap();
        let mut out = vec![0.0f32; 5];
        reader.read(&mut out);
        assert_eq!(reader.settle(), Some(60.0));
        reader.read(&mut out);
        assert_eq!(reader.settle(), None);
        assert_eq!(reader.status().target_ms, 60.0);
    }

    proptest! {
        #[test]
        fn prop_target_stays_within_bounds(
            ops in proptest::collection::vec((any::<bool>(), 1usize..4000), 1..60),
        ) {
            let tuning = BufferTuning {
                stable_ms: 20.0,
                cooldown_ms: 10.0,
                ..tuning()
            };
            let (mut writer, mut reader) = create_adaptive_buffer(&tuning, stereo_44k());
            let mut out = vec![0.0f32; 4000 * 2];
            let mut last_dropped = 0;
            for (is_write, n) in ops {
                if is_write {
                    writer.write(&frames(n, 0.5)).unwrap();
                } else {
                    let before = reader.status();
                    let outcome = reader.read(&mut out[..n * 2]);
                    if let ReadOutcome::Played { .. } = outcome {
                        prop_assert_eq!(reader.status().target_ms, before.target_ms);
                    }
                    reader.settle();
                }
                let status = writer.status();
                prop_assert!(status.target_ms >= tuning.min_ms);
                prop_assert!(status.target_ms <= tuning.max_ms);
                prop_assert!(status.dropped >= last_dropped);
                last_dropped = status.dropped;
            }
        }

        #[test]
        fn prop_full_read_consumes_exactly(n in 1usize..2000) {
            let (mut writer, mut reader) = create_adaptive_buffer(&tuning(), stereo_44k());
            writer.write(&frames(6000, 0.5)).unwrap();
            let before = reader.status();
            let available = reader.available();
            let mut out = vec![0.0f32; n * 2];
            prop_assert_eq!(reader.read(&mut out), ReadOutcome::Played { frames: n });
            prop_assert_eq!(reader.status().target_ms, before.target_ms);
            prop_assert_eq!(reader.available(), available - n * 2);
        }
    }
}
