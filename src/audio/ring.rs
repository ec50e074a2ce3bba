//! Lock-free sample ring for real-time audio
//!
//! Fixed-capacity single-producer single-consumer storage of interleaved f32
//! samples. The ingest side owns the [`RingWriter`], the render thread owns the
//! [`RingReader`]. Positions are monotonic sample counters; slot indices wrap
//! modulo capacity.
//!
//! Overflow is resolved by the writer alone: it advances the read position
//! past the oldest samples with a compare-and-swap, so the reader never has to
//! wait for it.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::BufferError;

/// Shared storage behind a writer/reader pair
struct SampleRing {
    /// f32 bit patterns
    slots: Box<[AtomicU32]>,
    channels: usize,
    /// Total samples ever written
    write_pos: CachePadded<AtomicU64>,
    /// Total samples ever consumed or dropped
    read_pos: CachePadded<AtomicU64>,
}

impl SampleRing {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.saturating_sub(r) as usize
    }

    fn slot(&self, pos: u64) -> &AtomicU32 {
        &self.slots[(pos % self.slots.len() as u64) as usize]
    }
}

/// Result of a write into the ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Samples from the input now held in the ring
    pub stored: usize,
    /// Samples lost to overflow (oldest buffered first, then input head)
    pub dropped: usize,
}

/// Allocate a ring holding `capacity_frames` frames of `channels` samples
pub fn allocate(capacity_frames: usize, channels: u16) -> (RingWriter, RingReader) {
    let channels = channels.max(1) as usize;
    let capacity = capacity_frames.max(1) * channels;
    let slots: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(0)).collect();

    let ring = Arc::new(SampleRing {
        slots,
        channels,
        write_pos: CachePadded::new(AtomicU64::new(0)),
        read_pos: CachePadded::new(AtomicU64::new(0)),
    });

    (
        RingWriter { ring: ring.clone() },
        RingReader { ring },
    )
}

/// Producer half, owned by the ingest path
pub struct RingWriter {
    ring: Arc<SampleRing>,
}

impl RingWriter {
    /// Append interleaved samples, dropping the oldest buffered samples when
    /// there is not enough free space.
    ///
    /// Writes whose length is not a multiple of the channel count are rejected
    /// without touching the ring.
    pub fn write(&mut self, samples: &[f32]) -> Result<WriteOutcome, BufferError> {
        let ring = &*self.ring;
        let channels = ring.channels;
        if samples.len() % channels != 0 {
            return Err(BufferError::Misaligned {
                samples: samples.len(),
                channels: channels as u16,
            });
        }
        if samples.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let capacity = ring.capacity();
        let mut dropped = 0;
        let samples = if samples.len() > capacity {
            dropped += samples.len() - capacity;
            &samples[samples.len() - capacity..]
        } else {
            samples
        };
        let n = samples.len();

        // Only this half ever moves write_pos.
        let w = ring.write_pos.load(Ordering::Relaxed);
        loop {
            let r = ring.read_pos.load(Ordering::Acquire);
            let used = w.saturating_sub(r) as usize;
            let free = capacity - used;
            if n <= free {
                break;
            }
            let overflow = n - free;
            if ring
                .read_pos
                .compare_exchange(r, r + overflow as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                dropped += overflow;
                break;
            }
        }

        for (i, sample) in samples.iter().enumerate() {
            ring.slot(w + i as u64).store(sample.to_bits(), Ordering::Relaxed);
        }
        ring.write_pos.store(w + n as u64, Ordering::Release);

        Ok(WriteOutcome { stored: n, dropped })
    }

    /// Drop up to `samples` of the oldest buffered samples, rounded down to
    /// whole frames. Returns how many were dropped.
    pub fn discard(&mut self, samples: usize) -> usize {
        let ring = &*self.ring;
        let samples = samples - samples % ring.channels;
        loop {
            let r = ring.read_pos.load(Ordering::Acquire);
            let w = ring.write_pos.load(Ordering::Relaxed);
            let n = samples.min(w.saturating_sub(r) as usize);
            if n == 0 {
                return 0;
            }
            if ring
                .read_pos
                .compare_exchange(r, r + n as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return n;
            }
        }
    }

    /// Buffered samples (all channels)
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// Capacity in samples (all channels)
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn channels(&self) -> u16 {
        self.ring.channels as u16
    }
}

/// Consumer half, owned by the render thread
pub struct RingReader {
    ring: Arc<SampleRing>,
}

impl RingReader {
    /// Fill `out` with the oldest buffered samples and zero-pad any shortfall.
    ///
    /// Only whole frames are consumed. Returns the number of real samples
    /// copied. Never allocates or blocks.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let ring = &*self.ring;
        let wanted = out.len() - out.len() % ring.channels;

        let taken = loop {
            let r = ring.read_pos.load(Ordering::Acquire);
            let w = ring.write_pos.load(Ordering::Acquire);
            let take = wanted.min(w.saturating_sub(r) as usize);

            for (i, dst) in out[..take].iter_mut().enumerate() {
                *dst = f32::from_bits(ring.slot(r + i as u64).load(Ordering::Relaxed));
            }

            // A failed swap means the writer dropped samples under us; the copy
            // may mix old and new data, so read again from the new position.
            if ring
                .read_pos
                .compare_exchange(r, r + take as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break take;
            }
        };

        out[taken..].fill(0.0);
        taken
    }

    /// Buffered samples (all channels)
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// Capacity in samples (all channels)
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn channels(&self) -> u16 {
        self.ring.channels as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_write_then_read_in_order() {
        let (mut writer, mut reader) = allocate(8, 2);
        let outcome = writer.write(&ramp(0, 6)).unwrap();
        assert_eq!(outcome, WriteOutcome { stored: 6, dropped: 0 });
        assert_eq!(reader.available(), 6);

        let mut out = [9.0f32; 4];
        assert_eq!(reader.read(&mut out), 4);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(reader.available(), 2);
    }

    #[test]
    fn test_read_zero_pads_shortfall() {
        let (mut writer, mut reader) = allocate(8, 2);
        writer.write(&[0.5, -0.5]).unwrap();

        let mut out = [1.0f32; 6];
        assert_eq!(reader.read(&mut out), 2);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn test_misaligned_write_rejected() {
        let (mut writer, reader) = allocate(8, 2);
        writer.write(&[1.0, 2.0]).unwrap();
        let err = writer.write(&[1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, BufferError::Misaligned { samples: 3, channels: 2 });
        assert_eq!(reader.available(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (mut writer, mut reader) = allocate(4, 2);
        writer.write(&ramp(0, 6)).unwrap();
        let outcome = writer.write(&ramp(6, 4)).unwrap();
        assert_eq!(outcome, WriteOutcome { stored: 4, dropped: 2 });

        let mut out = [0.0f32; 8];
        assert_eq!(reader.read(&mut out), 8);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_oversized_write_keeps_newest() {
        let (mut writer, mut reader) = allocate(2, 2);
        writer.write(&ramp(100, 2)).unwrap();
        let outcome = writer.write(&ramp(0, 10)).unwrap();
        assert_eq!(outcome.stored, 4);
        assert_eq!(outcome.dropped, 8);

        let mut out = [0.0f32; 4];
        reader.read(&mut out);
        assert_eq!(out, [6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_wraparound() {
        let (mut writer, mut reader) = allocate(3, 1);
        let mut out = [0.0f32; 2];
        for round in 0..10 {
            writer.write(&ramp(round * 2, 2)).unwrap();
            assert_eq!(reader.read(&mut out), 2);
            assert_eq!(out, [(round * 2) as f32, (round * 2 + 1) as f32]);
        }
    }

    #[test]
    fn test_discard_is_frame_aligned() {
        let (mut writer, reader) = allocate(8, 2);
        writer.write(&ramp(0, 8)).unwrap();
        assert_eq!(writer.discard(3), 2);
        assert_eq!(reader.available(), 6);
        assert_eq!(writer.discard(100), 6);
        assert_eq!(writer.discard(2), 0);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let (mut writer, mut reader) = allocate(256, 2);
        let total_frames = 50_000usize;

        let producer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < total_frames {
                if writer.available() + 64 <= writer.capacity() {
                    let block: Vec<f32> = (next..next + 32)
                        .flat_map(|i| [i as f32, -(i as f32)])
                        .collect();
                    writer.write(&block).unwrap();
                    next += 32;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 48];
        while expected < total_frames {
            let n = reader.read(&mut out);
            for frame in out[..n].chunks(2) {
                assert_eq!(frame[0], expected as f32);
                assert_eq!(frame[1], -(expected as f32));
                expected += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_overflow_keeps_frames_whole() {
        let (mut writer, mut reader) = allocate(64, 2);
        let capacity = reader.capacity();
        let total_frames = 200_000usize;
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let producer = {
            let done = done.clone();
            std::thread::spawn(move || {
                // Blocks close to capacity, written with no room check
                let mut dropped = 0usize;
                let mut next = 1usize;
                while next <= total_frames {
                    let len = 48.min(total_frames + 1 - next);
                    let block: Vec<f32> = (next..next + len)
                        .flat_map(|i| [i as f32, -(i as f32)])
                        .collect();
                    dropped += writer.write(&block).unwrap().dropped;
                    next += len;
                }
                done.store(true, Ordering::SeqCst);
                dropped
            })
        };

        let mut last_id = 0.0f32;
        let mut read_samples = 0usize;
        let mut out = [0.0f32; 40];
        loop {
            let finished = done.load(Ordering::SeqCst);
            assert!(reader.available() <= capacity);
            let n = reader.read(&mut out);
            assert_eq!(n % 2, 0);
            for frame in out[..n].chunks(2) {
                assert_eq!(frame[1], -frame[0], "torn frame {:?}", frame);
                assert!(frame[0] > last_id, "frame {} after {}", frame[0], last_id);
                last_id = frame[0];
            }
            read_samples += n;
            if finished && n == 0 && reader.available() == 0 {
                break;
            }
        }

        let dropped = producer.join().unwrap();
        assert_eq!(read_samples + dropped, total_frames * 2);
        assert_eq!(last_id, total_frames as f32);
    }

    proptest! {
        #[test]
        fn prop_write_fills_to_min_of_capacity(
            channels in 1u16..4,
            capacity_frames in 1usize..64,
            writes in proptest::collection::vec(0usize..80, 1..20),
        ) {
            let (mut writer, reader) = allocate(capacity_frames, channels);
            let capacity = capacity_frames * channels as usize;
            for frames in writes {
                let before = reader.available();
                let samples = vec![0.25f32; frames * channels as usize];
                let outcome = writer.write(&samples).unwrap();
                let after = reader.available();
                prop_assert_eq!(after, capacity.min(before + samples.len()));
                prop_assert_eq!(after % channels as usize, 0);
                prop_assert_eq!(outcome.dropped, (before + samples.len()).saturating_sub(capacity));
            }
        }
    }
}
