//! Ring buffer of played-back output samples
//!
//! The AEC pipeline needs a delayed copy of whatever the speaker is
//! playing (the far-end reference). Every output frame is appended here
//! while it is queued for playback; the pipeline later reads a window at
//! `delay_samples` behind the write position.
//!
//! Reads that reach behind the oldest retained sample are zero-filled
//! rather than failing: before playback starts the reference is silence.

use std::sync::Mutex;

/// Fixed-capacity circular store of i16 output samples.
///
/// Thread-safe under concurrent append (playback task) and read (AEC
/// task). Overwrite policy: oldest samples win the eviction.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

struct RingInner {
    buf: Vec<i16>,
    capacity: usize,
    /// Monotone count of samples ever appended. The window
    /// `[write_index - capacity, write_index)` is retained.
    write_index: u64,
}

impl RingBuffer {
    /// Create a buffer retaining `capacity` samples. Typical sizing is two
    /// seconds of audio (`2 * sample_rate`).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0; capacity],
                capacity,
                write_index: 0,
            }),
        }
    }

    /// Append samples, overwriting the oldest on wrap.
    pub fn append(&self, samples: &[i16]) {
        let mut inner = self.inner.lock().unwrap();
        // A write larger than the capacity only keeps its tail.
        let skip = samples.len().saturating_sub(inner.capacity);
        for &s in &samples[skip..] {
            let capacity = inner.capacity;
            let pos = ((inner.write_index + skip as u64) % capacity as u64) as usize;
            inner.buf[pos] = s;
            inner.write_index += 1;
        }
        if skip > 0 {
            inner.write_index += skip as u64;
        }
    }

    /// Read `count` samples ending `delay_samples` behind the write
    /// position, i.e. the window `[write - delay - count, write - delay)`.
    /// Positions that predate the oldest retained sample (or the first
    /// append) come back as zeros.
    pub fn read(&self, delay_samples: usize, count: usize) -> Vec<i16> {
        let inner = self.inner.lock().unwrap();
        let mut out = vec![0i16; count];

        let end = inner.write_index.saturating_sub(delay_samples as u64);
        let oldest = inner.write_index.saturating_sub(inner.capacity as u64);

        for (i, slot) in out.iter_mut().enumerate() {
            let wanted = count - i; // distance back from `end`
            if (wanted as u64) > end {
                continue; // predates the first appended sample
            }
            let pos = end - wanted as u64;
            if pos < oldest {
                continue; // evicted; stays silent
            }
            *slot = inner.buf[(pos % inner.capacity as u64) as usize];
        }
        out
    }

    /// Total samples appended so far.
    pub fn write_index(&self) -> u64 {
        self.inner.lock().unwrap().write_index
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Reset to silence without changing capacity.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.fill(0);
        inner.write_index = 0;
    }
}
