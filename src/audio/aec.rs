//! Acoustic echo cancellation contract
//!
//! The actual audio-processing module (WebRTC APM or a platform voice
//! processor) lives behind the [`AecBackend`] trait. [`EchoCanceller`]
//! wraps a backend and owns the contract enforcement: frames must be
//! exactly 10 ms of mono 16-bit PCM at the configured rate, the canceller
//! must be configured before use, and a failing backend never corrupts
//! the near-end audio: the frame passes through unchanged and a drop
//! counter ticks instead.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Processing backend: echo cancellation, noise suppression, gain control
/// and high-pass filtering over 10 ms frames.
///
/// `process_reverse` receives the far-end (playback) frame;
/// `process_near` mutates the captured frame in place.
pub trait AecBackend: Send {
    fn process_reverse(&mut self, far_end: &mut [i16]) -> std::result::Result<(), String>;
    fn process_near(&mut self, near_end: &mut [i16]) -> std::result::Result<(), String>;
    fn set_stream_delay_ms(&mut self, delay_ms: u16) -> std::result::Result<(), String>;
}

/// Backend that applies no processing. Used by console mode and tests,
/// and as the stand-in wherever no platform APM is linked.
#[derive(Debug, Default)]
pub struct PassthroughAec;

impl AecBackend for PassthroughAec {
    fn process_reverse(&mut self, _far_end: &mut [i16]) -> std::result::Result<(), String> {
        Ok(())
    }

    fn process_near(&mut self, _near_end: &mut [i16]) -> std::result::Result<(), String> {
        Ok(())
    }

    fn set_stream_delay_ms(&mut self, _delay_ms: u16) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Frame-oriented echo canceller enforcing the 10 ms / mono / 16-bit
/// contract around an [`AecBackend`].
pub struct EchoCanceller {
    backend: Box<dyn AecBackend>,
    sample_rate: u32,
    frame_samples: usize,
    configured: bool,
    dropped_frames: AtomicU64,
}

impl EchoCanceller {
    /// Wrap a backend for the given sample rate. The canceller is not
    /// usable until [`configure`](Self::configure) has run.
    pub fn new(backend: Box<dyn AecBackend>, sample_rate: u32) -> Self {
        Self {
            backend,
            sample_rate,
            frame_samples: (sample_rate / 100) as usize,
            configured: false,
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Set the nominal delay between a reverse frame arriving and its echo
    /// showing up in the near-end capture. Marks the canceller configured.
    pub fn configure(&mut self, stream_delay_ms: u16) -> Result<()> {
        self.backend
            .set_stream_delay_ms(stream_delay_ms)
            .map_err(AgentError::AudioProcessingError)?;
        self.configured = true;
        debug!("echo canceller configured, stream delay {} ms", stream_delay_ms);
        Ok(())
    }

    /// Feed the audio currently being played (far-end reference).
    pub fn process_reverse(&mut self, far_end: &mut [i16]) -> Result<()> {
        self.check_frame(far_end.len())?;
        if let Err(reason) = self.backend.process_reverse(far_end) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Err(AgentError::AudioProcessingError(reason));
        }
        Ok(())
    }

    /// Process a captured near-end frame in place. On backend failure the
    /// frame is left untouched and the error is reported; callers keep the
    /// unprocessed audio rather than losing the tick.
    pub fn process_near(&mut self, near_end: &mut [i16]) -> Result<()> {
        self.check_frame(near_end.len())?;
        if let Err(reason) = self.backend.process_near(near_end) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            warn!("AEC near-end processing failed, passing frame through: {}", reason);
            return Err(AgentError::AudioProcessingError(reason));
        }
        Ok(())
    }

    /// Update the nominal playback-to-capture delay.
    pub fn set_stream_delay(&mut self, delay_ms: u16) -> Result<()> {
        if !self.configured {
            return Err(AgentError::NotStarted("echo canceller".to_string()));
        }
        self.backend
            .set_stream_delay_ms(delay_ms)
            .map_err(AgentError::AudioProcessingError)
    }

    /// Samples in one 10 ms frame at the canceller's rate.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames dropped (passed through unprocessed) so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn check_frame(&self, len: usize) -> Result<()> {
        if !self.configured {
            return Err(AgentError::NotStarted("echo canceller".to_string()));
        }
        if len != self.frame_samples {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Err(AgentError::AudioProcessingError(format!(
                "invalid frame size: {} samples, expected {} (10 ms at {} Hz)",
                len, self.frame_samples, self.sample_rate
            )));
        }
        Ok(())
    }
}
