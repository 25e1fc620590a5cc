//! Voice Activity Detection
//!
//! Two-layer design: a [`VadProvider`] turns individual frames into
//! speech probabilities, and the [`segmenter::SpeechSegmenter`] built on
//! top applies the timing rules (minimum speech, hangover, prefix
//! padding) that turn raw flags into usable speech segments.
//!
//! When no ML provider is wired in, [`EnergyVad`] provides the dynamic-
//! threshold fallback: normalised RMS energy per frame, triggering above
//! twice the rolling mean of the recent noise floor.

pub mod segmenter;

use std::collections::VecDeque;

use crate::audio::frame::{AudioFrame, VAD_SAMPLE_RATE};
use crate::error::Result;

pub use segmenter::{SegmenterConfig, SegmenterEvent, SpeechSegment, SpeechSegmenter};

/// Per-frame verdict from a VAD provider.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    /// Speech probability in [0, 1].
    pub probability: f32,
    /// Thresholded decision for this frame.
    pub is_speech: bool,
}

/// Events a streaming VAD layer emits alongside per-frame decisions.
#[derive(Debug, Clone)]
pub enum VadEvent {
    StartOfSpeech,
    EndOfSpeech,
    /// One inference pass finished; carries the frame's probability.
    InferenceDone { probability: f32 },
}

/// A voice-activity detector scoring one frame at a time.
///
/// Frames are expected at [`required_sample_rate`](Self::required_sample_rate);
/// the session resamples before calling.
pub trait VadProvider: Send + Sync {
    fn detect(&mut self, frame: &AudioFrame) -> Result<VadDecision>;

    fn required_sample_rate(&self) -> u32 {
        VAD_SAMPLE_RATE
    }

    /// Drop adaptive state (noise floor estimates etc.).
    fn reset(&mut self) {}
}

/// Frames of history the rolling noise-floor mean covers.
const ENERGY_WINDOW_FRAMES: usize = 50;

/// Trigger multiplier over the rolling mean.
const ENERGY_TRIGGER_RATIO: f32 = 2.0;

/// Floor below which a frame is never treated as speech, regardless of
/// how quiet the recent window was.
const ENERGY_ABSOLUTE_FLOOR: f32 = 0.01;

/// Dynamic-threshold energy detector: the fallback when no ML VAD
/// provider is available.
pub struct EnergyVad {
    window: VecDeque<f32>,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(ENERGY_WINDOW_FRAMES),
        }
    }

    fn rolling_mean(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadProvider for EnergyVad {
    fn detect(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        let energy = frame.rms();
        let mean = self.rolling_mean();
        let threshold = (mean * ENERGY_TRIGGER_RATIO).max(ENERGY_ABSOLUTE_FLOOR);
        let is_speech = energy > threshold;

        // Speech frames are kept out of the noise-floor estimate so a long
        // utterance does not drag the threshold up after itself.
        if !is_speech {
            if self.window.len() == ENERGY_WINDOW_FRAMES {
                self.window.pop_front();
            }
            self.window.push_back(energy);
        }

        let probability = if threshold > 0.0 {
            (energy / (threshold * 2.0)).min(1.0)
        } else {
            0.0
        };

        Ok(VadDecision {
            probability,
            is_speech,
        })
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}
