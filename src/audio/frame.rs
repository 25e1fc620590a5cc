//! Audio frames and formats
//!
//! `AudioFrame` is the unit of exchange on every audio channel in the
//! runtime: a byte buffer of PCM samples plus the format describing it, a
//! capture timestamp, and the duration derived from the byte length.
//! Frames are produced by a single source and consumed by at most one
//! downstream stage; cloning is explicit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AgentError, Result};

/// Canonical pipeline sample rate (playback and microphone).
pub const PIPELINE_SAMPLE_RATE: u32 = 48_000;

/// Sample rate expected by VAD providers.
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Intermediate rate for OpenAI-style TTS output.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// AEC frame length.
pub const AEC_FRAME: Duration = Duration::from_millis(10);

/// Sample encoding of a PCM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SampleEncoding {
    /// Signed integer PCM (8/16/24/32 bit).
    Pcm,
    /// 32-bit IEEE float samples.
    Float32,
}

/// Shape of the samples inside an [`AudioFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// 1 = mono, 2 = stereo.
    pub channels: u16,
    /// Bits per sample: 8, 16, 24 or 32.
    pub bits_per_sample: u16,
    /// Integer PCM or float samples.
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// 16-bit mono PCM at the given rate, the working format of the
    /// pipeline, VAD and STT paths.
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
            encoding: SampleEncoding::Pcm,
        }
    }

    /// Bytes occupied by a single sample of a single channel.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Bytes per multi-channel sample tick.
    pub fn frame_stride(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Number of samples (per channel) in a buffer of 10 ms.
    pub fn samples_per_10ms(&self) -> usize {
        (self.sample_rate / 100) as usize
    }

    /// Validate the format invariant: `bytes_per_sample * channels > 0`.
    pub fn validate(&self) -> Result<()> {
        if self.frame_stride() == 0 || self.sample_rate == 0 {
            return Err(AgentError::AudioProcessingError(format!(
                "invalid audio format: {} Hz, {} ch, {} bits",
                self.sample_rate, self.channels, self.bits_per_sample
            )));
        }
        if self.encoding == SampleEncoding::Float32 && self.bits_per_sample != 32 {
            return Err(AgentError::AudioProcessingError(
                "float encoding requires 32 bits per sample".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono16(PIPELINE_SAMPLE_RATE)
    }
}

/// A chunk of PCM audio flowing through the runtime.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw sample bytes, interleaved when multi-channel.
    pub data: Vec<u8>,
    /// Layout of `data`.
    pub format: AudioFormat,
    /// Wall-clock capture (or synthesis) time.
    pub timestamp: DateTime<Utc>,
    /// Duration covered by `data`, derived from its byte length.
    pub duration: Duration,
    /// Free-form per-frame annotations (track id, calibration markers).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AudioFrame {
    /// Build a frame from raw bytes. The duration is always derived from
    /// the byte length; callers cannot supply an inconsistent one.
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Result<Self> {
        format.validate()?;
        let stride = format.frame_stride();
        if data.len() % stride != 0 {
            return Err(AgentError::AudioProcessingError(format!(
                "frame length {} is not a multiple of the {}-byte stride",
                data.len(),
                stride
            )));
        }
        let sample_count = data.len() / stride;
        let duration =
            Duration::from_secs_f64(sample_count as f64 / format.sample_rate as f64);
        Ok(Self {
            data,
            format,
            timestamp: Utc::now(),
            duration,
            metadata: HashMap::new(),
        })
    }

    /// Build a 16-bit mono frame from i16 samples.
    pub fn from_i16(samples: &[i16], sample_rate: u32) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        // mono16 always has a positive stride, so new() cannot fail here
        Self::new(data, AudioFormat::mono16(sample_rate)).expect("mono16 frame")
    }

    /// A frame of silence with the given duration.
    pub fn silence(format: AudioFormat, duration: Duration) -> Self {
        let samples = (duration.as_secs_f64() * format.sample_rate as f64).round() as usize;
        let data = vec![0u8; samples * format.frame_stride()];
        Self::new(data, format).expect("silence frame")
    }

    /// Number of samples per channel.
    pub fn sample_count(&self) -> usize {
        self.data.len() / self.format.frame_stride()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the buffer to i16 samples. Only valid for 16-bit PCM.
    pub fn samples_i16(&self) -> Result<Vec<i16>> {
        if self.format.bits_per_sample != 16 || self.format.encoding != SampleEncoding::Pcm {
            return Err(AgentError::AudioProcessingError(format!(
                "expected 16-bit PCM, got {} bits {:?}",
                self.format.bits_per_sample, self.format.encoding
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Decode to normalized f32 samples in [-1, 1]. Only 16-bit PCM paths
    /// are required by the pipeline.
    pub fn samples_f32(&self) -> Result<Vec<f32>> {
        Ok(self
            .samples_i16()?
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect())
    }

    /// Concatenate frames that share a format into one frame. The combined
    /// frame keeps the first frame's timestamp.
    pub fn concat(frames: &[AudioFrame]) -> Result<AudioFrame> {
        let first = frames.first().ok_or_else(|| {
            AgentError::AudioProcessingError("cannot concat zero frames".to_string())
        })?;
        let format = first.format;
        let mut data = Vec::with_capacity(frames.iter().map(|f| f.data.len()).sum());
        for frame in frames {
            if frame.format != format {
                return Err(AgentError::AudioProcessingError(format!(
                    "format mismatch in concat: {:?} vs {:?}",
                    frame.format, format
                )));
            }
            data.extend_from_slice(&frame.data);
        }
        let mut combined = AudioFrame::new(data, format)?;
        combined.timestamp = first.timestamp;
        Ok(combined)
    }

    /// Attach a metadata entry, returning the frame for chaining.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// RMS energy of the frame, normalized to [0, 1].
    pub fn rms(&self) -> f32 {
        match self.samples_f32() {
            Ok(samples) if !samples.is_empty() => {
                let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
                (sum_sq / samples.len() as f32).sqrt()
            }
            _ => 0.0,
        }
    }
}
