//! Linear-interpolation sample-rate conversion
//!
//! The pipeline moves between three standard rates (48 kHz device, 16 kHz
//! VAD, 24 kHz TTS). Linear interpolation over 16-bit mono is sufficient
//! for speech; the interpolator never indexes past the final source
//! sample.

use crate::audio::frame::{AudioFormat, AudioFrame, SampleEncoding};
use crate::error::{AgentError, Result};

/// Resample 16-bit mono samples from `from_rate` to `to_rate`.
///
/// Resampling to the source rate returns a verbatim copy.
pub fn resample_i16(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src = i as f64 / ratio;
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(samples.len() - 1);
        let frac = (src - lo as f64) as f32;
        let lo = lo.min(samples.len() - 1);

        let val = samples[lo] as f32 * (1.0 - frac) + samples[hi] as f32 * frac;
        out.push(val.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    out
}

/// Resample a whole frame to `to_rate`, preserving timestamp and metadata.
///
/// Only the 16-bit mono PCM path is supported; anything else is an
/// [`AgentError::AudioProcessingError`].
pub fn resample_frame(frame: &AudioFrame, to_rate: u32) -> Result<AudioFrame> {
    if frame.format.sample_rate == to_rate {
        return Ok(frame.clone());
    }
    if frame.format.channels != 1
        || frame.format.bits_per_sample != 16
        || frame.format.encoding != SampleEncoding::Pcm
    {
        return Err(AgentError::AudioProcessingError(format!(
            "resampler supports 16-bit mono PCM only, got {:?}",
            frame.format
        )));
    }

    let samples = frame.samples_i16()?;
    let resampled = resample_i16(&samples, frame.format.sample_rate, to_rate);
    let mut out = AudioFrame::from_i16(&resampled, to_rate);
    out.timestamp = frame.timestamp;
    out.metadata = frame.metadata.clone();
    out.format = AudioFormat::mono16(to_rate);
    Ok(out)
}
