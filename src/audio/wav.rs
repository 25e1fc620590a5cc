//! RIFF/WAVE packing for the STT request path
//!
//! STT providers take a complete WAV container per utterance. Encoding
//! runs over an in-memory cursor so no temp files are involved; the
//! canonical output is a 44-byte header (RIFF + `fmt ` + `data`, all
//! little-endian, AudioFormat=1/PCM) followed by the sample bytes.

use std::io::Cursor;

use crate::audio::frame::{AudioFormat, AudioFrame, SampleEncoding};
use crate::error::{AgentError, Result};

/// Size of the canonical header produced by [`encode_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Encode a PCM frame into a canonical RIFF/WAVE byte buffer.
pub fn encode_wav(frame: &AudioFrame) -> Result<Vec<u8>> {
    if frame.format.encoding != SampleEncoding::Pcm {
        return Err(AgentError::AudioProcessingError(
            "WAV encoding requires integer PCM samples".to_string(),
        ));
    }

    let spec = hound::WavSpec {
        channels: frame.format.channels,
        sample_rate: frame.format.sample_rate,
        bits_per_sample: frame.format.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AgentError::AudioProcessingError(format!("WAV writer: {}", e)))?;
        match frame.format.bits_per_sample {
            16 => {
                for sample in frame.samples_i16()? {
                    writer.write_sample(sample).map_err(|e| {
                        AgentError::AudioProcessingError(format!("WAV write: {}", e))
                    })?;
                }
            }
            other => {
                return Err(AgentError::AudioProcessingError(format!(
                    "unsupported WAV bit depth: {}",
                    other
                )))
            }
        }
        writer
            .finalize()
            .map_err(|e| AgentError::AudioProcessingError(format!("WAV finalize: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV byte buffer back into a frame. The recovered format
/// carries the header's sample rate, channel count and bit depth.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioFrame> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AgentError::AudioProcessingError(format!("WAV reader: {}", e)))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AgentError::AudioProcessingError(format!(
            "unsupported WAV payload: {:?} {} bits",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let mut data = Vec::new();
    for sample in reader.samples::<i16>() {
        let s = sample
            .map_err(|e| AgentError::AudioProcessingError(format!("WAV decode: {}", e)))?;
        data.extend_from_slice(&s.to_le_bytes());
    }

    AudioFrame::new(
        data,
        AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
            encoding: SampleEncoding::Pcm,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tone_frame(sample_rate: u32, millis: u64) -> AudioFrame {
        let count = (sample_rate as u64 * millis / 1000) as usize;
        let samples: Vec<i16> = (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect();
        AudioFrame::from_i16(&samples, sample_rate)
    }

    #[test]
    fn test_round_trip_preserves_data_and_format() {
        // Property 5: decode(encode(frame)).data == frame.data and the
        // header recovers (sample_rate, channels, bits_per_sample).
        let frame = tone_frame(16_000, 200);
        let wav = encode_wav(&frame).unwrap();
        let decoded = decode_wav(&wav).unwrap();

        assert_eq!(decoded.data, frame.data);
        assert_eq!(decoded.format.sample_rate, 16_000);
        assert_eq!(decoded.format.channels, 1);
        assert_eq!(decoded.format.bits_per_sample, 16);
    }

    #[test]
    fn test_canonical_header() {
        let frame = tone_frame(16_000, 100);
        let wav = encode_wav(&frame).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        // PCM format tag, little-endian
        assert_eq!(u16::from_le_bytes([wav[20], wav[21]]), 1);
        // Sample rate field
        assert_eq!(
            u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]),
            16_000
        );
        assert_eq!(wav.len(), WAV_HEADER_LEN + frame.data.len());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav file at all").is_err());
        assert!(decode_wav(&[]).is_err());
    }

    #[test]
    fn test_empty_frame_encodes_header_only() {
        let frame = AudioFrame::from_i16(&[], 16_000);
        let wav = encode_wav(&frame).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        let decoded = decode_wav(&wav).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        // STT request bodies are also written to disk in debug runs; make
        // sure the bytes survive the filesystem unchanged.
        let frame = tone_frame(24_000, 50);
        let wav = encode_wav(&frame).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&wav).unwrap();
        let bytes = std::fs::read(file.path()).unwrap();
        let decoded = decode_wav(&bytes).unwrap();
        assert_eq!(decoded.data, frame.data);
        assert_eq!(decoded.format.sample_rate, 24_000);
    }
}
