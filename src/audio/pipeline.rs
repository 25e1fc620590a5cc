//! Acoustic echo control pipeline
//!
//! Couples the audio device, the output ring buffer and the echo
//! canceller into one frame-aligned duplex path. Every 10 ms tick:
//!
//! 1. take the next near-end frame from the device input,
//! 2. read the delayed far-end reference window from the ring buffer,
//! 3. feed the reference through `process_reverse`, then clean the
//!    near-end in place with `process_near`,
//! 4. emit the processed frame downstream.
//!
//! Playback goes through [`PlaybackWriter`]: a tee that queues frames on
//! the device output and appends the same samples to the ring buffer the
//! reference reads come from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::aec::EchoCanceller;
use crate::audio::device::{DeviceStreams, OutputSink, AUDIO_CHANNEL_CAPACITY};
use crate::audio::frame::AudioFrame;
use crate::audio::resample::resample_frame;
use crate::audio::ring_buffer::RingBuffer;
use crate::error::{AgentError, Result};

/// Consecutive tick failures tolerated before the pipeline gives up.
pub const MAX_CONSECUTIVE_TICK_ERRORS: u64 = 100;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Working sample rate of the duplex path.
    pub sample_rate: u32,
    /// Far-end delay in milliseconds: how far behind playback the echo
    /// shows up in the microphone.
    pub delay_ms: u16,
    /// Ring buffer retention.
    pub ring_capacity_secs: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::audio::frame::PIPELINE_SAMPLE_RATE,
            delay_ms: 40,
            ring_capacity_secs: 2,
        }
    }
}

/// Playback tee: frames written here are queued for the speaker and
/// appended to the AEC reference ring.
#[derive(Clone)]
pub struct PlaybackWriter {
    sink: OutputSink,
    ring: Arc<RingBuffer>,
    sample_rate: u32,
}

impl PlaybackWriter {
    pub fn new(sink: OutputSink, ring: Arc<RingBuffer>, sample_rate: u32) -> Self {
        Self {
            sink,
            ring,
            sample_rate,
        }
    }

    /// Write one frame: resampled to the pipeline rate, appended to the
    /// reference ring, queued on the device output.
    pub fn write(&self, frame: &AudioFrame) -> Result<()> {
        let frame = resample_frame(frame, self.sample_rate)?;
        self.ring.append(&frame.samples_i16()?);
        self.sink.send(frame);
        Ok(())
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// The running AEC pipeline: owns the tick task, exposes processed input
/// frames and the playback writer.
pub struct AecPipeline {
    /// Cleaned near-end frames, 10 ms each.
    pub processed: mpsc::Receiver<AudioFrame>,
    playback: PlaybackWriter,
    cancel: CancellationToken,
    consecutive_errors: Arc<AtomicU64>,
}

impl AecPipeline {
    /// Wire the pipeline over an opened device and start the tick task.
    pub fn start(
        streams: DeviceStreams,
        mut aec: EchoCanceller,
        config: PipelineConfig,
    ) -> Result<Self> {
        if aec.sample_rate() != config.sample_rate {
            return Err(AgentError::InvalidConfiguration(format!(
                "echo canceller runs at {} Hz but the pipeline at {} Hz",
                aec.sample_rate(),
                config.sample_rate
            )));
        }
        aec.configure(config.delay_ms)?;

        let ring = Arc::new(RingBuffer::new(
            (config.sample_rate * config.ring_capacity_secs) as usize,
        ));
        let playback = PlaybackWriter::new(streams.output, ring.clone(), config.sample_rate);

        let (processed_tx, processed_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let consecutive_errors = Arc::new(AtomicU64::new(0));

        let tick_cancel = cancel.clone();
        let tick_errors = consecutive_errors.clone();
        let tick_ring = ring.clone();
        let frame_samples = aec.frame_samples();
        let delay_samples =
            (config.delay_ms as usize * config.sample_rate as usize) / 1000;
        let mut input = streams.input;

        tokio::spawn(async move {
            info!(
                "AEC pipeline running at {} Hz, delay {} samples",
                config.sample_rate, delay_samples
            );
            loop {
                let frame = tokio::select! {
                    _ = tick_cancel.cancelled() => break,
                    frame = input.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };

                match Self::tick(&mut aec, &tick_ring, frame, delay_samples, frame_samples) {
                    Ok(processed) => {
                        tick_errors.store(0, Ordering::Relaxed);
                        // Audio path drops on backpressure rather than
                        // stalling capture.
                        let _ = processed_tx.try_send(processed);
                    }
                    Err(e) => {
                        let errors = tick_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("AEC tick dropped: {}", e);
                        if errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                            error!(
                                "AEC pipeline stopping after {} consecutive tick errors",
                                errors
                            );
                            break;
                        }
                    }
                }
            }
            info!("AEC pipeline stopped");
        });

        Ok(Self {
            processed: processed_rx,
            playback,
            cancel,
            consecutive_errors,
        })
    }

    fn tick(
        aec: &mut EchoCanceller,
        ring: &RingBuffer,
        frame: AudioFrame,
        delay_samples: usize,
        frame_samples: usize,
    ) -> Result<AudioFrame> {
        let mut near = frame.samples_i16()?;
        if near.len() != frame_samples {
            return Err(AgentError::AudioProcessingError(format!(
                "tick frame has {} samples, expected {}",
                near.len(),
                frame_samples
            )));
        }

        let mut far = ring.read(delay_samples, frame_samples);
        aec.process_reverse(&mut far)?;

        match aec.process_near(&mut near) {
            Ok(()) => {}
            // Backend failure passes the frame through unprocessed; the
            // canceller already counted the drop.
            Err(AgentError::AudioProcessingError(reason)) => {
                warn!("near-end processing degraded: {}", reason);
            }
            Err(e) => return Err(e),
        }

        let mut out = AudioFrame::from_i16(&near, frame.format.sample_rate);
        out.timestamp = frame.timestamp;
        out.metadata = frame.metadata;
        Ok(out)
    }

    /// The playback tee for everything the session says.
    pub fn playback(&self) -> PlaybackWriter {
        self.playback.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current run of consecutive failed ticks.
    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }
}

impl Drop for AecPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AecPipeline {
    /// Auto-calibrate the playback→capture delay before starting the
    /// pipeline: play the 1 kHz tone on the output side and locate its
    /// peak-energy offset in the captured input.
    ///
    /// Runs against the raw device streams; call it before
    /// [`AecPipeline::start`] and feed the result into
    /// [`PipelineConfig::delay_ms`].
    pub async fn calibrate(
        streams: &mut DeviceStreams,
        sample_rate: u32,
        tone_duration: Duration,
    ) -> Result<u16> {
        let listen_for = tone_duration * 3;
        let needed = (listen_for.as_secs_f64() * sample_rate as f64) as usize;
        let deadline = tokio::time::Instant::now() + listen_for + Duration::from_secs(1);

        // Tone frames go out paced at the 10 ms tick so the bounded
        // output queue never sheds part of the tone.
        let mut tone = calibration_tone(sample_rate, tone_duration).into_iter();
        let mut ticker = tokio::time::interval(Duration::from_millis(10));

        let mut captured: Vec<i16> = Vec::with_capacity(needed);
        while captured.len() < needed {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(frame) = tone.next() {
                        streams.output.send(frame);
                    }
                }
                frame = streams.input.recv() => match frame {
                    Some(frame) => captured.extend(frame.samples_i16()?),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        detect_tone_delay(&captured, sample_rate, tone_duration).ok_or_else(|| {
            AgentError::AudioProcessingError(
                "calibration tone was not detected in the captured input".to_string(),
            )
        })
    }
}

// ─── Delay calibration ───────────────────────────────────────

/// Calibration tone frequency.
pub const CALIBRATION_TONE_HZ: f32 = 1000.0;

/// Generate the 1 kHz calibration tone as 10 ms frames.
pub fn calibration_tone(sample_rate: u32, duration: Duration) -> Vec<AudioFrame> {
    let frame_samples = (sample_rate / 100) as usize;
    let total = (duration.as_secs_f64() * sample_rate as f64) as usize;
    let mut frames = Vec::new();
    let mut produced = 0usize;
    while produced < total {
        let samples: Vec<i16> = (0..frame_samples)
            .map(|i| {
                let t = (produced + i) as f32 / sample_rate as f32;
                ((t * CALIBRATION_TONE_HZ * std::f32::consts::TAU).sin() * 16_000.0) as i16
            })
            .collect();
        frames.push(AudioFrame::from_i16(&samples, sample_rate));
        produced += frame_samples;
    }
    frames
}

/// Estimate the playback→capture delay by locating the peak-energy
/// offset of the calibration tone in the captured signal.
///
/// `played_at_sample` is the capture-stream sample index at which the
/// tone started playing; the returned value is the additional delay in
/// milliseconds observed in the capture.
pub fn detect_tone_delay(
    captured: &[i16],
    sample_rate: u32,
    window: Duration,
) -> Option<u16> {
    let window_samples = ((window.as_secs_f64() * sample_rate as f64) as usize).max(1);
    if captured.len() < window_samples {
        return None;
    }

    let mut best_offset = 0usize;
    let mut best_energy = 0f64;
    let hop = (sample_rate / 1000) as usize; // 1 ms steps
    let mut offset = 0usize;
    while offset + window_samples <= captured.len() {
        let energy: f64 = captured[offset..offset + window_samples]
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        if energy > best_energy {
            best_energy = energy;
            best_offset = offset;
        }
        offset += hop.max(1);
    }

    if best_energy <= 0.0 {
        return None;
    }
    Some(((best_offset * 1000) / sample_rate as usize) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::aec::{AecBackend, PassthroughAec};
    use crate::audio::device::{AudioDevice, DeviceOptions, LoopbackDevice};

    fn pipeline_with_loopback(
        config: PipelineConfig,
    ) -> (AecPipeline, LoopbackDevice) {
        let mut device = LoopbackDevice::new(DeviceOptions {
            sample_rate: config.sample_rate,
            ..Default::default()
        });
        let streams = device.open().unwrap();
        let aec = EchoCanceller::new(Box::new(PassthroughAec), config.sample_rate);
        let pipeline = AecPipeline::start(streams, aec, config).unwrap();
        (pipeline, device)
    }

    #[tokio::test]
    async fn test_input_frames_flow_through() {
        let config = PipelineConfig {
            sample_rate: 16_000,
            ..Default::default()
        };
        let (mut pipeline, mut device) = pipeline_with_loopback(config);
        let handle = device.take_handle().unwrap();

        handle
            .mic_tx
            .send(AudioFrame::from_i16(&vec![900i16; 160], 16_000))
            .await
            .unwrap();

        let out = tokio::time::timeout(Duration::from_secs(1), pipeline.processed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.sample_count(), 160);
        assert_eq!(out.samples_i16().unwrap()[0], 900); // passthrough AEC
        device.stop();
    }

    #[tokio::test]
    async fn test_playback_tee_feeds_ring_and_device() {
        let config = PipelineConfig {
            sample_rate: 16_000,
            ..Default::default()
        };
        let (pipeline, mut device) = pipeline_with_loopback(config);
        let mut handle = device.take_handle().unwrap();
        let playback = pipeline.playback();

        playback
            .write(&AudioFrame::from_i16(&vec![1234i16; 160], 16_000))
            .unwrap();

        // Ring saw the samples…
        assert_eq!(playback.ring().write_index(), 160);
        assert_eq!(playback.ring().read(0, 160), vec![1234i16; 160]);
        // …and the device queue got the frame.
        let played = tokio::time::timeout(Duration::from_secs(1), handle.played_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(played.sample_count(), 160);
        device.stop();
    }

    #[tokio::test]
    async fn test_playback_resamples_tts_rate() {
        let config = PipelineConfig {
            sample_rate: 48_000,
            ..Default::default()
        };
        let (pipeline, mut device) = pipeline_with_loopback(config);
        let playback = pipeline.playback();

        // A 24 kHz TTS frame doubles in sample count at 48 kHz.
        playback
            .write(&AudioFrame::from_i16(&vec![10i16; 240], 24_000))
            .unwrap();
        assert_eq!(playback.ring().write_index(), 480);
        device.stop();
    }

    /// Backend that always fails near-end processing.
    struct BrokenAec;

    impl AecBackend for BrokenAec {
        fn process_reverse(&mut self, _f: &mut [i16]) -> std::result::Result<(), String> {
            Ok(())
        }
        fn process_near(&mut self, _n: &mut [i16]) -> std::result::Result<(), String> {
            Err("always broken".to_string())
        }
        fn set_stream_delay_ms(&mut self, _d: u16) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backend_failure_passes_audio_through() {
        let config = PipelineConfig {
            sample_rate: 16_000,
            ..Default::default()
        };
        let mut device = LoopbackDevice::new(DeviceOptions {
            sample_rate: 16_000,
            ..Default::default()
        });
        let streams = device.open().unwrap();
        let aec = EchoCanceller::new(Box::new(BrokenAec), 16_000);
        let mut pipeline = AecPipeline::start(streams, aec, config).unwrap();
        let handle = device.take_handle().unwrap();

        handle
            .mic_tx
            .send(AudioFrame::from_i16(&vec![777i16; 160], 16_000))
            .await
            .unwrap();

        // Frame still arrives, unprocessed.
        let out = tokio::time::timeout(Duration::from_secs(1), pipeline.processed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.samples_i16().unwrap()[0], 777);
        device.stop();
    }

    #[tokio::test]
    async fn test_mismatched_rate_rejected() {
        let mut device = LoopbackDevice::new(DeviceOptions::default());
        let streams = device.open().unwrap();
        let aec = EchoCanceller::new(Box::new(PassthroughAec), 16_000);
        let config = PipelineConfig {
            sample_rate: 48_000,
            ..Default::default()
        };
        assert!(AecPipeline::start(streams, aec, config).is_err());
    }

    #[test]
    fn test_calibration_tone_shape() {
        let frames = calibration_tone(16_000, Duration::from_millis(100));
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().all(|f| f.sample_count() == 160));
        // The tone actually carries energy.
        assert!(frames[0].rms() > 0.1);
    }

    #[test]
    fn test_detect_tone_delay_finds_offset() {
        let sample_rate = 16_000u32;
        // 50 ms silence, then 100 ms of tone.
        let mut captured = vec![0i16; (sample_rate / 20) as usize];
        for frame in calibration_tone(sample_rate, Duration::from_millis(100)) {
            captured.extend(frame.samples_i16().unwrap());
        }
        let delay =
            detect_tone_delay(&captured, sample_rate, Duration::from_millis(100)).unwrap();
        assert!(
            (45..=55).contains(&delay),
            "expected ~50 ms, got {} ms",
            delay
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_measures_capture_offset() {
        // Hand-built capture stream: 50 ms of room silence, then the tone
        // as the (simulated) speaker-to-mic path delivers it.
        let (input_tx, input_rx) = tokio::sync::mpsc::channel(256);
        let (sink, _played) = crate::audio::device::OutputSink::channel(64);
        let mut streams = DeviceStreams {
            input: input_rx,
            output: sink,
        };

        for _ in 0..5 {
            input_tx
                .send(AudioFrame::from_i16(&vec![0i16; 160], 16_000))
                .await
                .unwrap();
        }
        for frame in calibration_tone(16_000, Duration::from_millis(200)) {
            input_tx.send(frame).await.unwrap();
        }
        drop(input_tx);

        let delay = AecPipeline::calibrate(&mut streams, 16_000, Duration::from_millis(200))
            .await
            .unwrap();
        assert!((45..=55).contains(&delay), "delay {} ms", delay);
    }

    #[test]
    fn test_detect_tone_delay_on_silence() {
        let captured = vec![0i16; 16_000];
        assert_eq!(
            detect_tone_delay(&captured, 16_000, Duration::from_millis(100)),
            None
        );
    }
}
