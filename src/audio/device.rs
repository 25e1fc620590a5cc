//! Duplex audio device
//!
//! Provides the two sample streams the pipeline runs between: microphone
//! frames in, playback frames out. The real device is cpal capture plus a
//! rodio sink (behind the `voice` feature); `LoopbackDevice` is a
//! channel-backed stand-in used by console mode and tests, optionally
//! echoing output back into the input the way a speaker-to-mic loop would.
//!
//! Contract highlights:
//! - Input is resampled to the requested rate when the hardware differs.
//! - Output frames are accepted at any rate and resampled to the device.
//! - The output side opens only after a startup delay (>= 100 ms) so the
//!   input side is already capturing when a test tone starts.
//! - A saturated output queue drops frames (never blocks) and warns once.
//! - Stop waits a grace period for queued frames, then force-closes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audio::frame::{AudioFrame, PIPELINE_SAMPLE_RATE};
use crate::audio::resample::resample_frame;
use crate::error::{AgentError, Result};

/// Frames buffered on each audio channel before backpressure kicks in.
pub const AUDIO_CHANNEL_CAPACITY: usize = 10;

/// Minimum delay between opening the input and the output side.
pub const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// How long `stop` waits for queued output before force-closing.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

/// Device configuration.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Rate the caller wants frames delivered/accepted at.
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Capture buffer size in samples.
    pub buffer_size: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            sample_rate: PIPELINE_SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
            buffer_size: (PIPELINE_SAMPLE_RATE / 10) as usize,
        }
    }
}

/// Sending half of the playback path. Drops on saturation instead of
/// blocking the producer; the first drop is logged, later ones only
/// counted.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
    drop_logged: Arc<AtomicBool>,
}

impl OutputSink {
    fn new(tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            drop_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Device-free sink: frames land on the returned receiver. Backs
    /// tests and any playback path that is not a real device.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AudioFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Queue a frame for playback. Saturation drops the frame.
    pub fn send(&self, frame: AudioFrame) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.drop_logged.swap(true, Ordering::Relaxed) {
                warn!("audio output queue saturated, dropping frames");
            }
        }
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The two stream ends handed to the pipeline when a device opens.
pub struct DeviceStreams {
    /// Captured microphone frames, already at the requested rate.
    pub input: mpsc::Receiver<AudioFrame>,
    /// Playback queue.
    pub output: OutputSink,
}

/// A duplex audio endpoint.
pub trait AudioDevice: Send {
    /// Open both sides and hand back the stream pair. Fails with
    /// `AlreadyStarted` on a second call without `stop`.
    fn open(&mut self) -> Result<DeviceStreams>;

    /// Stop capture and playback, draining queued output within the grace
    /// period.
    fn stop(&mut self);
}

// ─── Loopback device (tests, console mode) ───────────────────

/// Control handle for a [`LoopbackDevice`]: push microphone frames, read
/// what the agent played.
pub struct LoopbackHandle {
    /// Feed frames that the device will deliver as microphone input.
    pub mic_tx: mpsc::Sender<AudioFrame>,
    /// Frames the agent wrote to the output side.
    pub played_rx: mpsc::Receiver<AudioFrame>,
}

/// Channel-backed device. With `echo_delay` set, every output frame is
/// also fed back into the input after that delay, attenuated, which is
/// what the delay calibration and feedback tests need.
pub struct LoopbackDevice {
    options: DeviceOptions,
    echo_delay: Option<Duration>,
    echo_gain: f32,
    running: Arc<AtomicBool>,
    handle: Option<LoopbackHandle>,
}

impl LoopbackDevice {
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            options,
            echo_delay: None,
            echo_gain: 0.5,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Echo output back into input after `delay`, scaled by `gain`.
    pub fn with_echo(mut self, delay: Duration, gain: f32) -> Self {
        self.echo_delay = Some(delay);
        self.echo_gain = gain.clamp(0.0, 1.0);
        self
    }

    /// Take the control handle. Available once after `open`.
    pub fn take_handle(&mut self) -> Option<LoopbackHandle> {
        self.handle.take()
    }
}

impl AudioDevice for LoopbackDevice {
    fn open(&mut self) -> Result<DeviceStreams> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyStarted("loopback device".to_string()));
        }

        let (mic_tx, mic_feed_rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_CAPACITY * 4);
        let (input_tx, input_rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_CAPACITY);
        let (played_tx, played_rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_CAPACITY * 8);

        let target_rate = self.options.sample_rate;
        let running = self.running.clone();

        // Input feeder: resamples mic frames to the requested rate.
        let feeder_running = running.clone();
        let feeder_input_tx = input_tx.clone();
        let mut mic_feed_rx = mic_feed_rx;
        tokio::spawn(async move {
            while let Some(frame) = mic_feed_rx.recv().await {
                if !feeder_running.load(Ordering::SeqCst) {
                    break;
                }
                let frame = match resample_frame(&frame, target_rate) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("loopback input resample failed: {}", e);
                        continue;
                    }
                };
                if feeder_input_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Playback drain: records played frames, optionally echoes them
        // back into the mic path.
        let echo_delay = self.echo_delay;
        let echo_gain = self.echo_gain;
        let echo_mic_tx = mic_tx.clone();
        let drain_running = running.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if !drain_running.load(Ordering::SeqCst) {
                    break;
                }
                let _ = played_tx.send(frame.clone()).await;
                if let Some(delay) = echo_delay {
                    let mic_tx = echo_mic_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Ok(samples) = frame.samples_i16() {
                            let echoed: Vec<i16> = samples
                                .iter()
                                .map(|&s| (s as f32 * echo_gain) as i16)
                                .collect();
                            let _ = mic_tx
                                .send(AudioFrame::from_i16(&echoed, frame.format.sample_rate))
                                .await;
                        }
                    });
                }
            }
        });

        self.handle = Some(LoopbackHandle { mic_tx, played_rx });
        info!("loopback device open at {} Hz", target_rate);

        Ok(DeviceStreams {
            input: input_rx,
            output: OutputSink::new(out_tx),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle = None;
    }
}

// ─── cpal device (hardware capture + rodio playback) ─────────

#[cfg(feature = "voice")]
mod hardware {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use crate::audio::resample::resample_i16;

    /// Hardware-backed device: cpal for microphone capture, rodio for
    /// speaker playback.
    pub struct CpalDevice {
        options: DeviceOptions,
        running: Arc<AtomicBool>,
        capture_thread: Option<std::thread::JoinHandle<()>>,
        playback_thread: Option<std::thread::JoinHandle<()>>,
    }

    impl CpalDevice {
        pub fn new(options: DeviceOptions) -> Self {
            Self {
                options,
                running: Arc::new(AtomicBool::new(false)),
                capture_thread: None,
                playback_thread: None,
            }
        }

        fn spawn_capture(
            &self,
            input_tx: mpsc::Sender<AudioFrame>,
        ) -> Result<std::thread::JoinHandle<()>> {
            let target_rate = self.options.sample_rate;
            let running = self.running.clone();

            let handle = std::thread::Builder::new()
                .name("vox-audio-capture".to_string())
                .spawn(move || {
                    if let Err(e) = capture_loop(target_rate, running, input_tx) {
                        warn!("audio capture ended: {}", e);
                    }
                })
                .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?;
            Ok(handle)
        }

        fn spawn_playback(
            &self,
            mut out_rx: mpsc::Receiver<AudioFrame>,
        ) -> Result<std::thread::JoinHandle<()>> {
            let running = self.running.clone();

            let handle = std::thread::Builder::new()
                .name("vox-audio-playback".to_string())
                .spawn(move || {
                    let (_stream, stream_handle) = match rodio::OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("no audio output stream: {}", e);
                            return;
                        }
                    };
                    let sink = match rodio::Sink::try_new(&stream_handle) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("no audio sink: {}", e);
                            return;
                        }
                    };

                    while running.load(Ordering::SeqCst) {
                        match out_rx.blocking_recv() {
                            Some(frame) => match frame.samples_i16() {
                                Ok(samples) => {
                                    let source = rodio::buffer::SamplesBuffer::new(
                                        frame.format.channels,
                                        frame.format.sample_rate,
                                        samples,
                                    );
                                    sink.append(source);
                                }
                                Err(e) => warn!("unplayable frame: {}", e),
                            },
                            None => break,
                        }
                    }
                    // Let queued audio finish within the grace period.
                    let deadline = std::time::Instant::now() + STOP_GRACE;
                    while !sink.empty() && std::time::Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    sink.stop();
                })
                .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?;
            Ok(handle)
        }
    }

    fn capture_loop(
        target_rate: u32,
        running: Arc<AtomicBool>,
        input_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<()> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            AgentError::ServiceUnavailable("no input device (microphone not found)".to_string())
        })?;
        let config = device
            .default_input_config()
            .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?;
        let device_rate = config.sample_rate().0;
        let device_channels = config.channels() as usize;
        info!(
            "capture device {} at {} Hz, {} ch",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            device_rate,
            device_channels
        );

        // Accumulate device samples and cut 10 ms frames at the target
        // rate. The callback must stay allocation-light, so conversion to
        // frames happens on whole chunks.
        let chunk = (device_rate / 100) as usize * device_channels;
        let pending = Arc::new(std::sync::Mutex::new(Vec::<i16>::new()));
        let cb_pending = pending.clone();
        let cb_running = running.clone();

        let err_fn = |err| warn!("audio capture error: {}", err);
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !cb_running.load(Ordering::SeqCst) {
                            return;
                        }
                        let mut pending = cb_pending.lock().unwrap();
                        pending.extend(data.iter().map(|&s| {
                            (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                        }));
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?,
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !cb_running.load(Ordering::SeqCst) {
                            return;
                        }
                        cb_pending.lock().unwrap().extend_from_slice(data);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?,
            other => {
                return Err(AgentError::AudioProcessingError(format!(
                    "unsupported capture format {:?}",
                    other
                )))
            }
        };
        stream
            .play()
            .map_err(|e| AgentError::AudioProcessingError(e.to_string()))?;

        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
            let chunk_samples: Option<Vec<i16>> = {
                let mut pending = pending.lock().unwrap();
                if pending.len() >= chunk {
                    Some(pending.drain(..chunk).collect())
                } else {
                    None
                }
            };
            if let Some(samples) = chunk_samples {
                // Downmix interleaved channels, then resample to target.
                let mono: Vec<i16> = if device_channels > 1 {
                    samples
                        .chunks(device_channels)
                        .map(|c| {
                            (c.iter().map(|&s| s as i32).sum::<i32>() / c.len() as i32) as i16
                        })
                        .collect()
                } else {
                    samples
                };
                let resampled = resample_i16(&mono, device_rate, target_rate);
                let frame = AudioFrame::from_i16(&resampled, target_rate);
                // Capture never blocks on slow consumers.
                let _ = input_tx.try_send(frame);
            }
        }
        Ok(())
    }

    impl AudioDevice for CpalDevice {
        fn open(&mut self) -> Result<DeviceStreams> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(AgentError::AlreadyStarted("audio device".to_string()));
            }

            let (input_tx, input_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
            let (out_tx, out_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);

            self.capture_thread = Some(self.spawn_capture(input_tx)?);
            // Input must be live before the output side opens so the mic
            // hears the very start of any playback (test tones included).
            std::thread::sleep(STARTUP_DELAY);
            self.playback_thread = Some(self.spawn_playback(out_rx)?);

            Ok(DeviceStreams {
                input: input_rx,
                output: OutputSink::new(out_tx),
            })
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            for handle in [self.capture_thread.take(), self.playback_thread.take()]
                .into_iter()
                .flatten()
            {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(feature = "voice")]
pub use hardware::CpalDevice;
