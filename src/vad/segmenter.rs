//! Speech segmentation over per-frame VAD decisions
//!
//! The segmenter owns the timing policy of turn detection:
//! - sub-threshold speech spikes shorter than `min_speech` are ignored,
//! - speech ends only after `min_silence` of hangover,
//! - `prefix_padding` of pre-speech audio is prepended so plosives and
//!   soft onsets are not clipped,
//! - a runaway segment is force-closed at `max_buffered_speech`.
//!
//! State machine: `Silent → Speaking` once accumulated speech reaches
//! `min_speech`; `Speaking → Silent` once accumulated silence reaches
//! `min_silence`, emitting the collected frames as one segment.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::audio::frame::AudioFrame;
use crate::error::Result;
use crate::vad::{VadProvider, VadEvent};

/// Timing policy for the segmenter.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Accumulated speech needed before a segment opens.
    pub min_speech: Duration,
    /// Hangover: silence needed before a segment closes.
    pub min_silence: Duration,
    /// Pre-speech audio prepended to each segment.
    pub prefix_padding: Duration,
    /// Hard cap on a single segment.
    pub max_buffered_speech: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_speech: Duration::from_millis(50),
            min_silence: Duration::from_millis(550),
            prefix_padding: Duration::from_millis(500),
            max_buffered_speech: Duration::from_secs(60),
        }
    }
}

/// One detected user utterance: ordered frames between start- and
/// end-of-speech, with aggregate timing.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub frames: Vec<AudioFrame>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SpeechSegment {
    /// Concatenate the segment into one contiguous frame for STT.
    pub fn combined(&self) -> Result<AudioFrame> {
        AudioFrame::concat(&self.frames)
    }
}

/// What a pushed frame produced.
#[derive(Debug)]
pub enum SegmenterEvent {
    StartOfSpeech,
    EndOfSpeech(SpeechSegment),
    InferenceDone { probability: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmenterState {
    Silent,
    Speaking,
}

/// Frame-by-frame segmenter over a [`VadProvider`].
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    vad: Box<dyn VadProvider>,
    state: SegmenterState,

    /// Ring of recent silent frames kept for prefix padding.
    prefix: VecDeque<AudioFrame>,
    prefix_duration: Duration,

    /// Consecutive speech frames observed while still Silent.
    onset_run: Vec<AudioFrame>,
    onset_duration: Duration,

    /// Frames of the open segment.
    segment: Vec<AudioFrame>,
    segment_duration: Duration,
    segment_started_at: Option<DateTime<Utc>>,

    /// Consecutive silence observed while Speaking.
    hangover: Duration,
}

impl SpeechSegmenter {
    pub fn new(vad: Box<dyn VadProvider>, config: SegmenterConfig) -> Self {
        Self {
            config,
            vad,
            state: SegmenterState::Silent,
            prefix: VecDeque::new(),
            prefix_duration: Duration::ZERO,
            onset_run: Vec::new(),
            onset_duration: Duration::ZERO,
            segment: Vec::new(),
            segment_duration: Duration::ZERO,
            segment_started_at: None,
            hangover: Duration::ZERO,
        }
    }

    /// Sample rate frames must arrive at.
    pub fn required_sample_rate(&self) -> u32 {
        self.vad.required_sample_rate()
    }

    pub fn is_speaking(&self) -> bool {
        self.state == SegmenterState::Speaking
    }

    /// Feed one frame; returns the events it produced, in order.
    pub fn push(&mut self, frame: AudioFrame) -> Result<Vec<SegmenterEvent>> {
        let decision = self.vad.detect(&frame)?;
        trace!(
            "vad frame: p={:.2} speech={} state={:?}",
            decision.probability,
            decision.is_speech,
            self.state
        );

        let mut events = vec![SegmenterEvent::InferenceDone {
            probability: decision.probability,
        }];

        match self.state {
            SegmenterState::Silent => {
                if decision.is_speech {
                    self.onset_duration += frame.duration;
                    self.onset_run.push(frame);

                    if self.onset_duration >= self.config.min_speech {
                        self.open_segment();
                        events.push(SegmenterEvent::StartOfSpeech);
                    }
                } else {
                    // The spike was shorter than min_speech: fold it into
                    // the prefix ring and forget it was ever speech.
                    for spiked in self.onset_run.drain(..) {
                        Self::push_prefix(
                            &mut self.prefix,
                            &mut self.prefix_duration,
                            self.config.prefix_padding,
                            spiked,
                        );
                    }
                    self.onset_duration = Duration::ZERO;
                    Self::push_prefix(
                        &mut self.prefix,
                        &mut self.prefix_duration,
                        self.config.prefix_padding,
                        frame,
                    );
                }
            }
            SegmenterState::Speaking => {
                if decision.is_speech {
                    self.hangover = Duration::ZERO;
                } else {
                    self.hangover += frame.duration;
                }
                self.segment_duration += frame.duration;
                self.segment.push(frame);

                if self.hangover >= self.config.min_silence {
                    events.push(SegmenterEvent::EndOfSpeech(self.close_segment()));
                } else if self.segment_duration >= self.config.max_buffered_speech {
                    debug!(
                        "segment hit max buffered speech ({:?}), force closing",
                        self.config.max_buffered_speech
                    );
                    events.push(SegmenterEvent::EndOfSpeech(self.close_segment()));
                }
            }
        }

        Ok(events)
    }

    /// Per-frame events translated for streaming listeners.
    pub fn event_kind(event: &SegmenterEvent) -> Option<VadEvent> {
        match event {
            SegmenterEvent::StartOfSpeech => Some(VadEvent::StartOfSpeech),
            SegmenterEvent::EndOfSpeech(_) => Some(VadEvent::EndOfSpeech),
            SegmenterEvent::InferenceDone { probability } => Some(VadEvent::InferenceDone {
                probability: *probability,
            }),
        }
    }

    /// Reset to silence, dropping any open segment.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Silent;
        self.prefix.clear();
        self.prefix_duration = Duration::ZERO;
        self.onset_run.clear();
        self.onset_duration = Duration::ZERO;
        self.segment.clear();
        self.segment_duration = Duration::ZERO;
        self.segment_started_at = None;
        self.hangover = Duration::ZERO;
        self.vad.reset();
    }

    fn open_segment(&mut self) {
        self.state = SegmenterState::Speaking;
        self.hangover = Duration::ZERO;
        self.segment_started_at = self
            .prefix
            .front()
            .or_else(|| self.onset_run.first())
            .map(|f| f.timestamp)
            .or_else(|| Some(Utc::now()));

        // Segment = prefix padding, then the onset run that crossed the
        // threshold.
        self.segment_duration = Duration::ZERO;
        for frame in self.prefix.drain(..) {
            self.segment_duration += frame.duration;
            self.segment.push(frame);
        }
        self.prefix_duration = Duration::ZERO;
        for frame in self.onset_run.drain(..) {
            self.segment_duration += frame.duration;
            self.segment.push(frame);
        }
        self.onset_duration = Duration::ZERO;
        debug!("start of speech ({} prefix+onset frames)", self.segment.len());
    }

    fn close_segment(&mut self) -> SpeechSegment {
        self.state = SegmenterState::Silent;
        let frames = std::mem::take(&mut self.segment);
        let duration = self.segment_duration;
        self.segment_duration = Duration::ZERO;
        self.hangover = Duration::ZERO;
        let started_at = self.segment_started_at.take().unwrap_or_else(Utc::now);
        debug!(
            "end of speech: {} frames, {:?}",
            frames.len(),
            duration
        );
        SpeechSegment {
            frames,
            started_at,
            duration,
        }
    }

    fn push_prefix(
        prefix: &mut VecDeque<AudioFrame>,
        prefix_duration: &mut Duration,
        capacity: Duration,
        frame: AudioFrame,
    ) {
        *prefix_duration += frame.duration;
        prefix.push_back(frame);
        while *prefix_duration > capacity {
            if let Some(old) = prefix.pop_front() {
                *prefix_duration = prefix_duration.saturating_sub(old.duration);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::VadDecision;

    /// Scripted VAD: a frame is speech iff its first sample is non-zero.
    struct MarkerVad;

    impl VadProvider for MarkerVad {
        fn detect(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
            let speech = frame.samples_i16()?.first().copied().unwrap_or(0) != 0;
            Ok(VadDecision {
                probability: if speech { 0.9 } else { 0.1 },
                is_speech: speech,
            })
        }
    }

    fn speech_frame() -> AudioFrame {
        AudioFrame::from_i16(&vec![8000i16; 160], 16_000) // 10 ms
    }

    fn silent_frame() -> AudioFrame {
        AudioFrame::from_i16(&vec![0i16; 160], 16_000) // 10 ms
    }

    fn segmenter(config: SegmenterConfig) -> SpeechSegmenter {
        SpeechSegmenter::new(Box::new(MarkerVad), config)
    }

    fn push_collect(seg: &mut SpeechSegmenter, frame: AudioFrame) -> Vec<SegmenterEvent> {
        seg.push(frame).unwrap()
    }

    #[test]
    fn test_short_spike_ignored() {
        let mut seg = segmenter(SegmenterConfig::default());
        // 40 ms of speech < min_speech 50 ms, then silence
        for _ in 0..4 {
            push_collect(&mut seg, speech_frame());
        }
        let events = push_collect(&mut seg, silent_frame());
        assert!(!seg.is_speaking());
        assert!(!events
            .iter()
            .any(|e| matches!(e, SegmenterEvent::StartOfSpeech)));
    }

    #[test]
    fn test_start_of_speech_after_min_speech() {
        let mut seg = segmenter(SegmenterConfig::default());
        let mut started = false;
        for _ in 0..5 {
            let events = push_collect(&mut seg, speech_frame());
            started |= events
                .iter()
                .any(|e| matches!(e, SegmenterEvent::StartOfSpeech));
        }
        assert!(started);
        assert!(seg.is_speaking());
    }

    #[test]
    fn test_end_of_speech_after_hangover() {
        let mut seg = segmenter(SegmenterConfig::default());
        for _ in 0..10 {
            push_collect(&mut seg, speech_frame());
        }
        // 550 ms hangover = 55 silent frames
        let mut segment = None;
        for _ in 0..55 {
            for event in push_collect(&mut seg, silent_frame()) {
                if let SegmenterEvent::EndOfSpeech(s) = event {
                    segment = Some(s);
                }
            }
        }
        let segment = segment.expect("segment should close after hangover");
        assert!(!seg.is_speaking());
        // 100 ms of speech plus 550 ms of hangover frames
        assert!(segment.duration >= Duration::from_millis(650));
    }

    #[test]
    fn test_brief_pause_does_not_split_segment() {
        let mut seg = segmenter(SegmenterConfig::default());
        for _ in 0..10 {
            push_collect(&mut seg, speech_frame());
        }
        // 200 ms pause < min_silence 550 ms
        for _ in 0..20 {
            let events = push_collect(&mut seg, silent_frame());
            assert!(!events
                .iter()
                .any(|e| matches!(e, SegmenterEvent::EndOfSpeech(_))));
        }
        assert!(seg.is_speaking());
        push_collect(&mut seg, speech_frame());
        assert!(seg.is_speaking());
    }

    #[test]
    fn test_prefix_padding_prepended() {
        let config = SegmenterConfig {
            prefix_padding: Duration::from_millis(100),
            ..Default::default()
        };
        let mut seg = segmenter(config);
        // 30 silent frames; only the last 10 (100 ms) should be retained.
        for _ in 0..30 {
            push_collect(&mut seg, silent_frame());
        }
        for _ in 0..10 {
            push_collect(&mut seg, speech_frame());
        }
        let mut segment = None;
        for _ in 0..55 {
            for event in push_collect(&mut seg, silent_frame()) {
                if let SegmenterEvent::EndOfSpeech(s) = event {
                    segment = Some(s);
                }
            }
        }
        let segment = segment.unwrap();
        // prefix 10 + speech 10 + hangover 55
        assert_eq!(segment.frames.len(), 75);
        // and the first frames are the silent prefix
        assert_eq!(segment.frames[0].samples_i16().unwrap()[0], 0);
    }

    #[test]
    fn test_max_buffered_speech_force_closes() {
        let config = SegmenterConfig {
            max_buffered_speech: Duration::from_millis(200),
            ..Default::default()
        };
        let mut seg = segmenter(config);
        let mut closed = false;
        for _ in 0..40 {
            for event in push_collect(&mut seg, speech_frame()) {
                if matches!(event, SegmenterEvent::EndOfSpeech(_)) {
                    closed = true;
                }
            }
        }
        assert!(closed, "unbounded speech must be force-closed");
    }

    #[test]
    fn test_combined_segment_is_contiguous() {
        let mut seg = segmenter(SegmenterConfig::default());
        for _ in 0..10 {
            push_collect(&mut seg, speech_frame());
        }
        let mut segment = None;
        for _ in 0..55 {
            for event in push_collect(&mut seg, silent_frame()) {
                if let SegmenterEvent::EndOfSpeech(s) = event {
                    segment = Some(s);
                }
            }
        }
        let segment = segment.unwrap();
        let combined = segment.combined().unwrap();
        assert_eq!(
            combined.sample_count(),
            segment.frames.iter().map(|f| f.sample_count()).sum::<usize>()
        );
    }

    #[test]
    fn test_reset_drops_open_segment() {
        let mut seg = segmenter(SegmenterConfig::default());
        for _ in 0..10 {
            push_collect(&mut seg, speech_frame());
        }
        assert!(seg.is_speaking());
        seg.reset();
        assert!(!seg.is_speaking());
    }
}
