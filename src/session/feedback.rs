//! Feedback gate: keeping the agent from hearing itself
//!
//! Two independent guards:
//!
//! - **Temporal**: while TTS is playing, and for a configurable
//!   extension period after it ends, microphone input is discarded before
//!   it reaches the VAD. Residual room echo outlives the playback by a
//!   second or two, hence the extension.
//! - **Content**: a bounded ring of recent TTS utterances. A transcript
//!   matching one of them (exact, or substring either way for longer
//!   texts) is self-echo that slipped past the temporal gate and must not
//!   become a user turn.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Recent utterances retained for the content check.
const UTTERANCE_RING: usize = 5;

/// Transcripts longer than this also match on substring containment.
const SUBSTRING_MIN_LEN: usize = 10;

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct FeedbackGateConfig {
    /// How long after TTS ends the temporal gate stays closed.
    pub gate_extension_period: Duration,
    /// When set, the temporal gate covers only active playback, letting
    /// the user barge in as soon as the agent stops talking.
    pub allow_interrupts: bool,
}

impl Default for FeedbackGateConfig {
    fn default() -> Self {
        Self {
            gate_extension_period: Duration::from_secs(3),
            allow_interrupts: false,
        }
    }
}

#[derive(Debug)]
enum TtsState {
    Idle,
    Playing,
    Ended { at: Instant },
}

struct GateInner {
    state: TtsState,
    utterances: VecDeque<String>,
}

/// Shared gate; read on the hot input path, written by the orchestrator
/// around TTS playback.
pub struct FeedbackGate {
    config: FeedbackGateConfig,
    inner: Mutex<GateInner>,
}

impl FeedbackGate {
    pub fn new(config: FeedbackGateConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GateInner {
                state: TtsState::Idle,
                utterances: VecDeque::with_capacity(UTTERANCE_RING),
            }),
        }
    }

    /// TTS playback starts; `text` joins the utterance ring.
    pub fn mark_tts_started(&self, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = TtsState::Playing;
        if inner.utterances.len() == UTTERANCE_RING {
            inner.utterances.pop_front();
        }
        inner.utterances.push_back(normalize(text));
        debug!("feedback gate closed (TTS playing)");
    }

    /// TTS playback finished; the extended gate starts now.
    pub fn mark_tts_ended(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = TtsState::Ended { at: Instant::now() };
        debug!(
            "TTS ended, gate extension running for {:?}",
            self.config.gate_extension_period
        );
    }

    /// Temporal guard: should this microphone input be discarded?
    pub fn should_discard_input(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            TtsState::Idle => false,
            TtsState::Playing => true,
            TtsState::Ended { at } => {
                !self.config.allow_interrupts
                    && at.elapsed() < self.config.gate_extension_period
            }
        }
    }

    /// Content guard: does this transcript echo a recent TTS utterance?
    pub fn is_feedback(&self, transcript: &str) -> bool {
        let needle = normalize(transcript);
        if needle.is_empty() {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        inner.utterances.iter().any(|spoken| {
            if needle == *spoken {
                return true;
            }
            needle.len() > SUBSTRING_MIN_LEN
                && (spoken.contains(&needle) || needle.contains(spoken.as_str()))
        })
    }

    /// Forget utterances and reopen the gate.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = TtsState::Idle;
        inner.utterances.clear();
    }
}

/// Trim, lowercase, and strip punctuation so "Hello, I am Kelly." matches
/// the STT rendition "Hello I am Kelly".
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
