//! Scripted providers and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vox_agent::audio::device::OutputSink;
use vox_agent::audio::frame::AudioFrame;
use vox_agent::audio::pipeline::PlaybackWriter;
use vox_agent::audio::RingBuffer;
use vox_agent::chat::message::ChatMessage;
use vox_agent::error::{AgentError, Result};
use vox_agent::providers::traits::{
    ChatDelta, ChatOptions, ChatStream, ChatStreamItem, LlmProvider, Recognition, SttProvider,
    ToolCallDelta, TtsProvider,
};
use vox_agent::session::feedback::{FeedbackGate, FeedbackGateConfig};
use vox_agent::session::orchestrator::{OrchestratorConfig, SessionOrchestrator};
use vox_agent::session::Agent;
use vox_agent::vad::segmenter::{SegmenterConfig, SpeechSegment, SpeechSegmenter};
use vox_agent::vad::{VadDecision, VadProvider};

// ─── STT ─────────────────────────────────────────────────────

/// Returns scripted transcripts in order; counts calls; optional delay.
pub struct ScriptedStt {
    replies: Mutex<Vec<Recognition>>,
    pub calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedStt {
    pub fn new(texts: &[(&str, f32)]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                texts
                    .iter()
                    .rev() // popped from the back
                    .map(|(text, confidence)| Recognition {
                        text: text.to_string(),
                        confidence: *confidence,
                        language: None,
                        is_final: true,
                    })
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }
}

#[async_trait]
impl SttProvider for ScriptedStt {
    async fn recognize(&self, _frame: &AudioFrame) -> Result<Recognition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.replies.lock().unwrap().pop().unwrap_or(Recognition {
            text: String::new(),
            confidence: 0.0,
            language: None,
            is_final: true,
        }))
    }
}

// ─── LLM ─────────────────────────────────────────────────────

/// One scripted assistant reply.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    ToolCalls(Vec<(String, String, String)>), // (id, name, arguments)
    /// Streams a tool call whose argument JSON is cut off mid-object,
    /// followed by a complete one.
    PartialThenComplete,
    /// Never completes (for cancellation tests).
    Hang,
}

pub struct ScriptedLlm {
    replies: Mutex<Vec<Reply>>,
    pub calls: AtomicUsize,
    pub seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().rev().collect()),
            calls: AtomicUsize::new(0),
            seen_messages: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _opts: ChatOptions,
    ) -> Result<ChatStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_messages.lock().unwrap().push(messages);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Reply::Text("…".into()));

        let (tx, stream) = ChatStream::channel();
        tokio::spawn(async move {
            match reply {
                Reply::Text(text) => {
                    // Word-by-word deltas, the way real streams arrive.
                    for piece in split_inclusive_words(&text) {
                        let _ = tx
                            .send(ChatStreamItem::Delta(ChatDelta {
                                content: Some(piece),
                                ..Default::default()
                            }))
                            .await;
                    }
                    let _ = tx.send(ChatStreamItem::End).await;
                }
                Reply::ToolCalls(calls) => {
                    for (index, (id, name, arguments)) in calls.into_iter().enumerate() {
                        let _ = tx
                            .send(ChatStreamItem::Delta(ChatDelta {
                                tool_calls: vec![ToolCallDelta {
                                    index,
                                    id: Some(id),
                                    name: Some(name),
                                    arguments: String::new(),
                                }],
                                ..Default::default()
                            }))
                            .await;
                        // Arguments stream in as a separate fragment.
                        let _ = tx
                            .send(ChatStreamItem::Delta(ChatDelta {
                                tool_calls: vec![ToolCallDelta {
                                    index,
                                    arguments,
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }))
                            .await;
                    }
                    let _ = tx.send(ChatStreamItem::End).await;
                }
                Reply::PartialThenComplete => {
                    let _ = tx
                        .send(ChatStreamItem::Delta(ChatDelta {
                            tool_calls: vec![
                                ToolCallDelta {
                                    index: 0,
                                    id: Some("cut".into()),
                                    name: Some("get_weather".into()),
                                    arguments: r#"{"location": "Par"#.into(),
                                },
                                ToolCallDelta {
                                    index: 1,
                                    id: Some("c1".into()),
                                    name: Some("get_weather".into()),
                                    arguments: r#"{"location":"Paris"}"#.into(),
                                },
                            ],
                            ..Default::default()
                        }))
                        .await;
                    let _ = tx.send(ChatStreamItem::End).await;
                }
                Reply::Hang => {
                    // Hold the sender open forever.
                    std::future::pending::<()>().await;
                }
            }
        });
        Ok(stream)
    }
}

fn split_inclusive_words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if c == ' ' {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// ─── TTS ─────────────────────────────────────────────────────

/// Synthesizes a short tone per request; records texts.
pub struct ScriptedTts {
    pub calls: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    frame_millis: u64,
}

impl ScriptedTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            frame_millis: 20,
        })
    }
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    async fn synthesize(&self, text: &str) -> Result<AudioFrame> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(text.to_string());
        let samples = (24_000 * self.frame_millis / 1000) as usize;
        Ok(AudioFrame::from_i16(&vec![2000i16; samples], 24_000))
    }
}

/// TTS that always fails.
pub struct FailingTts;

#[async_trait]
impl TtsProvider for FailingTts {
    async fn synthesize(&self, _text: &str) -> Result<AudioFrame> {
        Err(AgentError::TransientProviderError {
            service: "tts".into(),
            reason: "synthesizer offline".into(),
        })
    }
}

// ─── VAD ─────────────────────────────────────────────────────

/// Deterministic VAD: speech iff the first sample is non-zero.
pub struct MarkerVad;

impl VadProvider for MarkerVad {
    fn detect(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        let speech = frame
            .samples_i16()?
            .first()
            .copied()
            .unwrap_or(0)
            != 0;
        Ok(VadDecision {
            probability: if speech { 0.9 } else { 0.1 },
            is_speech: speech,
        })
    }
}

// ─── Harness ─────────────────────────────────────────────────

/// Assembled orchestrator plus the observable ends of its audio path.
pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub played: tokio::sync::mpsc::Receiver<AudioFrame>,
    pub ring: Arc<RingBuffer>,
    pub gate: Arc<FeedbackGate>,
    pub cancel: CancellationToken,
}

pub fn harness(
    agent: Arc<dyn Agent>,
    stt: Arc<dyn SttProvider>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    config: OrchestratorConfig,
) -> Harness {
    let (sink, played) = OutputSink::channel(64);
    let ring = Arc::new(RingBuffer::new(48_000 * 2));
    let playback = PlaybackWriter::new(sink, ring.clone(), 48_000);
    let gate = Arc::new(FeedbackGate::new(FeedbackGateConfig::default()));
    let cancel = CancellationToken::new();

    let segmenter = SpeechSegmenter::new(Box::new(MarkerVad), SegmenterConfig::default());
    let orchestrator = SessionOrchestrator::new(
        "sess_test",
        agent,
        stt,
        llm,
        tts,
        segmenter,
        playback,
        gate.clone(),
        cancel.clone(),
        config,
    );

    Harness {
        orchestrator,
        played,
        ring,
        gate,
        cancel,
    }
}

/// A 16 kHz user utterance of `millis` ms as one speech segment.
pub fn speech_segment(millis: u64) -> SpeechSegment {
    let frames: Vec<AudioFrame> = (0..millis / 10)
        .map(|_| AudioFrame::from_i16(&vec![6000i16; 160], 16_000))
        .collect();
    let duration = Duration::from_millis(millis);
    SpeechSegment {
        frames,
        started_at: chrono::Utc::now(),
        duration,
    }
}

/// A 10 ms frame at 16 kHz: loud when `speech`, silent otherwise.
pub fn mic_frame(speech: bool) -> AudioFrame {
    let amp = if speech { 6000 } else { 0 };
    AudioFrame::from_i16(&vec![amp; 160], 16_000)
}
