//! Service contracts for the pluggable providers
//!
//! STT, LLM and TTS backends implement these traits; everything else in
//! the runtime works against them. Streaming surfaces are pull-style
//! cursors over bounded channels with an explicit end sentinel, so
//! cancellation (dropping the stream) tears down both ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::audio::frame::AudioFrame;
use crate::chat::message::{ChatMessage, Role, ToolCall};
use crate::error::{AgentError, Result};

/// Control-path channel capacity (chat/tool items).
pub const CONTROL_CHANNEL_CAPACITY: usize = 50;

/// Providers may short-circuit audio shorter than this to an empty
/// transcript.
pub const MIN_RECOGNIZABLE_AUDIO: Duration = Duration::from_millis(100);

// ─── STT ─────────────────────────────────────────────────────

/// One transcription result.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
    pub language: Option<String>,
    pub is_final: bool,
}

/// Speech-to-text backend.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Transcribe one complete utterance frame.
    async fn recognize(&self, frame: &AudioFrame) -> Result<Recognition>;
}

/// Incremental recognition over a long-lived audio feed: `send_audio`
/// frames in, `recv` partial and final results out, `close_send` to end
/// the utterance.
pub struct RecognitionStream {
    audio_tx: Option<mpsc::Sender<AudioFrame>>,
    results_rx: mpsc::Receiver<Result<Recognition>>,
}

impl RecognitionStream {
    /// Drive a batch [`SttProvider`] as a stream: buffered frames are
    /// transcribed when the send side closes.
    pub fn open(provider: Arc<dyn SttProvider>) -> Self {
        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(CONTROL_CHANNEL_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = audio_rx.recv().await {
                frames.push(frame);
            }
            if frames.is_empty() {
                return;
            }
            let result = match AudioFrame::concat(&frames) {
                Ok(combined) => provider.recognize(&combined).await,
                Err(e) => Err(e),
            };
            let _ = results_tx.send(result).await;
        });

        Self {
            audio_tx: Some(audio_tx),
            results_rx,
        }
    }

    pub async fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        match &self.audio_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| AgentError::Cancelled),
            None => Err(AgentError::NotStarted("recognition stream send side closed".into())),
        }
    }

    /// Signal end of the utterance; results drain through `recv`.
    pub fn close_send(&mut self) {
        self.audio_tx = None;
    }

    /// Next recognition, or `None` once the stream is exhausted.
    pub async fn recv(&mut self) -> Option<Result<Recognition>> {
        self.results_rx.recv().await
    }
}

// ─── LLM ─────────────────────────────────────────────────────

/// Options for one chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Tool definitions offered to the model, in OpenAI function format.
    pub tools: Vec<Value>,
    /// "auto", "none", or a forced tool name.
    pub tool_choice: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

/// One partial tool call inside a streamed delta. Fields fill in over
/// several deltas keyed by `index`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One streamed chunk of an assistant message.
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

/// Items on a chat stream. `End` is the transport sentinel; accumulation
/// stops there.
#[derive(Debug)]
pub enum ChatStreamItem {
    Delta(ChatDelta),
    End,
    Error(AgentError),
}

/// Pull-cursor over a streamed completion.
pub struct ChatStream {
    rx: mpsc::Receiver<ChatStreamItem>,
}

impl ChatStream {
    pub fn new(rx: mpsc::Receiver<ChatStreamItem>) -> Self {
        Self { rx }
    }

    /// Channel pair for producers.
    pub fn channel() -> (mpsc::Sender<ChatStreamItem>, Self) {
        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<ChatStreamItem> {
        self.rx.recv().await
    }

    /// Drain the stream into one assistant message, collecting any
    /// malformed-tool-call errors along the way.
    pub async fn collect(mut self) -> Result<(ChatMessage, Vec<AgentError>)> {
        let mut acc = StreamAccumulator::new();
        while let Some(item) = self.next().await {
            match item {
                ChatStreamItem::Delta(delta) => acc.push(delta),
                ChatStreamItem::End => break,
                ChatStreamItem::Error(e) => return Err(e),
            }
        }
        Ok(acc.finish())
    }
}

/// Large-language-model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Streamed completion; the stream ends with [`ChatStreamItem::End`].
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Result<ChatStream>;

    /// Non-streamed completion. Defaults to draining the stream.
    async fn chat(&self, messages: Vec<ChatMessage>, opts: ChatOptions) -> Result<ChatMessage> {
        let stream = self.chat_stream(messages, opts).await?;
        let (message, malformed) = stream.collect().await?;
        for err in malformed {
            warn!("discarded malformed tool call: {}", err);
        }
        Ok(message)
    }
}

/// Accumulates streamed deltas into the final assistant message.
///
/// Tool-call fragments are merged by index; a call whose argument buffer
/// is not valid JSON when the stream ends is reported as
/// `MalformedToolCall` and skipped, leaving complete calls intact.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    role: Option<Role>,
    content: String,
    tool_parts: BTreeMap<usize, ToolCallDelta>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: ChatDelta) {
        if let Some(role) = delta.role {
            self.role = Some(role);
        }
        if let Some(content) = delta.content {
            self.content.push_str(&content);
        }
        for part in delta.tool_calls {
            let entry = self.tool_parts.entry(part.index).or_default();
            entry.index = part.index;
            if part.id.is_some() {
                entry.id = part.id;
            }
            if part.name.is_some() {
                entry.name = part.name;
            }
            entry.arguments.push_str(&part.arguments);
        }
    }

    /// Content accumulated so far (for live display).
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self) -> (ChatMessage, Vec<AgentError>) {
        let mut calls = Vec::new();
        let mut malformed = Vec::new();

        for (_, part) in self.tool_parts {
            let name = part.name.clone().unwrap_or_default();
            let arguments = if part.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                part.arguments.clone()
            };
            if name.is_empty() {
                malformed.push(AgentError::MalformedToolCall {
                    name: format!("index {}", part.index),
                    reason: "stream ended before a tool name arrived".into(),
                });
                continue;
            }
            if let Err(e) = serde_json::from_str::<Value>(&arguments) {
                malformed.push(AgentError::MalformedToolCall {
                    name: name.clone(),
                    reason: format!("arguments are not valid JSON: {}", e),
                });
                continue;
            }
            calls.push(ToolCall {
                id: part
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                name,
                arguments,
            });
        }

        let message = if calls.is_empty() {
            ChatMessage::assistant(self.content)
        } else {
            // Mixed content + tool calls resolve as a tool-call message;
            // the concurrent content rides along but is not spoken.
            ChatMessage::assistant_with_tools(self.content, calls)
        };
        (message, malformed)
    }
}

// ─── TTS ─────────────────────────────────────────────────────

/// Text-to-speech backend. Returned frames declare their own sample
/// rate; callers resample as needed.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioFrame>;
}

/// Incremental synthesis: `send_text` chunks in, `recv` audio frames out.
pub struct SynthesisStream {
    text_tx: Option<mpsc::Sender<String>>,
    frames_rx: mpsc::Receiver<Result<AudioFrame>>,
}

impl SynthesisStream {
    /// Drive a batch [`TtsProvider`] as a stream: each text chunk is
    /// synthesized in order and its frame emitted.
    pub fn open(provider: Arc<dyn TtsProvider>) -> Self {
        let (text_tx, mut text_rx) = mpsc::channel::<String>(CONTROL_CHANNEL_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = text_rx.recv().await {
                let result = provider.synthesize(&text).await;
                if frames_tx.send(result).await.is_err() {
                    break;
                }
            }
        });

        Self {
            text_tx: Some(text_tx),
            frames_rx,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        match &self.text_tx {
            Some(tx) => tx
                .send(text.into())
                .await
                .map_err(|_| AgentError::Cancelled),
            None => Err(AgentError::NotStarted("synthesis stream send side closed".into())),
        }
    }

    pub fn close_send(&mut self) {
        self.text_tx = None;
    }

    /// Next synthesized frame; `None` once all sent text is rendered.
    pub async fn recv(&mut self) -> Option<Result<AudioFrame>> {
        self.frames_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_delta(content: &str) -> ChatDelta {
        ChatDelta {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_accumulator_concatenates_content() {
        let mut acc = StreamAccumulator::new();
        acc.push(ChatDelta {
            role: Some(Role::Assistant),
            ..Default::default()
        });
        acc.push(text_delta("Hello"));
        acc.push(text_delta(", world"));
        let (msg, malformed) = acc.finish();
        assert!(malformed.is_empty());
        assert_eq!(msg.content, "Hello, world");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_accumulator_merges_tool_call_fragments() {
        let mut acc = StreamAccumulator::new();
        acc.push(ChatDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("get_weather".into()),
                arguments: r#"{"loca"#.into(),
            }],
            ..Default::default()
        });
        acc.push(ChatDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments: r#"tion":"Paris"}"#.into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let (msg, malformed) = acc.finish();
        assert!(malformed.is_empty());
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "c1");
        assert_eq!(msg.tool_calls[0].arguments, r#"{"location":"Paris"}"#);
    }

    #[test]
    fn test_partial_tool_call_reported_and_skipped() {
        let mut acc = StreamAccumulator::new();
        acc.push(ChatDelta {
            tool_calls: vec![
                ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("good_tool".into()),
                    arguments: "{}".into(),
                },
                ToolCallDelta {
                    index: 1,
                    id: Some("c2".into()),
                    name: Some("cut_off".into()),
                    arguments: r#"{"x": 1"#.into(), // stream died mid-JSON
                },
            ],
            ..Default::default()
        });
        let (msg, malformed) = acc.finish();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "good_tool");
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].kind(), "MalformedToolCall");
    }

    #[test]
    fn test_mixed_content_and_tools_is_tool_message() {
        let mut acc = StreamAccumulator::new();
        acc.push(text_delta("thinking..."));
        acc.push(ChatDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("t".into()),
                arguments: "{}".into(),
            }],
            ..Default::default()
        });
        let (msg, _) = acc.finish();
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn test_missing_id_generated() {
        let mut acc = StreamAccumulator::new();
        acc.push(ChatDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: None,
                name: Some("t".into()),
                arguments: "{}".into(),
            }],
            ..Default::default()
        });
        let (msg, _) = acc.finish();
        assert!(msg.tool_calls[0].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn test_chat_stream_collect_stops_at_sentinel() {
        let (tx, stream) = ChatStream::channel();
        tx.send(ChatStreamItem::Delta(text_delta("a"))).await.unwrap();
        tx.send(ChatStreamItem::Delta(text_delta("b"))).await.unwrap();
        tx.send(ChatStreamItem::End).await.unwrap();
        // Anything after the sentinel must be ignored.
        tx.send(ChatStreamItem::Delta(text_delta("zzz"))).await.unwrap();
        drop(tx);

        let (msg, _) = stream.collect().await.unwrap();
        assert_eq!(msg.content, "ab");
    }

    struct EchoStt;

    #[async_trait]
    impl SttProvider for EchoStt {
        async fn recognize(&self, frame: &AudioFrame) -> Result<Recognition> {
            Ok(Recognition {
                text: format!("{} samples", frame.sample_count()),
                confidence: 1.0,
                language: None,
                is_final: true,
            })
        }
    }

    #[tokio::test]
    async fn test_recognition_stream_buffers_until_close() {
        let mut stream = RecognitionStream::open(Arc::new(EchoStt));
        for _ in 0..3 {
            stream
                .send_audio(AudioFrame::from_i16(&vec![0i16; 160], 16_000))
                .await
                .unwrap();
        }
        stream.close_send();
        let recognition = stream.recv().await.unwrap().unwrap();
        assert_eq!(recognition.text, "480 samples");
        assert!(stream.recv().await.is_none());
    }

    struct BeepTts;

    #[async_trait]
    impl TtsProvider for BeepTts {
        async fn synthesize(&self, text: &str) -> Result<AudioFrame> {
            Ok(AudioFrame::from_i16(&vec![1i16; text.len() * 10], 24_000))
        }
    }

    #[tokio::test]
    async fn test_synthesis_stream_orders_chunks() {
        let mut stream = SynthesisStream::open(Arc::new(BeepTts));
        stream.send_text("one").await.unwrap();
        stream.send_text("seven").await.unwrap();
        stream.close_send();

        let first = stream.recv().await.unwrap().unwrap();
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.sample_count(), 30);
        assert_eq!(second.sample_count(), 50);
        assert!(stream.recv().await.is_none());
    }
}
