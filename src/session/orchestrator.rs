//! Session orchestrator
//!
//! The turn-taking state machine at the center of a session:
//!
//! ```text
//! Idle → Listening → Segmenting → Transcribing → Reasoning
//!          ↑                                        │  ↘ ToolExecuting
//!          │                                        │  ↙      │
//!          └──────── Speaking ← Synthesizing ←──────┴─────────┘
//! ```
//!
//! Frames from the AEC pipeline run through the feedback gate and the
//! speech segmenter; a completed segment becomes an STT call, a user
//! turn, an LLM exchange (with a bounded tool loop), and finally TTS
//! audio written to the playback tee. One turn at a time: the
//! orchestrator task serializes everything per session.
//!
//! Failures never crash the session: a failed STT/LLM/TTS call is logged,
//! recorded as an apologetic assistant message, and the state machine
//! returns to `Listening`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::frame::AudioFrame;
use crate::audio::pipeline::PlaybackWriter;
use crate::audio::resample::resample_frame;
use crate::chat::context::ChatContext;
use crate::chat::message::ToolResult;
use crate::error::{AgentError, Result};
use crate::providers::traits::{ChatOptions, LlmProvider, SttProvider, SynthesisStream, TtsProvider};
use crate::session::agent::{Agent, SessionInfo};
use crate::session::feedback::FeedbackGate;
use crate::session::SessionState;
use crate::tools::{ToolCtx, ToolRegistry};
use crate::vad::segmenter::{SegmenterEvent, SpeechSegment, SpeechSegmenter};

/// Fallback line used when a turn fails mid-flight.
const APOLOGY: &str = "I had trouble processing that. Could you try again?";

/// Greeting used when the context already has history at session start.
const DEFAULT_GREETING: &str = "Hello! How can I help you today?";

/// Per-turn behaviour knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Speak a greeting when the session starts.
    pub greet_on_start: bool,
    /// Upper bound on LLM↔tool round trips inside one turn.
    pub max_tool_iterations: usize,
    pub stt_deadline: Duration,
    pub llm_deadline: Duration,
    pub tts_deadline: Duration,
    pub tool_deadline: Duration,
    /// Safety margin added to the estimated playback time before the gate
    /// extension starts.
    pub playback_margin: Duration,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            greet_on_start: false,
            max_tool_iterations: 5,
            stt_deadline: Duration::from_secs(10),
            llm_deadline: Duration::from_secs(15),
            tts_deadline: Duration::from_secs(10),
            tool_deadline: Duration::from_secs(30),
            playback_margin: Duration::from_millis(250),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// The per-session turn engine. Owned and driven by exactly one task.
pub struct SessionOrchestrator {
    session_id: String,
    agent: Arc<dyn Agent>,
    stt: Arc<dyn SttProvider>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    tools: ToolRegistry,
    context: ChatContext,
    gate: Arc<FeedbackGate>,
    segmenter: SpeechSegmenter,
    playback: PlaybackWriter,
    cancel: CancellationToken,
    config: OrchestratorConfig,
    state: SessionState,
    started: bool,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        agent: Arc<dyn Agent>,
        stt: Arc<dyn SttProvider>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TtsProvider>,
        segmenter: SpeechSegmenter,
        playback: PlaybackWriter,
        gate: Arc<FeedbackGate>,
        cancel: CancellationToken,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent,
            stt,
            llm,
            tts,
            tools: ToolRegistry::new(),
            context: ChatContext::new(),
            gate,
            segmenter,
            playback,
            cancel,
            config,
            state: SessionState::Idle,
            started: false,
        }
    }

    /// Register the agent's tools, fire `on_enter`, and optionally speak
    /// the initial greeting.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(AgentError::AlreadyStarted("session orchestrator".into()));
        }
        self.started = true;

        self.agent.register_tools(&mut self.tools)?;
        info!(
            "session {}: registered {} tools",
            self.session_id,
            self.tools.len()
        );

        if let Some(instructions) = self.agent.instructions() {
            self.context.set_system_prompt(instructions);
        }

        let info = SessionInfo {
            session_id: self.session_id.clone(),
            agent_name: self.agent.name().to_string(),
        };
        self.agent.on_enter(&info).await;
        self.set_state(SessionState::Listening);

        if self.config.greet_on_start {
            self.generate_reply().await?;
        }
        Ok(())
    }

    /// Speak an initial reply: from the LLM when the context is fresh,
    /// otherwise the stock greeting.
    pub async fn generate_reply(&mut self) -> Result<()> {
        self.ensure_started()?;

        let text = if self.context.is_effectively_empty() {
            self.set_state(SessionState::Reasoning);
            match self.run_llm_once().await {
                Ok((message, _)) if !message.content.trim().is_empty() => message.content,
                Ok(_) => DEFAULT_GREETING.to_string(),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("greeting LLM call failed, using default: {}", e);
                    DEFAULT_GREETING.to_string()
                }
            }
        } else {
            DEFAULT_GREETING.to_string()
        };

        self.context.add_assistant(&text);
        match self.speak(&text).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                error!("greeting synthesis failed: {}", e);
                self.set_state(SessionState::Listening);
                Ok(())
            }
        }
    }

    /// Feed one processed frame from the AEC pipeline.
    pub async fn on_frame(&mut self, frame: AudioFrame) -> Result<()> {
        self.ensure_started()?;
        self.agent.on_audio_frame(&frame);

        if self.gate.should_discard_input() {
            return Ok(());
        }

        let wanted = self.segmenter.required_sample_rate();
        let frame = if frame.format.sample_rate != wanted {
            resample_frame(&frame, wanted)?
        } else {
            frame
        };

        let events = self.segmenter.push(frame)?;
        for event in events {
            match event {
                SegmenterEvent::StartOfSpeech => {
                    self.agent.on_speech_detected();
                    self.set_state(SessionState::Segmenting);
                }
                SegmenterEvent::EndOfSpeech(segment) => {
                    self.agent.on_speech_ended();
                    self.handle_segment(segment).await?;
                }
                SegmenterEvent::InferenceDone { .. } => {}
            }
        }
        Ok(())
    }

    /// One completed speech segment → at most one user turn.
    pub async fn handle_segment(&mut self, segment: SpeechSegment) -> Result<()> {
        self.ensure_started()?;
        if segment.frames.is_empty() {
            self.set_state(SessionState::Listening);
            return Ok(());
        }

        self.set_state(SessionState::Transcribing);
        let combined = segment.combined()?;
        debug!(
            "transcribing segment of {:.2}s",
            combined.duration.as_secs_f64()
        );

        let stt = self.stt.clone();
        let recognition = match self
            .guarded("stt", self.config.stt_deadline, async move {
                stt.recognize(&combined).await
            })
            .await
        {
            Ok(r) => r,
            Err(e) => return self.turn_error("transcription", e),
        };

        let text = recognition.text.trim().to_string();
        if text.is_empty() {
            debug!("empty transcript, back to listening");
            self.set_state(SessionState::Listening);
            return Ok(());
        }

        if self.gate.is_feedback(&text) {
            info!("transcript matches recent TTS output, suppressing: {:?}", text);
            self.set_state(SessionState::Listening);
            return Ok(());
        }

        info!(
            "user turn ({:.0}% confidence): {:?}",
            recognition.confidence * 100.0,
            text
        );
        self.context.add_user(&text);
        let message = self
            .context
            .last()
            .cloned()
            .expect("user message was just appended");
        self.agent.on_user_turn_completed(&message).await;

        self.run_turn().await
    }

    /// The LLM ↔ tool loop for one user turn, ending in speech.
    async fn run_turn(&mut self) -> Result<()> {
        self.set_state(SessionState::Reasoning);

        for iteration in 1..=self.config.max_tool_iterations {
            let (message, malformed) = match self.run_llm_once().await {
                Ok(out) => out,
                Err(e) => return self.turn_error("reasoning", e),
            };
            for err in malformed {
                warn!("skipping malformed tool call: {}", err);
            }

            if message.has_tool_calls() {
                let calls = message.tool_calls.clone();
                self.context.add_tool_calls(message.content.clone(), calls.clone());
                self.set_state(SessionState::ToolExecuting);

                for call in &calls {
                    let ctx = ToolCtx::new(self.session_id.clone())
                        .with_cancel(self.cancel.clone())
                        .with_deadline(self.config.tool_deadline);

                    let result = match self.tools.dispatch(ctx, call).await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            warn!("tool {} failed: {}", call.name, e);
                            ToolResult {
                                tool_call_id: call.id.clone(),
                                name: call.name.clone(),
                                payload: json!({ "error": e.kind() }),
                            }
                        }
                    };
                    self.context.add_tool_result(&result)?;
                }

                self.set_state(SessionState::Reasoning);
                debug!(
                    "tool iteration {}/{} complete",
                    iteration, self.config.max_tool_iterations
                );
                continue;
            }

            // Plain text message: the turn's answer.
            let text = message.content.trim().to_string();
            if text.is_empty() {
                debug!("assistant returned empty text, back to listening");
                self.set_state(SessionState::Listening);
                return Ok(());
            }
            self.context.add_assistant(&text);
            return match self.speak(&text).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    error!("synthesis failed: {}", e);
                    self.set_state(SessionState::Listening);
                    Ok(())
                }
            };
        }

        warn!(
            "turn exceeded {} tool iterations",
            self.config.max_tool_iterations
        );
        self.turn_error(
            "tool loop",
            AgentError::ToolExecutionError {
                tool: "loop".into(),
                reason: "maximum tool iterations exceeded".into(),
            },
        )
    }

    /// One streamed LLM completion over the current context.
    async fn run_llm_once(
        &mut self,
    ) -> Result<(crate::chat::message::ChatMessage, Vec<AgentError>)> {
        let llm = self.llm.clone();
        let messages = self.context.render();
        let opts = ChatOptions {
            tools: self.tool_definitions(),
            tool_choice: None,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stop: Vec::new(),
        };
        self.guarded("llm", self.config.llm_deadline, async move {
            let stream = llm.chat_stream(messages, opts).await?;
            stream.collect().await
        })
        .await
    }

    /// Synthesize and play `text`, holding the feedback gate closed for
    /// the playback window.
    async fn speak(&mut self, text: &str) -> Result<()> {
        self.set_state(SessionState::Synthesizing);
        self.gate.mark_tts_started(text);

        let tts = self.tts.clone();
        let owned = text.to_string();
        let synthesized = self
            .guarded("tts", self.config.tts_deadline, async move {
                let mut stream = SynthesisStream::open(tts);
                stream.send_text(owned).await?;
                stream.close_send();
                let mut frames = Vec::new();
                while let Some(frame) = stream.recv().await {
                    let frame = frame?;
                    if !frame.is_empty() {
                        frames.push(frame);
                    }
                }
                Ok(frames)
            })
            .await;

        let frames = match synthesized {
            Ok(frames) => frames,
            Err(e) => {
                self.gate.mark_tts_ended();
                return Err(e);
            }
        };
        if frames.is_empty() {
            self.gate.mark_tts_ended();
            self.set_state(SessionState::Listening);
            return Ok(());
        }

        self.set_state(SessionState::Speaking);
        let combined = AudioFrame::concat(&frames)?;
        let playback_time = combined.duration + self.config.playback_margin;
        self.playback.write(&combined)?;
        info!(
            "speaking {:.1}s of audio",
            combined.duration.as_secs_f64()
        );

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.gate.mark_tts_ended();
                return Err(AgentError::Cancelled);
            }
            _ = tokio::time::sleep(playback_time) => {}
        }

        self.gate.mark_tts_ended();
        self.set_state(SessionState::Listening);
        Ok(())
    }

    /// Record a failed turn: log it, apologize in the context, return to
    /// listening. Cancellation propagates silently instead.
    fn turn_error(&mut self, stage: &str, err: AgentError) -> Result<()> {
        if err.is_cancelled() {
            return Err(err);
        }
        error!("session {}: {} failed: {}", self.session_id, stage, err);
        self.context.add_assistant(APOLOGY);
        self.set_state(SessionState::Listening);
        Ok(())
    }

    /// Run a provider call under its deadline and the session token.
    async fn guarded<T, F>(&self, operation: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(deadline, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout {
                    operation: operation.to_string(),
                    deadline,
                }),
            },
        }
    }

    /// Tool definitions in OpenAI function format, registration order.
    fn tool_definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.schema,
                    }
                })
            })
            .collect()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session {}: {:?} → {:?}", self.session_id, self.state, state);
            self.state = state;
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started {
            return Err(AgentError::NotStarted("session orchestrator".into()));
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> &ChatContext {
        &self.context
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tear down: fire `on_exit` and trip the token.
    pub async fn shutdown(&mut self) {
        let info = SessionInfo {
            session_id: self.session_id.clone(),
            agent_name: self.agent.name().to_string(),
        };
        self.agent.on_exit(&info).await;
        self.cancel.cancel();
        self.set_state(SessionState::Idle);
    }
}
