//! Session assembly
//!
//! Builds the per-session task graph: device → AEC pipeline → feedback
//! gate → segmenter → orchestrator, and owns its teardown. One `Session`
//! equals one conversation with one local user.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::aec::{AecBackend, EchoCanceller, PassthroughAec};
use crate::audio::device::AudioDevice;
use crate::audio::pipeline::{AecPipeline, PipelineConfig};
use crate::error::{AgentError, Result};
use crate::providers::traits::{LlmProvider, SttProvider, TtsProvider};
use crate::session::agent::Agent;
use crate::session::feedback::{FeedbackGate, FeedbackGateConfig};
use crate::session::orchestrator::{OrchestratorConfig, SessionOrchestrator};
use crate::vad::segmenter::{SegmenterConfig, SpeechSegmenter};
use crate::vad::{EnergyVad, VadProvider};

/// Everything configurable about one session.
pub struct SessionOptions {
    pub orchestrator: OrchestratorConfig,
    pub gate: FeedbackGateConfig,
    pub segmenter: SegmenterConfig,
    pub pipeline: PipelineConfig,
    /// VAD provider; defaults to the energy fallback.
    pub vad: Option<Box<dyn VadProvider>>,
    /// Echo-cancellation backend; defaults to passthrough.
    pub aec: Option<Box<dyn AecBackend>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            gate: FeedbackGateConfig::default(),
            segmenter: SegmenterConfig::default(),
            pipeline: PipelineConfig::default(),
            vad: None,
            aec: None,
        }
    }
}

/// The providers a session talks to.
#[derive(Clone)]
pub struct ProviderSet {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

/// One running conversation: the audio pipeline plus the orchestrator
/// task driving it.
pub struct Session {
    id: String,
    cancel: CancellationToken,
    gate: Arc<FeedbackGate>,
    device: Box<dyn AudioDevice>,
    pipeline_stop: AecPipeline,
    driver: Option<JoinHandle<Result<()>>>,
}

impl Session {
    /// Open the device, wire the pipeline, and start the orchestrator
    /// loop.
    pub async fn start(
        agent: Arc<dyn Agent>,
        providers: ProviderSet,
        mut device: Box<dyn AudioDevice>,
        options: SessionOptions,
    ) -> Result<Self> {
        let id = format!("sess_{}", Uuid::new_v4().simple());
        info!("starting session {} for agent {}", id, agent.name());

        let streams = device.open()?;
        let aec_backend = options.aec.unwrap_or_else(|| Box::new(PassthroughAec));
        let canceller = EchoCanceller::new(aec_backend, options.pipeline.sample_rate);
        let mut pipeline = AecPipeline::start(streams, canceller, options.pipeline.clone())?;

        let vad: Box<dyn VadProvider> = options.vad.unwrap_or_else(|| Box::new(EnergyVad::new()));
        let segmenter = SpeechSegmenter::new(vad, options.segmenter);

        let gate = Arc::new(FeedbackGate::new(options.gate));
        let cancel = CancellationToken::new();

        let mut orchestrator = SessionOrchestrator::new(
            id.clone(),
            agent,
            providers.stt,
            providers.llm,
            providers.tts,
            segmenter,
            pipeline.playback(),
            gate.clone(),
            cancel.clone(),
            options.orchestrator,
        );

        let driver_cancel = cancel.clone();
        let mut processed = std::mem::replace(
            &mut pipeline.processed,
            tokio::sync::mpsc::channel(1).1,
        );

        let driver = tokio::spawn(async move {
            orchestrator.start().await?;
            loop {
                tokio::select! {
                    _ = driver_cancel.cancelled() => break,
                    frame = processed.recv() => match frame {
                        Some(frame) => match orchestrator.on_frame(frame).await {
                            Ok(()) => {}
                            Err(e) if e.is_cancelled() => break,
                            Err(e) => warn!("frame handling failed: {}", e),
                        },
                        None => break,
                    },
                }
            }
            orchestrator.shutdown().await;
            Ok(())
        });

        Ok(Self {
            id,
            cancel,
            gate,
            device,
            pipeline_stop: pipeline,
            driver: Some(driver),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn gate(&self) -> Arc<FeedbackGate> {
        self.gate.clone()
    }

    /// Cancel the session and wait for the orchestrator task to unwind.
    pub async fn close(mut self) -> Result<()> {
        info!("closing session {}", self.id);
        self.cancel.cancel();
        self.pipeline_stop.stop();
        self.device.stop();

        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(result) => result,
                Err(join_err) => Err(AgentError::from_join(join_err)),
            }
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{DeviceOptions, LoopbackDevice};
    use crate::providers::traits::Recognition;
    use crate::session::agent::BaseAgent;
    use async_trait::async_trait;
    use crate::audio::frame::AudioFrame;
    use crate::chat::message::ChatMessage;
    use crate::providers::traits::{ChatOptions, ChatStream, ChatStreamItem, ChatDelta};

    struct StubStt;

    #[async_trait]
    impl SttProvider for StubStt {
        async fn recognize(&self, _frame: &AudioFrame) -> Result<Recognition> {
            Ok(Recognition {
                text: "hello".into(),
                confidence: 0.95,
                language: None,
                is_final: true,
            })
        }
    }

    struct StubLlm;

    #[async_trait]
    impl LlmProvider for StubLlm {
        async fn chat_stream(
            &self,
            _messages: Vec<ChatMessage>,
            _opts: ChatOptions,
        ) -> Result<ChatStream> {
            let (tx, stream) = ChatStream::channel();
            tokio::spawn(async move {
                let _ = tx
                    .send(ChatStreamItem::Delta(ChatDelta {
                        content: Some("Hi!".into()),
                        ..Default::default()
                    }))
                    .await;
                let _ = tx.send(ChatStreamItem::End).await;
            });
            Ok(stream)
        }
    }

    struct StubTts;

    #[async_trait]
    impl TtsProvider for StubTts {
        async fn synthesize(&self, _text: &str) -> Result<AudioFrame> {
            Ok(AudioFrame::from_i16(&vec![100i16; 2400], 24_000))
        }
    }

    fn providers() -> ProviderSet {
        ProviderSet {
            stt: Arc::new(StubStt),
            llm: Arc::new(StubLlm),
            tts: Arc::new(StubTts),
        }
    }

    #[tokio::test]
    async fn test_session_starts_and_closes() {
        let device = Box::new(LoopbackDevice::new(DeviceOptions {
            sample_rate: 16_000,
            ..Default::default()
        }));
        let options = SessionOptions {
            pipeline: PipelineConfig {
                sample_rate: 16_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let session = Session::start(
            Arc::new(BaseAgent::new("test")),
            providers(),
            device,
            options,
        )
        .await
        .unwrap();
        assert!(session.id().starts_with("sess_"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_token_trips_on_close() {
        let device = Box::new(LoopbackDevice::new(DeviceOptions {
            sample_rate: 16_000,
            ..Default::default()
        }));
        let options = SessionOptions {
            pipeline: PipelineConfig {
                sample_rate: 16_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let session = Session::start(
            Arc::new(BaseAgent::new("test")),
            providers(),
            device,
            options,
        )
        .await
        .unwrap();
        let token = session.cancel_token();
        assert!(!token.is_cancelled());
        session.close().await.unwrap();
        assert!(token.is_cancelled());
    }
}
