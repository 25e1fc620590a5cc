//! vox_agent: real-time voice-agent runtime
//!
//! The orchestration engine between five pluggable services (VAD, STT,
//! LLM, TTS, echo cancellation) and a duplex audio path:
//! - frame-aligned acoustic echo control with a delayed far-end reference,
//! - speech segmentation with prefix padding and hangover,
//! - a turn-taking orchestrator with streaming LLM calls and a bounded
//!   tool loop,
//! - a feedback gate keeping the agent's own speech out of its input,
//! - a supervised worker pool running session entrypoints.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vox_agent::providers::{HttpLlm, HttpStt, HttpTts};
//! use vox_agent::session::{BaseAgent, Session, SessionOptions};
//! use vox_agent::session::session::ProviderSet;
//! use vox_agent::audio::device::{DeviceOptions, LoopbackDevice};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let providers = ProviderSet {
//!         stt: Arc::new(HttpStt::new(key.clone(), "whisper-1")),
//!         llm: Arc::new(HttpLlm::new(key.clone(), "gpt-4o-mini")),
//!         tts: Arc::new(HttpTts::new(key, "tts-1")),
//!     };
//!     let agent = Arc::new(BaseAgent::new("kelly"));
//!     let device = Box::new(LoopbackDevice::new(DeviceOptions::default()));
//!     let session = Session::start(agent, providers, device, SessionOptions::default()).await?;
//!     // … feed audio, converse …
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod providers;
pub mod session;
pub mod tools;
pub mod vad;
pub mod worker;

// Re-export the types most integrations touch.
pub use config::{ProviderEnv, WorkerOptions};
pub use error::{AgentError, Result};
pub use jobs::{Job, JobContext, JobStatus, JobSupervisor};
pub use session::{Agent, BaseAgent, Session, SessionOptions, SessionState};
pub use tools::{ToolCtx, ToolRegistry, ToolSpec};
pub use worker::Worker;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
