//! Worker configuration
//!
//! Options resolve in three layers: struct defaults, then an optional
//! `config.toml`, then environment variables. `start` mode insists on
//! real media-server credentials; `console` mode substitutes fakes so a
//! local session runs with no external services at all.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// How job entrypoints are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    #[default]
    Thread,
    Process,
}

/// Everything a worker needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOptions {
    #[serde(default)]
    pub executor_type: ExecutorType,
    /// Bind address for the worker's local control endpoint.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Media-server API credentials.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Media-server URL, e.g. `wss://host`.
    #[serde(default)]
    pub media_server_url: Option<String>,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Free-form worker metadata published to the room.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Specific room to attach to (the `connect` subcommand).
    #[serde(default)]
    pub room_name: Option<String>,
    /// Identity the agent joins the room under.
    #[serde(default)]
    pub participant_identity: Option<String>,
    /// Record session audio.
    #[serde(default)]
    pub record: bool,
    /// Local-only mode: mock room, fake credentials, passthrough AEC.
    #[serde(default)]
    pub console_mode: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_agent_name() -> String {
    "vox-agent".to_string()
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::Thread,
            host: default_host(),
            port: default_port(),
            api_key: None,
            api_secret: None,
            media_server_url: None,
            agent_name: default_agent_name(),
            metadata: HashMap::new(),
            room_name: None,
            participant_identity: None,
            record: false,
            console_mode: false,
        }
    }
}

impl WorkerOptions {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> AnyResult<Self> {
        let mut options = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        options.apply_env();
        Ok(options)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("LIVEKIT_URL") {
            self.media_server_url = Some(url);
        }
        if let Ok(key) = std::env::var("LIVEKIT_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("LIVEKIT_API_SECRET") {
            self.api_secret = Some(secret);
        }
    }

    /// Local-only options: fake credentials, mock room.
    pub fn for_console(mut self) -> Self {
        self.console_mode = true;
        self.media_server_url
            .get_or_insert_with(|| "wss://console.invalid".to_string());
        self.api_key.get_or_insert_with(|| "console".to_string());
        self.api_secret.get_or_insert_with(|| "console".to_string());
        self
    }

    /// Identity the agent publishes under.
    pub fn identity(&self) -> String {
        self.participant_identity
            .clone()
            .unwrap_or_else(|| format!("agent-{}", self.agent_name))
    }

    /// Production mode requires real media-server settings.
    pub fn validate(&self) -> Result<()> {
        if self.console_mode {
            return Ok(());
        }
        if self.media_server_url.as_deref().unwrap_or("").is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "media_server_url is required (set LIVEKIT_URL)".into(),
            ));
        }
        if self.api_key.as_deref().unwrap_or("").is_empty()
            || self.api_secret.as_deref().unwrap_or("").is_empty()
        {
            return Err(AgentError::InvalidConfiguration(
                "api_key and api_secret are required (set LIVEKIT_API_KEY / LIVEKIT_API_SECRET)"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Provider credentials and service overrides pulled from the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderEnv {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub deepgram_api_key: Option<String>,
    /// `AGENTS_{STT,TTS,LLM,VAD}_SERVICE` overrides.
    pub stt_service: Option<String>,
    pub tts_service: Option<String>,
    pub llm_service: Option<String>,
    pub vad_service: Option<String>,
}

impl ProviderEnv {
    pub fn from_env() -> Self {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            deepgram_api_key: get("DEEPGRAM_API_KEY"),
            stt_service: get("AGENTS_STT_SERVICE"),
            tts_service: get("AGENTS_TTS_SERVICE"),
            llm_service: get("AGENTS_LLM_SERVICE"),
            vad_service: get("AGENTS_VAD_SERVICE"),
        }
    }

    /// The key the default OpenAI-compatible providers need.
    pub fn require_openai_key(&self) -> Result<String> {
        self.openai_api_key
            .clone()
            .ok_or_else(|| AgentError::InvalidConfiguration("OPENAI_API_KEY is not set".into()))
    }
}
