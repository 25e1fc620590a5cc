//! Provider plugin registry
//!
//! Maps service names (the values of the `AGENTS_{STT,TTS,LLM,VAD}_SERVICE`
//! overrides) to factories producing provider instances. Workers normally
//! receive an explicit registry; the process-global one exists as a
//! convenience for binaries that register plugins at startup.
//!
//! Registration is idempotent (registering the same name twice keeps the
//! first factory) and thread-safe.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::ProviderEnv;
use crate::error::{AgentError, Result};
use crate::providers::http_llm::HttpLlm;
use crate::providers::http_stt::HttpStt;
use crate::providers::http_tts::HttpTts;
use crate::providers::traits::{LlmProvider, SttProvider, TtsProvider};

/// A provider built by a plugin factory.
pub enum ProviderInstance {
    Stt(Arc<dyn SttProvider>),
    Llm(Arc<dyn LlmProvider>),
    Tts(Arc<dyn TtsProvider>),
}

impl std::fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderInstance::Stt(_) => write!(f, "ProviderInstance::Stt"),
            ProviderInstance::Llm(_) => write!(f, "ProviderInstance::Llm"),
            ProviderInstance::Tts(_) => write!(f, "ProviderInstance::Tts"),
        }
    }
}

impl ProviderInstance {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderInstance::Stt(_) => "stt",
            ProviderInstance::Llm(_) => "llm",
            ProviderInstance::Tts(_) => "tts",
        }
    }
}

type PluginFactory = Arc<dyn Fn(&ProviderEnv) -> Result<ProviderInstance> + Send + Sync>;

/// Name → factory map.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`. Idempotent: a second registration
    /// of the same name is a no-op.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&ProviderEnv) -> Result<ProviderInstance> + Send + Sync + 'static,
    {
        let mut plugins = self.plugins.write().unwrap();
        if plugins.contains_key(name) {
            debug!("plugin {} already registered, keeping first", name);
            return;
        }
        plugins.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiate the named plugin's provider.
    pub fn create(&self, name: &str, env: &ProviderEnv) -> Result<ProviderInstance> {
        let factory = {
            let plugins = self.plugins.read().unwrap();
            plugins
                .get(name)
                .cloned()
                .ok_or_else(|| AgentError::PluginNotFound(name.to_string()))?
        };
        factory(env)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Process-global registry with the bundled OpenAI-compatible plugins
/// pre-registered.
static GLOBAL: Lazy<PluginRegistry> = Lazy::new(|| {
    let registry = PluginRegistry::new();
    registry.register("openai-stt", |env| {
        Ok(ProviderInstance::Stt(Arc::new(HttpStt::new(
            env.require_openai_key()?,
            "whisper-1",
        ))))
    });
    registry.register("openai-llm", |env| {
        Ok(ProviderInstance::Llm(Arc::new(HttpLlm::new(
            env.require_openai_key()?,
            "gpt-4o-mini",
        ))))
    });
    registry.register("openai-tts", |env| {
        Ok(ProviderInstance::Tts(Arc::new(HttpTts::new(
            env.require_openai_key()?,
            "tts-1",
        ))))
    });
    registry
});

/// The process-global registry.
pub fn global() -> &'static PluginRegistry {
    &GLOBAL
}
