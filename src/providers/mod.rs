//! External service contracts and reference providers
//!
//! The runtime only depends on the traits in [`traits`]; concrete model
//! backends are collaborators. The `http_*` modules ship OpenAI-compatible
//! reference implementations over plain HTTPS for the three speech/LLM
//! services.

pub mod http_llm;
pub mod http_stt;
pub mod http_tts;
pub mod plugin;
pub mod traits;

pub use traits::{
    ChatDelta, ChatOptions, ChatStream, ChatStreamItem, LlmProvider, Recognition,
    RecognitionStream, StreamAccumulator, SttProvider, SynthesisStream, ToolCallDelta,
    TtsProvider,
};

pub use http_llm::HttpLlm;
pub use http_stt::HttpStt;
pub use http_tts::HttpTts;
pub use plugin::{PluginRegistry, ProviderInstance};
