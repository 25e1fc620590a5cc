//! OpenAI-compatible speech-synthesis client
//!
//! Posts text to `/audio/speech` and decodes the response into a frame.
//! The endpoint is asked for WAV so the sample rate travels inside the
//! payload; callers resample to the pipeline rate on playback.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::audio::frame::{AudioFrame, TTS_SAMPLE_RATE};
use crate::audio::wav::decode_wav;
use crate::error::{AgentError, Result};
use crate::providers::traits::TtsProvider;

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// HTTP text-to-speech provider.
#[derive(Clone)]
pub struct HttpTts {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl HttpTts {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_OPENAI_BASE, api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "alloy".to_string(),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl TtsProvider for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<AudioFrame> {
        if text.trim().is_empty() {
            return Ok(AudioFrame::from_i16(&[], TTS_SAMPLE_RATE));
        }
        debug!("synthesizing {} chars", text.len());

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "wav",
            }))
            .send()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "tts".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::TransientProviderError {
                service: "tts".into(),
                reason: format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>()),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "tts".into(),
                reason: e.to_string(),
            })?;

        // The WAV header carries the provider's actual output rate.
        let frame = decode_wav(&bytes)?;
        debug!(
            "synthesized {:.1}s at {} Hz",
            frame.duration.as_secs_f64(),
            frame.format.sample_rate
        );
        Ok(frame)
    }
}
