//! OpenAI-compatible transcription client
//!
//! Posts one WAV-packed utterance per request to `/audio/transcriptions`
//! as multipart form data. Audio shorter than the provider minimum is
//! short-circuited to an empty transcript locally; a round trip for 80 ms
//! of breath noise is wasted money.

use async_trait::async_trait;
use reqwest::multipart;
use serde_json::Value;
use tracing::debug;

use crate::audio::frame::AudioFrame;
use crate::audio::wav::encode_wav;
use crate::error::{AgentError, Result};
use crate::providers::traits::{Recognition, SttProvider, MIN_RECOGNIZABLE_AUDIO};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// HTTP speech-to-text provider.
#[derive(Clone)]
pub struct HttpStt {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpStt {
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
        }
    }
}

#[async_trait]
impl SttProvider for HttpStt {
    async fn recognize(&self, frame: &AudioFrame) -> Result<Recognition> {
        if frame.duration < MIN_RECOGNIZABLE_AUDIO {
            debug!(
                "utterance of {:?} below provider minimum, returning empty transcript",
                frame.duration
            );
            return Ok(Recognition {
                text: String::new(),
                confidence: 0.0,
                language: None,
                is_final: true,
            });
        }

        let wav = encode_wav(frame)?;
        debug!(
            "transcribing {:.1}s of audio ({} bytes WAV)",
            frame.duration.as_secs_f64(),
            wav.len()
        );

        let part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| AgentError::TransientProviderError {
                service: "stt".into(),
                reason: e.to_string(),
            })?;
        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "stt".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::TransientProviderError {
                service: "stt".into(),
                reason: format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>()),
            });
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "stt".into(),
                reason: format!("transcription response did not parse: {}", e),
            })?;

        Ok(Recognition {
            text: raw
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            confidence: raw
                .get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(1.0) as f32,
            language: raw
                .get("language")
                .and_then(|l| l.as_str())
                .map(|s| s.to_string()),
            is_final: true,
        })
    }
}
