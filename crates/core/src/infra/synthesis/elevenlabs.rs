use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::voices;
use super::{SynthesisError, VoiceSynthesizer};

const API_BASE: &str = "https://api.elevenlabs.io/v1";
const MODEL_ID: &str = "eleven_multilingual_v2";

/// ElevenLabs text-to-speech を使用した音声合成
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    settings: VoiceSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.75,
            similarity_boost: 0.75,
            style: 0.25,
            use_speaker_boost: true,
        }
    }
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: &'a VoiceSettings,
}

impl ElevenLabsSynthesizer {
    /// `timeout` は接続全体の上限。チャプターごとの上限は呼び出し側で掛ける
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::NotAvailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: API_BASE.to_string(),
            settings: VoiceSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: VoiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, voice_id: &str) -> String {
        format!(
            "{}/text-to-speech/{}",
            self.base_url,
            voices::provider_voice_id(voice_id)
        )
    }
}

#[async_trait]
impl VoiceSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        if !voices::is_known_voice(voice_id) {
            log::warn!("Unknown voice '{voice_id}', falling back to {}", voices::DEFAULT_VOICE);
        }

        let request = TtsRequest {
            text,
            model_id: MODEL_ID,
            voice_settings: &self.settings,
        };

        let response = self
            .client
            .post(self.endpoint(voice_id))
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SynthesisError::Timeout
                } else {
                    SynthesisError::Failed(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Failed(format!(
                "ElevenLabs API error: {status} - {body}"
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SynthesisError::Timeout
            } else {
                SynthesisError::Failed(format!("Audio download failed: {e}"))
            }
        })?;

        if bytes.is_empty() {
            return Err(SynthesisError::Failed("Empty audio from ElevenLabs".to_string()));
        }

        log::debug!("Synthesized {} chars into {} bytes", text.len(), bytes.len());
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &str {
        "elevenlabs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uses_provider_voice() {
        let synth = ElevenLabsSynthesizer::new("k".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            synth.endpoint("david"),
            "https://api.elevenlabs.io/v1/text-to-speech/VR6AewLTigWG4xSOukaG"
        );
        assert!(synth.endpoint("unknown").ends_with("EXAVITQu4vr4xnSDxMaL"));
    }

    #[test]
    fn test_request_body_shape() {
        let settings = VoiceSettings::default();
        let body = serde_json::to_value(TtsRequest {
            text: "Sleep well",
            model_id: MODEL_ID,
            voice_settings: &settings,
        })
        .unwrap();
        assert_eq!(body["model_id"], "eleven_multilingual_v2");
        assert_eq!(body["voice_settings"]["style"], 0.25);
        assert_eq!(body["voice_settings"]["use_speaker_boost"], true);
    }
}
