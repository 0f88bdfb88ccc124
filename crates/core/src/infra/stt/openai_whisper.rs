use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AudioClip, SttContext, SttEngine, SttError, Transcript};
use crate::infra::audio::wav::encode_wav;

const API_BASE: &str = "https://api.openai.com/v1";
const MODEL: &str = "whisper-1";
const DEFAULT_LANGUAGE: &str = "en";

/// アップロード上限 (25MB)
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// OpenAI Audio Transcriptions API を使用した文字起こし
pub struct OpenAiWhisper {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiWhisper {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, SttError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SttError::engine_not_available(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// アップロードするファイル (バイト列, ファイル名, MIME)
fn upload_payload(clip: &AudioClip) -> Result<(Vec<u8>, String, String), SttError> {
    if let Some(encoded) = &clip.encoded {
        if !encoded.mime.starts_with("audio/") {
            return Err(SttError::audio_format(format!(
                "not an audio upload: {}",
                encoded.mime
            )));
        }
        return Ok((
            encoded.bytes.clone(),
            encoded.file_name.clone(),
            encoded.mime.clone(),
        ));
    }

    let samples = clip
        .samples
        .as_deref()
        .ok_or_else(|| SttError::audio_format("clip has neither samples nor encoded audio"))?;
    let wav = encode_wav(samples, clip.sample_rate).map_err(SttError::audio_format)?;
    Ok((wav, format!("{}.wav", clip.id), "audio/wav".to_string()))
}

#[async_trait]
impl SttEngine for OpenAiWhisper {
    async fn transcribe(&self, clip: &AudioClip, ctx: &SttContext) -> Result<Transcript, SttError> {
        let (bytes, file_name, mime) = upload_payload(clip)?;
        if bytes.is_empty() {
            return Err(SttError::audio_format("empty audio"));
        }
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(SttError::audio_format(format!(
                "audio too large: {} bytes",
                bytes.len()
            )));
        }

        let language = ctx
            .language
            .clone()
            .or_else(|| clip.language.clone())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&mime)
            .map_err(|e| SttError::audio_format(format!("invalid mime {mime}: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", MODEL)
            .text("language", language);
        if !ctx.prompt_hints.is_empty() {
            form = form.text("prompt", ctx.prompt_hints.join(", "));
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SttError::timeout(e.to_string())
                } else {
                    SttError::transcription_failed(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SttError::transcription_failed(format!(
                "OpenAI API error: {status} - {body}"
            )));
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| SttError::transcription_failed(format!("Response parse error: {e}")))?;

        log::debug!("Transcribed clip {}: {:?}", clip.id, result.text);
        Ok(Transcript::new(result.text))
    }

    fn name(&self) -> &str {
        MODEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stt::SttErrorKind;

    #[test]
    fn test_encoded_upload_kept_as_is() {
        let clip = AudioClip::from_encoded(vec![9; 10], "audio/webm", "voice.webm");
        let (bytes, name, mime) = upload_payload(&clip).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(name, "voice.webm");
        assert_eq!(mime, "audio/webm");
    }

    #[test]
    fn test_non_audio_upload_rejected() {
        let clip = AudioClip::from_encoded(vec![9; 10], "text/plain", "notes.txt");
        let err = upload_payload(&clip).unwrap_err();
        assert_eq!(err.kind, SttErrorKind::AudioFormat);
    }

    #[test]
    fn test_samples_are_wrapped_in_wav() {
        let clip = AudioClip::from_samples(vec![0.1; 1600], 16_000, chrono::Utc::now());
        let (bytes, name, mime) = upload_payload(&clip).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert!(name.ends_with(".wav"));
        assert_eq!(mime, "audio/wav");
    }

    #[test]
    fn test_whisper_name() {
        let stt = OpenAiWhisper::new("k".to_string(), Duration::from_secs(30)).unwrap();
        assert_eq!(stt.name(), "whisper-1");
    }
}
